//! Body normalization: content encodings and media types.
//!
//! Two requests that differ only in transfer compression or JSON whitespace must compare and
//! persist identically, so every request body goes through [`normalize_body`] before it is
//! stored on a tape.

use std::{
    borrow::Cow,
    io::{Read as _, Write as _},
};

use flate2::{
    Compression,
    read::{DeflateDecoder, GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
};
use serde_json::Value;

use crate::{error::CodecError, headers::Headers};

const CONTENT_ENCODING: &str = "content-encoding";
const CONTENT_TYPE: &str = "content-type";
const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

const HUMAN_READABLE_TYPES: &[&str] = &["application/javascript"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentEncoding {
    pub fn from_headers(headers: &Headers) -> Result<Self, CodecError> {
        let Some(raw) = headers.get(CONTENT_ENCODING) else {
            return Ok(Self::Identity);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Self::Identity),
            "gzip" | "x-gzip" => Ok(Self::Gzip),
            "deflate" => Ok(Self::Deflate),
            "br" => Ok(Self::Brotli),
            other => Err(CodecError::UnsupportedEncoding(other.to_owned())),
        }
    }

    pub fn is_uncompressed(self) -> bool {
        self == Self::Identity
    }

    pub fn decompress(self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(body.len().saturating_mul(2));
        match self {
            Self::Identity => out.extend_from_slice(body),
            Self::Gzip => {
                GzDecoder::new(body).read_to_end(&mut out)?;
            }
            Self::Deflate => {
                // "deflate" is zlib-wrapped per RFC 9110, but raw streams are common in the wild.
                if ZlibDecoder::new(body).read_to_end(&mut out).is_err() {
                    out.clear();
                    DeflateDecoder::new(body).read_to_end(&mut out)?;
                }
            }
            Self::Brotli => {
                brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }

    pub fn compress(self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Identity => Ok(body.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                Ok(encoder.finish()?)
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(body)?;
                Ok(encoder.finish()?)
            }
            Self::Brotli => {
                let mut writer = brotli::CompressorWriter::new(
                    Vec::new(),
                    BROTLI_BUFFER_SIZE,
                    BROTLI_QUALITY,
                    BROTLI_WINDOW,
                );
                writer.write_all(body)?;
                writer.flush()?;
                Ok(writer.into_inner())
            }
        }
    }
}

/// Returns `body` decoded according to its `content-encoding` header.
///
/// Uncompressed bodies are borrowed untouched.
pub fn decompress_if_needed<'a>(
    body: &'a [u8],
    headers: &Headers,
) -> Result<Cow<'a, [u8]>, CodecError> {
    let encoding = ContentEncoding::from_headers(headers)?;
    if encoding.is_uncompressed() {
        return Ok(Cow::Borrowed(body));
    }
    encoding.decompress(body).map(Cow::Owned)
}

/// Effective media type: the `content-type` essence, lowercased, parameters dropped.
pub fn media_type(headers: &Headers) -> Option<String> {
    let raw = headers.get(CONTENT_TYPE)?;
    let essence = raw.split(';').next().unwrap_or_default().trim();
    if essence.is_empty() {
        return None;
    }
    Some(essence.to_ascii_lowercase())
}

pub fn is_json(headers: &Headers) -> bool {
    media_type(headers).is_some_and(|media_type| is_json_media_type(&media_type))
}

pub fn is_human_readable(headers: &Headers) -> bool {
    media_type(headers).is_some_and(|media_type| {
        media_type.starts_with("text/")
            || is_json_media_type(&media_type)
            || HUMAN_READABLE_TYPES.contains(&media_type.as_str())
    })
}

fn is_json_media_type(media_type: &str) -> bool {
    media_type == "application/json"
        || (media_type.starts_with("application/") && media_type.ends_with("+json"))
}

/// Parses and re-serializes a JSON body with two-space indentation and sorted keys.
pub fn canonical_json(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let value: Value = serde_json::from_slice(body).map_err(CodecError::InvalidJson)?;
    serde_json::to_vec_pretty(&value).map_err(CodecError::InvalidJson)
}

/// Normalizes a request body in place of its headers.
///
/// Compressed bodies are decoded and their `content-encoding` header dropped, then non-empty
/// JSON bodies are canonicalized. Running it on its own output is a no-op.
pub fn normalize_body(body: &[u8], headers: &mut Headers) -> Result<Vec<u8>, CodecError> {
    let decoded = decompress_if_needed(body, headers)?;
    let was_compressed = matches!(decoded, Cow::Owned(_));
    let mut normalized = decoded.into_owned();
    if was_compressed {
        headers.remove(CONTENT_ENCODING);
    }

    if !normalized.is_empty() && is_json(headers) {
        normalized = canonical_json(&normalized)?;
    }
    Ok(normalized)
}
