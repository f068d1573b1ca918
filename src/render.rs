//! Tape documents on disk.
//!
//! A tape is stored as a JSON5 document with `req`, `res` and `meta` sections. Human-readable
//! bodies are kept readable (JSON as embedded values, other text as strings) so tapes can be
//! edited by hand; everything else is base64. Documents are written as pretty JSON, which any
//! JSON5 reader accepts, and read back with a full JSON5 parser that tolerates comments and
//! trailing commas.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, ser::PrettyFormatter};

use crate::{
    codec::{self, ContentEncoding},
    error::TapeError,
    headers::Headers,
    options::Options,
    simulate::LatencyValue,
    tape::{HttpRequest, HttpResponse, Metadata, Tape},
};

pub const TAPE_EXTENSION: &str = ".json5";
const INDENT: &[u8] = b"    ";

#[derive(Debug, Serialize, Deserialize)]
struct StoredTape {
    req: StoredRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    res: Option<StoredResponse>,
    meta: StoredMeta,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRequest {
    url: String,
    method: String,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    #[serde(default)]
    headers: Headers,
    #[serde(default)]
    body: Value,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredMeta {
    created_at: DateTime<Utc>,
    #[serde(default)]
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    latency: Option<LatencyValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_rate: Option<f64>,
    #[serde(default)]
    req_human_readable: bool,
    #[serde(default)]
    res_human_readable: bool,
    #[serde(default)]
    res_uncompressed: bool,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

struct RenderedBody {
    value: Value,
    human_readable: bool,
}

/// Renders `tape` as a tape document.
pub fn render(tape: &Tape) -> Result<String, TapeError> {
    let req = render_body(&tape.req.headers, &tape.req.body);

    let mut res_human_readable = false;
    let mut res_uncompressed = false;
    let res = tape.res.as_ref().map(|res| {
        let encoding = ContentEncoding::from_headers(&res.headers).ok();
        let decoded = match encoding {
            Some(encoding) if !encoding.is_uncompressed() && codec::is_human_readable(&res.headers) => {
                encoding.decompress(&res.body).ok()
            }
            _ => None,
        };
        let body = match decoded.as_deref() {
            Some(decoded) => {
                let rendered = render_body(&res.headers, decoded);
                res_uncompressed = rendered.human_readable;
                if rendered.human_readable {
                    rendered
                } else {
                    render_body(&res.headers, &res.body)
                }
            }
            None => render_body(&res.headers, &res.body),
        };
        res_human_readable = body.human_readable;
        StoredResponse {
            status: res.status,
            headers: res.headers.clone(),
            body: body.value,
        }
    });

    let stored = StoredTape {
        req: StoredRequest {
            url: tape.req.url.clone(),
            method: tape.req.method.clone(),
            headers: tape.req.headers.clone(),
            body: req.value,
        },
        res,
        meta: StoredMeta {
            created_at: tape.meta.created_at,
            host: tape.meta.host.clone(),
            latency: tape.meta.latency.clone(),
            error_rate: tape.meta.error_rate,
            req_human_readable: req.human_readable,
            res_human_readable,
            res_uncompressed,
            extra: tape.meta.extra.clone(),
        },
    };

    let mut out = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(INDENT));
    stored.serialize(&mut serializer).map_err(TapeError::Render)?;
    out.push(b'\n');
    // serde_json only ever writes UTF-8.
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Parses a tape document. The request goes through the same normalization as a live one, so
/// a stored tape always compares like a freshly built tape.
pub fn parse(document: &str, options: &Options) -> Result<Tape, TapeError> {
    let stored: StoredTape = json5::from_str(document).map_err(TapeError::Parse)?;
    let StoredTape { req, res, meta } = stored;

    let req_body = parse_body(req.body, meta.req_human_readable)?;
    let req = HttpRequest::new(&req.method, req.url, req.headers, req_body)?;
    let mut tape = Tape::new(req, options)?;

    tape.res = match res {
        Some(res) => {
            let mut body = parse_body(res.body, meta.res_human_readable)?;
            if meta.res_uncompressed {
                body = ContentEncoding::from_headers(&res.headers)?.compress(&body)?;
            }
            Some(HttpResponse::new(res.status, res.headers, body))
        }
        None => None,
    };
    tape.meta = Metadata {
        created_at: meta.created_at,
        host: meta.host,
        latency: meta.latency,
        error_rate: meta.error_rate,
        extra: meta.extra,
    };
    Ok(tape)
}

fn render_body(headers: &Headers, body: &[u8]) -> RenderedBody {
    if body.is_empty() {
        return RenderedBody {
            value: Value::String(String::new()),
            human_readable: true,
        };
    }
    if codec::is_human_readable(headers)
        && let Ok(text) = std::str::from_utf8(body)
    {
        // Embed JSON structurally only when reading it back reproduces the exact bytes.
        if codec::is_json(headers)
            && let Ok(value) = serde_json::from_str::<Value>(text)
            && (value.is_object() || value.is_array())
            && serde_json::to_string_pretty(&value).is_ok_and(|pretty| pretty == text)
        {
            return RenderedBody {
                value,
                human_readable: true,
            };
        }
        return RenderedBody {
            value: Value::String(text.to_owned()),
            human_readable: true,
        };
    }
    RenderedBody {
        value: Value::String(BASE64.encode(body)),
        human_readable: false,
    }
}

fn parse_body(value: Value, human_readable: bool) -> Result<Vec<u8>, TapeError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(text) if human_readable => Ok(text.into_bytes()),
        Value::String(text) => Ok(BASE64.decode(text)?),
        structured => serde_json::to_vec_pretty(&structured).map_err(TapeError::Render),
    }
}
