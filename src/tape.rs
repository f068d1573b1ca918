use std::{borrow::Cow, collections::BTreeMap};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::{
    codec,
    error::{CodecError, TapeError},
    headers::Headers,
    options::Options,
    simulate::LatencyValue,
};

const TOKEN_SPECIALS: &[u8] = b"!#$%&'*+-.^_`|~";

/// Inbound request as seen by the orchestrator: method, origin-form URL, headers, body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Validates the method token and that `url` is a path with an optional query.
    pub fn new(
        method: &str,
        url: impl Into<String>,
        headers: Headers,
        body: impl Into<Vec<u8>>,
    ) -> Result<Self, TapeError> {
        let url = url.into();
        if method.is_empty()
            || !method
                .bytes()
                .all(|byte| byte.is_ascii_alphanumeric() || TOKEN_SPECIALS.contains(&byte))
        {
            return Err(TapeError::InvalidRequest(format!(
                "invalid method `{method}`"
            )));
        }
        if !url.starts_with('/') {
            return Err(TapeError::InvalidRequest(format!(
                "url `{url}` must start with `/`"
            )));
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            url,
            headers,
            body: body.into(),
        })
    }

    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(path, _)| path)
    }

    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, query)| query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Headers, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    pub fn plain_text(status: u16, text: &str) -> Self {
        let mut headers = Headers::new();
        headers.insert("content-type", "text/plain");
        Self::new(status, headers, text.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub host: String,
    /// Overrides the configured latency when replaying this tape.
    pub latency: Option<LatencyValue>,
    /// Overrides the configured error rate when replaying this tape.
    pub error_rate: Option<f64>,
    /// Unrecognized keys from a stored tape, written back unchanged.
    pub extra: BTreeMap<String, Value>,
}

/// One recorded exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Tape {
    pub req: HttpRequest,
    pub res: Option<HttpResponse>,
    pub meta: Metadata,
    /// Relative storage key; `None` until the tape is saved.
    pub path: Option<String>,
    pub is_new: bool,
    pub used: bool,
}

impl Tape {
    /// Builds a tape around a normalized copy of `req`.
    pub fn new(req: HttpRequest, options: &Options) -> Result<Self, CodecError> {
        Ok(Self {
            req: normalize_request(req, options)?,
            res: None,
            meta: Metadata {
                created_at: Utc::now(),
                host: options.host.clone(),
                latency: None,
                error_rate: None,
                extra: BTreeMap::new(),
            },
            path: None,
            is_new: false,
            used: false,
        })
    }

    pub fn display_name(&self) -> &str {
        self.path.as_deref().unwrap_or("<unsaved>")
    }
}

/// Body first: encoding and media type detection need the headers that scrubbing may drop.
pub fn normalize_request(mut req: HttpRequest, options: &Options) -> Result<HttpRequest, CodecError> {
    req.body = codec::normalize_body(&req.body, &mut req.headers)?;

    for name in &options.ignore_headers {
        req.headers.remove(name);
    }

    req.url = strip_query_params(&req.url, &options.ignore_query_params);
    Ok(req)
}

/// Removes ignored query parameters, keeping the others in their original order.
pub fn strip_query_params(url: &str, ignore: &[String]) -> String {
    if ignore.is_empty() {
        return url.to_owned();
    }
    let Some((path, query)) = url.split_once('?') else {
        return url.to_owned();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|segment| !segment.is_empty())
        .filter(|segment| {
            let raw = segment.split_once('=').map_or(*segment, |(name, _)| name);
            let name = decode_query_name(raw);
            !ignore.iter().any(|ignored| *ignored == name)
        })
        .collect();

    if kept.is_empty() {
        path.to_owned()
    } else {
        format!("{path}?{}", kept.join("&"))
    }
}

/// Form-style decoding: `+` is a space. Undecodable names are compared raw.
fn decode_query_name(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['%', '+']) {
        return Cow::Borrowed(raw);
    }
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => Cow::Owned(decoded.into_owned()),
        Err(_) => Cow::Borrowed(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::{HttpRequest, Tape, normalize_request, strip_query_params};
    use crate::{error::TapeError, headers::Headers, options::Options};

    fn ignore(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn query_scrubbing_keeps_order_and_drops_empty_query() {
        assert_eq!(strip_query_params("/x?a=1&b=2", &ignore(&["a"])), "/x?b=2");
        assert_eq!(strip_query_params("/x?a=1&b=2", &ignore(&["a", "b"])), "/x");
        assert_eq!(
            strip_query_params("/x?c=3&a=1&b=2", &ignore(&["a"])),
            "/x?c=3&b=2"
        );
        assert_eq!(strip_query_params("/x?flag&a=1", &ignore(&["flag"])), "/x?a=1");
        assert_eq!(strip_query_params("/x?a=1", &[]), "/x?a=1");
        assert_eq!(strip_query_params("/x", &ignore(&["a"])), "/x");
    }

    #[test]
    fn query_scrubbing_compares_decoded_names() {
        assert_eq!(strip_query_params("/x?a%5B%5D=1&b=2", &ignore(&["a[]"])), "/x?b=2");
        assert_eq!(
            strip_query_params("/x?b=%20&my+key=1", &ignore(&["my key"])),
            "/x?b=%20"
        );
        assert_eq!(
            strip_query_params("/x?a%5B%5D=1&b%20c=2", &ignore(&["z"])),
            "/x?a%5B%5D=1&b%20c=2"
        );
        assert_eq!(strip_query_params("/x?%ZZ=1", &ignore(&["%ZZ"])), "/x");
    }

    #[test]
    fn request_validation_rejects_bad_method_and_url() {
        assert!(matches!(
            HttpRequest::new("GE T", "/", Headers::new(), Vec::new()),
            Err(TapeError::InvalidRequest(_))
        ));
        assert!(matches!(
            HttpRequest::new("GET", "http://example.com/", Headers::new(), Vec::new()),
            Err(TapeError::InvalidRequest(_))
        ));

        let req = HttpRequest::new("patch", "/a?b=1", Headers::new(), Vec::new()).unwrap();
        assert_eq!(req.method, "PATCH");
        assert_eq!(req.path(), "/a");
        assert_eq!(req.query(), Some("b=1"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let options = Options {
            ignore_headers: ignore(&["x-request-id"]),
            ignore_query_params: ignore(&["ts"]),
            ..Options::default()
        };
        let headers: Headers = [
            ("content-type", "application/json"),
            ("X-Request-Id", "abc"),
            ("accept", "*/*"),
        ]
        .into_iter()
        .collect();
        let req = HttpRequest::new("POST", "/items?ts=1&id=7", headers, br#"{"z":1, "a":2}"#.to_vec())
            .unwrap();

        let once = normalize_request(req, &options).unwrap();
        assert_eq!(once.url, "/items?id=7");
        assert!(!once.headers.contains("x-request-id"));
        assert_eq!(once.body, b"{\n  \"a\": 2,\n  \"z\": 1\n}");

        let twice = normalize_request(once.clone(), &options).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn new_tape_carries_configured_host() {
        let options = Options {
            host: "http://upstream.test".to_owned(),
            ..Options::default()
        };
        let req = HttpRequest::new("GET", "/", Headers::new(), Vec::new()).unwrap();
        let tape = Tape::new(req, &options).unwrap();
        assert_eq!(tape.meta.host, "http://upstream.test");
        assert!(tape.path.is_none());
        assert!(!tape.is_new && !tape.used);
    }
}
