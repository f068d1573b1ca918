use std::{error::Error as StdError, fmt};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Method, Request, Uri,
    header::{self, HeaderName, HeaderValue},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{
    error::UpstreamError,
    headers::Headers,
    tape::{HttpRequest, HttpResponse},
};

pub(crate) type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type UpstreamHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<UpstreamHttpsConnector, ProxyBody>;

/// What gets sent to the real host: the inbound request with its URL made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    /// Never carries `host`; the client derives it from `url`.
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl UpstreamRequest {
    pub fn new(host: &str, req: &HttpRequest) -> Self {
        let mut headers = req.headers.clone();
        headers.remove("host");
        Self {
            method: req.method.clone(),
            url: format!("{}{}", host.trim_end_matches('/'), req.url),
            headers,
            body: req.body.clone(),
        }
    }
}

/// The real upstream call.
///
/// A non-success answer is `Err(UpstreamError::Response)` and carries the full response; only a
/// missing response is `UpstreamError::Network`.
#[async_trait]
pub trait Upstream: Send + Sync + fmt::Debug {
    async fn fetch(&self, request: UpstreamRequest) -> Result<HttpResponse, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct HyperUpstream {
    client: HttpClient,
}

impl HyperUpstream {
    pub fn new() -> anyhow::Result<Self> {
        ensure_rustls_crypto_provider()?;
        let connector = build_https_connector()?;
        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        })
    }
}

#[async_trait]
impl Upstream for HyperUpstream {
    async fn fetch(&self, request: UpstreamRequest) -> Result<HttpResponse, UpstreamError> {
        let uri: Uri = request.url.parse().map_err(|err| {
            UpstreamError::Network(format!("invalid upstream url `{}`: {err}", request.url))
        })?;
        let method = Method::from_bytes(request.method.as_bytes()).map_err(|err| {
            UpstreamError::Network(format!("invalid method `{}`: {err}", request.method))
        })?;

        let mut headers = request.headers.to_header_map();
        strip_hop_by_hop_headers(&mut headers);
        // Decorators may have rewritten the body; hyper derives the length from it.
        headers.remove(header::CONTENT_LENGTH);
        set_host_header(&mut headers, &uri);

        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(request_headers) = builder.headers_mut() {
            *request_headers = headers;
        }
        let upstream_req = builder
            .body(boxed_full(request.body))
            .map_err(|err| UpstreamError::Network(format!("build upstream request: {err}")))?;

        tracing::debug!(url = %request.url, method = %request.method, "calling upstream");
        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(|err| UpstreamError::Network(format!("{}: {err}", request.url)))?;
        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| UpstreamError::Network(format!("read upstream body: {err}")))?
            .to_bytes();

        strip_hop_by_hop_headers(&mut parts.headers);
        let response = HttpResponse::new(
            parts.status.as_u16(),
            Headers::from_header_map(&parts.headers),
            body.to_vec(),
        );
        if parts.status.is_success() {
            Ok(response)
        } else {
            Err(UpstreamError::Response(response))
        }
    }
}

pub(crate) fn ensure_rustls_crypto_provider() -> anyhow::Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(anyhow::anyhow!("install rustls ring crypto provider"));
    }
    Ok(())
}

fn build_https_connector() -> anyhow::Result<UpstreamHttpsConnector> {
    let builder = match HttpsConnectorBuilder::new().with_native_roots() {
        Ok(builder) => builder,
        Err(err) => {
            tracing::warn!("no native TLS root certificates ({err}); https upstreams will fail");
            let tls = rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth();
            HttpsConnectorBuilder::new().with_tls_config(tls)
        }
    };
    Ok(builder.https_or_http().enable_http1().enable_http2().build())
}

pub(crate) fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

fn set_host_header(headers: &mut hyper::HeaderMap, uri: &Uri) {
    let Some(authority) = uri.authority() else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
        headers.insert(header::HOST, value);
    }
}

pub(crate) fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let mut to_remove = Vec::new();
    for value in headers.get_all(header::CONNECTION).iter() {
        let Ok(value) = value.to_str() else { continue };
        for name in value.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            to_remove.push(header_name);
        }
    }

    for header_name in to_remove {
        headers.remove(header_name);
    }

    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];
    for header_name in HOP_BY_HOP {
        headers.remove(*header_name);
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, net::SocketAddr};

    use bytes::Bytes;
    use http_body_util::{BodyExt as _, Full};
    use hyper::{
        Request, Response,
        body::Incoming,
        header::{self, HeaderValue},
        server::conn::http1,
        service::service_fn,
    };
    use hyper_util::rt::TokioIo;
    use serde_json::Value;
    use tokio::net::TcpListener;

    use super::{HyperUpstream, Upstream, UpstreamRequest, strip_hop_by_hop_headers};
    use crate::{error::UpstreamError, headers::Headers, tape::HttpRequest};

    async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let status = req
            .uri()
            .path()
            .strip_prefix("/status/")
            .and_then(|status| status.parse::<u16>().ok())
            .unwrap_or(200);
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let payload = serde_json::json!({
            "method": method,
            "host": host,
            "uri": uri,
            "body": String::from_utf8_lossy(&body),
        });
        Ok(Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(payload.to_string())))
            .unwrap())
    }

    async fn spawn_echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(echo))
                        .await;
                });
            }
        });
        addr
    }

    fn request(method: &str, url: &str, body: &str) -> HttpRequest {
        let headers: Headers = [("host", "localhost:8080"), ("x-trace", "abc")]
            .into_iter()
            .collect();
        HttpRequest::new(method, url, headers, body.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn upstream_request_joins_host_and_drops_host_header() {
        let upstream = UpstreamRequest::new("http://api.example.com/", &request("GET", "/a?b=1", ""));
        assert_eq!(upstream.url, "http://api.example.com/a?b=1");
        assert!(!upstream.headers.contains("host"));
        assert_eq!(upstream.headers.get("x-trace"), Some("abc"));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        strip_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn fetch_returns_upstream_response() {
        let addr = spawn_echo_upstream().await;
        let upstream = HyperUpstream::new().unwrap();
        let host = format!("http://{addr}");

        let response = upstream
            .fetch(UpstreamRequest::new(&host, &request("POST", "/echo?x=1", "hello")))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let echoed: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(echoed["method"], "POST");
        assert_eq!(echoed["uri"], "/echo?x=1");
        assert_eq!(echoed["host"], addr.to_string());
        assert_eq!(echoed["body"], "hello");
    }

    #[tokio::test]
    async fn non_success_status_is_an_upstream_response_error() {
        let addr = spawn_echo_upstream().await;
        let upstream = HyperUpstream::new().unwrap();

        let err = upstream
            .fetch(UpstreamRequest::new(
                &format!("http://{addr}"),
                &request("GET", "/status/418", ""),
            ))
            .await
            .unwrap_err();
        match err {
            UpstreamError::Response(response) => {
                assert_eq!(response.status, 418);
                assert_eq!(response.headers.get("content-type"), Some("application/json"));
            }
            other => panic!("expected response error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = HyperUpstream::new().unwrap();
        let err = upstream
            .fetch(UpstreamRequest::new(
                &format!("http://{addr}"),
                &request("GET", "/", ""),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Network(_)), "{err:?}");
    }
}
