use std::{
    convert::Infallible,
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context as _, anyhow};
use http_body_util::BodyExt as _;
use hyper::{
    Method, Request, Response, StatusCode,
    body::Incoming,
    header::{self, HeaderValue},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::{net::TcpListener, sync::oneshot};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument as _;

use crate::{
    handler::RequestHandler,
    headers::Headers,
    options::{HttpsOptions, Options},
    summary::Summary,
    tape::{HttpRequest, HttpResponse},
    upstream::{ProxyBody, boxed_full, ensure_rustls_crypto_provider, strip_hop_by_hop_headers},
};

/// A running proxy. Dropping it leaves the listener running; call [`ProxyHandle::shutdown`].
#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    handler: Arc<RequestHandler>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    join: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxyHandle {
    /// Stops accepting connections. Only the first call does anything; it returns the usage
    /// summary when `summary` is enabled.
    pub async fn shutdown(&self) -> Option<Summary> {
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let _ = shutdown_tx.send(());
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            let _ = join.await;
        }
        tracing::info!(listen_addr = %self.listen_addr, "stopped talkback");

        if !self.handler.options().summary {
            return None;
        }
        Some(Summary::from_tapes(&self.handler.store().tapes().await))
    }

    pub async fn has_tape_been_used(&self, tape_name: &str) -> bool {
        self.handler.store().has_tape_been_used(tape_name).await
    }

    pub async fn reset_tape_usage(&self) {
        self.handler.store().reset_tape_usage().await;
    }

    pub fn handler(&self) -> &Arc<RequestHandler> {
        &self.handler
    }
}

/// Loads tapes from `options.path` and starts listening on `options.listen`.
pub async fn serve(options: Options) -> anyhow::Result<ProxyHandle> {
    let handler = RequestHandler::from_options(options).await?;
    serve_with_handler(Arc::new(handler)).await
}

/// Starts listening with an already wired handler, e.g. one with a custom upstream.
pub async fn serve_with_handler(handler: Arc<RequestHandler>) -> anyhow::Result<ProxyHandle> {
    ensure_rustls_crypto_provider()?;
    let tls = build_tls_acceptor(&handler.options().https)?;

    let listen = handler.options().listen;
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|err| anyhow!("bind {listen}: {err}"))?;
    let listen_addr = listener
        .local_addr()
        .map_err(|err| anyhow!("get local_addr: {err}"))?;
    tracing::info!(%listen_addr, tls = tls.is_some(), "starting talkback");

    let state = Arc::clone(&handler);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let Ok((stream, _peer)) = accept else { continue };
                    let handler = Arc::clone(&state);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| proxy_handler(req, Arc::clone(&handler)));
                        let builder = ConnectionBuilder::new(TokioExecutor::new());
                        let served = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    builder.serve_connection(TokioIo::new(stream), service).await
                                }
                                Err(err) => {
                                    tracing::debug!("TLS handshake failed: {err}");
                                    return;
                                }
                            },
                            None => builder.serve_connection(TokioIo::new(stream), service).await,
                        };
                        if let Err(err) = served {
                            tracing::debug!("connection error: {err}");
                        }
                    });
                }
            }
        }
    });

    Ok(ProxyHandle {
        listen_addr,
        handler,
        shutdown_tx: Mutex::new(Some(shutdown_tx)),
        join: Mutex::new(Some(join)),
    })
}

fn build_tls_acceptor(https: &HttpsOptions) -> anyhow::Result<Option<TlsAcceptor>> {
    if !https.enabled {
        return Ok(None);
    }
    let cert_path = https
        .cert_path
        .as_deref()
        .context("https is enabled but `cert_path` is not set")?;
    let key_path = https
        .key_path
        .as_deref()
        .context("https is enabled but `key_path` is not set")?;

    let cert_chain = load_certs(cert_path)?;
    let private_key = load_private_key(key_path)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .map_err(|err| anyhow!("build TLS server certificate: {err}"))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("open TLS cert {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse TLS cert {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("open TLS key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse TLS key {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

async fn proxy_handler(
    req: Request<Incoming>,
    handler: Arc<RequestHandler>,
) -> Result<Response<ProxyBody>, Infallible> {
    let method = req.method().to_string();
    let url = req
        .uri()
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str())
        .to_owned();
    let span = tracing::info_span!("proxy.request", method = %method, url = %url);
    Ok(handle_request(req, &handler, &method, url)
        .instrument(span)
        .await)
}

/// Every failure past this point is a 500 with an empty body; the connection stays usable.
async fn handle_request(
    req: Request<Incoming>,
    handler: &RequestHandler,
    method: &str,
    url: String,
) -> Response<ProxyBody> {
    let is_head = req.method() == Method::HEAD;
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            tracing::error!("read request body: {err}");
            return internal_error();
        }
    };

    let mut headers = parts.headers;
    strip_hop_by_hop_headers(&mut headers);
    let request = match HttpRequest::new(
        method,
        url,
        Headers::from_header_map(&headers),
        body.to_vec(),
    ) {
        Ok(request) => request,
        Err(err) => {
            tracing::error!("rejecting request: {err}");
            return internal_error();
        }
    };

    match handler.handle(request).await {
        Ok(response) => {
            tracing::info!(status = response.status, "proxy request completed");
            to_hyper_response(response, is_head)
        }
        Err(err) => {
            let kind = err.kind();
            let cause = anyhow::Error::from(err);
            tracing::error!(kind, "error handling request: {cause:#}");
            internal_error()
        }
    }
}

/// `content-length` always describes the buffered body, which may differ from what was recorded.
fn to_hyper_response(response: HttpResponse, is_head: bool) -> Response<ProxyBody> {
    let Ok(status) = StatusCode::from_u16(response.status) else {
        tracing::error!(status = response.status, "tape has an invalid status code");
        return internal_error();
    };
    let mut headers = response.headers.to_header_map();
    strip_hop_by_hop_headers(&mut headers);
    if !is_head {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(response.body.len()));
    }

    let mut out = Response::new(boxed_full(response.body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

fn internal_error() -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Vec::new()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
