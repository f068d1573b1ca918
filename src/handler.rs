use std::sync::Arc;

use crate::{
    error::{ContractViolation, HandlerError, TapeError, UpstreamError},
    options::{FallbackMode, MatchingContext, Options, RecordMode},
    simulate::{ErrorRate, Latency},
    store::TapeStore,
    tape::{HttpRequest, HttpResponse, Tape},
    upstream::{HyperUpstream, Upstream, UpstreamRequest},
};

pub const NOT_FOUND_STATUS: u16 = 404;
pub const NOT_FOUND_BODY: &str = "talkback - tape not found";
pub const UPSTREAM_UNREACHABLE_STATUS: u16 = 502;
pub const UPSTREAM_UNREACHABLE_BODY: &str = "talkback - upstream unreachable";

/// Decides, per request, between replaying a tape, recording a new one, proxying, or failing.
#[derive(Debug)]
pub struct RequestHandler {
    options: Arc<Options>,
    store: Arc<TapeStore>,
    upstream: Arc<dyn Upstream>,
    latency: Latency,
    error_rate: ErrorRate,
}

impl RequestHandler {
    pub fn new(options: Arc<Options>, store: Arc<TapeStore>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            latency: Latency::new(options.latency.clone()),
            error_rate: ErrorRate::new(options.error_rate.clone()),
            options,
            store,
            upstream,
        }
    }

    /// Loads the tape directory and wires a real upstream client. No listener is started.
    pub async fn from_options(options: Options) -> anyhow::Result<Self> {
        let options = Arc::new(options);
        let store = Arc::new(TapeStore::new(Arc::clone(&options)));
        store.load().await?;
        let upstream = Arc::new(HyperUpstream::new()?);
        Ok(Self::new(options, store, upstream))
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn store(&self) -> &Arc<TapeStore> {
        &self.store
    }

    pub async fn handle(&self, req: HttpRequest) -> Result<HttpResponse, HandlerError> {
        let record_mode = self.options.record.resolve(&req)?;
        let context = MatchingContext::new();

        let req = match self.options.request_decorator.as_ref() {
            Some(decorate) => decorate(req, &context).map_err(|source| {
                HandlerError::DecoratorContract {
                    decorator: "request decorator",
                    source,
                }
            })?,
            None => req,
        };

        let candidate = Tape::new(req.clone(), &self.options)?;
        let matched = self.store.find(&candidate).await;

        let outgoing = match matched {
            Some(tape) if record_mode != RecordMode::Overwrite => {
                if self.error_rate.should_simulate(&req, Some(&tape))? {
                    return Ok(self.error_rate.simulate(&req));
                }
                self.latency.simulate(&req, Some(&tape)).await?;
                tape
            }
            matched => {
                let mut tape = matched.unwrap_or(candidate);
                match record_mode {
                    RecordMode::New | RecordMode::Overwrite => {
                        let response = match self.call_upstream(&req).await {
                            Ok(response) => response,
                            Err(err) => {
                                tracing::warn!(url = %req.url, "not recording: {err}");
                                return Ok(upstream_unreachable());
                            }
                        };
                        tape.res = Some(response);
                        if let Some(decorate) = self.options.tape_decorator.as_ref() {
                            tape = decorate(tape, &context).map_err(|source| {
                                HandlerError::DecoratorContract {
                                    decorator: "tape decorator",
                                    source,
                                }
                            })?;
                        }
                        self.store
                            .save(&mut tape)
                            .await
                            .map_err(|err| HandlerError::Store(err.into()))?;
                        tape
                    }
                    RecordMode::Disabled => {
                        tape.res = Some(self.fallback(&req).await?);
                        tape
                    }
                }
            }
        };

        self.respond(outgoing, &req, &context)
    }

    async fn fallback(&self, req: &HttpRequest) -> Result<HttpResponse, HandlerError> {
        let fallback_mode = self.options.fallback_mode.resolve(req)?;
        tracing::info!(
            url = %req.url,
            fallback_mode = %fallback_mode,
            "tape not found and recording is disabled"
        );
        tracing::debug!(url = %req.url, headers = ?req.headers, "unmatched request");

        match fallback_mode {
            FallbackMode::Proxy => {
                if self.error_rate.should_simulate(req, None)? {
                    return Ok(self.error_rate.simulate(req));
                }
                self.latency.simulate(req, None).await?;
                Ok(self.call_upstream(req).await.unwrap_or_else(|err| {
                    tracing::warn!(url = %req.url, "{err}");
                    upstream_unreachable()
                }))
            }
            FallbackMode::NotFound => Ok(HttpResponse::plain_text(NOT_FOUND_STATUS, NOT_FOUND_BODY)),
        }
    }

    /// An upstream error response is a response like any other; only a network failure is `Err`.
    async fn call_upstream(&self, req: &HttpRequest) -> Result<HttpResponse, UpstreamError> {
        let request = UpstreamRequest::new(&self.options.host, req);
        match self.upstream.fetch(request).await {
            Ok(response) | Err(UpstreamError::Response(response)) => Ok(response),
            Err(err) => Err(err),
        }
    }

    /// `outgoing` is an owned copy; stored tapes are never decorated.
    fn respond(
        &self,
        outgoing: Tape,
        req: &HttpRequest,
        context: &MatchingContext,
    ) -> Result<HttpResponse, HandlerError> {
        let name = outgoing.display_name().to_owned();
        let response = match self.options.response_decorator.as_ref() {
            None => outgoing.res,
            Some(decorate) => {
                let mut decorated = decorate(outgoing, req, context).map_err(|source| {
                    HandlerError::DecoratorContract {
                        decorator: "response decorator",
                        source,
                    }
                })?;
                if let Some(res) = decorated.res.as_mut()
                    && res.headers.contains("content-length")
                {
                    let length = res.body.len().to_string();
                    res.headers.insert("content-length", length);
                }
                match decorated.res {
                    Some(res) => Some(res),
                    None => {
                        return Err(HandlerError::DecoratorContract {
                            decorator: "response decorator",
                            source: ContractViolation::new("returned tape has no response"),
                        });
                    }
                }
            }
        };
        response.ok_or_else(|| HandlerError::Tape(TapeError::MissingResponse(name)))
    }
}

fn upstream_unreachable() -> HttpResponse {
    HttpResponse::plain_text(UPSTREAM_UNREACHABLE_STATUS, UPSTREAM_UNREACHABLE_BODY)
}
