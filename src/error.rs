use crate::tape::HttpResponse;

/// Invalid option values. Never retried; surfaced to whoever asked for the value.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid record mode `{0}`; expected one of NEW, OVERWRITE, DISABLED")]
    InvalidRecordMode(String),
    #[error("invalid fallback mode `{0}`; expected one of NOT_FOUND, PROXY")]
    InvalidFallbackMode(String),
    #[error("invalid latency: {0}")]
    InvalidLatency(String),
    #[error("invalid error rate: {0}")]
    InvalidErrorRate(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported content encoding `{0}`")]
    UnsupportedEncoding(String),
    #[error("body declared as JSON could not be parsed")]
    InvalidJson(#[source] serde_json::Error),
    #[error("transcode body")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TapeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("parse tape document")]
    Parse(#[source] json5::Error),
    #[error("render tape document")]
    Render(#[source] serde_json::Error),
    #[error("tape `{0}` has no recorded response")]
    MissingResponse(String),
    #[error("invalid base64 body in tape")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Returned by a decorator that produced no value.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Default)]
#[error("{reason}")]
pub struct ContractViolation {
    reason: String,
}

impl ContractViolation {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Fatal for the single request being handled.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{decorator} didn't return a value: {source}")]
    DecoratorContract {
        decorator: &'static str,
        #[source]
        source: ContractViolation,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tape(#[from] TapeError),
    #[error("persist tape")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::DecoratorContract { .. } => "decorator_contract",
            Self::Codec(_) => "codec",
            Self::Tape(_) => "tape",
            Self::Store(_) => "store",
        }
    }
}

/// Failure of the real upstream call.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The upstream answered, but with a non-success status.
    #[error("upstream responded with status {}", .0.status)]
    Response(HttpResponse),
    /// No response was received at all.
    #[error("upstream unreachable: {0}")]
    Network(String),
}
