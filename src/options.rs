use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use uuid::Uuid;

use crate::{
    config::Config,
    error::{ConfigError, ContractViolation},
    matcher::{self, MatcherOverrides},
    simulate::{ErrorRateSpec, LatencySpec, validate_error_rate},
    tape::{HttpRequest, Tape},
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TAPE_PATH: &str = "./tapes/";
pub const DEFAULT_IGNORED_HEADERS: &[&str] = &["content-length", "host"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    /// Record requests that have no matching tape.
    New,
    /// Always hit the upstream and rewrite the tape, matched or not.
    Overwrite,
    Disabled,
}

impl FromStr for RecordMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "OVERWRITE" => Ok(Self::Overwrite),
            "DISABLED" => Ok(Self::Disabled),
            _ => Err(ConfigError::InvalidRecordMode(s.to_owned())),
        }
    }
}

impl fmt::Display for RecordMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "NEW",
            Self::Overwrite => "OVERWRITE",
            Self::Disabled => "DISABLED",
        })
    }
}

/// What to do with an unmatched request while recording is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    NotFound,
    Proxy,
}

impl FromStr for FallbackMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NOT_FOUND" => Ok(Self::NotFound),
            "PROXY" => Ok(Self::Proxy),
            _ => Err(ConfigError::InvalidFallbackMode(s.to_owned())),
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "NOT_FOUND",
            Self::Proxy => "PROXY",
        })
    }
}

pub type ModeFn = Arc<dyn Fn(&HttpRequest) -> String + Send + Sync>;

/// A mode that is either fixed or computed from each request.
///
/// Computed values are parsed per request, so an unknown value is reported before any I/O.
#[derive(Clone)]
pub enum ModeSource<T> {
    Static(T),
    Computed(ModeFn),
}

impl<T> ModeSource<T>
where
    T: Copy + FromStr<Err = ConfigError>,
{
    pub fn resolve(&self, req: &HttpRequest) -> Result<T, ConfigError> {
        match self {
            Self::Static(mode) => Ok(*mode),
            Self::Computed(mode_fn) => mode_fn(req).parse(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ModeSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(mode) => f.debug_tuple("Static").field(mode).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Per-request correlation token handed to every decorator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingContext {
    pub id: Uuid,
}

impl MatchingContext {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for MatchingContext {
    fn default() -> Self {
        Self::new()
    }
}

pub type RequestDecorator =
    Arc<dyn Fn(HttpRequest, &MatchingContext) -> Result<HttpRequest, ContractViolation> + Send + Sync>;
pub type TapeDecorator =
    Arc<dyn Fn(Tape, &MatchingContext) -> Result<Tape, ContractViolation> + Send + Sync>;
pub type ResponseDecorator = Arc<
    dyn Fn(Tape, &HttpRequest, &MatchingContext) -> Result<Tape, ContractViolation> + Send + Sync,
>;
/// Names a new tape from the current tape count. `.json5` is appended when missing.
pub type TapeNameGenerator = Arc<dyn Fn(usize, &Tape) -> String + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpsOptions {
    pub enabled: bool,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
}

/// Runtime options. Built from [`Config`] and extended in code with closures.
#[derive(Clone)]
pub struct Options {
    pub listen: SocketAddr,
    /// Upstream base URL, e.g. `https://api.example.com`.
    pub host: String,
    pub path: PathBuf,
    pub record: ModeSource<RecordMode>,
    pub fallback_mode: ModeSource<FallbackMode>,
    pub ignore_headers: Vec<String>,
    pub ignore_query_params: Vec<String>,
    /// Headers the matcher compares; all others are ignored when matching.
    pub match_headers: Vec<String>,
    pub latency: Option<LatencySpec>,
    pub error_rate: Option<ErrorRateSpec>,
    pub https: HttpsOptions,
    pub summary: bool,
    pub tape_name_generator: Option<TapeNameGenerator>,
    pub request_decorator: Option<RequestDecorator>,
    pub tape_decorator: Option<TapeDecorator>,
    pub response_decorator: Option<ResponseDecorator>,
    pub matchers: MatcherOverrides,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            host: String::new(),
            path: PathBuf::from(DEFAULT_TAPE_PATH),
            record: ModeSource::Static(RecordMode::New),
            fallback_mode: ModeSource::Static(FallbackMode::NotFound),
            ignore_headers: DEFAULT_IGNORED_HEADERS
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            ignore_query_params: Vec::new(),
            match_headers: Vec::new(),
            latency: None,
            error_rate: None,
            https: HttpsOptions::default(),
            summary: true,
            tape_name_generator: None,
            request_decorator: None,
            tape_decorator: None,
            response_decorator: None,
            matchers: MatcherOverrides::default(),
        }
    }
}

impl Options {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let tapes = &config.tapes;

        let latency = match tapes.latency.clone() {
            Some(value) => {
                value.validate()?;
                Some(LatencySpec::Value(value))
            }
            None => None,
        };
        let error_rate = match tapes.error_rate {
            Some(rate) => {
                validate_error_rate(rate)?;
                Some(ErrorRateSpec::Percent(rate))
            }
            None => None,
        };
        let mut matchers = MatcherOverrides::default();
        if tapes.ignore_body {
            matchers.body = Some(matcher::ignore_body());
        }

        Ok(Self {
            listen: config.proxy.listen.unwrap_or(defaults.listen),
            host: config.proxy.host.clone().unwrap_or_default(),
            path: tapes.path.clone().unwrap_or(defaults.path),
            record: ModeSource::Static(match tapes.record.as_deref() {
                Some(raw) => raw.parse()?,
                None => RecordMode::New,
            }),
            fallback_mode: ModeSource::Static(match tapes.fallback_mode.as_deref() {
                Some(raw) => raw.parse()?,
                None => FallbackMode::NotFound,
            }),
            ignore_headers: tapes
                .ignore_headers
                .clone()
                .unwrap_or(defaults.ignore_headers),
            ignore_query_params: tapes.ignore_query_params.clone(),
            match_headers: tapes.match_headers.clone(),
            latency,
            error_rate,
            https: config
                .proxy
                .https
                .as_ref()
                .map(|https| HttpsOptions {
                    enabled: https.enabled,
                    key_path: https.key_path.clone(),
                    cert_path: https.cert_path.clone(),
                })
                .unwrap_or_default(),
            summary: config.proxy.summary.unwrap_or(defaults.summary),
            matchers,
            ..defaults
        })
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("listen", &self.listen)
            .field("host", &self.host)
            .field("path", &self.path)
            .field("record", &self.record)
            .field("fallback_mode", &self.fallback_mode)
            .field("ignore_headers", &self.ignore_headers)
            .field("ignore_query_params", &self.ignore_query_params)
            .field("match_headers", &self.match_headers)
            .field("latency", &self.latency)
            .field("error_rate", &self.error_rate)
            .field("https", &self.https)
            .field("summary", &self.summary)
            .field("tape_name_generator", &self.tape_name_generator.is_some())
            .field("request_decorator", &self.request_decorator.is_some())
            .field("tape_decorator", &self.tape_decorator.is_some())
            .field("response_decorator", &self.response_decorator.is_some())
            .finish_non_exhaustive()
    }
}
