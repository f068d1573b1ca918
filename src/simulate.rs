//! Latency and failure injection applied to replayed and proxied requests.

use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    tape::{HttpRequest, HttpResponse, Tape},
};

pub const ERROR_RESPONSE_STATUS: u16 = 503;
pub const ERROR_RESPONSE_BODY: &str = "talkback - failure injection";

/// Latency as written in configuration or tape metadata, in milliseconds.
///
/// Either a fixed delay or a `[low, high)` range drawn uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LatencyValue {
    Fixed(f64),
    Range(Vec<f64>),
}

impl LatencyValue {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Fixed(ms) => validate_millis(*ms),
            Self::Range(bounds) => {
                let [low, high] = bounds.as_slice() else {
                    return Err(ConfigError::InvalidLatency(format!(
                        "range must have exactly two elements, got {}",
                        bounds.len()
                    )));
                };
                validate_millis(*low)?;
                validate_millis(*high)?;
                if low > high {
                    return Err(ConfigError::InvalidLatency(format!(
                        "range low bound {low} exceeds high bound {high}"
                    )));
                }
                Ok(())
            }
        }
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Duration, ConfigError> {
        self.validate()?;
        let micros = match self {
            Self::Fixed(ms) => to_micros(*ms),
            Self::Range(bounds) => {
                let (low, high) = (bounds[0], bounds[1]);
                if low == high {
                    to_micros(low)
                } else {
                    // Truncation keeps the draw below `high`; the clamp covers a range
                    // narrower than a microsecond.
                    to_micros(rng.gen_range(low..high))
                        .min(to_micros(high).saturating_sub(1))
                        .max(to_micros(low))
                }
            }
        };
        Ok(Duration::from_micros(micros))
    }
}

fn to_micros(ms: f64) -> u64 {
    (ms * 1000.0) as u64
}

fn validate_millis(ms: f64) -> Result<(), ConfigError> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(ConfigError::InvalidLatency(format!(
            "{ms} is not a non-negative number of milliseconds"
        )));
    }
    Ok(())
}

pub type LatencyFn = Arc<dyn Fn(&HttpRequest) -> Duration + Send + Sync>;

#[derive(Clone)]
pub enum LatencySpec {
    Value(LatencyValue),
    Computed(LatencyFn),
}

impl fmt::Debug for LatencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

pub type ErrorRateFn = Arc<dyn Fn(&HttpRequest) -> f64 + Send + Sync>;

/// Probability of a synthetic failure, in percent (`0..=100`).
#[derive(Clone)]
pub enum ErrorRateSpec {
    Percent(f64),
    Computed(ErrorRateFn),
}

impl fmt::Debug for ErrorRateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(rate) => f.debug_tuple("Percent").field(rate).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

pub fn validate_error_rate(rate: f64) -> Result<(), ConfigError> {
    if !rate.is_finite() || !(0.0..=100.0).contains(&rate) {
        return Err(ConfigError::InvalidErrorRate(format!(
            "{rate} is not a percentage between 0 and 100"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct Latency {
    spec: Option<LatencySpec>,
}

impl Latency {
    pub fn new(spec: Option<LatencySpec>) -> Self {
        Self { spec }
    }

    /// Tape override first, then the configured spec. No spec means no delay.
    pub fn resolve(&self, req: &HttpRequest, tape: Option<&Tape>) -> Result<Duration, ConfigError> {
        self.resolve_with(req, tape, &mut rand::thread_rng())
    }

    pub fn resolve_with<R: Rng + ?Sized>(
        &self,
        req: &HttpRequest,
        tape: Option<&Tape>,
        rng: &mut R,
    ) -> Result<Duration, ConfigError> {
        if let Some(value) = tape.and_then(|tape| tape.meta.latency.as_ref()) {
            return value.draw(rng);
        }
        match self.spec.as_ref() {
            None => Ok(Duration::ZERO),
            Some(LatencySpec::Value(value)) => value.draw(rng),
            Some(LatencySpec::Computed(latency_fn)) => Ok(latency_fn(req)),
        }
    }

    pub async fn simulate(&self, req: &HttpRequest, tape: Option<&Tape>) -> Result<(), ConfigError> {
        let delay = self.resolve(req, tape)?;
        if delay.is_zero() {
            return Ok(());
        }
        tracing::debug!(url = %req.url, delay_ms = delay.as_millis() as u64, "simulating latency");
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ErrorRate {
    spec: Option<ErrorRateSpec>,
}

impl ErrorRate {
    pub fn new(spec: Option<ErrorRateSpec>) -> Self {
        Self { spec }
    }

    pub fn resolve(&self, req: &HttpRequest, tape: Option<&Tape>) -> Result<f64, ConfigError> {
        let rate = match tape.and_then(|tape| tape.meta.error_rate) {
            Some(rate) => rate,
            None => match self.spec.as_ref() {
                None => return Ok(0.0),
                Some(ErrorRateSpec::Percent(rate)) => *rate,
                Some(ErrorRateSpec::Computed(rate_fn)) => rate_fn(req),
            },
        };
        validate_error_rate(rate)?;
        Ok(rate)
    }

    pub fn should_simulate(&self, req: &HttpRequest, tape: Option<&Tape>) -> Result<bool, ConfigError> {
        self.should_simulate_with(req, tape, &mut rand::thread_rng())
    }

    pub fn should_simulate_with<R: Rng + ?Sized>(
        &self,
        req: &HttpRequest,
        tape: Option<&Tape>,
        rng: &mut R,
    ) -> Result<bool, ConfigError> {
        let rate = self.resolve(req, tape)?;
        if rate <= 0.0 {
            return Ok(false);
        }
        Ok(rng.gen_range(0.0..100.0) < rate)
    }

    pub fn simulate(&self, req: &HttpRequest) -> HttpResponse {
        tracing::info!(url = %req.url, "simulating failure");
        HttpResponse::plain_text(ERROR_RESPONSE_STATUS, ERROR_RESPONSE_BODY)
    }
}
