//! Maps transport responses onto rate-limit state changes.
//!
//! Interpretation is a pure function of the response and the instant it was
//! observed. Applying the result to the bucket registry and the global
//! throttle is left to the worker.

use std::time::Duration;

use http::{HeaderMap, HeaderName, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;

use crate::bucket::BucketUpdate;
use crate::config::HeaderNames;
use crate::error::ConfigError;

/// Which limit a throttled response hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleScope {
    Route,
    Global,
}

/// What should happen to the request that produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The request is finished; hand the response to the caller.
    Complete,
    /// Throttled. Wait and retry the same request in place.
    Retry(ThrottleScope),
    /// Rejected by the edge layer before reaching the service. Terminal.
    Banned { retry_after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpretation {
    pub bucket: BucketUpdate,
    pub global_resume_at: Option<Instant>,
    pub verdict: Verdict,
}

/// Body of a 429 response from the service.
#[derive(Debug, Default, Deserialize)]
struct ThrottleBody {
    /// Seconds, fractional
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseInterpreter {
    global: HeaderName,
    remaining: HeaderName,
    reset: HeaderName,
    via: HeaderName,
    retry_after: HeaderName,
}

impl ResponseInterpreter {
    pub fn interpret(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        body: &str,
        observed_at: Instant,
    ) -> Interpretation {
        let mut bucket = BucketUpdate {
            remaining: self.parse_remaining(headers),
            reset_at: parse_seconds(headers, &self.reset)
                .and_then(|reset| instant_after(observed_at, reset)),
        };

        if status != StatusCode::TOO_MANY_REQUESTS {
            return Interpretation {
                bucket,
                global_resume_at: None,
                verdict: Verdict::Complete,
            };
        }

        if !headers.contains_key(&self.via) {
            let retry_after = parse_seconds(headers, &self.retry_after).unwrap_or_else(|| {
                tracing::debug!("Edge rejection carried no usable retry-after header");
                Duration::ZERO
            });
            return Interpretation {
                bucket,
                global_resume_at: Some(resume_at(observed_at, retry_after)),
                verdict: Verdict::Banned { retry_after },
            };
        }

        let body: ThrottleBody = serde_json::from_str(body).unwrap_or_default();
        let retry_after = body
            .retry_after
            .and_then(seconds_to_duration)
            .unwrap_or(Duration::ZERO);
        let global = body.global || self.is_global(headers);

        if global {
            Interpretation {
                bucket,
                global_resume_at: Some(resume_at(observed_at, retry_after)),
                verdict: Verdict::Retry(ThrottleScope::Global),
            }
        } else {
            bucket.remaining = Some(0);
            bucket.reset_at = Some(resume_at(observed_at, retry_after));
            Interpretation {
                bucket,
                global_resume_at: None,
                verdict: Verdict::Retry(ThrottleScope::Route),
            }
        }
    }

    fn is_global(&self, headers: &HeaderMap) -> bool {
        header_str(headers, &self.global).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    fn parse_remaining(&self, headers: &HeaderMap) -> Option<u32> {
        let value = header_str(headers, &self.remaining)?;
        match value.parse::<i64>() {
            Ok(remaining) => Some(u32::try_from(remaining.max(0)).unwrap_or(u32::MAX)),
            Err(_) => {
                tracing::debug!(header = %self.remaining, value, "Ignoring unparseable header");
                None
            }
        }
    }
}

impl Default for ResponseInterpreter {
    fn default() -> Self {
        Self {
            global: HeaderName::from_static("x-ratelimit-global"),
            remaining: HeaderName::from_static("x-ratelimit-remaining"),
            reset: HeaderName::from_static("x-ratelimit-reset"),
            via: HeaderName::from_static("via"),
            retry_after: HeaderName::from_static("retry-after"),
        }
    }
}

impl TryFrom<&HeaderNames> for ResponseInterpreter {
    type Error = ConfigError;

    fn try_from(names: &HeaderNames) -> Result<Self, Self::Error> {
        Ok(Self {
            global: header_name("global", &names.global)?,
            remaining: header_name("remaining", &names.remaining)?,
            reset: header_name("reset", &names.reset)?,
            via: header_name("via", &names.via)?,
            retry_after: header_name("retry_after", &names.retry_after)?,
        })
    }
}

fn header_name(field: &'static str, name: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConfigError::InvalidHeaderName {
        field,
        name: name.to_string(),
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

/// Parse a header holding a (possibly fractional) number of seconds.
fn parse_seconds(headers: &HeaderMap, name: &HeaderName) -> Option<Duration> {
    let value = header_str(headers, name)?;
    let parsed = value.parse::<f64>().ok().and_then(seconds_to_duration);
    if parsed.is_none() {
        tracing::debug!(header = %name, value, "Ignoring unparseable header");
    }
    parsed
}

/// `None` when the delay lies beyond what an `Instant` can represent.
fn instant_after(observed_at: Instant, delay: Duration) -> Option<Instant> {
    let instant = observed_at.checked_add(delay);
    if instant.is_none() {
        tracing::debug!(delay_secs = delay.as_secs(), "Ignoring out-of-range delay");
    }
    instant
}

/// An out-of-range delay falls back to no wait.
fn resume_at(observed_at: Instant, delay: Duration) -> Instant {
    instant_after(observed_at, delay).unwrap_or(observed_at)
}

/// Negative and NaN values clamp to zero; infinite values are rejected.
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds.max(0.0)).ok()
}
