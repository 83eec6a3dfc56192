//! Bucket identity and per-bucket rate-limit state.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::request::PendingRequest;

/// Identifies the API endpoint a request targets (for example `translate`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(endpoint.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(endpoint: &str) -> Self {
        Self(endpoint.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(endpoint: String) -> Self {
        Self(endpoint)
    }
}

/// Rate-limit scope of a request: the endpoint plus an optional major parameter.
///
/// Two requests share a bucket iff their keys are equal. The major parameter
/// separates routes whose limits apply per resource instead of per endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    endpoint: EndpointId,
    major_parameter: Option<String>,
}

impl BucketKey {
    pub fn new(endpoint: impl Into<EndpointId>) -> Self {
        Self {
            endpoint: endpoint.into(),
            major_parameter: None,
        }
    }

    #[must_use]
    pub fn with_major_parameter(mut self, major_parameter: impl Into<String>) -> Self {
        self.major_parameter = Some(major_parameter.into());
        self
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn major_parameter(&self) -> Option<&str> {
        self.major_parameter.as_deref()
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.major_parameter {
            Some(major) => write!(f, "{}[{}]", self.endpoint, major),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

/// Changes to a bucket's counters derived from one response.
///
/// `None` fields leave the current value untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketUpdate {
    pub remaining: Option<u32>,
    pub reset_at: Option<Instant>,
}

impl BucketUpdate {
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.reset_at.is_none()
    }
}

/// Counters learned from server responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketLimits {
    /// Requests left before `reset_at`. `None` until a response reported it.
    remaining: Option<u32>,
    reset_at: Option<Instant>,
}

impl BucketLimits {
    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    pub fn reset_at(&self) -> Option<Instant> {
        self.reset_at
    }

    pub fn apply(&mut self, update: BucketUpdate) {
        if let Some(remaining) = update.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_at) = update.reset_at {
            self.reset_at = Some(reset_at);
        }
    }

    /// Time to wait before the next request may be sent.
    ///
    /// Only an exhausted bucket with a known reset in the future has to wait.
    pub fn time_until_available(&self, now: Instant) -> Duration {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) => reset_at.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }
}

/// A queue of pending requests sharing one [`BucketKey`].
pub(crate) struct Bucket {
    pub(crate) queue: VecDeque<PendingRequest>,
    pub(crate) limits: BucketLimits,
}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            limits: BucketLimits::default(),
        }
    }
}
