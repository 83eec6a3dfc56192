use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::request::RequestInfo;
use crate::transport::Response;

/// Failure reported by a transport invocation.
///
/// Carries the response that caused it when the transport got that far, so
/// its rate-limit headers can still be honored.
#[derive(Debug, Clone)]
pub struct TransportFailure {
    message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    response: Option<Response>,
}

impl TransportFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            response: None,
        }
    }

    pub fn from_error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: error.to_string(),
            source: Some(Arc::new(error)),
            response: None,
        }
    }

    #[must_use]
    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.response {
            Some(response) => write!(f, "{} (status {})", self.message, response.status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Why a submitted request did not complete successfully.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Request {} to {} failed: {failure}", .request.id, .request.key)]
    Transport {
        request: RequestInfo,
        #[source]
        failure: TransportFailure,
    },

    #[error("Request {} to {} was rejected by an edge ban, retry after {retry_after:?}", .request.id, .request.key)]
    Banned {
        request: RequestInfo,
        response: Response,
        retry_after: Duration,
    },

    #[error("Request {} to {} was still throttled after {attempts} attempts", .request.id, .request.key)]
    RetriesExhausted {
        request: RequestInfo,
        attempts: u32,
        response: Response,
    },

    #[error("Request {} to {} was cancelled", .request.id, .request.key)]
    Cancelled { request: RequestInfo },

    #[error("Request {} to {} panicked during execution: {message}", .request.id, .request.key)]
    InvocationPanicked { request: RequestInfo, message: String },
}

impl DispatchError {
    /// The request this failure belongs to.
    pub fn request(&self) -> &RequestInfo {
        match self {
            DispatchError::Transport { request, .. }
            | DispatchError::Banned { request, .. }
            | DispatchError::RetriesExhausted { request, .. }
            | DispatchError::Cancelled { request }
            | DispatchError::InvocationPanicked { request, .. } => request,
        }
    }

    /// The response behind this failure, if one was received.
    pub fn response(&self) -> Option<&Response> {
        match self {
            DispatchError::Transport { failure, .. } => failure.response(),
            DispatchError::Banned { response, .. }
            | DispatchError::RetriesExhausted { response, .. } => Some(response),
            DispatchError::Cancelled { .. } | DispatchError::InvocationPanicked { .. } => None,
        }
    }
}

/// Returned when a result handle is resolved a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Result for request {0} was already resolved")]
pub struct AlreadyResolved(pub Uuid);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envconfig::Error),

    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid header name '{name}' configured for {field}")]
    InvalidHeaderName { field: &'static str, name: String },

    #[error("Dispatcher must be created inside a tokio runtime")]
    NoRuntime,
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
