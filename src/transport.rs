//! The boundary to the HTTP transport.
//!
//! The dispatcher never talks to the network itself. Each submitted request
//! carries an [`Invocation`] that performs the actual call and reports either
//! a [`Response`] or a [`TransportFailure`].

use std::future::Future;

use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::error::TransportFailure;

/// A transport response as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Executes one request against the transport.
///
/// An invocation is called again when its request is retried in place after
/// a throttled response, so it must be repeatable.
#[async_trait]
pub trait Invocation: Send + Sync + 'static {
    async fn invoke(&self) -> Result<Response, TransportFailure>;
}

#[async_trait]
impl<F, Fut> Invocation for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, TransportFailure>> + Send,
{
    async fn invoke(&self) -> Result<Response, TransportFailure> {
        (self)().await
    }
}
