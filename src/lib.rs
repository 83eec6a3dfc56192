//! A rate-limit-aware request dispatcher for API clients.
//!
//! Requests are grouped into buckets by endpoint and optional major
//! parameter. Each bucket executes its requests strictly in submission order
//! on its own worker task, pausing whenever the server reports the bucket or
//! the whole client as rate limited.
//!
//! ```no_run
//! use bucket_dispatch::{Dispatcher, DispatcherConfig, Response, TransportFailure};
//! use http::StatusCode;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//! let handle = dispatcher.submit("translate", Some("doc-1".to_string()), || async {
//!     Ok::<_, TransportFailure>(Response::new(StatusCode::OK))
//! });
//! let response = handle.await?;
//! assert_eq!(response.status, StatusCode::OK);
//! # Ok(())
//! # }
//! ```

pub mod bucket;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod global;
pub mod handle;
pub mod interpreter;
pub mod metrics;
mod registry;
pub mod request;
pub mod transport;
mod worker;

pub use bucket::{BucketKey, BucketLimits, EndpointId};
pub use config::{DispatcherConfig, HeaderNames};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DispatchError, Result, TransportFailure};
pub use handle::{Outcome, ResultHandle};
pub use metrics::StatsSnapshot;
pub use request::RequestInfo;
pub use transport::{Invocation, Response};
