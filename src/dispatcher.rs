use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::Instrument;
use validator::Validate;

use crate::bucket::{BucketKey, BucketLimits, EndpointId};
use crate::config::DispatcherConfig;
use crate::error::ConfigError;
use crate::global::GlobalThrottle;
use crate::handle::ResultHandle;
use crate::interpreter::ResponseInterpreter;
use crate::metrics::{DispatchStats, StatsSnapshot};
use crate::registry::BucketRegistry;
use crate::request::PendingRequest;
use crate::transport::Invocation;
use crate::worker::BucketWorker;

/// State shared between a dispatcher and its bucket workers.
pub(crate) struct DispatchShared {
    pub(crate) config: DispatcherConfig,
    pub(crate) registry: BucketRegistry,
    pub(crate) global: GlobalThrottle,
    pub(crate) interpreter: ResponseInterpreter,
    pub(crate) stats: DispatchStats,
}

/// Queues requests per rate-limit bucket and executes each bucket in order.
///
/// Every bucket gets its own worker task while it has pending requests;
/// buckets run independently of each other but all honor the shared global
/// throttle. Cloning a dispatcher yields another handle to the same buckets.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    runtime: Handle,
}

impl Dispatcher {
    /// Create a dispatcher whose workers run on the current tokio runtime.
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        Self::with_runtime(config, runtime)
    }

    /// Create a dispatcher whose workers run on the given runtime.
    ///
    /// Requests may then be submitted from any thread.
    pub fn with_runtime(config: DispatcherConfig, runtime: Handle) -> Result<Self, ConfigError> {
        config.validate()?;
        let interpreter = ResponseInterpreter::try_from(&config.headers)?;

        Ok(Self {
            shared: Arc::new(DispatchShared {
                config,
                registry: BucketRegistry::new(),
                global: GlobalThrottle::new(),
                interpreter,
                stats: DispatchStats::new(),
            }),
            runtime,
        })
    }

    /// Queue a request for `endpoint`, optionally scoped by a major parameter.
    ///
    /// Never blocks and never fails; the outcome arrives through the handle.
    pub fn submit<I>(
        &self,
        endpoint: impl Into<EndpointId>,
        major_parameter: Option<String>,
        invocation: I,
    ) -> ResultHandle
    where
        I: Invocation,
    {
        let key = match major_parameter {
            Some(major) => BucketKey::new(endpoint).with_major_parameter(major),
            None => BucketKey::new(endpoint),
        };
        self.submit_to(key, invocation)
    }

    /// Queue a request into the bucket identified by `key`.
    pub fn submit_to<I>(&self, key: BucketKey, invocation: I) -> ResultHandle
    where
        I: Invocation,
    {
        let request = PendingRequest::new(key.clone(), Arc::new(invocation));
        let handle = request.handle.clone();
        self.shared.stats.record_submitted();

        if self.shared.registry.enqueue(request) {
            self.shared.stats.record_worker_spawned();
            tracing::debug!(bucket = %key, "Starting worker for bucket");
            let span = tracing::debug_span!("bucket_worker", bucket = %key);
            let worker = BucketWorker::new(key, Arc::clone(&self.shared));
            self.runtime.spawn(worker.run().instrument(span));
        }

        handle
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Keys of all buckets that currently have pending requests.
    pub fn active_buckets(&self) -> Vec<BucketKey> {
        self.shared.registry.keys()
    }

    pub fn active_bucket_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_active(&self, key: &BucketKey) -> bool {
        self.shared.registry.contains(key)
    }

    /// Number of requests queued for `key`, including the one executing.
    pub fn queue_len(&self, key: &BucketKey) -> usize {
        self.shared.registry.queue_len(key)
    }

    /// Rate-limit counters of an active bucket.
    pub fn bucket_limits(&self, key: &BucketKey) -> Option<BucketLimits> {
        self.shared.registry.limits(key)
    }

    /// Time left until the global throttle lifts, zero if none is active.
    pub fn global_resume_in(&self) -> Duration {
        self.shared.global.time_until_available(Instant::now())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.shared.config)
            .field("active_buckets", &self.shared.registry.len())
            .field("global_resume_at", &self.shared.global.resume_at())
            .finish()
    }
}
