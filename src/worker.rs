use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::bucket::BucketKey;
use crate::dispatcher::DispatchShared;
use crate::error::DispatchError;
use crate::handle::Outcome;
use crate::interpreter::{Interpretation, ThrottleScope, Verdict};
use crate::request::PendingRequest;
use crate::transport::Response;

enum Step {
    /// Execute the same head request again
    Retry,
    /// The head request is resolved; move on
    Done,
}

/// Drains one bucket's queue, one request at a time.
///
/// Exactly one worker exists per registered bucket. It stops once the queue
/// runs empty, at which point the registry has already dropped the bucket.
pub(crate) struct BucketWorker {
    key: BucketKey,
    shared: Arc<DispatchShared>,
}

impl BucketWorker {
    pub(crate) fn new(key: BucketKey, shared: Arc<DispatchShared>) -> Self {
        Self { key, shared }
    }

    pub(crate) async fn run(self) {
        let Some(mut request) = self.shared.registry.head(&self.key) else {
            return;
        };
        let mut attempts = 0;

        loop {
            let step = if request.handle.is_done() {
                self.skip(&request);
                Step::Done
            } else {
                self.wait_for_capacity().await;
                if request.handle.is_done() {
                    self.skip(&request);
                    Step::Done
                } else {
                    attempts += 1;
                    self.execute(&request, attempts).await
                }
            };

            if let Step::Done = step {
                attempts = 0;
                match self.shared.registry.advance(&self.key) {
                    Some(next) => request = next,
                    None => break,
                }
            }
        }

        debug!(bucket = %self.key, "Bucket drained, stopping worker");
    }

    /// Sleeps until both the bucket and the global throttle allow a request.
    async fn wait_for_capacity(&self) {
        loop {
            let now = Instant::now();
            let wait = self
                .shared
                .registry
                .time_until_available(&self.key, now)
                .max(self.shared.global.time_until_available(now));
            if wait.is_zero() {
                return;
            }

            debug!(
                bucket = %self.key,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Delaying request to prevent hitting rate limits"
            );
            // Recheck afterwards: another worker may have set a fresher global throttle
            time::sleep_until(now + wait).await;
        }
    }

    /// Runs one attempt; a panic in the invocation or while handling its
    /// response resolves the request instead of killing the worker.
    async fn execute(&self, request: &PendingRequest, attempts: u32) -> Step {
        match AssertUnwindSafe(self.attempt(request, attempts))
            .catch_unwind()
            .await
        {
            Ok(step) => step,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    bucket = %self.key,
                    request_id = %request.info().id,
                    %message,
                    "Encountered unexpected panic while executing request"
                );
                self.resolve(
                    request,
                    Err(DispatchError::InvocationPanicked {
                        request: request.info().clone(),
                        message,
                    }),
                );
                Step::Done
            }
        }
    }

    async fn attempt(&self, request: &PendingRequest, attempts: u32) -> Step {
        let result = request.invocation.invoke().await;
        let observed_at = Instant::now();

        match result {
            Ok(response) => self.handle_response(request, response, observed_at, attempts),
            Err(failure) => {
                if let Some(response) = failure.response() {
                    let interpretation = self.interpret(response, observed_at);
                    self.apply(&interpretation);
                }
                debug!(
                    bucket = %self.key,
                    request_id = %request.info().id,
                    error = %failure,
                    "Request failed"
                );
                self.resolve(
                    request,
                    Err(DispatchError::Transport {
                        request: request.info().clone(),
                        failure,
                    }),
                );
                Step::Done
            }
        }
    }

    fn handle_response(
        &self,
        request: &PendingRequest,
        response: Response,
        observed_at: Instant,
        attempts: u32,
    ) -> Step {
        let interpretation = self.interpret(&response, observed_at);
        self.apply(&interpretation);

        match interpretation.verdict {
            Verdict::Complete => {
                self.resolve(request, Ok(response));
                Step::Done
            }
            Verdict::Retry(scope) => {
                self.shared.stats.record_throttle(scope);
                match scope {
                    ThrottleScope::Global => warn!(
                        bucket = %self.key,
                        "Hit a global rate limit! Too many requests were sent within a short time frame"
                    ),
                    ThrottleScope::Route => debug!(
                        bucket = %self.key,
                        "Received a 429 response, pausing bucket before retrying"
                    ),
                }

                match self.shared.config.max_throttle_retries {
                    Some(max_retries) if attempts > max_retries => {
                        warn!(
                            bucket = %self.key,
                            request_id = %request.info().id,
                            attempts,
                            "Giving up on request that stayed throttled"
                        );
                        self.resolve(
                            request,
                            Err(DispatchError::RetriesExhausted {
                                request: request.info().clone(),
                                attempts,
                                response,
                            }),
                        );
                        Step::Done
                    }
                    _ => Step::Retry,
                }
            }
            Verdict::Banned { retry_after } => {
                self.shared.stats.record_ban();
                warn!(
                    bucket = %self.key,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Hit an edge ban! A very large amount of invalid requests was sent"
                );
                self.resolve(
                    request,
                    Err(DispatchError::Banned {
                        request: request.info().clone(),
                        response,
                        retry_after,
                    }),
                );
                Step::Done
            }
        }
    }

    fn interpret(&self, response: &Response, observed_at: Instant) -> Interpretation {
        self.shared.interpreter.interpret(
            response.status,
            &response.headers,
            &response.body,
            observed_at,
        )
    }

    fn apply(&self, interpretation: &Interpretation) {
        self.shared
            .registry
            .apply_update(&self.key, interpretation.bucket);
        if let Some(resume_at) = interpretation.global_resume_at {
            self.shared.global.set_resume_at(resume_at);
        }
    }

    fn resolve(&self, request: &PendingRequest, outcome: Outcome) {
        let succeeded = outcome.is_ok();
        match request.handle.resolve(outcome) {
            Ok(()) if succeeded => self.shared.stats.record_completed(),
            Ok(()) => self.shared.stats.record_failed(),
            Err(err) => {
                self.shared.stats.record_cancelled();
                warn!(bucket = %self.key, %err, "Discarding outcome of an already resolved request");
            }
        }
    }

    fn skip(&self, request: &PendingRequest) {
        self.shared.stats.record_cancelled();
        debug!(
            bucket = %self.key,
            request_id = %request.info().id,
            "Skipping request that was cancelled before execution"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
