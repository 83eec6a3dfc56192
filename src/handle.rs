//! Single-assignment result handles returned by [`Dispatcher::submit`].
//!
//! [`Dispatcher::submit`]: crate::Dispatcher::submit

use std::fmt;
use std::future::IntoFuture;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::error::{AlreadyResolved, DispatchError, Result};
use crate::request::RequestInfo;
use crate::transport::Response;

/// Final outcome of a submitted request.
pub type Outcome = Result<Response>;

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

#[derive(Default)]
struct State {
    outcome: Option<Outcome>,
    callbacks: Vec<Callback>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    resolved: Condvar,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves exactly once, to either the transport's response or a
/// [`DispatchError`].
///
/// Handles are cheap to clone; every clone observes the same outcome.
#[derive(Clone)]
pub struct ResultHandle {
    request: RequestInfo,
    shared: Arc<Shared>,
}

impl ResultHandle {
    pub(crate) fn new(request: RequestInfo) -> Self {
        Self {
            request,
            shared: Arc::new(Shared::default()),
        }
    }

    /// The request this handle belongs to.
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    /// Returns the outcome without waiting, if there is one.
    pub fn try_get(&self) -> Option<Outcome> {
        self.shared.lock().outcome.clone()
    }

    /// Waits asynchronously for the outcome.
    pub async fn wait(&self) -> Outcome {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Blocks the current thread until the outcome is available.
    ///
    /// Must not be called from a task running on the dispatcher's runtime.
    pub fn wait_blocking(&self) -> Outcome {
        let mut state = self.shared.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .shared
                .resolved
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Registers a continuation that runs once with the outcome.
    ///
    /// Runs immediately on the calling thread if the handle is already
    /// resolved, otherwise on the thread that resolves it.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let mut state = self.shared.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                run_callback(Box::new(callback), &outcome);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Fails the request with [`DispatchError::Cancelled`].
    ///
    /// Returns `false` if the request had already been resolved. A queued
    /// request that was cancelled is skipped by its bucket's worker.
    pub fn cancel(&self) -> bool {
        self.resolve(Err(DispatchError::Cancelled {
            request: self.request.clone(),
        }))
        .is_ok()
    }

    pub(crate) fn resolve(&self, outcome: Outcome) -> Result<(), AlreadyResolved> {
        let callbacks = {
            let mut state = self.shared.lock();
            if state.outcome.is_some() {
                return Err(AlreadyResolved(self.request.id));
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };

        self.shared.resolved.notify_all();
        self.shared.notify.notify_waiters();

        for callback in callbacks {
            run_callback(callback, &outcome);
        }
        Ok(())
    }
}

fn run_callback(callback: Callback, outcome: &Outcome) {
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        tracing::warn!("A result handle continuation panicked");
    }
}

impl IntoFuture for ResultHandle {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("request", &self.request)
            .field("done", &self.is_done())
            .finish()
    }
}
