use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Process-wide throttle shared by every bucket of a dispatcher.
///
/// Set when the server reports a global limit or an edge ban; every worker
/// waits for it before executing.
#[derive(Debug, Default)]
pub struct GlobalThrottle {
    resume_at: Mutex<Option<Instant>>,
}

impl GlobalThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resume_at(&self) -> Option<Instant> {
        *self.resume_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the resume instant with a fresher server signal.
    pub fn set_resume_at(&self, resume_at: Instant) {
        *self.resume_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(resume_at);
    }

    pub fn time_until_available(&self, now: Instant) -> Duration {
        self.resume_at()
            .map_or(Duration::ZERO, |resume_at| {
                resume_at.saturating_duration_since(now)
            })
    }
}
