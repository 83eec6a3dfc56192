use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::bucket::{Bucket, BucketKey, BucketLimits, BucketUpdate};
use crate::request::PendingRequest;

/// The set of active buckets.
///
/// A bucket is present iff its queue is non-empty. Every queue mutation and
/// the create/remove decisions happen under the one lock, which is never held
/// across an await point.
#[derive(Default)]
pub(crate) struct BucketRegistry {
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl BucketRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BucketKey, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a request to its bucket, creating the bucket if needed.
    ///
    /// Returns `true` when the bucket had no pending work, i.e. a worker must
    /// be started for it.
    pub(crate) fn enqueue(&self, request: PendingRequest) -> bool {
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(request.info().key.clone())
            .or_insert_with(Bucket::new);

        // Must be checked before the request is added
        let had_work = !bucket.queue.is_empty();
        bucket.queue.push_back(request);
        !had_work
    }

    pub(crate) fn head(&self, key: &BucketKey) -> Option<PendingRequest> {
        self.lock()
            .get(key)
            .and_then(|bucket| bucket.queue.front().cloned())
    }

    /// Pops the finished head request and returns the next one.
    ///
    /// When the queue runs empty the bucket is removed and `None` is
    /// returned; the calling worker must stop.
    pub(crate) fn advance(&self, key: &BucketKey) -> Option<PendingRequest> {
        let mut buckets = self.lock();
        let bucket = buckets.get_mut(key)?;
        bucket.queue.pop_front();
        if let Some(next) = bucket.queue.front() {
            return Some(next.clone());
        }
        buckets.remove(key);
        None
    }

    pub(crate) fn apply_update(&self, key: &BucketKey, update: BucketUpdate) {
        if update.is_empty() {
            return;
        }
        if let Some(bucket) = self.lock().get_mut(key) {
            bucket.limits.apply(update);
        }
    }

    pub(crate) fn time_until_available(&self, key: &BucketKey, now: Instant) -> Duration {
        self.lock()
            .get(key)
            .map_or(Duration::ZERO, |bucket| {
                bucket.limits.time_until_available(now)
            })
    }

    pub(crate) fn limits(&self, key: &BucketKey) -> Option<BucketLimits> {
        self.lock().get(key).map(|bucket| bucket.limits)
    }

    pub(crate) fn contains(&self, key: &BucketKey) -> bool {
        self.lock().contains_key(key)
    }

    pub(crate) fn queue_len(&self, key: &BucketKey) -> usize {
        self.lock().get(key).map_or(0, |bucket| bucket.queue.len())
    }

    pub(crate) fn keys(&self) -> Vec<BucketKey> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}
