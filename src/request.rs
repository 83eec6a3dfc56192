use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use crate::bucket::BucketKey;
use crate::handle::ResultHandle;
use crate::transport::Invocation;

/// Metadata describing a submitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub id: Uuid,
    pub key: BucketKey,
    pub submitted_at: Instant,
}

/// A request waiting in (or at the head of) its bucket's queue.
#[derive(Clone)]
pub(crate) struct PendingRequest {
    pub(crate) invocation: Arc<dyn Invocation>,
    pub(crate) handle: ResultHandle,
}

impl PendingRequest {
    pub(crate) fn new(key: BucketKey, invocation: Arc<dyn Invocation>) -> Self {
        let info = RequestInfo {
            id: Uuid::new_v4(),
            key,
            submitted_at: Instant::now(),
        };
        Self {
            invocation,
            handle: ResultHandle::new(info),
        }
    }

    pub(crate) fn info(&self) -> &RequestInfo {
        self.handle.request()
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("info", self.info())
            .field("done", &self.handle.is_done())
            .finish()
    }
}
