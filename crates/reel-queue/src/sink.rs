//! Enqueue side of the transport, as seen by the pipeline stages.

use async_trait::async_trait;

use crate::error::QueueResult;
use crate::job::QueueJob;

/// Anything the stages can hand follow-up messages to.
///
/// Implementations deduplicate by [`QueueJob::idempotency_key`] and report
/// a repeated key as [`QueueError::Duplicate`](crate::QueueError::Duplicate).
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Enqueue a job, returning its message id.
    async fn enqueue(&self, job: QueueJob) -> QueueResult<String>;
}
