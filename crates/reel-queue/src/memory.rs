//! In-process queue for tests and single-binary runs.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{QueueError, QueueResult};
use crate::job::QueueJob;
use crate::sink::JobSink;

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    pending: VecDeque<(String, QueueJob)>,
    dedup: HashSet<String>,
    enqueued: Vec<QueueJob>,
}

/// FIFO queue with the same dedup semantics as the Redis stream.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next message, if any.
    pub async fn pop(&self) -> Option<(String, QueueJob)> {
        self.inner.lock().await.pending.pop_front()
    }

    /// Take every queued message.
    pub async fn drain(&self) -> Vec<(String, QueueJob)> {
        self.inner.lock().await.pending.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every job ever accepted, in enqueue order.
    pub async fn history(&self) -> Vec<QueueJob> {
        self.inner.lock().await.enqueued.clone()
    }

    pub async fn clear_dedup(&self, job: &QueueJob) {
        self.inner.lock().await.dedup.remove(&job.idempotency_key());
    }
}

#[async_trait]
impl JobSink for MemoryQueue {
    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let mut inner = self.inner.lock().await;
        let key = job.idempotency_key();
        if !inner.dedup.insert(key.clone()) {
            return Err(QueueError::duplicate(key));
        }
        inner.next_id += 1;
        let message_id = format!("{}-0", inner.next_id);
        inner.enqueued.push(job.clone());
        inner.pending.push_back((message_id.clone(), job));
        Ok(message_id)
    }
}
