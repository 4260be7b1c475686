//! Redis Streams job queue.
//!
//! This crate provides:
//! - Typed pipeline messages with idempotency keys
//! - Job enqueueing with deduplication via Redis Streams
//! - Consumer-group consumption, pending-claim, retry counters and DLQ
//! - An in-process queue with the same semantics

pub mod error;
pub mod job;
pub mod memory;
pub mod queue;
pub mod sink;

pub use error::{QueueError, QueueResult};
pub use job::{ComposeJob, GenerateSceneJob, PublishJob, QueueJob, WriteScriptJob};
pub use memory::MemoryQueue;
pub use queue::{JobQueue, QueueConfig};
pub use sink::JobSink;
