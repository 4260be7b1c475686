//! Durable job store.
//!
//! This crate provides:
//! - The [`JobStore`] contract: conditional status transitions and the
//!   idempotent per-scene increment that drives fan-in
//! - [`MemoryJobStore`] for single-process runs and tests
//! - [`RedisJobStore`] backed by Lua scripts and native key expiry
//! - Retry with backoff for transport errors and store metrics

pub mod error;
pub mod memory;
pub mod metrics;
pub mod redis_store;
pub mod retry;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryJobStore;
pub use redis_store::{RedisJobStore, StoreConfig};
pub use retry::RetryConfig;
pub use store::{IncrementOutcome, JobStore, SceneFailureOutcome, StatusDetails};
