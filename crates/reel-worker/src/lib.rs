//! Pipeline worker.
//!
//! This crate provides:
//! - The script, scene, compose and publish stages
//! - Fan-in coordination on top of the job store's conditional increment
//! - A Redis Streams executor with bounded concurrency, pending-claim and DLQ
//! - Graceful shutdown

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod logging;
pub mod retry;
pub mod stages;

pub use config::WorkerConfig;
pub use context::PipelineContext;
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use stages::fan_in::{FanInCoordinator, FanInDecision};
pub use stages::{run_stage, StageOutcome};
