//! Shared data models for the reel generation pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their lifecycle status and the transition table
//! - Generation configuration, scripts and per-scene parameters
//! - Submission validation and retention policy

pub mod generation;
pub mod job;
pub mod job_status;
pub mod validation;

// Re-export common types
pub use generation::{GenerationConfig, GenerationParams, Quality, Script, ScriptScene, VideoFormat};
pub use job::{Job, JobId, RetentionPolicy, SceneFailurePolicy};
pub use job_status::{JobStatus, UnknownStatus, TRANSITIONS};
pub use validation::{GenerationRequest, SubmissionPolicy, ValidationError};
