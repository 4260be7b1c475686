//! Object storage for pipeline artifacts.
//!
//! This crate provides:
//! - The [`ArtifactStore`] trait with JSON helpers
//! - An S3-compatible client (aws-sdk-s3)
//! - An in-process store
//! - The deterministic key layout for scripts, scenes, composed assets and
//!   publish receipts

pub mod artifacts;
pub mod error;
pub mod memory;
pub mod s3;
pub mod store;

pub use artifacts::{PublishReceipt, SceneManifest};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryArtifactStore;
pub use s3::{S3ArtifactStore, S3Config};
pub use store::{get_json, put_json, ArtifactStore};
