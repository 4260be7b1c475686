//! FFmpeg-based composition of generated scenes.
//!
//! This crate provides:
//! - A multi-input FFmpeg command builder and a runner with progress parsing
//! - The [`Composer`] trait and its FFmpeg implementation

pub mod command;
pub mod composer;
pub mod error;
pub mod progress;

pub use command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
pub use composer::{Composer, EncodingSettings, FfmpegComposer, SceneMedia};
pub use error::{MediaError, MediaResult};
pub use progress::FfmpegProgress;
