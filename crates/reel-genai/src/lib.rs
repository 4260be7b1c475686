//! Clients for the external backends the pipeline drives.
//!
//! Each backend sits behind a trait so the worker can be exercised with
//! in-process fakes:
//! - [`ScriptWriter`]: topic to script (OpenAI-compatible chat completion)
//! - [`SceneGenerator`]: scene parameters to video and narration (fal.run)
//! - [`Publisher`]: composed video to a public URL (YouTube Data API)

pub mod config;
pub mod error;
pub mod http;
pub mod publish;
pub mod scene;
pub mod script;

pub use config::{FalConfig, GenaiConfig, ScriptWriterConfig, YoutubeConfig};
pub use error::{GenaiError, GenaiResult};
pub use http::build_client;
pub use publish::{PublishMetadata, PublishedVideo, Publisher, YoutubePublisher};
pub use scene::{FalSceneGenerator, GeneratedScene, SceneGenerator};
pub use script::{parse_script, ChatScriptWriter, ScriptWriter};
