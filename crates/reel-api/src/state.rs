//! Application state.

use std::sync::Arc;

use reel_queue::{JobQueue, JobSink};
use reel_store::{JobStore, RedisJobStore};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobSink>,
}

impl AppState {
    /// Connect to Redis for both the job store and the queue.
    pub async fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let store = RedisJobStore::from_env()?;
        let queue = JobQueue::from_env()?;
        queue.init().await?;

        Ok(Self::with_backends(config, Arc::new(store), Arc::new(queue)))
    }

    pub fn with_backends(config: ApiConfig, store: Arc<dyn JobStore>, queue: Arc<dyn JobSink>) -> Self {
        Self { config, store, queue }
    }
}
