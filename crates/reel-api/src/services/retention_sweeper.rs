//! Background service that removes job records past their retention.
//!
//! Teardown is driven only by `expires_at`; jobs still moving through the
//! pipeline are removed too, and their stages drop late messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use reel_models::JobId;
use reel_store::JobStore;

use crate::metrics;

/// Periodic retention sweep over the job store.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    interval: Duration,
    enabled: bool,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, interval: Duration) -> Self {
        let enabled = std::env::var("ENABLE_RETENTION_SWEEP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Self {
            store,
            interval,
            enabled,
        }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            info!("Retention sweep is disabled");
            return;
        }

        info!("Starting retention sweeper (interval: {:?})", self.interval);

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!("Retention sweep error: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retention sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Run a single sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<JobId>> {
        let removed = self.store.sweep_expired(now).await?;
        if !removed.is_empty() {
            info!(count = removed.len(), "Removed expired jobs");
            metrics::record_jobs_swept(removed.len());
        }
        Ok(removed)
    }
}
