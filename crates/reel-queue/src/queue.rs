//! Job queue using Redis Streams.
//!
//! Delivery is at-least-once: a consumed message stays in the consumer
//! group's pending list until acked, and messages idle for longer than the
//! visibility timeout are claimed by another consumer.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::QueueJob;
use crate::sink::JobSink;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Prefix of dedup and retry keys
    pub key_prefix: String,
    /// Failed deliveries before a message is dead-lettered
    pub max_retries: u32,
    /// Idle time after which a pending message may be claimed; must outlast
    /// the longest stage invocation
    pub visibility_timeout: Duration,
    /// Lifetime of an idempotency key
    pub dedup_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "reel:jobs".to_string(),
            consumer_group: "reel:workers".to_string(),
            dlq_stream_name: "reel:dlq".to_string(),
            key_prefix: "reel".to_string(),
            max_retries: 5,
            visibility_timeout: Duration::from_secs(1200), // 20 minutes
            dedup_ttl: Duration::from_secs(3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            visibility_timeout: std::env::var("QUEUE_VISIBILITY_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            dedup_ttl: std::env::var("QUEUE_DEDUP_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
        }
    }
}

/// Job queue client.
pub struct JobQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a new job queue.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    /// Idle time after which another consumer may claim a pending message.
    pub fn visibility_timeout(&self) -> Duration {
        self.config.visibility_timeout
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Create consumer group (ignore error if already exists)
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    fn dedup_key(&self, job: &QueueJob) -> String {
        format!("{}:dedup:{}", self.config.key_prefix, job.idempotency_key())
    }

    fn retry_key(&self, message_id: &str) -> String {
        format!("{}:retry:{}", self.config.key_prefix, message_id)
    }

    /// Enqueue a job unless one with the same idempotency key is queued.
    pub async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let payload = serde_json::to_string(&job)?;
        let idempotency_key = job.idempotency_key();

        // Claim the idempotency key first so concurrent enqueues race on SET NX.
        let dedup_key = self.dedup_key(&job);
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&dedup_key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.config.dedup_ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            debug!("Duplicate job not enqueued: {}", idempotency_key);
            counter!("queue_duplicates_total", "stage" => job.stage()).increment(1);
            return Err(QueueError::duplicate(idempotency_key));
        }

        // Add to stream
        let added: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("key")
            .arg(&idempotency_key)
            .query_async(&mut conn)
            .await;

        let message_id = match added {
            Ok(id) => id,
            Err(e) => {
                // Release the key so a retry can enqueue.
                conn.del::<_, ()>(&dedup_key).await.ok();
                return Err(e.into());
            }
        };

        counter!("queue_enqueued_total", "stage" => job.stage()).increment(1);
        info!(
            "Enqueued {} job {} with message ID {}",
            job.stage(),
            job.job_id(),
            message_id
        );

        Ok(message_id)
    }

    /// Forget the idempotency key of a job so it can be enqueued again.
    pub async fn clear_dedup(&self, job: &QueueJob) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.del::<_, ()>(self.dedup_key(job)).await?;
        Ok(())
    }

    /// Acknowledge a job (mark as completed).
    pub async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Delete the message from the stream
        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        conn.del::<_, ()>(self.retry_key(message_id)).await?;

        debug!("Acknowledged job: {}", message_id);
        Ok(())
    }

    /// Move a job to the dead letter queue.
    pub async fn dlq(&self, message_id: &str, job: &QueueJob, error: &str) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let payload = serde_json::to_string(job)?;

        // Add to DLQ
        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("error")
            .arg(error)
            .arg("original_id")
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        // Ack the original message
        self.ack(message_id).await?;

        counter!("queue_dead_lettered_total", "stage" => job.stage()).increment(1);
        warn!("Moved job {} to DLQ: {}", job.job_id(), error);
        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    /// Consume new jobs from the queue as (message_id, job) pairs.
    pub async fn consume(
        &self,
        consumer_name: &str,
        block_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, QueueJob)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Read from consumer group
        let result: Option<redis::streams::StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::new();
        let Some(result) = result else {
            return Ok(jobs);
        };

        for stream_key in result.keys {
            for entry in stream_key.ids {
                if let Some(job) = self.parse_entry(&entry.id, &entry.map).await {
                    debug!("Consumed job {} from stream", job.job_id());
                    jobs.push((entry.id, job));
                }
            }
        }

        Ok(jobs)
    }

    /// Claim pending jobs that have been idle longer than `min_idle_ms`.
    /// This handles jobs from crashed or timed-out workers.
    pub async fn claim_pending(
        &self,
        consumer_name: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> QueueResult<Vec<(String, QueueJob)>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        // Find candidates that have been idle long enough
        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer_name)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let result: redis::streams::StreamClaimReply = cmd.query_async(&mut conn).await?;

        let mut jobs = Vec::new();
        for entry in result.ids {
            if let Some(job) = self.parse_entry(&entry.id, &entry.map).await {
                info!("Claimed pending job {} from stream", job.job_id());
                jobs.push((entry.id, job));
            }
        }

        Ok(jobs)
    }

    /// Decode a stream entry; malformed payloads are acked and dropped.
    async fn parse_entry(
        &self,
        message_id: &str,
        map: &std::collections::HashMap<String, redis::Value>,
    ) -> Option<QueueJob> {
        let payload = match map.get("job") {
            Some(redis::Value::BulkString(payload)) => String::from_utf8_lossy(payload).into_owned(),
            _ => {
                warn!("Stream entry {} has no job payload", message_id);
                self.ack(message_id).await.ok();
                return None;
            }
        };
        match serde_json::from_str::<QueueJob>(&payload) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Failed to parse job payload: {}", e);
                // Ack the malformed message to prevent reprocessing
                self.ack(message_id).await.ok();
                None
            }
        }
    }

    /// Increment retry count for a message.
    pub async fn increment_retry(&self, message_id: &str) -> QueueResult<u32> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = self.retry_key(message_id);
        let count: u32 = conn.incr(&key, 1).await?;
        // Set TTL to 24 hours
        conn.expire::<_, ()>(&key, 86400).await?;
        Ok(count)
    }

    /// Get max retries from config.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}

#[async_trait]
impl JobSink for JobQueue {
    async fn enqueue(&self, job: QueueJob) -> QueueResult<String> {
        JobQueue::enqueue(self, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ComposeJob, WriteScriptJob};
    use reel_models::JobId;

    fn test_queue() -> JobQueue {
        let suffix = JobId::new().to_string();
        let config = QueueConfig {
            stream_name: format!("reel-test:{}:jobs", suffix),
            consumer_group: format!("reel-test:{}:workers", suffix),
            dlq_stream_name: format!("reel-test:{}:dlq", suffix),
            key_prefix: format!("reel-test:{}", suffix),
            ..QueueConfig::default()
        };
        JobQueue::new(config).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_name, "reel:jobs");
        assert!(config.max_retries > 3);
    }

    #[test]
    fn test_claim_idle_follows_visibility_timeout() {
        let queue = JobQueue::new(QueueConfig {
            visibility_timeout: Duration::from_secs(1500),
            ..QueueConfig::default()
        })
        .unwrap();
        assert_eq!(queue.visibility_timeout(), Duration::from_secs(1500));
    }

    // Requires Redis on localhost:6379
    #[tokio::test]
    #[ignore]
    async fn test_enqueue_is_deduplicated() {
        let queue = test_queue();
        queue.init().await.unwrap();

        let job = QueueJob::from(ComposeJob::new(JobId::new()));
        queue.enqueue(job.clone()).await.unwrap();
        assert!(queue.enqueue(job.clone()).await.unwrap_err().is_duplicate());

        queue.clear_dedup(&job).await.unwrap();
        queue.enqueue(job).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    // Requires Redis on localhost:6379
    #[tokio::test]
    #[ignore]
    async fn test_unacked_message_is_claimable() {
        let queue = test_queue();
        queue.init().await.unwrap();

        let job = QueueJob::from(WriteScriptJob::new(JobId::new()));
        queue.enqueue(job.clone()).await.unwrap();

        let consumed = queue.consume("worker-a", 100, 1).await.unwrap();
        assert_eq!(consumed.len(), 1);
        assert_eq!(consumed[0].1, job);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let claimed = queue.claim_pending("worker-b", 10, 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].0, consumed[0].0);

        queue.ack(&claimed[0].0).await.unwrap();
        assert!(queue.claim_pending("worker-b", 0, 5).await.unwrap().is_empty());
    }
}
