//! Redis-backed job store.
//!
//! Layout per job (`{prefix}` defaults to `reel`):
//! - `{prefix}:job:{id}`                 hash with the scalar fields
//! - `{prefix}:job:{id}:done`            set of completed scene indices
//! - `{prefix}:job:{id}:failed`          set of failed scene indices
//! - `{prefix}:job:{id}:scene_attempts`  hash of scene index -> attempts
//! - `{prefix}:owner:{owner}:jobs`       set of job ids per owner
//! - `{prefix}:jobs:expiry`              zset of job ids scored by expiry
//!
//! Every mutation is a single Lua script, so each one is atomic with
//! respect to all other operations on the same job. Job keys also carry a
//! native `EXPIREAT` so Redis drops them even if no sweeper runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use reel_models::{GenerationConfig, Job, JobId, JobStatus, SceneFailurePolicy};

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};
use crate::store::{IncrementOutcome, JobStore, SceneFailureOutcome, StatusDetails};

/// Redis job store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "reel".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("STORE_KEY_PREFIX").unwrap_or_else(|_| "reel".to_string()),
            retry: RetryConfig::from_env(),
        }
    }
}

/// Shared by the increment and scene-failure scripts.
/// KEYS[1] job hash, KEYS[2] done set, KEYS[3] failed set.
const FAN_IN_LUA: &str = r#"
local function try_fan_in(total, scene, now)
  if redis.call('HGET', KEYS[1], 'status') ~= 'GENERATING_SCENES' then return 0 end
  if redis.call('HEXISTS', KEYS[1], 'fan_in_scene') == 1 then return 0 end
  local accounted = redis.call('SCARD', KEYS[2]) + redis.call('SCARD', KEYS[3])
  if accounted < total then return 0 end
  redis.call('HSET', KEYS[1], 'fan_in_scene', scene, 'status', 'COMPOSING',
    'attempt_count', 0, 'updated_at', now)
  return 1
end

local function mark_failed(reason, now)
  local status = redis.call('HGET', KEYS[1], 'status')
  if status == 'COMPLETE' or status == 'FAILED' then return 0 end
  redis.call('HSET', KEYS[1], 'status', 'FAILED', 'failure_reason', reason,
    'attempt_count', 0, 'updated_at', now)
  return 1
end

local function scene_total(scene)
  if redis.call('EXISTS', KEYS[1]) == 0 then return nil, {'missing'} end
  local total = tonumber(redis.call('HGET', KEYS[1], 'total_scenes'))
  if not total then return nil, {'no_total'} end
  if tonumber(scene) >= total then return nil, {'out_of_range', tostring(total)} end
  return total, nil
end

local function keep_until_expiry(key)
  local expires = redis.call('HGET', KEYS[1], 'expires_ts')
  if expires then redis.call('EXPIREAT', key, expires) end
end
"#;

/// KEYS[1] job hash, KEYS[2] expiry zset, KEYS[3] owner set.
/// ARGV[1] job id, ARGV[2] expiry timestamp, ARGV[3..] field/value pairs.
const CREATE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
local fields = {}
for i = 3, #ARGV do fields[#fields + 1] = ARGV[i] end
redis.call('HSET', KEYS[1], unpack(fields))
redis.call('EXPIREAT', KEYS[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
"#;

/// KEYS[1] job hash. ARGV[1] total, ARGV[2] now.
const BEGIN_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= 'PENDING_SCRIPT' then return {'stale', status} end
if redis.call('HEXISTS', KEYS[1], 'total_scenes') == 1 then return {'total_set'} end
redis.call('HSET', KEYS[1], 'total_scenes', ARGV[1], 'status', 'GENERATING_SCENES',
  'attempt_count', 0, 'updated_at', ARGV[2])
return {'ok'}
"#;

/// ARGV[1] scene index, ARGV[2] now.
const INCREMENT_LUA: &str = r#"
local total, err = scene_total(ARGV[1])
if not total then return err end
local completed = tonumber(redis.call('HGET', KEYS[1], 'completed_scenes') or '0')
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1
  or redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then
  return {'ok', tostring(completed), '0', '0'}
end
redis.call('SADD', KEYS[2], ARGV[1])
keep_until_expiry(KEYS[2])
completed = redis.call('HINCRBY', KEYS[1], 'completed_scenes', 1)
redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
local first = try_fan_in(total, ARGV[1], ARGV[2])
return {'ok', tostring(completed), '1', tostring(first)}
"#;

/// ARGV[1] scene index, ARGV[2] now, ARGV[3] reason, ARGV[4] policy.
const SCENE_FAILURE_LUA: &str = r#"
local total, err = scene_total(ARGV[1])
if not total then return err end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1
  or redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then
  return {'ok', '0', '0', '0'}
end
redis.call('SADD', KEYS[3], ARGV[1])
keep_until_expiry(KEYS[3])
redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
local job_failed, first = 0, 0
if ARGV[4] == 'fail_job' then
  job_failed = mark_failed(ARGV[3], ARGV[2])
else
  local accounted = redis.call('SCARD', KEYS[2]) + redis.call('SCARD', KEYS[3])
  if accounted >= total and redis.call('SCARD', KEYS[2]) == 0 then
    job_failed = mark_failed('all scenes failed', ARGV[2])
  else
    first = try_fan_in(total, ARGV[1], ARGV[2])
  end
end
return {'ok', '1', tostring(job_failed), tostring(first)}
"#;

/// KEYS[1] job hash. ARGV[1] expected status, ARGV[2] now.
const ATTEMPT_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= ARGV[1] then return {'stale', status} end
local n = redis.call('HINCRBY', KEYS[1], 'attempt_count', 1)
redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
return {'ok', tostring(n)}
"#;

/// KEYS[1] job hash, KEYS[2] done set, KEYS[3] failed set, KEYS[4] attempts hash.
/// ARGV[1] scene index.
const SCENE_ATTEMPT_LUA: &str = r#"
local total, err = scene_total(ARGV[1])
if not total then return err end
local n = redis.call('HINCRBY', KEYS[4], ARGV[1], 1)
keep_until_expiry(KEYS[4])
return {'ok', tostring(n)}
"#;

/// KEYS[1] job hash. ARGV[1] expected, ARGV[2] new, ARGV[3] now,
/// ARGV[4] composed asset, ARGV[5] published url, ARGV[6] failure reason.
/// Empty detail arguments leave the field untouched.
const SET_STATUS_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
local status = redis.call('HGET', KEYS[1], 'status')
if status ~= ARGV[1] then return {'stale', status} end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'attempt_count', 0, 'updated_at', ARGV[3])
if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'composed_asset_ref', ARGV[4]) end
if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'published_url', ARGV[5]) end
if ARGV[6] ~= '' then redis.call('HSET', KEYS[1], 'failure_reason', ARGV[6]) end
return {'ok'}
"#;

/// KEYS[1] job hash. ARGV[1] reason, ARGV[2] now.
const FAIL_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
return {'ok', tostring(mark_failed(ARGV[1], ARGV[2]))}
"#;

/// KEYS[1] job hash, KEYS[2] done, KEYS[3] failed, KEYS[4] attempts,
/// KEYS[5] expiry zset, KEYS[6] owner set. ARGV[1] job id, ARGV[2] now ts.
const SWEEP_LUA: &str = r#"
local expires = tonumber(redis.call('HGET', KEYS[1], 'expires_ts'))
if expires and expires > tonumber(ARGV[2]) then return 0 end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3], KEYS[4])
redis.call('ZREM', KEYS[5], ARGV[1])
redis.call('SREM', KEYS[6], ARGV[1])
return 1
"#;

/// Job store backed by Redis hashes and Lua scripts.
pub struct RedisJobStore {
    client: redis::Client,
    config: StoreConfig,
    create_script: Script,
    begin_script: Script,
    increment_script: Script,
    scene_failure_script: Script,
    attempt_script: Script,
    scene_attempt_script: Script,
    set_status_script: Script,
    fail_script: Script,
    sweep_script: Script,
}

fn with_fan_in(body: &str) -> Script {
    Script::new(&format!("{}\n{}", FAN_IN_LUA, body))
}

impl RedisJobStore {
    /// Create a new store.
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            create_script: Script::new(CREATE_LUA),
            begin_script: Script::new(BEGIN_LUA),
            increment_script: with_fan_in(INCREMENT_LUA),
            scene_failure_script: with_fan_in(SCENE_FAILURE_LUA),
            attempt_script: Script::new(ATTEMPT_LUA),
            scene_attempt_script: with_fan_in(SCENE_ATTEMPT_LUA),
            set_status_script: Script::new(SET_STATUS_LUA),
            fail_script: with_fan_in(FAIL_LUA),
            sweep_script: Script::new(SWEEP_LUA),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, job_id)
    }

    fn done_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}:done", self.config.key_prefix, job_id)
    }

    fn failed_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}:failed", self.config.key_prefix, job_id)
    }

    fn attempts_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}:scene_attempts", self.config.key_prefix, job_id)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}:owner:{}:jobs", self.config.key_prefix, owner_id)
    }

    fn expiry_key(&self) -> String {
        format!("{}:jobs:expiry", self.config.key_prefix)
    }

    async fn fetch(&self, job_id: &JobId) -> StoreResult<Job> {
        let mut conn = self.conn().await?;
        let (fields, done, failed, attempts): (
            HashMap<String, String>,
            Vec<u32>,
            Vec<u32>,
            HashMap<u32, u32>,
        ) = redis::pipe()
            .atomic()
            .hgetall(self.job_key(job_id))
            .smembers(self.done_key(job_id))
            .smembers(self.failed_key(job_id))
            .hgetall(self.attempts_key(job_id))
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Err(StoreError::not_found(job_id));
        }
        job_from_fields(fields, done, failed, attempts)
    }
}

/// Map a `{'missing'}` / `{'stale', status}` / ... script reply to an error.
fn script_error(job_id: &JobId, expected: JobStatus, reply: &[String]) -> StoreError {
    match reply.first().map(String::as_str) {
        Some("missing") => StoreError::not_found(job_id),
        Some("stale") => match reply.get(1).and_then(|s| s.parse::<JobStatus>().ok()) {
            Some(actual) => StoreError::stale(expected, actual),
            None => StoreError::corrupt(format!("job {} has an unreadable status", job_id)),
        },
        Some("no_total") => {
            StoreError::precondition_failed(format!("job {} has no total_scenes", job_id))
        }
        Some("out_of_range") => StoreError::precondition_failed(format!(
            "scene out of range for job {} with {} scenes",
            job_id,
            reply.get(1).map(String::as_str).unwrap_or("?")
        )),
        Some("total_set") => StoreError::precondition_failed("total_scenes already set"),
        other => StoreError::corrupt(format!("unexpected script reply {:?}", other)),
    }
}

fn flag(reply: &[String], index: usize) -> bool {
    reply.get(index).map(|s| s == "1").unwrap_or(false)
}

fn number(reply: &[String], index: usize) -> StoreResult<u32> {
    reply
        .get(index)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::corrupt(format!("missing number at {} in {:?}", index, reply)))
}

fn fields_for(job: &Job) -> StoreResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("job_id", job.job_id.to_string()),
        ("owner_id", job.owner_id.clone()),
        ("topic", job.topic.clone()),
        ("config", serde_json::to_string(&job.config)?),
        ("status", job.status.as_str().to_string()),
        ("completed_scenes", job.completed_scenes.to_string()),
        ("attempt_count", job.attempt_count.to_string()),
        ("created_at", job.created_at.to_rfc3339()),
        ("updated_at", job.updated_at.to_rfc3339()),
        ("expires_at", job.expires_at.to_rfc3339()),
        ("expires_ts", job.expires_at.timestamp().to_string()),
    ];
    if let Some(total) = job.total_scenes {
        fields.push(("total_scenes", total.to_string()));
    }
    Ok(fields)
}

fn parse_time(fields: &HashMap<String, String>, name: &str) -> StoreResult<DateTime<Utc>> {
    let raw = fields
        .get(name)
        .ok_or_else(|| StoreError::corrupt(format!("missing field {}", name)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("bad {}: {}", name, e)))
}

fn parse_u32(fields: &HashMap<String, String>, name: &str) -> StoreResult<Option<u32>> {
    fields
        .get(name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| StoreError::corrupt(format!("bad {}: {}", name, raw)))
        })
        .transpose()
}

fn job_from_fields(
    mut fields: HashMap<String, String>,
    done: Vec<u32>,
    failed: Vec<u32>,
    attempts: HashMap<u32, u32>,
) -> StoreResult<Job> {
    let status = fields
        .get("status")
        .ok_or_else(|| StoreError::corrupt("missing status"))?
        .parse::<JobStatus>()
        .map_err(|e| StoreError::corrupt(e.to_string()))?;
    let config: GenerationConfig = match fields.get("config") {
        Some(raw) => serde_json::from_str(raw)?,
        None => return Err(StoreError::corrupt("missing config")),
    };

    Ok(Job {
        job_id: JobId::from_string(fields.remove("job_id").unwrap_or_default()),
        owner_id: fields.remove("owner_id").unwrap_or_default(),
        topic: fields.remove("topic").unwrap_or_default(),
        config,
        status,
        total_scenes: parse_u32(&fields, "total_scenes")?,
        completed_scenes: parse_u32(&fields, "completed_scenes")?.unwrap_or(0),
        completed_indices: done.into_iter().collect(),
        failed_scenes: failed.into_iter().collect(),
        scene_attempts: attempts.into_iter().collect(),
        attempt_count: parse_u32(&fields, "attempt_count")?.unwrap_or(0),
        fan_in_scene: parse_u32(&fields, "fan_in_scene")?,
        created_at: parse_time(&fields, "created_at")?,
        updated_at: parse_time(&fields, "updated_at")?,
        expires_at: parse_time(&fields, "expires_at")?,
        composed_asset_ref: fields.remove("composed_asset_ref"),
        published_url: fields.remove("published_url"),
        failure_reason: fields.remove("failure_reason"),
    })
}

fn policy_arg(policy: SceneFailurePolicy) -> &'static str {
    match policy {
        SceneFailurePolicy::FailJob => "fail_job",
        SceneFailurePolicy::ComposeWithGap => "compose_with_gap",
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &Job) -> StoreResult<()> {
        let fields = fields_for(job)?;
        let created: i64 = with_retry(&self.config.retry, "create", || async {
            let mut conn = self.conn().await?;
            let mut invocation = self.create_script.key(self.job_key(&job.job_id));
            invocation
                .key(self.expiry_key())
                .key(self.owner_key(&job.owner_id))
                .arg(job.job_id.as_str())
                .arg(job.expires_at.timestamp());
            for (name, value) in &fields {
                invocation.arg(*name).arg(value);
            }
            Ok(invocation.invoke_async(&mut conn).await?)
        })
        .await?;

        if created == 0 {
            metrics::record_operation("create", "exists");
            return Err(StoreError::AlreadyExists(job.job_id.clone()));
        }
        metrics::record_operation("create", "ok");
        debug!(job_id = %job.job_id, "Created job record");
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Job> {
        with_retry(&self.config.retry, "get", || self.fetch(job_id)).await
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Job>> {
        let owner_key = self.owner_key(owner_id);
        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.smembers(&owner_key).await?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = JobId::from_string(id);
            match self.get(&job_id).await {
                Ok(job) => jobs.push(job),
                Err(e) if e.is_not_found() => {
                    // Natively expired; drop the dangling index entry.
                    let mut conn = self.conn().await?;
                    conn.srem::<_, _, ()>(&owner_key, job_id.as_str()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn begin_scene_generation(&self, job_id: &JobId, total_scenes: u32) -> StoreResult<Job> {
        if total_scenes == 0 {
            return Err(StoreError::precondition_failed("total_scenes must be positive"));
        }
        let reply: Vec<String> = with_retry(&self.config.retry, "begin_scene_generation", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .begin_script
                .key(self.job_key(job_id))
                .arg(total_scenes)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            return Err(script_error(job_id, JobStatus::PendingScript, &reply));
        }
        self.get(job_id).await
    }

    async fn conditional_increment(
        &self,
        job_id: &JobId,
        scene_index: u32,
    ) -> StoreResult<IncrementOutcome> {
        let reply: Vec<String> = with_retry(&self.config.retry, "conditional_increment", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .increment_script
                .key(self.job_key(job_id))
                .key(self.done_key(job_id))
                .key(self.failed_key(job_id))
                .arg(scene_index)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            return Err(script_error(job_id, JobStatus::GeneratingScenes, &reply));
        }
        let outcome = IncrementOutcome {
            completed_scenes: number(&reply, 1)?,
            applied: flag(&reply, 2),
            first_to_reach_total: flag(&reply, 3),
        };

        if outcome.first_to_reach_total {
            metrics::record_fan_in();
            info!(job_id = %job_id, scene_index, "All scenes accounted for, job moved to COMPOSING");
        } else if !outcome.applied {
            metrics::record_duplicate_increment();
            debug!(job_id = %job_id, scene_index, "Scene already counted");
        }
        Ok(outcome)
    }

    async fn record_scene_failure(
        &self,
        job_id: &JobId,
        scene_index: u32,
        reason: &str,
        policy: SceneFailurePolicy,
    ) -> StoreResult<SceneFailureOutcome> {
        let reason = format!("scene {} failed: {}", scene_index, reason);
        let reply: Vec<String> = with_retry(&self.config.retry, "record_scene_failure", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .scene_failure_script
                .key(self.job_key(job_id))
                .key(self.done_key(job_id))
                .key(self.failed_key(job_id))
                .arg(scene_index)
                .arg(Utc::now().to_rfc3339())
                .arg(&reason)
                .arg(policy_arg(policy))
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            return Err(script_error(job_id, JobStatus::GeneratingScenes, &reply));
        }
        let outcome = SceneFailureOutcome {
            applied: flag(&reply, 1),
            job_failed: flag(&reply, 2),
            first_to_reach_total: flag(&reply, 3),
        };
        if outcome.first_to_reach_total {
            metrics::record_fan_in();
        }
        Ok(outcome)
    }

    async fn record_attempt(&self, job_id: &JobId, expected: JobStatus) -> StoreResult<u32> {
        let reply: Vec<String> = with_retry(&self.config.retry, "record_attempt", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .attempt_script
                .key(self.job_key(job_id))
                .arg(expected.as_str())
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            return Err(script_error(job_id, expected, &reply));
        }
        number(&reply, 1)
    }

    async fn record_scene_attempt(&self, job_id: &JobId, scene_index: u32) -> StoreResult<u32> {
        let reply: Vec<String> = with_retry(&self.config.retry, "record_scene_attempt", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .scene_attempt_script
                .key(self.job_key(job_id))
                .key(self.done_key(job_id))
                .key(self.failed_key(job_id))
                .key(self.attempts_key(job_id))
                .arg(scene_index)
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            return Err(script_error(job_id, JobStatus::GeneratingScenes, &reply));
        }
        number(&reply, 1)
    }

    async fn set_status_with(
        &self,
        job_id: &JobId,
        expected: JobStatus,
        new: JobStatus,
        details: StatusDetails,
    ) -> StoreResult<Job> {
        if !expected.can_transition_to(new) {
            return Err(StoreError::IllegalTransition { from: expected, to: new });
        }
        let reply: Vec<String> = with_retry(&self.config.retry, "set_status", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .set_status_script
                .key(self.job_key(job_id))
                .arg(expected.as_str())
                .arg(new.as_str())
                .arg(Utc::now().to_rfc3339())
                .arg(details.composed_asset_ref.as_deref().unwrap_or(""))
                .arg(details.published_url.as_deref().unwrap_or(""))
                .arg(details.failure_reason.as_deref().unwrap_or(""))
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            let err = script_error(job_id, expected, &reply);
            metrics::record_operation("set_status", if err.is_stale() { "stale" } else { "error" });
            return Err(err);
        }
        metrics::record_operation("set_status", "ok");
        self.get(job_id).await
    }

    async fn fail(&self, job_id: &JobId, reason: &str) -> StoreResult<bool> {
        let reply: Vec<String> = with_retry(&self.config.retry, "fail", || async {
            let mut conn = self.conn().await?;
            Ok(self
                .fail_script
                .key(self.job_key(job_id))
                .arg(reason)
                .arg(Utc::now().to_rfc3339())
                .invoke_async(&mut conn)
                .await?)
        })
        .await?;

        if reply.first().map(String::as_str) != Some("ok") {
            return Err(script_error(job_id, JobStatus::Failed, &reply));
        }
        Ok(flag(&reply, 1))
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<JobId>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrangebyscore(self.expiry_key(), "-inf", now.timestamp())
            .await?;

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            let job_id = JobId::from_string(id);
            let owner: Option<String> = conn.hget(self.job_key(&job_id), "owner_id").await?;
            let owner_key = self.owner_key(owner.as_deref().unwrap_or(""));
            let deleted: i64 = self
                .sweep_script
                .key(self.job_key(&job_id))
                .key(self.done_key(&job_id))
                .key(self.failed_key(&job_id))
                .key(self.attempts_key(&job_id))
                .key(self.expiry_key())
                .key(owner_key)
                .arg(job_id.as_str())
                .arg(now.timestamp())
                .invoke_async(&mut conn)
                .await?;
            if deleted == 1 {
                removed.push(job_id);
            } else {
                warn!(job_id = %job_id, "Expiry index ahead of record, skipping");
            }
        }
        metrics::record_expired(removed.len());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reel_models::RetentionPolicy;
    use std::sync::Arc;

    #[test]
    fn test_fields_round_trip() {
        let mut job = Job::new("owner", "A topic for testing", GenerationConfig::default(), &RetentionPolicy::default());
        job.total_scenes = Some(3);
        job.completed_scenes = 1;
        let fields: HashMap<String, String> = fields_for(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let mut attempts = HashMap::new();
        attempts.insert(0, 1);

        let parsed = job_from_fields(fields, vec![0], vec![], attempts).unwrap();
        assert_eq!(parsed.job_id, job.job_id);
        assert_eq!(parsed.total_scenes, Some(3));
        assert!(parsed.is_scene_completed(0));
        assert_eq!(parsed.scene_attempts.get(&0), Some(&1));
        assert_eq!(parsed.expires_at.timestamp(), job.expires_at.timestamp());
    }

    #[test]
    fn test_script_error_mapping() {
        let id = JobId::from_string("j");
        let reply = vec!["stale".to_string(), "PUBLISHING".to_string()];
        let err = script_error(&id, JobStatus::Composing, &reply);
        assert!(matches!(
            err,
            StoreError::StaleState { expected: JobStatus::Composing, actual: JobStatus::Publishing }
        ));
        assert!(script_error(&id, JobStatus::Composing, &["missing".to_string()]).is_not_found());
    }

    fn test_store() -> RedisJobStore {
        let mut config = StoreConfig::default();
        config.key_prefix = format!("reel-test-{}", uuid_suffix());
        RedisJobStore::new(config).unwrap()
    }

    fn uuid_suffix() -> String {
        JobId::new().to_string()[..8].to_string()
    }

    // Requires Redis on localhost:6379
    #[tokio::test]
    #[ignore]
    async fn test_redis_fan_in_triggers_once() {
        let store = Arc::new(test_store());
        let job = Job::new("owner", "Concurrency on redis", GenerationConfig::default(), &RetentionPolicy::default());
        store.create(&job).await.unwrap();
        store.begin_scene_generation(&job.job_id, 5).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            for scene in 0..5 {
                let store = Arc::clone(&store);
                let job_id = job.job_id.clone();
                handles.push(tokio::spawn(async move {
                    store.conditional_increment(&job_id, scene).await.unwrap()
                }));
            }
        }
        let mut triggers = 0;
        for handle in handles {
            if handle.await.unwrap().first_to_reach_total {
                triggers += 1;
            }
        }
        assert_eq!(triggers, 1);

        let stored = store.get(&job.job_id).await.unwrap();
        assert_eq!(stored.completed_scenes, 5);
        assert_eq!(stored.status, JobStatus::Composing);
    }

    // Requires Redis on localhost:6379
    #[tokio::test]
    #[ignore]
    async fn test_redis_conditional_status_and_sweep() {
        let store = test_store();
        let job = Job::new("owner", "Status on redis", GenerationConfig::default(), &RetentionPolicy::default());
        store.create(&job).await.unwrap();
        assert!(matches!(store.create(&job).await, Err(StoreError::AlreadyExists(_))));

        store.begin_scene_generation(&job.job_id, 1).await.unwrap();
        let err = store
            .set_status(&job.job_id, JobStatus::Composing, JobStatus::Publishing)
            .await
            .unwrap_err();
        assert!(err.is_stale());

        let removed = store.sweep_expired(job.expires_at).await.unwrap();
        assert_eq!(removed, vec![job.job_id.clone()]);
        assert!(store.get(&job.job_id).await.unwrap_err().is_not_found());
        assert!(store.list_for_owner("owner").await.unwrap().is_empty());
    }
}
