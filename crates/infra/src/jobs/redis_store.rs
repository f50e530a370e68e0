//! Redis-backed job store and work queue.
//!
//! ## Keys
//!
//! - **Job record**: `{prefix}job:{job_id}`, JSON, `EX ttl` refreshed on every write
//! - **Work queue**: `{prefix}queue`, a list (`LPUSH` to enqueue, `RPOP` to dequeue)
//!
//! Record updates are optimistic compare-and-set: the new value is written by
//! a Lua script only if the key still holds the exact bytes that were read.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};

use redrun_core::{Job, JobId, JobStatus};

use super::queue::{JobQueue, QueueError};
use super::store::{
    apply_mutation, check_new, JobMutator, JobStore, JobStoreError, DEFAULT_KEY_PREFIX,
};
use super::types::JobPayload;

/// Max CAS rounds before giving up with `Conflict`
const MAX_CAS_ROUNDS: u32 = 8;

/// Dial attempts per (re)connect, with jittered exponential backoff
const DIAL_RETRIES: usize = 3;

/// SCAN page size for `list_running`
const SCAN_COUNT: u32 = 200;

// KEYS[1] = record key, ARGV = expected raw, new raw, ttl seconds.
// Returns 1 on write, 0 on mismatch, -1 when the key is gone.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return 1
"#;

/// Lazily opened connection shared by every command.
///
/// `ConnectionManager` re-dials in the background after the socket drops, so
/// a Redis restart costs the in-flight command and nothing after it.
#[derive(Clone)]
struct Connector {
    client: Arc<redis::Client>,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl Connector {
    fn open(redis_url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: Arc::new(redis::Client::open(redis_url)?),
            conn: Arc::new(OnceCell::new()),
        })
    }

    async fn get(&self) -> Result<ConnectionManager, redis::RedisError> {
        self.conn
            .get_or_try_init(|| {
                ConnectionManager::new_with_backoff(
                    (*self.client).clone(),
                    2,
                    100,
                    DIAL_RETRIES,
                )
            })
            .await
            .cloned()
    }
}

pub struct RedisJobStore {
    connector: Connector,
    key_prefix: String,
    ttl_secs: u64,
    cas: redis::Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

impl RedisJobStore {
    /// Create a store. The connection is established lazily on first use.
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
        ttl: Duration,
    ) -> Result<Self, JobStoreError> {
        let connector = Connector::open(redis_url.as_ref())
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;
        Ok(Self {
            connector,
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            ttl_secs: ttl.as_secs().max(1),
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    fn key(&self, job_id: JobId) -> String {
        format!("{}job:{}", self.key_prefix, job_id)
    }

    async fn conn(&self) -> Result<ConnectionManager, JobStoreError> {
        self.connector
            .get()
            .await
            .map_err(|e| JobStoreError::Storage(e.to_string()))
    }

    async fn read_raw(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
    ) -> Result<Option<String>, JobStoreError> {
        redis::cmd("GET")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(|e| JobStoreError::Storage(e.to_string()))
    }
}

fn decode(raw: &str) -> Result<Job, JobStoreError> {
    serde_json::from_str(raw).map_err(|e| JobStoreError::Storage(format!("corrupt job record: {e}")))
}

fn encode(job: &Job) -> Result<String, JobStoreError> {
    serde_json::to_string(job).map_err(|e| JobStoreError::Storage(e.to_string()))
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        check_new(job)?;
        let raw = encode(job)?;
        let mut conn = self.conn().await?;

        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(job.job_id))
            .arg(raw)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| JobStoreError::Storage(e.to_string()))?;

        match set {
            Some(_) => Ok(()),
            None => Err(JobStoreError::AlreadyExists(job.job_id)),
        }
    }

    #[instrument(skip(self, mutate), fields(job_id = %job_id), err)]
    async fn update(&self, job_id: JobId, mutate: JobMutator<'_>) -> Result<Job, JobStoreError> {
        let key = self.key(job_id);
        let mut conn = self.conn().await?;

        for round in 1..=MAX_CAS_ROUNDS {
            let raw = self
                .read_raw(&mut conn, &key)
                .await?
                .ok_or(JobStoreError::NotFound(job_id))?;
            let current = decode(&raw)?;
            let next = apply_mutation(&current, mutate, Utc::now())?;
            let encoded = encode(&next)?;

            let outcome: i64 = self
                .cas
                .key(&key)
                .arg(&raw)
                .arg(&encoded)
                .arg(self.ttl_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;

            match outcome {
                1 => return Ok(next),
                -1 => return Err(JobStoreError::NotFound(job_id)),
                _ => debug!(round, "job record changed concurrently, retrying"),
            }
        }

        Err(JobStoreError::Conflict(job_id))
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut conn = self.conn().await?;
        let raw = self
            .read_raw(&mut conn, &self.key(job_id))
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        decode(&raw)
    }

    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}job:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut running = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;

            for key in keys {
                // Keys may expire between SCAN and GET.
                let Some(raw) = self.read_raw(&mut conn, &key).await? else {
                    continue;
                };
                match decode(&raw) {
                    Ok(job) if job.status == JobStatus::Running => running.push(job),
                    Ok(_) => {}
                    Err(e) => debug!(key = %key, error = %e, "skipping unreadable job record"),
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        running.sort_by_key(|j| j.created_at);
        Ok(running)
    }
}

/// Redis list used as the work queue.
pub struct RedisJobQueue {
    connector: Connector,
    queue_key: String,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("queue_key", &self.queue_key)
            .finish()
    }
}

impl RedisJobQueue {
    pub fn new(redis_url: impl AsRef<str>, key_prefix: Option<String>) -> Result<Self, QueueError> {
        let connector = Connector::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let prefix = key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
        Ok(Self {
            connector,
            queue_key: format!("{prefix}queue"),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, QueueError> {
        self.connector
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    #[instrument(skip(self, payload), fields(queue = %self.queue_key, job_id = %payload.job_id), err)]
    async fn enqueue(&self, payload: &JobPayload) -> Result<(), QueueError> {
        let raw = serde_json::to_string(payload)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.queue_key)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<JobPayload>, QueueError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = redis::cmd("RPOP")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Command(e.to_string()))?;

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Serialization(format!("dropping malformed payload: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redis_url() -> Option<String> {
        std::env::var("REDRUN_TEST_REDIS_URL").ok()
    }

    #[tokio::test]
    async fn construction_does_not_dial() {
        // Nothing listens on port 1.
        let store = RedisJobStore::new("redis://127.0.0.1:1", None, Duration::from_secs(60)).unwrap();
        let queue = RedisJobQueue::new("redis://127.0.0.1:1", None).unwrap();
        assert!(matches!(store.get(JobId::new()).await, Err(JobStoreError::Storage(_))));
        assert!(matches!(queue.dequeue().await, Err(QueueError::Connection(_))));
        // A failed dial is not cached; the next call dials again.
        assert!(matches!(store.get(JobId::new()).await, Err(JobStoreError::Storage(_))));
    }

    #[tokio::test]
    #[ignore = "needs REDRUN_TEST_REDIS_URL"]
    async fn commands_recover_after_connection_is_killed() {
        let Some(url) = redis_url() else { return };
        let prefix = format!("redrun-test:{}:", JobId::new());
        let store = RedisJobStore::new(&url, Some(prefix), Duration::from_secs(60)).unwrap();
        let id = JobId::new();
        store
            .create(&Job::queued(id, Default::default(), Utc::now()))
            .await
            .unwrap();

        // Drop every client connection, ours included.
        let mut admin = redis::Client::open(url.as_str())
            .unwrap()
            .get_multiplexed_async_connection()
            .await
            .unwrap();
        let _: redis::Value = redis::cmd("CLIENT")
            .arg("KILL")
            .arg("TYPE")
            .arg("normal")
            .arg("SKIPME")
            .arg("yes")
            .query_async(&mut admin)
            .await
            .unwrap();

        let mut recovered = None;
        for _ in 0..50 {
            if let Ok(job) = store.get(id).await {
                recovered = Some(job);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(recovered.unwrap().status, JobStatus::Queued);
    }
}
