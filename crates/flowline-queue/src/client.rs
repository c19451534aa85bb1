use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::worker_info::WorkerInfo;

/// A task as it travels through the Work Queue. Serialized as JSON for
/// every list/zset entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: Uuid,
    pub workflow_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
}

impl QueuedTask {
    fn encode(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to serialize queued task")
    }

    fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to deserialize queued task")
    }
}

/// Snapshot of the four per-type channel depths, used by the metrics
/// endpoint and operational tooling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub ready: u64,
    pub processing: u64,
    pub retry: u64,
    pub dead_letter: u64,
}

/// Exponential backoff schedule: `min(max_delay, initial_delay * factor^n)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let seconds =
            self.initial_delay.as_secs_f64() * self.backoff_factor.powi(retry_count.max(0));
        Duration::from_secs_f64(seconds.min(self.max_delay.as_secs_f64()))
    }
}

const WORKER_TTL_SECONDS: i64 = 300;

fn ready_key(task_type: &str) -> String {
    format!("queue:{task_type}")
}
fn processing_key(task_type: &str) -> String {
    format!("processing:{task_type}")
}
fn retry_key(task_type: &str) -> String {
    format!("retry:{task_type}")
}
fn dead_letter_key(task_type: &str) -> String {
    format!("dead_letter:{task_type}")
}
fn lease_key(task_type: &str) -> String {
    format!("lease:{task_type}")
}
fn worker_key(id: Uuid) -> String {
    format!("worker:{id}")
}
fn workers_set_key(task_type: &str) -> String {
    format!("workers:{task_type}")
}

/// Client for the Redis-backed Work Queue: per-type ready/processing/retry/
/// dead-letter channels plus a TTL'd worker registry.
#[derive(Clone)]
pub struct WorkQueue {
    conn: ConnectionManager,
}

impl WorkQueue {
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .with_context(|| format!("invalid redis url {}", config.redis_url))?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to establish redis connection")?;
        Ok(Self { conn })
    }

    /// Push a task onto its type's ready list. No deduplication -- see
    /// module docs: duplicate delivery is tolerated by design.
    pub async fn enqueue(&self, task: &QueuedTask) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = task.encode()?;
        conn.lpush::<_, _, ()>(ready_key(&task.task_type), encoded)
            .await
            .context("failed to enqueue task")?;
        Ok(())
    }

    /// Blocking atomic pop-and-register: move one task from `queue:<type>`
    /// to `processing:<type>`, recording this worker as its lease owner.
    /// Returns `None` on timeout.
    pub async fn dequeue(
        &self,
        task_type: &str,
        worker_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<QueuedTask>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .brpoplpush(ready_key(task_type), processing_key(task_type), timeout.as_secs_f64())
            .await
            .context("failed to dequeue task")?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let task = QueuedTask::decode(&raw)?;
        let lease_value = format!("{worker_id}:{}", Utc::now().to_rfc3339());
        conn.hset::<_, _, _, ()>(lease_key(task_type), task.task_id.to_string(), lease_value)
            .await
            .context("failed to record lease owner")?;

        Ok(Some(task))
    }

    /// Acknowledge successful (or terminally-failed, already-dead-lettered)
    /// completion: remove the task from `processing[type]`.
    pub async fn ack(&self, task: &QueuedTask) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = task.encode()?;
        conn.lrem::<_, _, ()>(processing_key(&task.task_type), -1, encoded)
            .await
            .context("failed to ack task")?;
        conn.hdel::<_, _, ()>(lease_key(&task.task_type), task.task_id.to_string())
            .await
            .context("failed to clear lease")?;
        Ok(())
    }

    /// Remove a failed task from processing and either schedule it for
    /// retry (zset, scored by eligibility time) or dead-letter it if its
    /// retry budget is exhausted. `task.retry_count` must already reflect
    /// the attempt that just failed.
    pub async fn nack(&self, task: &QueuedTask, policy: &RetryPolicy) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = task.encode()?;

        conn.lrem::<_, _, ()>(processing_key(&task.task_type), -1, &encoded)
            .await
            .context("failed to remove task from processing")?;
        conn.hdel::<_, _, ()>(lease_key(&task.task_type), task.task_id.to_string())
            .await
            .context("failed to clear lease")?;

        if task.retry_count < task.max_retries {
            let delay = policy.backoff(task.retry_count);
            let eligible_at = (Utc::now() + chrono::Duration::from_std(delay)?).timestamp();
            conn.zadd::<_, _, _, ()>(retry_key(&task.task_type), encoded, eligible_at)
                .await
                .context("failed to schedule retry")?;
        } else {
            conn.lpush::<_, _, ()>(dead_letter_key(&task.task_type), encoded)
                .await
                .context("failed to dead-letter task")?;
        }

        Ok(())
    }

    /// Move every retry-eligible task (score <= now) back onto the ready
    /// list. Returns the number promoted.
    pub async fn process_retries(&self, task_type: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp();

        let due: Vec<String> = conn
            .zrangebyscore(retry_key(task_type), "-inf", now)
            .await
            .context("failed to scan due retries")?;

        for entry in &due {
            conn.lpush::<_, _, ()>(ready_key(task_type), entry)
                .await
                .context("failed to promote retry to ready")?;
            conn.zrem::<_, _, ()>(retry_key(task_type), entry)
                .await
                .context("failed to remove promoted retry")?;
        }

        Ok(due.len() as u64)
    }

    /// Register a worker process, advertising the task types it serves.
    pub async fn register_worker(&self, info: &WorkerInfo) -> Result<()> {
        let mut conn = self.conn.clone();
        let encoded = serde_json::to_string(info).context("failed to serialize worker info")?;

        conn.set_ex::<_, _, ()>(worker_key(info.id), &encoded, WORKER_TTL_SECONDS as u64)
            .await
            .context("failed to register worker")?;

        for task_type in &info.served_types {
            conn.sadd::<_, _, ()>(workers_set_key(task_type), info.id.to_string())
                .await
                .context("failed to add worker to type set")?;
        }

        Ok(())
    }

    /// Refresh a worker's lease: re-stamps `last_heartbeat` in the stored
    /// record and renews its TTL.
    pub async fn update_heartbeat(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(worker_key(id))
            .await
            .context("failed to fetch worker info")?;

        let Some(raw) = raw else {
            anyhow::bail!("worker {id} is not registered (lease expired?)");
        };

        let mut info: WorkerInfo =
            serde_json::from_str(&raw).context("failed to deserialize worker info")?;
        info.last_heartbeat = Utc::now();

        let encoded = serde_json::to_string(&info).context("failed to serialize worker info")?;
        conn.set_ex::<_, _, ()>(worker_key(id), encoded, WORKER_TTL_SECONDS as u64)
            .await
            .context("failed to refresh worker lease")?;

        Ok(())
    }

    /// Active workers serving a type: Redis-key-alive and within the
    /// 2-minute heartbeat deadline. Stale set membership is pruned.
    pub async fn get_active_workers(&self, task_type: &str) -> Result<Vec<WorkerInfo>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(workers_set_key(task_type))
            .await
            .context("failed to list worker set")?;

        let now = Utc::now();
        let mut active = Vec::new();
        for id_str in ids {
            let raw: Option<String> = conn
                .get(format!("worker:{id_str}"))
                .await
                .context("failed to fetch worker record")?;

            match raw.and_then(|r| serde_json::from_str::<WorkerInfo>(&r).ok()) {
                Some(info) if !info.lease_expired(now) => active.push(info),
                _ => {
                    let _: () = conn
                        .srem(workers_set_key(task_type), &id_str)
                        .await
                        .context("failed to prune stale worker")?;
                }
            }
        }

        Ok(active)
    }

    /// Depth of all four channels for a task type.
    pub async fn get_queue_stats(&self, task_type: &str) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let ready: u64 = conn.llen(ready_key(task_type)).await.context("llen ready")?;
        let processing: u64 = conn
            .llen(processing_key(task_type))
            .await
            .context("llen processing")?;
        let retry: u64 = conn.zcard(retry_key(task_type)).await.context("zcard retry")?;
        let dead_letter: u64 = conn
            .llen(dead_letter_key(task_type))
            .await
            .context("llen dead_letter")?;

        Ok(QueueStats {
            ready,
            processing,
            retry,
            dead_letter,
        })
    }

    /// Restore the at-least-once guarantee: any entry in `processing[type]`
    /// whose lease owner is no longer active is redelivered to
    /// `queue[type]` without touching its retry count.
    pub async fn reap_expired_leases(&self, task_type: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let active = self.get_active_workers(task_type).await?;
        let active_ids: std::collections::HashSet<String> =
            active.iter().map(|w| w.id.to_string()).collect();

        let entries: Vec<String> = conn
            .lrange(processing_key(task_type), 0, -1)
            .await
            .context("failed to scan processing list")?;

        let mut reaped = 0u64;
        for entry in entries {
            let task = match QueuedTask::decode(&entry) {
                Ok(t) => t,
                Err(_) => continue,
            };

            let lease: Option<String> = conn
                .hget(lease_key(task_type), task.task_id.to_string())
                .await
                .context("failed to read lease")?;

            let owner_active = lease
                .as_deref()
                .and_then(|l| l.split(':').next())
                .map(|owner| active_ids.contains(owner))
                .unwrap_or(false);

            if !owner_active {
                conn.lrem::<_, _, ()>(processing_key(task_type), 1, &entry)
                    .await
                    .context("failed to remove expired-lease entry")?;
                conn.lpush::<_, _, ()>(ready_key(task_type), &entry)
                    .await
                    .context("failed to redeliver expired-lease entry")?;
                conn.hdel::<_, _, ()>(lease_key(task_type), task.task_id.to_string())
                    .await
                    .context("failed to clear stale lease")?;
                reaped += 1;
            }
        }

        Ok(reaped)
    }
}
