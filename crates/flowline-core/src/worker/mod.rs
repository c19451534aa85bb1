//! Worker Runtime: a small library a task executor links against. It
//! advertises one or more task types, handles dequeue/ack/nack and status
//! reporting; the caller only supplies the pluggable [`TaskBody`] per type.
//! The core never inspects a task's payload semantics.

mod status_client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use flowline_queue::{QueuedTask, RetryPolicy, WorkerInfo, WorkQueue};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use status_client::{StatusIngressClient, TaskOutcome};

/// Caller-supplied execution logic for one task type. The core dequeues,
/// leases, acks/nacks, and reports status; this trait only runs the task.
#[async_trait]
pub trait TaskBody: Send + Sync {
    /// The task type this body serves, matching the `type` field of
    /// workflow task definitions.
    fn task_type(&self) -> &str;

    /// Execute the task, returning its result payload or an error message.
    async fn execute(&self, payload: serde_json::Value) -> Result<serde_json::Value>;
}

/// Runtime configuration: how a worker identifies and paces itself.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub address: String,
    pub dequeue_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: "unknown".to_string(),
            dequeue_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Start a worker: registers with the Work Queue, then spawns a heartbeat
/// loop plus one dequeue loop per served task type. Returns the join
/// handles so the caller can await clean shutdown after cancelling.
pub async fn run_worker(
    worker_id: Uuid,
    queue: WorkQueue,
    status: StatusIngressClient,
    bodies: Vec<Arc<dyn TaskBody>>,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let served_types: Vec<String> = bodies.iter().map(|b| b.task_type().to_string()).collect();
    let info = WorkerInfo::new(worker_id, config.address.clone(), served_types);
    queue.register_worker(&info).await?;

    let mut handles = Vec::with_capacity(bodies.len() + 1);

    handles.push(spawn_heartbeat_loop(
        worker_id,
        queue.clone(),
        config.heartbeat_interval,
        cancel.clone(),
    ));

    let bodies_by_type: HashMap<String, Arc<dyn TaskBody>> = bodies
        .into_iter()
        .map(|b| (b.task_type().to_string(), b))
        .collect();

    for (task_type, body) in bodies_by_type {
        handles.push(spawn_dequeue_loop(
            worker_id,
            task_type,
            body,
            queue.clone(),
            status.clone(),
            config.clone(),
            cancel.clone(),
        ));
    }

    Ok(handles)
}

fn spawn_heartbeat_loop(
    worker_id: Uuid,
    queue: WorkQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = queue.update_heartbeat(worker_id).await {
                        tracing::error!(%worker_id, error = %err, "heartbeat failed");
                    }
                }
            }
        }
    })
}

/// The per-type loop of §4.4: dequeue, report running, execute, ack/nack,
/// report terminal status.
fn spawn_dequeue_loop(
    worker_id: Uuid,
    task_type: String,
    body: Arc<dyn TaskBody>,
    queue: WorkQueue,
    status: StatusIngressClient,
    config: WorkerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = queue.dequeue(&task_type, worker_id, config.dequeue_timeout) => next,
            };

            let task = match next {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(task_type = %task_type, error = %err, "dequeue failed");
                    continue;
                }
            };

            if let Err(err) = status.report(task.task_id, TaskOutcome::Running, None, None).await {
                tracing::error!(task_id = %task.task_id, error = %err, "failed to report running");
            }

            match body.execute(task.payload.clone()).await {
                Ok(result) => {
                    if let Err(err) = queue.ack(&task).await {
                        tracing::error!(task_id = %task.task_id, error = %err, "ack failed");
                    }
                    if let Err(err) = status
                        .report(task.task_id, TaskOutcome::Completed, Some(result), None)
                        .await
                    {
                        tracing::error!(task_id = %task.task_id, error = %err, "failed to report completion");
                    }
                }
                Err(err) => {
                    handle_failure(&queue, &status, &task, &config.retry_policy, &err.to_string())
                        .await;
                }
            }
        }
    })
}

/// Decides retry-vs-terminal by re-reading the task's current
/// `retry_count`/`max_retries` from the State Store rather than trusting
/// the `QueuedTask` payload, which can be stale relative to concurrent
/// state-store writes (see `DESIGN.md`). Falls back to the queue payload's
/// own numbers if the state-store read itself fails, since a transient
/// read failure shouldn't strand the task without an outcome.
async fn handle_failure(
    queue: &WorkQueue,
    status: &StatusIngressClient,
    task: &QueuedTask,
    retry_policy: &RetryPolicy,
    error: &str,
) {
    let (retry_count, max_retries) = match status.get_task(task.task_id).await {
        Ok(current) => (current.retry_count, current.max_retries),
        Err(err) => {
            tracing::warn!(
                task_id = %task.task_id,
                error = %err,
                "failed to re-read task from state store, falling back to queue payload"
            );
            (task.retry_count, task.max_retries)
        }
    };
    let will_retry = retry_count < max_retries;

    if will_retry {
        if let Err(err) = queue.nack(task, retry_policy).await {
            tracing::error!(task_id = %task.task_id, error = %err, "nack failed");
        }
        if let Err(err) = status
            .report(task.task_id, TaskOutcome::Retrying, None, Some(error.to_string()))
            .await
        {
            tracing::error!(task_id = %task.task_id, error = %err, "failed to report retrying");
        }
    } else {
        if let Err(err) = queue.ack(task).await {
            tracing::error!(task_id = %task.task_id, error = %err, "ack (terminal failure) failed");
        }
        if let Err(err) = status
            .report(task.task_id, TaskOutcome::Failed, None, Some(error.to_string()))
            .await
        {
            tracing::error!(task_id = %task.task_id, error = %err, "failed to report failure");
        }
    }
}
