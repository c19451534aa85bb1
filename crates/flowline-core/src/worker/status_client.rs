//! Thin HTTP client for the Status Ingress (§4.5): the only interface a
//! worker uses to report task outcomes back to the orchestrator.

use anyhow::{Context, Result};
use flowline_db::models::Task;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome reported for a task. Mirrors `flowline_db::models::TaskStatus`
/// but is kept separate since not every `TaskStatus` variant is a valid
/// worker-reported outcome (a worker never reports `pending` or
/// `cancelled`, for instance).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Running,
    Completed,
    Retrying,
    Failed,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    status: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Client for `POST /api/v1/tasks/{id}/status`.
#[derive(Debug, Clone)]
pub struct StatusIngressClient {
    base_url: String,
    http: reqwest::Client,
}

impl StatusIngressClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn report(
        &self,
        task_id: Uuid,
        status: TaskOutcome,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let url = format!("{}/api/v1/tasks/{task_id}/status", self.base_url);
        let body = StatusReport {
            status,
            result,
            error,
        };

        self.http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to report status for task {task_id}"))?
            .error_for_status()
            .with_context(|| format!("status ingress rejected report for task {task_id}"))?;

        Ok(())
    }

    /// Fetch a task's current record from the State Store via
    /// `GET /api/v1/tasks/{id}`. Used to re-read the authoritative
    /// `retry_count` before deciding whether a failure should retry, since
    /// the Work Queue's serialized payload may be stale relative to
    /// concurrent state-store writes.
    pub async fn get_task(&self, task_id: Uuid) -> Result<Task> {
        let url = format!("{}/api/v1/tasks/{task_id}", self.base_url);
        self.http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch task {task_id}"))?
            .error_for_status()
            .with_context(|| format!("state store rejected fetch for task {task_id}"))?
            .json::<Task>()
            .await
            .with_context(|| format!("failed to decode task {task_id}"))
    }
}
