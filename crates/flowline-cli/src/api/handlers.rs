use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use flowline_core::dag::{TaskNode, validate_dag};
use flowline_core::worker::TaskOutcome;
use flowline_db::models::{Task, WorkflowStatus, WorkflowWithTasks};
use flowline_db::queries::tasks as task_db;
use flowline_db::queries::workflows::{self as workflow_db, NewTask, NewWorkflow};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::AppError;
use super::AppState;

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: CreateWorkflowConfig,
    pub tasks: Vec<CreateTaskRequest>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateWorkflowConfig {
    pub max_concurrency: Option<i32>,
    pub timeout_seconds: Option<i64>,
    pub retry_policy: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl TryFrom<CreateWorkflowRequest> for NewWorkflow {
    type Error = flowline_core::WorkflowValidationError;

    fn try_from(req: CreateWorkflowRequest) -> Result<Self, Self::Error> {
        let nodes: Vec<TaskNode<'_>> = req
            .tasks
            .iter()
            .map(|t| TaskNode {
                name: &t.name,
                depends_on: &t.dependencies,
            })
            .collect();
        validate_dag(&nodes)?;

        Ok(NewWorkflow {
            name: req.name,
            description: req.description,
            max_concurrency: req.config.max_concurrency,
            timeout_seconds: req.config.timeout_seconds,
            retry_policy: req.config.retry_policy,
            tasks: req
                .tasks
                .into_iter()
                .map(|t| NewTask {
                    name: t.name,
                    task_type: t.task_type,
                    payload: t.payload,
                    max_retries: t.max_retries,
                    priority: t.priority,
                    dependencies: t.dependencies,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<WorkflowStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

const MAX_LIST_LIMIT: i64 = 200;

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<flowline_db::models::Workflow>,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatusReport {
    pub status: TaskOutcome,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub workflows_by_status: HashMap<String, i64>,
    pub queue_stats_by_type: HashMap<String, flowline_queue::QueueStats>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, AppError> {
    let new: NewWorkflow = body.try_into()?;
    let created = workflow_db::create_workflow(&state.pool, &new)
        .await
        .map_err(AppError::internal)?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
    let page = workflow_db::list_workflows(&state.pool, query.status, limit, query.offset)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(ListWorkflowsResponse {
        workflows: page.workflows,
        total: page.total,
    }))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowWithTasks>, AppError> {
    let workflow = workflow_db::get_workflow(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;
    Ok(Json(workflow))
}

pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<MessageResponse>, AppError> {
    workflow_db::get_workflow(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("workflow {id} not found")))?;

    workflow_db::update_workflow_status(&state.pool, id, WorkflowStatus::Cancelled)
        .await
        .map_err(AppError::internal)?;
    task_db::cancel_tasks_for_workflow(&state.pool, id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(MessageResponse {
        message: "Workflow cancelled".to_string(),
    }))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;
    Ok(Json(task))
}

pub async fn list_workflow_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Task>>, AppError> {
    let tasks = task_db::list_tasks_for_workflow(&state.pool, id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(tasks))
}

/// Status Ingress (§4.5): `ReportTaskStatus`. Idempotent by (task_id,
/// status) -- a repeated terminal report is a no-op since the underlying
/// `UPDATE` statements are themselves idempotent on final state.
pub async fn report_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TaskStatusReport>,
) -> Result<Json<MessageResponse>, AppError> {
    match body.status {
        TaskOutcome::Running => {
            task_db::mark_task_running(&state.pool, id)
                .await
                .map_err(AppError::internal)?;
        }
        TaskOutcome::Completed => {
            task_db::mark_task_completed(&state.pool, id, body.result.unwrap_or(serde_json::Value::Null))
                .await
                .map_err(AppError::internal)?;
        }
        TaskOutcome::Retrying | TaskOutcome::Failed => {
            task_db::record_task_failure(
                &state.pool,
                id,
                body.error.as_deref().unwrap_or("task failed"),
            )
            .await
            .map_err(AppError::internal)?;
        }
    }

    Ok(Json(MessageResponse {
        message: "ok".to_string(),
    }))
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn metrics(State(state): State<AppState>) -> Result<Json<MetricsResponse>, AppError> {
    let mut workflows_by_status = HashMap::new();
    for status in [
        WorkflowStatus::Pending,
        WorkflowStatus::Running,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ] {
        let page = workflow_db::list_workflows(&state.pool, Some(status), 1, 0)
            .await
            .map_err(AppError::internal)?;
        workflows_by_status.insert(status.to_string(), page.total);
    }

    let mut queue_stats_by_type = HashMap::new();
    for task_type in task_db::distinct_task_types(&state.pool)
        .await
        .map_err(AppError::internal)?
    {
        let stats = state
            .queue
            .get_queue_stats(&task_type)
            .await
            .map_err(AppError::internal)?;
        queue_stats_by_type.insert(task_type, stats);
    }

    Ok(Json(MetricsResponse {
        workflows_by_status,
        queue_stats_by_type,
    }))
}
