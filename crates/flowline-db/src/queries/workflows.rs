//! Database query functions for the `workflows` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, Workflow, WorkflowStatus, WorkflowWithTasks};

/// A task as submitted, before an id or creation timestamp is assigned.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub max_retries: i32,
    pub priority: i32,
    /// Names of sibling tasks (within the same workflow) this task depends on.
    pub dependencies: Vec<String>,
}

/// A workflow as submitted, before an id or creation timestamp is assigned.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub name: String,
    pub description: Option<String>,
    pub max_concurrency: Option<i32>,
    pub timeout_seconds: Option<i64>,
    pub retry_policy: Option<serde_json::Value>,
    pub tasks: Vec<NewTask>,
}

/// Insert a workflow and all of its tasks (and dependency edges) in a single
/// transaction.
///
/// Callers MUST validate the dependency graph (all names resolve, no cycles)
/// before calling this; this function only re-checks referential integrity
/// (a dependency name must name a sibling task) since it already has the
/// full task set in hand, and rejects the whole workflow on failure rather
/// than leaving a partial write.
pub async fn create_workflow(pool: &PgPool, new: &NewWorkflow) -> Result<WorkflowWithTasks> {
    let names: std::collections::HashSet<&str> =
        new.tasks.iter().map(|t| t.name.as_str()).collect();
    for task in &new.tasks {
        for dep in &task.dependencies {
            if !names.contains(dep.as_str()) {
                anyhow::bail!(
                    "task {:?} depends on unknown task {:?}",
                    task.name,
                    dep
                );
            }
        }
    }

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin workflow creation transaction")?;

    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (name, description, max_concurrency, timeout_seconds, retry_policy) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(new.max_concurrency)
    .bind(new.timeout_seconds)
    .bind(&new.retry_policy)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert workflow")?;

    let mut tasks = Vec::with_capacity(new.tasks.len());
    for task in &new.tasks {
        let row = sqlx::query_as::<_, Task>(
            "INSERT INTO tasks (workflow_id, name, task_type, payload, max_retries, priority) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING *",
        )
        .bind(workflow.id)
        .bind(&task.name)
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(task.max_retries)
        .bind(task.priority)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert task {:?}", task.name))?;

        for dep in &task.dependencies {
            sqlx::query(
                "INSERT INTO task_dependencies (task_id, depends_on_name) VALUES ($1, $2)",
            )
            .bind(row.id)
            .bind(dep)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!("failed to insert dependency {:?} -> {:?}", task.name, dep)
            })?;
        }

        tasks.push(row);
    }

    tx.commit()
        .await
        .context("failed to commit workflow creation transaction")?;

    Ok(WorkflowWithTasks { workflow, tasks })
}

/// Fetch a workflow with its tasks hydrated in creation order.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowWithTasks>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    let Some(workflow) = workflow else {
        return Ok(None);
    };

    let tasks = super::tasks::list_tasks_for_workflow(pool, id).await?;

    Ok(Some(WorkflowWithTasks { workflow, tasks }))
}

/// A page of workflows, plus the total count matching the filter (for
/// pagination-aware clients).
#[derive(Debug, Clone)]
pub struct WorkflowPage {
    pub workflows: Vec<Workflow>,
    pub total: i64,
}

/// List workflows newest-first, optionally filtered by status, paginated.
pub async fn list_workflows(
    pool: &PgPool,
    status: Option<WorkflowStatus>,
    limit: i64,
    offset: i64,
) -> Result<WorkflowPage> {
    let workflows = match status {
        Some(status) => {
            sqlx::query_as::<_, Workflow>(
                "SELECT * FROM workflows WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Workflow>(
                "SELECT * FROM workflows ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list workflows")?;

    let total: i64 = match status {
        Some(status) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM workflows WHERE status = $1")
                .bind(status)
                .fetch_one(pool)
                .await
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM workflows")
                .fetch_one(pool)
                .await
        }
    }
    .context("failed to count workflows")?;

    Ok(WorkflowPage { workflows, total })
}

/// Fetch every workflow still `pending` or `running`, for the completion
/// monitor's sweep. `pending` is included alongside `running` so a
/// zero-task workflow -- which never gets promoted to `running`, since the
/// scheduling loop only touches workflows that have pending tasks -- is
/// still picked up and closed out. Unbounded: the number of concurrently
/// active workflows is expected to stay small relative to total workflow
/// history.
pub async fn list_active_workflows(pool: &PgPool) -> Result<Vec<Workflow>> {
    sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE status IN ('pending', 'running')")
        .fetch_all(pool)
        .await
        .context("failed to list active workflows")
}

/// Update a workflow's status. Idempotent: setting the same status twice
/// is a no-op on `started_at`/`completed_at` since `COALESCE` only fills
/// unset columns.
///
/// Sets `started_at` on the first transition to `running`, and
/// `completed_at` on any transition to a terminal status.
pub async fn update_workflow_status(
    pool: &PgPool,
    id: Uuid,
    status: WorkflowStatus,
) -> Result<()> {
    let started_at = matches!(status, WorkflowStatus::Running).then(Utc::now);
    let completed_at = matches!(
        status,
        WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
    )
    .then(Utc::now);

    let result = sqlx::query(
        "UPDATE workflows \
         SET status = $1, \
             updated_at = now(), \
             started_at = COALESCE(started_at, $2), \
             completed_at = COALESCE(completed_at, $3) \
         WHERE id = $4",
    )
    .bind(status)
    .bind(started_at)
    .bind(completed_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update workflow status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow {id} not found");
    }

    Ok(())
}
