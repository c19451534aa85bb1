//! Database query functions for the `tasks` and `task_dependencies` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskDependency, TaskStatus};

/// Distinct task types seen across all workflows, used by the scheduler's
/// retry-promotion loop and completion monitor to know which Work Queue
/// channels to sweep without requiring a static registry.
pub async fn distinct_task_types(pool: &PgPool) -> Result<Vec<String>> {
    sqlx::query_scalar("SELECT DISTINCT task_type FROM tasks ORDER BY task_type")
        .fetch_all(pool)
        .await
        .context("failed to list distinct task types")
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")
}

/// List all tasks belonging to a workflow, in creation order.
pub async fn list_tasks_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for workflow")
}

/// Fetch the dependency edges for a single task (by name, not id --
/// dependencies are stored as sibling task names, see
/// `SPEC_FULL.md` §9 on why the DAG is name-keyed rather than id-keyed).
pub async fn get_task_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskDependency>> {
    sqlx::query_as::<_, TaskDependency>(
        "SELECT * FROM task_dependencies WHERE task_id = $1 ORDER BY depends_on_name ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch task dependencies")
}

/// Fetch dependency edges for every task in a workflow in one query, keyed
/// by task id, for callers (the scheduler) that need to hydrate an entire
/// workflow's DAG at once rather than round-tripping per task.
pub async fn get_dependencies_for_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<TaskDependency>> {
    sqlx::query_as::<_, TaskDependency>(
        "SELECT td.* FROM task_dependencies td \
         JOIN tasks t ON t.id = td.task_id \
         WHERE t.workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch workflow dependencies")
}

/// Candidate tasks for scheduling across all active workflows: status is
/// `pending` or `retrying`, ordered by priority DESC then created_at ASC
/// then id ASC (the tie-break that makes scheduling order deterministic).
///
/// This does not check dependency satisfaction -- callers must hydrate
/// each task's workflow and check sibling statuses, since "all
/// dependencies completed" is not expressible as a single indexed
/// predicate over this table alone.
pub async fn get_pending_tasks(pool: &PgPool, limit: i64) -> Result<Vec<Task>> {
    sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('pending', 'retrying') \
         ORDER BY priority DESC, created_at ASC, id ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch pending tasks")
}

/// Transition a task to `running`, recording `started_at` on first entry.
/// Optimistic: only succeeds if the task's current status is schedulable
/// (`pending` or `retrying`); returns `false` if another scheduler tick (or
/// worker) already claimed it.
pub async fn mark_task_running(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', updated_at = now(), started_at = COALESCE(started_at, now()) \
         WHERE id = $1 AND status IN ('pending', 'retrying')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark task running")?;

    Ok(result.rows_affected() == 1)
}

/// Mark a task completed, recording its result payload.
pub async fn mark_task_completed(pool: &PgPool, id: Uuid, result: serde_json::Value) -> Result<()> {
    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', result = $2, error = NULL, \
             updated_at = now(), completed_at = now() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(result)
    .execute(pool)
    .await
    .context("failed to mark task completed")?;

    if rows.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }
    Ok(())
}

/// Record a task failure. If `retry_count < max_retries`, the task goes to
/// `retrying` and `retry_count` is incremented so the next scheduler tick
/// (and the Work Queue's own backoff promotion) can pick it back up;
/// otherwise it goes to the terminal `failed` state.
pub async fn record_task_failure(pool: &PgPool, id: Uuid, error: &str) -> Result<TaskStatus> {
    let row: (TaskStatus,) = sqlx::query_as(
        "UPDATE tasks \
         SET status = CASE WHEN retry_count < max_retries THEN 'retrying' ELSE 'failed' END, \
             retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END, \
             error = $2, \
             updated_at = now(), \
             completed_at = CASE WHEN retry_count >= max_retries THEN now() ELSE completed_at END \
         WHERE id = $1 \
         RETURNING status",
    )
    .bind(id)
    .bind(error)
    .fetch_one(pool)
    .await
    .context("failed to record task failure")?;

    Ok(row.0)
}

/// Mark a task cancelled. Used when a workflow is cancelled and its
/// not-yet-terminal tasks must be swept along with it.
pub async fn mark_task_cancelled(pool: &PgPool, id: Uuid) -> Result<()> {
    let rows = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', updated_at = now(), completed_at = now() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    let _ = rows.rows_affected();
    Ok(())
}

/// Cancel every non-terminal task belonging to a workflow in one
/// statement, used by the `cancel workflow` API/CLI path.
pub async fn cancel_tasks_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', updated_at = now(), completed_at = now() \
         WHERE workflow_id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(workflow_id)
    .execute(pool)
    .await
    .context("failed to cancel workflow tasks")?;

    Ok(result.rows_affected())
}

/// Whether every task in a workflow has reached a terminal status, and
/// whether any of them failed -- used by the scheduler's completion
/// monitor loop to decide when (and how) to close out a workflow.
///
/// A workflow with zero tasks reports `all_terminal = true` with nothing
/// failed or cancelled, so it closes out as `completed` on the first tick.
pub struct WorkflowCompletion {
    pub all_terminal: bool,
    pub any_failed: bool,
    pub any_cancelled: bool,
}

pub async fn check_workflow_completion(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<WorkflowCompletion> {
    let row: (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT \
            COUNT(*) FILTER (WHERE status NOT IN ('completed', 'failed', 'cancelled')), \
            COUNT(*) FILTER (WHERE status = 'failed'), \
            COUNT(*) FILTER (WHERE status = 'cancelled'), \
            COUNT(*) \
         FROM tasks WHERE workflow_id = $1",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check workflow completion")?;

    let (non_terminal, failed, cancelled, total) = row;
    Ok(WorkflowCompletion {
        all_terminal: total == 0 || non_terminal == 0,
        any_failed: failed > 0,
        any_cancelled: cancelled > 0,
    })
}
