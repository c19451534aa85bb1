use anyhow::Result;
use flowline_db::models::WorkflowStatus;
use flowline_db::queries::{tasks as task_db, workflows as workflow_db};
use flowline_queue::WorkQueue;
use sqlx::PgPool;

/// One tick of the completion monitor (§4.3): closes out finished
/// workflows and reaps expired worker leases.
///
/// A running workflow transitions to `completed` once every task is
/// completed, or to `failed` once all tasks are terminal and at least one
/// of them failed (no task remains that could still reach `completed`).
pub async fn run_completion_tick(pool: &PgPool, queue: &WorkQueue) -> Result<()> {
    for workflow in workflow_db::list_active_workflows(pool).await? {
        let completion = task_db::check_workflow_completion(pool, workflow.id).await?;
        if !completion.all_terminal {
            continue;
        }

        let next_status = if completion.any_failed {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        workflow_db::update_workflow_status(pool, workflow.id, next_status).await?;
        tracing::info!(workflow_id = %workflow.id, status = %next_status, "workflow closed out");
    }

    for task_type in task_db::distinct_task_types(pool).await? {
        let reaped = queue.reap_expired_leases(&task_type).await?;
        if reaped > 0 {
            tracing::warn!(task_type = %task_type, count = reaped, "reaped expired worker leases");
        }
    }

    Ok(())
}
