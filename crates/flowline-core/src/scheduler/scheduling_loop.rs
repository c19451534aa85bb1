use std::collections::HashMap;

use anyhow::Result;
use flowline_db::models::WorkflowStatus;
use flowline_db::queries::{tasks as task_db, workflows as workflow_db};
use flowline_queue::{QueuedTask, WorkQueue};
use sqlx::PgPool;
use uuid::Uuid;

use crate::dag::ready_tasks;

/// One tick of the scheduling loop (§4.3 step a-g):
///
/// 1. Fetch pending tasks.
/// 2. Group by workflow.
/// 3. For each workflow not in `{pending, running}`, skip.
/// 4. Compute the ready set (dependencies completed, status schedulable).
/// 5. If the ready set is non-empty and the workflow is pending, promote
///    it to running.
/// 6. Enqueue every ready task on the Work Queue. Its state-store status
///    stays `pending`/`retrying` until the worker flips it to `running`
///    on pickup.
pub async fn run_scheduling_tick(pool: &PgPool, queue: &WorkQueue) -> Result<()> {
    let pending = task_db::get_pending_tasks(pool, 1000).await?;
    if pending.is_empty() {
        return Ok(());
    }

    let mut by_workflow: HashMap<Uuid, Vec<_>> = HashMap::new();
    for task in pending {
        by_workflow.entry(task.workflow_id).or_default().push(task);
    }

    for (workflow_id, pending_in_workflow) in by_workflow {
        let Some(hydrated) = workflow_db::get_workflow(pool, workflow_id).await? else {
            tracing::warn!(%workflow_id, "pending task references missing workflow");
            continue;
        };

        if !matches!(
            hydrated.workflow.status,
            WorkflowStatus::Pending | WorkflowStatus::Running
        ) {
            continue;
        }

        let dependencies = task_db::get_dependencies_for_workflow(pool, workflow_id).await?;
        let mut deps_by_task: HashMap<Uuid, Vec<String>> = HashMap::new();
        for dep in dependencies {
            deps_by_task
                .entry(dep.task_id)
                .or_default()
                .push(dep.depends_on_name);
        }

        let ready = ready_tasks(&hydrated.tasks, &deps_by_task);
        let ready_ids: std::collections::HashSet<Uuid> = ready.iter().map(|t| t.id).collect();

        let ready_pending: Vec<_> = pending_in_workflow
            .into_iter()
            .filter(|t| ready_ids.contains(&t.id))
            .collect();

        if ready_pending.is_empty() {
            continue;
        }

        if hydrated.workflow.status == WorkflowStatus::Pending {
            workflow_db::update_workflow_status(pool, workflow_id, WorkflowStatus::Running)
                .await?;
        }

        for task in ready_pending {
            let queued = QueuedTask {
                task_id: task.id,
                workflow_id: task.workflow_id,
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                retry_count: task.retry_count,
                max_retries: task.max_retries,
            };
            queue.enqueue(&queued).await?;
            tracing::debug!(task_id = %task.id, task_type = %task.task_type, "enqueued ready task");
        }
    }

    Ok(())
}
