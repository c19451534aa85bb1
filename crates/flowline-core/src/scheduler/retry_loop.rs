use anyhow::Result;
use flowline_db::queries::tasks as task_db;
use flowline_queue::WorkQueue;
use sqlx::PgPool;

/// One tick of the retry-promotion loop (§4.3): for every known task type,
/// move due retries back onto the ready list.
pub async fn run_retry_tick(pool: &PgPool, queue: &WorkQueue) -> Result<()> {
    for task_type in task_db::distinct_task_types(pool).await? {
        let promoted = queue.process_retries(&task_type).await?;
        if promoted > 0 {
            tracing::info!(task_type = %task_type, count = promoted, "promoted due retries");
        }
    }
    Ok(())
}
