//! Three cooperating timer-driven loops, sharing a process but no mutable
//! state beyond a [`CancellationToken`]: scheduling, retry-promotion, and
//! completion monitoring. All cross-loop communication goes through the
//! State Store or Work Queue.

mod completion_monitor;
mod retry_loop;
mod scheduling_loop;

use std::time::Duration;

use flowline_queue::WorkQueue;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use completion_monitor::run_completion_tick;
pub use retry_loop::run_retry_tick;
pub use scheduling_loop::run_scheduling_tick;

/// Tick intervals for the three loops.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub scheduling_interval: Duration,
    pub retry_interval: Duration,
    pub completion_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduling_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(60),
            completion_interval: Duration::from_secs(300),
        }
    }
}

/// Spawn the three loops as independent `tokio` tasks. Each stops cleanly
/// when `cancel` is triggered.
pub fn spawn_loops(
    pool: PgPool,
    queue: WorkQueue,
    config: SchedulerConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_ticking(config.scheduling_interval, cancel.clone(), {
            let pool = pool.clone();
            let queue = queue.clone();
            move || {
                let pool = pool.clone();
                let queue = queue.clone();
                async move {
                    if let Err(err) = run_scheduling_tick(&pool, &queue).await {
                        tracing::error!(error = %err, "scheduling tick failed");
                    }
                }
            }
        }),
        spawn_ticking(config.retry_interval, cancel.clone(), {
            let pool = pool.clone();
            let queue = queue.clone();
            move || {
                let pool = pool.clone();
                let queue = queue.clone();
                async move {
                    if let Err(err) = run_retry_tick(&pool, &queue).await {
                        tracing::error!(error = %err, "retry-promotion tick failed");
                    }
                }
            }
        }),
        spawn_ticking(config.completion_interval, cancel.clone(), {
            move || {
                let pool = pool.clone();
                let queue = queue.clone();
                async move {
                    if let Err(err) = run_completion_tick(&pool, &queue).await {
                        tracing::error!(error = %err, "completion monitor tick failed");
                    }
                }
            }
        }),
    ]
}

fn spawn_ticking<F, Fut>(interval: Duration, cancel: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}
