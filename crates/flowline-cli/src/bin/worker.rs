use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Json;
use axum::routing::get;
use clap::Parser;
use flowline_core::worker::{run_worker, StatusIngressClient, TaskBody, WorkerConfig};
use flowline_queue::{QueueConfig, WorkQueue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flowline-worker", about = "Flowline task worker process")]
struct Cli {
    /// Work Queue address (overrides FLOWLINE_REDIS_URL env var)
    #[arg(long)]
    redis_url: Option<String>,

    /// Worker's own health-check bind address
    #[arg(long, default_value = "0.0.0.0:9090")]
    bind: String,

    /// Orchestrator status-callback base URL
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    callback_url: String,

    /// Comma-separated task types served by this worker
    #[arg(long, value_delimiter = ',')]
    types: Vec<String>,
}

/// A task body that echoes its payload back as the result. Demonstrates
/// the `TaskBody` seam a real executor would implement; the core never
/// inspects what a task actually does.
struct EchoTaskBody {
    task_type: String,
}

#[async_trait]
impl TaskBody for EchoTaskBody {
    fn task_type(&self) -> &str {
        &self.task_type
    }

    async fn execute(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "echoed": payload }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.types.is_empty() {
        anyhow::bail!("--types must name at least one served task type");
    }

    let queue_config = match cli.redis_url.as_deref() {
        Some(url) => QueueConfig::new(url),
        None => QueueConfig::from_env(),
    };
    let queue = WorkQueue::connect(&queue_config)
        .await
        .context("failed to connect to work queue at startup")?;

    let status = StatusIngressClient::new(cli.callback_url.clone());
    let worker_id = Uuid::new_v4();
    let bodies: Vec<Arc<dyn TaskBody>> = cli
        .types
        .iter()
        .map(|t| Arc::new(EchoTaskBody { task_type: t.clone() }) as Arc<dyn TaskBody>)
        .collect();

    let config = WorkerConfig {
        address: cli.bind.clone(),
        ..WorkerConfig::default()
    };

    let cancel = CancellationToken::new();
    let loops = run_worker(worker_id, queue, status, bodies, config, cancel.clone()).await?;

    let health_app = axum::Router::new().route("/healthz", get(health));
    let addr: SocketAddr = cli.bind.parse().context("invalid --bind address")?;
    tracing::info!(%addr, %worker_id, types = ?cli.types, "flowline worker listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, health_app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for handle in loops {
        let _ = handle.await;
    }

    tracing::info!(%worker_id, "flowline worker shut down");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}
