use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowline_cli::api;
use flowline_core::scheduler::{self, SchedulerConfig};
use flowline_core::yaml::parse_workflow_yaml;
use flowline_db::config::DbConfig;
use flowline_db::{pool, queries::workflows};
use flowline_queue::{QueueConfig, WorkQueue};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "flowline", about = "Distributed, DAG-aware workflow orchestrator")]
struct Cli {
    /// State-store connection string (overrides FLOWLINE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Work Queue address (overrides FLOWLINE_REDIS_URL env var)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// API bind address
    #[arg(long, global = true, default_value = "0.0.0.0:8080")]
    bind: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the three scheduler loops plus the HTTP API
    Serve,
    /// Apply pending migrations
    DbInit,
    /// Parse and validate a YAML workflow, then submit it to a running orchestrator
    Submit {
        /// Path to the workflow YAML file
        file: String,
        /// Base URL of the running orchestrator
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        orchestrator_url: String,
    },
    /// Show a workflow's status and tasks
    Status {
        workflow_id: Uuid,
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        orchestrator_url: String,
    },
    /// Cancel a running workflow
    Cancel {
        workflow_id: Uuid,
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        orchestrator_url: String,
    },
}

fn resolve_db_config(cli_url: Option<&str>) -> DbConfig {
    match cli_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    }
}

fn resolve_queue_config(cli_url: Option<&str>) -> QueueConfig {
    match cli_url {
        Some(url) => QueueConfig::new(url),
        None => QueueConfig::from_env(),
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

    match cli.command {
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve => cmd_serve(cli.database_url.as_deref(), cli.redis_url.as_deref(), &cli.bind).await,
        Commands::Submit { file, orchestrator_url } => cmd_submit(&file, &orchestrator_url).await,
        Commands::Status { workflow_id, orchestrator_url } => {
            cmd_status(workflow_id, &orchestrator_url).await
        }
        Commands::Cancel { workflow_id, orchestrator_url } => {
            cmd_cancel(workflow_id, &orchestrator_url).await
        }
    }
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let db_config = resolve_db_config(cli_db_url);

    tracing::info!("ensuring database exists");
    pool::ensure_database_exists(&db_config).await?;

    let db_pool = pool::create_pool(&db_config).await?;
    pool::run_default_migrations(&db_pool).await?;
    db_pool.close().await;

    tracing::info!("database initialized");
    Ok(())
}

async fn cmd_serve(cli_db_url: Option<&str>, cli_redis_url: Option<&str>, bind: &str) -> Result<()> {
    let db_config = resolve_db_config(cli_db_url);
    let queue_config = resolve_queue_config(cli_redis_url);

    let db_pool = pool::create_pool(&db_config)
        .await
        .context("failed to connect to state store at startup")?;
    let queue = WorkQueue::connect(&queue_config)
        .await
        .context("failed to connect to work queue at startup")?;

    let cancel = CancellationToken::new();
    let loops = scheduler::spawn_loops(db_pool.clone(), queue.clone(), SchedulerConfig::default(), cancel.clone());

    let state = api::AppState {
        pool: db_pool.clone(),
        queue: queue.clone(),
    };
    let app = api::build_router(state);
    let addr: SocketAddr = bind.parse().context("invalid --bind address")?;
    tracing::info!(%addr, "flowline orchestrator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for handle in loops {
        let _ = handle.await;
    }
    db_pool.close().await;

    tracing::info!("flowline orchestrator shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

async fn cmd_submit(file: &str, orchestrator_url: &str) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow file {file}"))?;
    let new_workflow = parse_workflow_yaml(&content)?;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{orchestrator_url}/api/v1/workflows"))
        .json(&new_workflow_to_request(&new_workflow))
        .send()
        .await
        .context("failed to submit workflow")?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.context("failed to parse response")?;
    if !status.is_success() {
        anyhow::bail!("submission rejected ({status}): {body}");
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn new_workflow_to_request(wf: &workflows::NewWorkflow) -> serde_json::Value {
    serde_json::json!({
        "name": wf.name,
        "description": wf.description,
        "config": {
            "max_concurrency": wf.max_concurrency,
            "timeout_seconds": wf.timeout_seconds,
            "retry_policy": wf.retry_policy,
        },
        "tasks": wf.tasks.iter().map(|t| serde_json::json!({
            "name": t.name,
            "type": t.task_type,
            "payload": t.payload,
            "max_retries": t.max_retries,
            "priority": t.priority,
            "dependencies": t.dependencies,
        })).collect::<Vec<_>>(),
    })
}

async fn cmd_status(workflow_id: Uuid, orchestrator_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{orchestrator_url}/api/v1/workflows/{workflow_id}"))
        .send()
        .await
        .context("failed to fetch workflow status")?
        .error_for_status()
        .context("orchestrator returned an error")?;

    let body: serde_json::Value = response.json().await.context("failed to parse response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn cmd_cancel(workflow_id: Uuid, orchestrator_url: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .put(format!("{orchestrator_url}/api/v1/workflows/{workflow_id}/cancel"))
        .send()
        .await
        .context("failed to cancel workflow")?
        .error_for_status()
        .context("orchestrator returned an error")?;

    let body: serde_json::Value = response.json().await.context("failed to parse response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
