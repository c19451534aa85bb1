//! Management API: workflow submission/inspection plus the Status Ingress,
//! sharing one router and error-mapping convention (`AppError`).

pub mod error;
pub mod handlers;

use axum::Router;
use axum::routing::{get, post, put};
use flowline_queue::WorkQueue;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub queue: WorkQueue,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/workflows",
            post(handlers::create_workflow).get(handlers::list_workflows),
        )
        .route("/api/v1/workflows/{id}", get(handlers::get_workflow))
        .route(
            "/api/v1/workflows/{id}/cancel",
            put(handlers::cancel_workflow),
        )
        .route(
            "/api/v1/workflows/{id}/tasks",
            get(handlers::list_workflow_tasks),
        )
        .route("/api/v1/tasks/{id}", get(handlers::get_task))
        .route(
            "/api/v1/tasks/{id}/status",
            post(handlers::report_task_status),
        )
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/metrics", get(handlers::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
