//! State Store: persistence layer for workflows, tasks, and their
//! dependency edges, backed by Postgres via `sqlx`.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use models::{Task, TaskDependency, TaskStatus, Workflow, WorkflowStatus, WorkflowWithTasks};
