//! Core orchestration logic: DAG validation, the YAML ingestion front-end,
//! the Scheduler's three loops, and the Worker Runtime library.

pub mod dag;
pub mod error;
pub mod scheduler;
pub mod worker;
pub mod yaml;

pub use error::WorkflowValidationError;
