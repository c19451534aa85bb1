//! Work Queue: the Redis-backed coordination surface between the
//! orchestrator and workers.

pub mod client;
pub mod config;
pub mod worker_info;

pub use client::{QueueStats, QueuedTask, RetryPolicy, WorkQueue};
pub use config::QueueConfig;
pub use worker_info::WorkerInfo;
