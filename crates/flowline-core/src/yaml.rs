//! Parsing and validation for YAML workflow definitions.
//!
//! Top-level keys: `name`, `description`, `config`, `tasks`. Shares cycle
//! and dangling-reference validation ([`crate::dag::validate_dag`]) with
//! the HTTP JSON submission path so both accept exactly the same graphs.

use std::time::Duration;

use flowline_db::queries::workflows::{NewTask, NewWorkflow};
use serde::Deserialize;

use crate::dag::{TaskNode, validate_dag};
use crate::error::WorkflowValidationError;

#[derive(Debug, Deserialize)]
struct WorkflowYaml {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    config: WorkflowConfigYaml,
    tasks: Vec<TaskYaml>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkflowConfigYaml {
    max_concurrency: Option<i32>,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicyYaml>,
}

#[derive(Debug, Deserialize)]
struct RetryPolicyYaml {
    max_attempts: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    initial_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    max_delay: Option<Duration>,
    backoff_factor: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TaskYaml {
    name: String,
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    max_retries: i32,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Parse and validate a YAML workflow definition, producing a
/// [`NewWorkflow`] ready for [`flowline_db::queries::workflows::create_workflow`].
pub fn parse_workflow_yaml(content: &str) -> Result<NewWorkflow, WorkflowValidationError> {
    let parsed: WorkflowYaml = serde_yaml::from_str(content)?;

    let nodes: Vec<TaskNode<'_>> = parsed
        .tasks
        .iter()
        .map(|t| TaskNode {
            name: &t.name,
            depends_on: &t.depends_on,
        })
        .collect();
    validate_dag(&nodes)?;

    let retry_policy = parsed.config.retry_policy.as_ref().map(|r| {
        serde_json::json!({
            "max_attempts": r.max_attempts,
            "initial_delay_secs": r.initial_delay.map(|d| d.as_secs()),
            "max_delay_secs": r.max_delay.map(|d| d.as_secs()),
            "backoff_factor": r.backoff_factor,
        })
    });

    Ok(NewWorkflow {
        name: parsed.name,
        description: parsed.description,
        max_concurrency: parsed.config.max_concurrency,
        timeout_seconds: parsed.config.timeout.map(|d| d.as_secs() as i64),
        retry_policy,
        tasks: parsed
            .tasks
            .into_iter()
            .map(|t| NewTask {
                name: t.name,
                task_type: t.task_type,
                payload: t.payload,
                max_retries: t.max_retries,
                priority: t.priority,
                dependencies: t.depends_on,
            })
            .collect(),
    })
}
