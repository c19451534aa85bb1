use thiserror::Error;

/// Errors raised while validating a workflow definition, shared between
/// the HTTP JSON submission path and the YAML file path.
#[derive(Debug, Error)]
pub enum WorkflowValidationError {
    #[error("duplicate task name: {0:?}")]
    DuplicateTaskName(String),

    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
