//! Dependency graph validation and ready-set computation.
//!
//! Tasks are linked by name (see `flowline_db::models::TaskDependency`):
//! this keeps a workflow's YAML definition round-trippable and decouples
//! persistence order from authoring order.

use std::collections::{HashMap, HashSet};

use flowline_db::models::{Task, TaskStatus};

use crate::error::WorkflowValidationError;

/// A task name and the names of the sibling tasks it depends on, as used
/// during validation before anything is persisted.
pub struct TaskNode<'a> {
    pub name: &'a str,
    pub depends_on: &'a [String],
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validate that every dependency reference resolves to a sibling task
/// name and that the dependency graph contains no cycles.
///
/// A workflow with zero tasks is valid: it has nothing to schedule and the
/// completion monitor closes it out as `completed` on its next tick.
///
/// Uses a standard DFS with three-coloring (white/unvisited, gray/active,
/// black/done): a gray node reached again means a cycle.
pub fn validate_dag(nodes: &[TaskNode<'_>]) -> Result<(), WorkflowValidationError> {
    let mut seen = HashSet::new();
    for node in nodes {
        if !seen.insert(node.name) {
            return Err(WorkflowValidationError::DuplicateTaskName(
                node.name.to_string(),
            ));
        }
    }

    for node in nodes {
        for dep in node.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(WorkflowValidationError::UnknownDependency {
                    task: node.name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let adjacency: HashMap<&str, &[String]> =
        nodes.iter().map(|n| (n.name, n.depends_on)).collect();
    let mut colors: HashMap<&str, Color> =
        nodes.iter().map(|n| (n.name, Color::White)).collect();

    for node in nodes {
        if colors[node.name] == Color::White {
            let mut stack = vec![node.name];
            visit(node.name, &adjacency, &mut colors, &mut stack)?;
        }
    }

    Ok(())
}

fn visit<'a>(
    name: &'a str,
    adjacency: &HashMap<&'a str, &'a [String]>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Result<(), WorkflowValidationError> {
    colors.insert(name, Color::Gray);

    if let Some(deps) = adjacency.get(name) {
        for dep in deps.iter() {
            let dep = dep.as_str();
            match colors.get(dep).copied().unwrap_or(Color::White) {
                Color::White => {
                    path.push(dep);
                    visit(dep, adjacency, colors, path)?;
                    path.pop();
                }
                Color::Gray => {
                    let mut cycle = path.clone();
                    cycle.push(dep);
                    return Err(WorkflowValidationError::CycleDetected(cycle.join(" -> ")));
                }
                Color::Black => {}
            }
        }
    }

    colors.insert(name, Color::Black);
    Ok(())
}

/// Tasks within a workflow whose dependencies have all completed and whose
/// own status is schedulable (pending or retrying). Mirrors the scheduling
/// loop's step (e): dependency satisfaction is checked in-process against
/// sibling statuses rather than as a single SQL predicate.
pub fn ready_tasks<'a>(tasks: &'a [Task], dependencies: &HashMap<uuid::Uuid, Vec<String>>) -> Vec<&'a Task> {
    let status_by_name: HashMap<&str, TaskStatus> =
        tasks.iter().map(|t| (t.name.as_str(), t.status)).collect();

    tasks
        .iter()
        .filter(|t| t.status.is_schedulable())
        .filter(|t| {
            dependencies
                .get(&t.id)
                .map(|deps| {
                    deps.iter()
                        .all(|dep| status_by_name.get(dep.as_str()) == Some(&TaskStatus::Completed))
                })
                .unwrap_or(true)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node<'a>(name: &'a str, deps: &'a [String]) -> TaskNode<'a> {
        TaskNode {
            name,
            depends_on: deps,
        }
    }

    #[test]
    fn empty_workflow_is_valid() {
        let nodes: Vec<TaskNode<'_>> = vec![];
        assert!(validate_dag(&nodes).is_ok());
    }

    #[test]
    fn linear_chain_is_valid() {
        let a_deps: Vec<String> = vec![];
        let b_deps = vec!["a".to_string()];
        let c_deps = vec!["b".to_string()];
        let nodes = vec![node("a", &a_deps), node("b", &b_deps), node("c", &c_deps)];
        assert!(validate_dag(&nodes).is_ok());
    }

    #[test]
    fn self_cycle_is_rejected() {
        let deps = vec!["a".to_string()];
        let nodes = vec![node("a", &deps)];
        let err = validate_dag(&nodes).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::CycleDetected(_)));
    }

    #[test]
    fn mutual_cycle_is_rejected() {
        let a_deps = vec!["b".to_string()];
        let b_deps = vec!["a".to_string()];
        let nodes = vec![node("a", &a_deps), node("b", &b_deps)];
        let err = validate_dag(&nodes).unwrap_err();
        assert!(matches!(err, WorkflowValidationError::CycleDetected(_)));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let deps = vec!["missing".to_string()];
        let nodes = vec![node("a", &deps)];
        let err = validate_dag(&nodes).unwrap_err();
        assert!(matches!(
            err,
            WorkflowValidationError::UnknownDependency { .. }
        ));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let empty: Vec<String> = vec![];
        let nodes = vec![node("a", &empty), node("a", &empty)];
        let err = validate_dag(&nodes).unwrap_err();
        assert!(matches!(
            err,
            WorkflowValidationError::DuplicateTaskName(_)
        ));
    }

    #[test]
    fn diamond_dependency_is_valid() {
        let empty: Vec<String> = vec![];
        let b_deps = vec!["a".to_string()];
        let c_deps = vec!["a".to_string()];
        let d_deps = vec!["b".to_string(), "c".to_string()];
        let nodes = vec![
            node("a", &empty),
            node("b", &b_deps),
            node("c", &c_deps),
            node("d", &d_deps),
        ];
        assert!(validate_dag(&nodes).is_ok());
    }
}
