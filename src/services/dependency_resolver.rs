//! Step dependency validation and cycle detection for templates.

use std::collections::{HashMap, HashSet};

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::WorkflowStep;

/// Service for resolving step dependencies and detecting circular dependencies
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver;

// Standalone helper for cycle detection (no self needed)
fn detect_cycle_util<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                if detect_cycle_util(neighbor, graph, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                if let Some(cycle_start) = path.iter().position(|&id| id == neighbor) {
                    path.drain(0..cycle_start);
                    path.push(neighbor);
                    return true;
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
    false
}

impl DependencyResolver {
    /// Stateless resolver.
    pub fn new() -> Self {
        Self
    }

    /// Every dependency must name another step of the same template.
    pub fn validate_dependencies(&self, steps: &[WorkflowStep]) -> OrchestrationResult<()> {
        let known: HashSet<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();

        for step in steps {
            for dep in &step.dependencies {
                if dep == &step.step_id {
                    return Err(OrchestrationError::DependencyCycle(vec![
                        dep.clone(),
                        dep.clone(),
                    ]));
                }
                if !known.contains(dep.as_str()) {
                    return Err(OrchestrationError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.step_id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Detect a circular dependency. The returned path starts and ends on
    /// the same step.
    pub fn detect_cycle(&self, steps: &[WorkflowStep]) -> Option<Vec<String>> {
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in steps {
            graph
                .entry(step.step_id.as_str())
                .or_default()
                .extend(step.dependencies.iter().map(String::as_str));
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for step in steps {
            let id = step.step_id.as_str();
            if !visited.contains(id)
                && detect_cycle_util(id, &graph, &mut visited, &mut rec_stack, &mut path)
            {
                return Some(path.into_iter().map(ToString::to_string).collect());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Capability, ProviderType, WorkflowTemplate};

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(id, id, ProviderType::Theory, vec![Capability::HypothesisGeneration], 10.0)
            .depends_on(deps)
    }

    #[test]
    fn test_builtin_templates_are_acyclic() {
        let resolver = DependencyResolver::new();
        for template in WorkflowTemplate::builtin() {
            resolver.validate_dependencies(&template.steps).unwrap();
            assert!(resolver.detect_cycle(&template.steps).is_none());
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let resolver = DependencyResolver::new();
        let err = resolver
            .validate_dependencies(&[step("a", &[]), step("b", &["missing"])])
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Validation(_)));
    }

    #[test]
    fn test_detect_cycle_path() {
        let resolver = DependencyResolver::new();
        let steps = vec![step("a", &["c"]), step("b", &["a"]), step("c", &["b"])];
        let cycle = resolver.detect_cycle(&steps).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let resolver = DependencyResolver::new();
        let err = resolver.validate_dependencies(&[step("a", &["a"])]).unwrap_err();
        assert_eq!(err.to_string(), "Step dependency cycle detected: a -> a");
    }
}
