//! Registry of validated workflow templates.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::WorkflowTemplate;
use crate::services::dependency_resolver::DependencyResolver;

/// Templates keyed by id. A registered template is never mutated; callers
/// share it through an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<WorkflowTemplate>>,
    resolver: DependencyResolver,
}

impl TemplateRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in templates.
    pub fn with_builtin() -> OrchestrationResult<Self> {
        let mut registry = Self::new();
        for template in WorkflowTemplate::builtin() {
            registry.register(template)?;
        }
        Ok(registry)
    }

    /// Validate and add a template. Re-registering an id is rejected.
    pub fn register(&mut self, template: WorkflowTemplate) -> OrchestrationResult<Arc<WorkflowTemplate>> {
        if self.templates.contains_key(&template.template_id) {
            return Err(OrchestrationError::Validation(format!(
                "template '{}' is already registered",
                template.template_id
            )));
        }
        self.validate(&template)?;

        let template = Arc::new(template);
        self.templates
            .insert(template.template_id.clone(), Arc::clone(&template));
        Ok(template)
    }

    /// Check ids, step references and dependency cycles without registering.
    pub fn validate(&self, template: &WorkflowTemplate) -> OrchestrationResult<()> {
        if template.template_id.trim().is_empty() {
            return Err(OrchestrationError::Validation("template id is empty".to_string()));
        }
        if template.steps.is_empty() {
            return Err(OrchestrationError::Validation(format!(
                "template '{}' has no steps",
                template.template_id
            )));
        }

        let mut seen = HashSet::new();
        for step in &template.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(OrchestrationError::Validation(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
            if !(step.estimated_duration_minutes > 0.0) {
                return Err(OrchestrationError::Validation(format!(
                    "step '{}' must have a positive duration",
                    step.step_id
                )));
            }
        }

        self.resolver.validate_dependencies(&template.steps)?;
        if let Some(cycle) = self.resolver.detect_cycle(&template.steps) {
            return Err(OrchestrationError::DependencyCycle(cycle));
        }
        Ok(())
    }

    /// Registered template by id.
    pub fn get(&self, template_id: &str) -> OrchestrationResult<Arc<WorkflowTemplate>> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::TemplateNotFound(template_id.to_string()))
    }

    /// All templates in id order.
    pub fn list(&self) -> Vec<Arc<WorkflowTemplate>> {
        self.templates.values().cloned().collect()
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// No templates registered.
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Capability, ProviderType, WorkflowStep};

    fn template(id: &str, steps: Vec<WorkflowStep>) -> WorkflowTemplate {
        WorkflowTemplate {
            template_id: id.to_string(),
            template_name: id.to_string(),
            description: String::new(),
            domain: "general".to_string(),
            steps,
            estimated_total_duration_hours: 1.0,
            success_criteria: vec![],
            failure_conditions: vec![],
        }
    }

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::new(id, id, ProviderType::Analysis, vec![Capability::DataAnalysis], 5.0).depends_on(deps)
    }

    #[test]
    fn test_builtin_registry() {
        let registry = TemplateRegistry::with_builtin().unwrap();
        assert_eq!(registry.len(), 2);
        let ids: Vec<String> = registry.list().iter().map(|t| t.template_id.clone()).collect();
        assert_eq!(ids, vec!["complete_physics_research", "quick_validation"]);
        assert!(matches!(
            registry.get("missing"),
            Err(OrchestrationError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_cyclic_template_rejected() {
        let mut registry = TemplateRegistry::new();
        let err = registry
            .register(template("loop", vec![step("a", &["b"]), step("b", &["a"])]))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::DependencyCycle(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_structural_validation() {
        let mut registry = TemplateRegistry::new();
        assert!(registry.register(template("empty", vec![])).is_err());
        assert!(registry
            .register(template("dup", vec![step("a", &[]), step("a", &[])]))
            .is_err());
        assert!(registry
            .register(template("dangling", vec![step("a", &["ghost"])]))
            .is_err());

        let mut zero = step("a", &[]);
        zero.estimated_duration_minutes = 0.0;
        assert!(registry.register(template("zero", vec![zero])).is_err());

        registry.register(template("ok", vec![step("a", &[])])).unwrap();
        assert!(registry.register(template("ok", vec![step("a", &[])])).is_err());
    }
}
