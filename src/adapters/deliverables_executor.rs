//! Deterministic executor for workflow steps.
//!
//! Produces one entry per deliverable the step declares in its payload, with
//! optional fixed values per deliverable name or per step. Stands in for real
//! capability providers in tests and local runs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::domain::models::{ResultMap, ScheduledTask};
use crate::domain::ports::{ExecutorError, TaskExecutor};

/// Executor that answers every step with its declared deliverables.
#[derive(Debug, Clone, Default)]
pub struct DeliverablesExecutor {
    /// Value for a deliverable name in any step.
    deliverable_values: HashMap<String, Value>,
    /// Extra fields keyed by step id.
    step_fields: HashMap<String, ResultMap>,
    /// Steps that always fail.
    failing_steps: HashMap<String, String>,
}

impl DeliverablesExecutor {
    /// Executor with generated values only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Values the built-in research templates' criteria look for.
    pub fn with_research_defaults() -> Self {
        Self::new()
            .with_deliverable_value("approval_status", json!("approved"))
            .with_step_field("peer_review", "approval", json!(true))
            .with_step_field("data_analysis", "statistical_significance", json!(true))
            .with_step_field("quick_analysis", "statistical_significance", json!(true))
    }

    /// Fixed value for a deliverable name.
    #[must_use]
    pub fn with_deliverable_value(mut self, deliverable: impl Into<String>, value: Value) -> Self {
        self.deliverable_values.insert(deliverable.into(), value);
        self
    }

    /// Extra output field for one step.
    #[must_use]
    pub fn with_step_field(mut self, step_id: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        self.step_fields
            .entry(step_id.into())
            .or_default()
            .insert(key.into(), value);
        self
    }

    /// Make a step fail with `message`.
    #[must_use]
    pub fn with_failing_step(mut self, step_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.failing_steps.insert(step_id.into(), message.into());
        self
    }
}

#[async_trait]
impl TaskExecutor for DeliverablesExecutor {
    async fn execute(&self, task: &ScheduledTask) -> Result<ResultMap, ExecutorError> {
        let payload = &task.payload;
        let step_id = payload
            .get("step_id")
            .and_then(Value::as_str)
            .or(task.workflow_step_id.as_deref());

        if let Some(message) = step_id.and_then(|s| self.failing_steps.get(s)) {
            return Err(ExecutorError::Failed(message.clone()));
        }

        let step_name = payload
            .get("step_name")
            .and_then(Value::as_str)
            .unwrap_or(task.task_id.as_str());

        let mut results = ResultMap::new();
        let deliverables = payload
            .get("output_deliverables")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for deliverable in deliverables {
            let value = self
                .deliverable_values
                .get(deliverable)
                .cloned()
                .unwrap_or_else(|| json!(format!("{deliverable} for {step_name}")));
            results.insert(deliverable.to_string(), value);
        }

        if let Some(fields) = step_id.and_then(|s| self.step_fields.get(s)) {
            results.extend(fields.clone());
        }
        if results.is_empty() {
            results.insert("status".to_string(), json!("completed"));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::PriorityLevel;

    fn step_task(step_id: &str, deliverables: &[&str]) -> ScheduledTask {
        let mut task = ScheduledTask::new(format!("c_{step_id}"), "workflow_step", PriorityLevel::Medium);
        task.payload = json!({
            "step_id": step_id,
            "step_name": "Safety Protocol Validation",
            "output_deliverables": deliverables,
        });
        task
    }

    #[tokio::test]
    async fn test_echoes_deliverables_with_overrides() {
        let executor = DeliverablesExecutor::with_research_defaults();
        let out = executor
            .execute(&step_task("safety_validation", &["safety_assessment", "approval_status"]))
            .await
            .unwrap();
        assert_eq!(out["approval_status"], json!("approved"));
        assert_eq!(
            out["safety_assessment"],
            json!("safety_assessment for Safety Protocol Validation")
        );

        let analysis = executor
            .execute(&step_task("data_analysis", &["processed_data"]))
            .await
            .unwrap();
        assert_eq!(analysis["statistical_significance"], json!(true));
    }

    #[tokio::test]
    async fn test_plain_task_and_failure() {
        let executor = DeliverablesExecutor::new().with_failing_step("boom", "instrument offline");
        let plain = ScheduledTask::new("t1", "analysis", PriorityLevel::Low);
        assert_eq!(executor.execute(&plain).await.unwrap()["status"], json!("completed"));

        assert_eq!(
            executor.execute(&step_task("boom", &[])).await,
            Err(ExecutorError::Failed("instrument offline".into()))
        );
    }
}
