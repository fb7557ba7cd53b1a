//! Named success criteria and failure conditions.
//!
//! Templates refer to predicates by name; the registry maps each name to a
//! check over the cycle's accumulated state. Unknown names evaluate to
//! false.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::models::AutomatedResearchCycle;

/// Named check over a cycle.
pub type Predicate = Arc<dyn Fn(&AutomatedResearchCycle) -> bool + Send + Sync>;

/// Outcome of scoring a list of criteria.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CriteriaScore {
    /// Criteria that held.
    pub satisfied: usize,
    /// Criteria scored.
    pub total: usize,
}

impl CriteriaScore {
    /// `satisfied / total`, or 0.0 when there are no criteria.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.satisfied as f64 / self.total as f64;
        ratio
    }
}

/// Predicates keyed by criterion name. Unknown names never hold.
#[derive(Clone)]
pub struct CriteriaRegistry {
    predicates: HashMap<String, Predicate>,
}

impl std::fmt::Debug for CriteriaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("CriteriaRegistry").field("names", &names).finish()
    }
}

fn step_field<'a>(cycle: &'a AutomatedResearchCycle, step_id: &str, field: &str) -> Option<&'a Value> {
    cycle.step_results.get(step_id).and_then(|r| r.get(field))
}

fn step_flag(cycle: &AutomatedResearchCycle, step_id: &str, field: &str) -> bool {
    step_field(cycle, step_id, field).and_then(Value::as_bool).unwrap_or(false)
}

fn any_result_has(cycle: &AutomatedResearchCycle, field: &str) -> bool {
    cycle.step_results.values().any(|r| r.contains_key(field))
}

fn any_result_says(cycle: &AutomatedResearchCycle, fields: &[&str], value: &str) -> bool {
    cycle.step_results.values().any(|r| {
        fields
            .iter()
            .any(|f| r.get(*f).and_then(Value::as_str) == Some(value))
    })
}

impl Default for CriteriaRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();

        // success criteria
        registry.register("All steps completed successfully", |c| {
            c.steps.iter().all(|s| s.is_completed)
        });
        registry.register("Quality score >= 0.7", |c| c.quality_score >= 0.7);
        registry.register("Peer review approval", |c| step_flag(c, "peer_review", "approval"));
        registry.register("Safety validation passed", |c| {
            step_field(c, "safety_validation", "approval_status").and_then(Value::as_str) == Some("approved")
        });
        registry.register("Statistical significance achieved", |c| {
            step_flag(c, "data_analysis", "statistical_significance")
        });
        registry.register("Hypothesis validated or refuted", |c| {
            any_result_has(c, "hypothesis_validation") || any_result_has(c, "validation_status")
        });
        registry.register("Results statistically significant", |c| {
            step_flag(c, "quick_analysis", "statistical_significance")
        });
        registry.register("No safety violations", |c| c.safety_status == "safe");

        // failure conditions
        let unsafe_cycle = |c: &AutomatedResearchCycle| c.safety_status != "safe";
        registry.register("Safety violation detected", unsafe_cycle);
        registry.register("Safety violation", unsafe_cycle);
        registry.register("Quality score < 0.5", |c| c.quality_score < 0.5);
        let step_missing = |c: &AutomatedResearchCycle| c.steps.iter().any(|s| !s.is_completed);
        registry.register("Critical step failure", step_missing);
        registry.register("Agent failure", step_missing);
        registry.register("Resource constraints exceeded", |c| {
            c.step_results
                .values()
                .any(|r| r.get("resource_constraints_exceeded").and_then(Value::as_bool) == Some(true))
        });
        registry.register("Timeout exceeded", |c| {
            let budget_secs = c.template.estimated_total_duration_hours * 2.0 * 3600.0;
            #[allow(clippy::cast_precision_loss)]
            let elapsed = c
                .started_at
                .map_or(0.0, |s| (Utc::now() - s).num_seconds() as f64);
            budget_secs > 0.0 && elapsed > budget_secs
        });
        registry.register("Inconclusive results", |c| {
            any_result_says(c, &["validation_status", "recommendation"], "inconclusive")
        });

        registry
    }
}

impl CriteriaRegistry {
    /// Registry with no predicates.
    pub fn empty() -> Self {
        Self {
            predicates: HashMap::new(),
        }
    }

    /// Add or replace a predicate.
    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&AutomatedResearchCycle) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    /// Whether a predicate is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    /// Run one predicate; false when unknown.
    pub fn evaluate(&self, name: &str, cycle: &AutomatedResearchCycle) -> bool {
        self.predicates.get(name).is_some_and(|p| p(cycle))
    }

    /// Count how many of `criteria` hold.
    pub fn score(&self, criteria: &[String], cycle: &AutomatedResearchCycle) -> CriteriaScore {
        CriteriaScore {
            satisfied: criteria.iter().filter(|c| self.evaluate(c, cycle)).count(),
            total: criteria.len(),
        }
    }

    /// Names of the conditions that currently hold.
    pub fn holding(&self, conditions: &[String], cycle: &AutomatedResearchCycle) -> Vec<String> {
        conditions
            .iter()
            .filter(|c| self.evaluate(c, cycle))
            .cloned()
            .collect()
    }
}
