//! Rule lookup and condition checks.
//!
//! Checks are pure: they take snapshots and readings and return
//! [`Detection`]s. The monitor decides what to do with them.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::domain::models::{
    CycleSnapshot, ResearchProject, ProjectState, RiskLevel, RuleCondition, SafetyConfig, SafetyRule,
    SystemMetric, TaskSnapshot, TaskStatus, ViolationSource, ViolationType, WorkflowState,
};
use crate::domain::ports::SystemMetrics;

/// Source name of violations raised against the host.
pub const SYSTEM_SOURCE: &str = "system_monitor";

/// A condition found by a check, not yet recorded as a violation.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Kind of breach.
    pub violation_type: ViolationType,
    /// Severity.
    pub risk_level: RiskLevel,
    /// What the condition was found on.
    pub source: ViolationSource,
    /// Rule that found it.
    pub rule_id: Option<String>,
    /// Human readable summary.
    pub description: String,
    /// Readings and ids for the violation record.
    pub context: Map<String, Value>,
    /// Emergency trigger tags beyond the ones implied by the type.
    pub extra_tags: Vec<&'static str>,
}

impl Detection {
    /// Detection with no rule, context or extra tags.
    pub fn new(
        violation_type: ViolationType,
        risk_level: RiskLevel,
        source: ViolationSource,
        description: impl Into<String>,
    ) -> Self {
        Self {
            violation_type,
            risk_level,
            source,
            rule_id: None,
            description: description.into(),
            context: Map::new(),
            extra_tags: Vec::new(),
        }
    }

    /// Attribute the detection to a rule.
    #[must_use]
    pub fn with_rule(mut self, rule_id: Option<&str>) -> Self {
        self.rule_id = rule_id.map(ToString::to_string);
        self
    }

    /// Add one context entry.
    #[must_use]
    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Add an emergency trigger tag.
    #[must_use]
    pub fn with_tag(mut self, tag: &'static str) -> Self {
        self.extra_tags.push(tag);
        self
    }

    /// All emergency trigger tags for this detection.
    pub fn trigger_tags(&self) -> Vec<&'static str> {
        let mut tags = self.extra_tags.clone();
        tags.extend_from_slice(self.violation_type.trigger_tags());
        tags
    }
}

/// Threshold resolved from a rule, or from config when no rule carries it.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Rule the limit came from, none when it came from config.
    pub rule_id: Option<String>,
    /// The limit.
    pub max: f64,
}

/// Ordered rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    rules: Vec<SafetyRule>,
}

impl RuleBook {
    /// Rule book in the given order.
    pub fn new(rules: Vec<SafetyRule>) -> Self {
        Self { rules }
    }

    /// All rules, enabled or not.
    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// No rules loaded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn enabled(&self) -> impl Iterator<Item = &SafetyRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    /// The rule whose action applies to a detection: the named rule when it
    /// is enabled, otherwise the first enabled rule of the type's class.
    pub fn applicable(&self, violation_type: ViolationType, rule_id: Option<&str>) -> Option<&SafetyRule> {
        if let Some(rule) = rule_id.and_then(|id| self.enabled().find(|r| r.rule_id == id)) {
            return Some(rule);
        }
        let class = violation_type.rule_class()?;
        self.enabled().find(|r| r.rule_class == class)
    }

    /// Enabled metric rules as `(rule_id, metric, max)`.
    pub fn metric_limits(&self) -> Vec<(&str, SystemMetric, f64)> {
        self.enabled()
            .filter_map(|r| match r.condition {
                RuleCondition::MetricAbove { metric, max } => Some((r.rule_id.as_str(), metric, max)),
                _ => None,
            })
            .collect()
    }

    fn threshold(&self, pick: impl Fn(&RuleCondition) -> Option<f64>, fallback: f64) -> Threshold {
        self.enabled()
            .find_map(|r| {
                pick(&r.condition).map(|max| Threshold {
                    rule_id: Some(r.rule_id.clone()),
                    max,
                })
            })
            .unwrap_or(Threshold {
                rule_id: None,
                max: fallback,
            })
    }

    /// Step duration multiplier limit.
    pub fn step_timeout(&self, config: &SafetyConfig) -> Threshold {
        self.threshold(
            |c| match c {
                RuleCondition::DurationMultiplierAbove { max } => Some(*max),
                _ => None,
            },
            config.step_timeout_multiplier,
        )
    }

    /// Cycle runtime limit in hours.
    pub fn cycle_timeout(&self, config: &SafetyConfig) -> Threshold {
        self.threshold(
            |c| match c {
                RuleCondition::RuntimeHoursAbove { max } => Some(*max),
                _ => None,
            },
            config.cycle_timeout_hours,
        )
    }

    /// Provider response limit in minutes.
    pub fn response_timeout(&self, config: &SafetyConfig) -> Threshold {
        self.threshold(
            |c| match c {
                RuleCondition::ResponseMinutesAbove { max } => Some(*max),
                _ => None,
            },
            config.agent_response_timeout_minutes,
        )
    }

    /// Rule demanding approved safety sign-off, if one is enabled.
    pub fn approval_rule(&self) -> Option<&SafetyRule> {
        self.enabled()
            .find(|r| matches!(r.condition, RuleCondition::ApprovalRequired))
    }
}

#[allow(clippy::cast_precision_loss)]
fn minutes_since(from: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - from).num_milliseconds() as f64 / 60_000.0
}

/// System readings against every enabled metric rule.
pub fn check_metrics(rules: &RuleBook, metrics: &SystemMetrics) -> Vec<Detection> {
    rules
        .metric_limits()
        .into_iter()
        .filter_map(|(rule_id, metric, max)| {
            let reading = metrics.get(metric);
            if reading <= max {
                return None;
            }
            let (risk, tag, label) = match metric {
                SystemMetric::CpuPercent => (
                    if reading > 95.0 { RiskLevel::High } else { RiskLevel::Moderate },
                    "high_cpu_usage",
                    "CPU",
                ),
                SystemMetric::MemoryPercent => (
                    if reading >= 95.0 { RiskLevel::Critical } else { RiskLevel::High },
                    "high_memory_usage",
                    "memory",
                ),
            };
            Some(
                Detection::new(
                    ViolationType::SystemOverload,
                    risk,
                    ViolationSource::System(SYSTEM_SOURCE.to_string()),
                    format!("High {label} usage detected: {reading:.1}%"),
                )
                .with_rule(Some(rule_id))
                .with_context(metric.as_str(), json!(reading))
                .with_context("threshold", json!(max))
                .with_tag(tag),
            )
        })
        .collect()
}

/// Runtime, state, intervention and approval checks on one cycle.
pub fn check_cycle(
    rules: &RuleBook,
    config: &SafetyConfig,
    cycle: &CycleSnapshot,
    now: DateTime<Utc>,
) -> Vec<Detection> {
    let source = ViolationSource::Cycle(cycle.cycle_id);
    let mut found = Vec::new();

    if !cycle.state.is_terminal() {
        if let Some(started) = cycle.started_at {
            let limit = rules.cycle_timeout(config);
            let hours = minutes_since(started, now) / 60.0;
            if hours > limit.max {
                found.push(
                    Detection::new(
                        ViolationType::TimeLimit,
                        RiskLevel::High,
                        source.clone(),
                        format!(
                            "Cycle {} exceeded maximum runtime ({hours:.1} hours)",
                            cycle.cycle_id
                        ),
                    )
                    .with_rule(limit.rule_id.as_deref())
                    .with_context("runtime_hours", json!(hours)),
                );
            }
        }
    }

    if cycle.state == WorkflowState::Failed {
        found.push(
            Detection::new(
                ViolationType::ProtocolViolation,
                RiskLevel::Moderate,
                source.clone(),
                format!("Cycle {} entered failed state", cycle.cycle_id),
            )
            .with_context("state", json!(cycle.state.as_str())),
        );
    }

    if cycle.intervention_required {
        found.push(
            Detection::new(
                ViolationType::AgentMalfunction,
                RiskLevel::High,
                source.clone(),
                format!("Cycle {} requires human intervention", cycle.cycle_id),
            )
            .with_context("intervention_required", json!(true)),
        );
    }

    if let Some(rule) = rules.approval_rule() {
        let mut unapproved: Vec<&String> = cycle
            .step_results
            .iter()
            .filter(|(_, r)| {
                r.get("approval_status")
                    .is_some_and(|v| v.as_str() != Some("approved"))
            })
            .map(|(step, _)| step)
            .collect();
        unapproved.sort();
        if let Some(step_id) = unapproved.first() {
            found.push(
                Detection::new(
                    ViolationType::ProtocolViolation,
                    RiskLevel::High,
                    source,
                    format!("Step {step_id} of cycle {} lacks safety approval", cycle.cycle_id),
                )
                .with_rule(Some(&rule.rule_id))
                .with_context("step_id", json!(step_id)),
            );
        }
    }

    found
}

/// Overrunning executions and unresponsive providers.
pub fn check_task(
    rules: &RuleBook,
    config: &SafetyConfig,
    task: &TaskSnapshot,
    now: DateTime<Utc>,
) -> Option<Detection> {
    match task.status {
        TaskStatus::Executing => {
            let started = task.started_at?;
            let estimate = task.estimated_duration_minutes.filter(|e| *e > 0.0)?;
            let limit = rules.step_timeout(config);
            let elapsed = minutes_since(started, now);
            if elapsed <= estimate * limit.max {
                return None;
            }
            let source = task
                .cycle_id
                .map_or_else(|| ViolationSource::Task(task.task_id.clone()), ViolationSource::Cycle);
            Some(
                Detection::new(
                    ViolationType::TimeLimit,
                    RiskLevel::Moderate,
                    source,
                    format!(
                        "Task {} running {elapsed:.1} min, over {}x its {estimate:.1} min estimate",
                        task.task_id, limit.max
                    ),
                )
                .with_rule(limit.rule_id.as_deref())
                .with_context("task_id", json!(task.task_id))
                .with_context("elapsed_minutes", json!(elapsed)),
            )
        }
        TaskStatus::Assigned => {
            let assigned = task.assigned_at?;
            let limit = rules.response_timeout(config);
            let waited = minutes_since(assigned, now);
            if waited <= limit.max {
                return None;
            }
            Some(
                Detection::new(
                    ViolationType::AgentMalfunction,
                    RiskLevel::Moderate,
                    ViolationSource::Task(task.task_id.clone()),
                    format!(
                        "Provider {} has not started task {} after {waited:.1} min",
                        task.assigned_provider_id.as_deref().unwrap_or("unknown"),
                        task.task_id
                    ),
                )
                .with_rule(limit.rule_id.as_deref())
                .with_context("task_id", json!(task.task_id))
                .with_context("provider_id", json!(task.assigned_provider_id)),
            )
        }
        _ => None,
    }
}

/// Budget and state checks on one project.
pub fn check_project(project: &ResearchProject) -> Vec<Detection> {
    let source = ViolationSource::Project(project.id);
    let mut found = Vec::new();

    if project.is_over_budget() {
        found.push(
            Detection::new(
                ViolationType::ResourceLimit,
                RiskLevel::Moderate,
                source.clone(),
                format!(
                    "Project {} exceeded budget ({} > {})",
                    project.id, project.current_cost_usd, project.max_cost_usd
                ),
            )
            .with_context("budget_exceeded", json!(true)),
        );
    }
    if project.state == ProjectState::Failed {
        found.push(
            Detection::new(
                ViolationType::ProtocolViolation,
                RiskLevel::Moderate,
                source,
                format!("Project {} entered failed state", project.id),
            )
            .with_context("state", json!(project.state.as_str())),
        );
    }
    found
}
