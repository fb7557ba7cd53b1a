//! Safety rules, emergency protocols and violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk level of a single violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Negligible.
    Minimal,
    /// Worth logging.
    Low,
    /// Degrades the status to warning.
    Moderate,
    /// Emergency-grade on its own.
    High,
    /// Highest level.
    Critical,
}

impl RiskLevel {
    /// Numeric weight used by risk aggregation.
    pub const fn weight(self) -> f64 {
        match self {
            Self::Minimal => 0.1,
            Self::Low => 0.3,
            Self::Moderate => 0.5,
            Self::High => 0.8,
            Self::Critical => 1.0,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall system safety status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyStatus {
    /// No active violation of note.
    #[default]
    Safe,
    /// Highest active weight at least 0.4.
    Warning,
    /// Highest active weight at least 0.6.
    Critical,
    /// Highest active weight at least 0.8.
    Emergency,
}

impl SafetyStatus {
    /// Status derived from the highest active risk weight.
    pub fn from_max_weight(max_weight: Option<f64>) -> Self {
        match max_weight {
            Some(w) if w >= 0.8 => Self::Emergency,
            Some(w) if w >= 0.6 => Self::Critical,
            Some(w) if w >= 0.4 => Self::Warning,
            _ => Self::Safe,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for SafetyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of a safety rule. Violations are matched to rules by class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleClass {
    /// CPU and memory limits.
    Resource,
    /// Step and cycle durations.
    Time,
    /// Provider responsiveness.
    Agent,
    /// Sign-off and compliance checks.
    Protocol,
}

/// Response a rule prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Log and notify only.
    Warn,
    /// Pause the affected cycle.
    Pause,
    /// Stop the affected cycle.
    Stop,
    /// Run matching emergency protocols.
    Emergency,
}

impl RuleAction {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Emergency => "emergency",
        }
    }
}

/// System metric a resource rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMetric {
    /// Host CPU usage.
    CpuPercent,
    /// Host memory usage.
    MemoryPercent,
}

impl SystemMetric {
    /// Snake case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuPercent => "cpu_percent",
            Self::MemoryPercent => "memory_percent",
        }
    }
}

/// Condition under which a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// A system reading exceeds `max` percent.
    MetricAbove { metric: SystemMetric, max: f64 },
    /// A running task exceeds `max` times its estimated duration.
    DurationMultiplierAbove { max: f64 },
    /// A cycle has been running longer than `max` hours.
    RuntimeHoursAbove { max: f64 },
    /// A task has waited on its provider longer than `max` minutes.
    ResponseMinutesAbove { max: f64 },
    /// Step outputs must carry an approved safety sign-off.
    ApprovalRequired,
}

/// Static rule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    /// Unique rule id.
    pub rule_id: String,
    /// Display name.
    pub rule_name: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Class used to match violations.
    pub rule_class: RuleClass,
    /// When the rule fires.
    pub condition: RuleCondition,
    /// What the monitor does when it fires.
    pub action: RuleAction,
    /// Disabled rules are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

const fn default_true() -> bool {
    true
}

impl SafetyRule {
    fn new(
        rule_id: &str,
        rule_name: &str,
        description: &str,
        rule_class: RuleClass,
        condition: RuleCondition,
        action: RuleAction,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            rule_name: rule_name.to_string(),
            description: description.to_string(),
            rule_class,
            condition,
            action,
            enabled: true,
        }
    }

    /// Built-in rule set.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "cpu_usage_limit",
                "CPU Usage Limit",
                "Warn when CPU usage is high",
                RuleClass::Resource,
                RuleCondition::MetricAbove { metric: SystemMetric::CpuPercent, max: 85.0 },
                RuleAction::Warn,
            ),
            Self::new(
                "memory_usage_limit",
                "Memory Usage Limit",
                "Trigger emergency response at critical memory usage",
                RuleClass::Resource,
                RuleCondition::MetricAbove { metric: SystemMetric::MemoryPercent, max: 90.0 },
                RuleAction::Emergency,
            ),
            Self::new(
                "step_timeout",
                "Workflow Step Timeout",
                "Detect workflow steps that exceed their expected duration",
                RuleClass::Time,
                RuleCondition::DurationMultiplierAbove { max: 3.0 },
                RuleAction::Pause,
            ),
            Self::new(
                "cycle_timeout",
                "Research Cycle Timeout",
                "Detect research cycles that run too long",
                RuleClass::Time,
                RuleCondition::RuntimeHoursAbove { max: 24.0 },
                RuleAction::Stop,
            ),
            Self::new(
                "agent_response_timeout",
                "Agent Response Timeout",
                "Detect unresponsive providers",
                RuleClass::Agent,
                RuleCondition::ResponseMinutesAbove { max: 10.0 },
                RuleAction::Warn,
            ),
            Self::new(
                "safety_protocol_compliance",
                "Safety Protocol Compliance",
                "Ensure all experiments follow safety protocols",
                RuleClass::Protocol,
                RuleCondition::ApprovalRequired,
                RuleAction::Stop,
            ),
        ]
    }
}

/// Mitigation action an emergency protocol can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    /// Pause every monitored cycle that is executing.
    PauseAllNonCriticalCycles,
    /// Logged for operator follow-up.
    NotifyAdministrators,
    /// Logged for operator follow-up.
    InitiateGracefulShutdown,
    /// Record a snapshot of cycles and tasks.
    SaveCurrentState,
    /// Stop the offending task.
    IsolateMalfunctioningAgent,
    /// Pause the cycle the violation came from.
    PauseAffectedWorkflows,
    /// Logged for operator follow-up.
    ReassignCriticalTasks,
    /// Logged for operator follow-up.
    InitiateAgentRecovery,
    /// Stop every active task.
    StopAllDataOperations,
    /// Record a snapshot of cycles and tasks.
    BackupCurrentState,
    /// Logged for operator follow-up.
    IsolateAffectedSystems,
    /// Logged for operator follow-up.
    InitiateForensicAnalysis,
}

impl EmergencyAction {
    /// Snake case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PauseAllNonCriticalCycles => "pause_all_non_critical_cycles",
            Self::NotifyAdministrators => "notify_administrators",
            Self::InitiateGracefulShutdown => "initiate_graceful_shutdown",
            Self::SaveCurrentState => "save_current_state",
            Self::IsolateMalfunctioningAgent => "isolate_malfunctioning_agent",
            Self::PauseAffectedWorkflows => "pause_affected_workflows",
            Self::ReassignCriticalTasks => "reassign_critical_tasks",
            Self::InitiateAgentRecovery => "initiate_agent_recovery",
            Self::StopAllDataOperations => "stop_all_data_operations",
            Self::BackupCurrentState => "backup_current_state",
            Self::IsolateAffectedSystems => "isolate_affected_systems",
            Self::InitiateForensicAnalysis => "initiate_forensic_analysis",
        }
    }
}

/// Named, ordered set of mitigation actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyProtocol {
    /// Unique protocol id.
    pub protocol_id: String,
    /// Display name.
    pub protocol_name: String,
    /// Tags that activate the protocol.
    pub trigger_conditions: Vec<String>,
    /// Actions run in order.
    pub emergency_actions: Vec<EmergencyAction>,
    /// Addresses notified when the protocol runs.
    #[serde(default)]
    pub notification_targets: Vec<String>,
    /// Run without operator approval.
    #[serde(default = "default_true")]
    pub auto_execute: bool,
}

impl EmergencyProtocol {
    /// Whether any tag matches a trigger condition.
    pub fn is_triggered_by(&self, tags: &[&str]) -> bool {
        tags.iter()
            .any(|t| self.trigger_conditions.iter().any(|c| c == t))
    }

    /// Built-in protocols.
    pub fn defaults() -> Vec<Self> {
        use EmergencyAction as A;
        let strings = |v: &[&str]| v.iter().map(ToString::to_string).collect::<Vec<_>>();

        vec![
            Self {
                protocol_id: "system_overload".to_string(),
                protocol_name: "System Overload Emergency Response".to_string(),
                trigger_conditions: strings(&["high_cpu_usage", "high_memory_usage", "resource_exhaustion"]),
                emergency_actions: vec![
                    A::PauseAllNonCriticalCycles,
                    A::NotifyAdministrators,
                    A::InitiateGracefulShutdown,
                    A::SaveCurrentState,
                ],
                notification_targets: strings(&["admin@research-institute.ai", "safety@research-institute.ai"]),
                auto_execute: true,
            },
            Self {
                protocol_id: "agent_malfunction".to_string(),
                protocol_name: "Agent Malfunction Response".to_string(),
                trigger_conditions: strings(&["agent_unresponsive", "agent_error_cascade", "agent_safety_violation"]),
                emergency_actions: vec![
                    A::IsolateMalfunctioningAgent,
                    A::PauseAffectedWorkflows,
                    A::ReassignCriticalTasks,
                    A::InitiateAgentRecovery,
                ],
                notification_targets: strings(&["agent-team@research-institute.ai"]),
                auto_execute: true,
            },
            Self {
                protocol_id: "data_integrity".to_string(),
                protocol_name: "Data Integrity Emergency Response".to_string(),
                trigger_conditions: strings(&["data_corruption_detected", "security_breach", "unauthorized_access"]),
                emergency_actions: vec![
                    A::StopAllDataOperations,
                    A::BackupCurrentState,
                    A::IsolateAffectedSystems,
                    A::InitiateForensicAnalysis,
                ],
                notification_targets: strings(&["security@research-institute.ai", "data-team@research-institute.ai"]),
                auto_execute: false,
            },
        ]
    }
}

/// Kind of safety breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    /// A resource rule threshold was crossed.
    ResourceLimit,
    /// A step or cycle ran too long.
    TimeLimit,
    /// A provider stopped responding or erred.
    AgentMalfunction,
    /// Results failed integrity checks.
    DataCorruption,
    /// A required sign-off was missing.
    ProtocolViolation,
    /// Reported by a step as an ethics breach.
    EthicalViolation,
    /// Unauthorised access.
    SecurityBreach,
    /// Resources exhausted.
    SystemOverload,
}

impl ViolationType {
    /// Snake case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceLimit => "resource_limit",
            Self::TimeLimit => "time_limit",
            Self::AgentMalfunction => "agent_malfunction",
            Self::DataCorruption => "data_corruption",
            Self::ProtocolViolation => "protocol_violation",
            Self::EthicalViolation => "ethical_violation",
            Self::SecurityBreach => "security_breach",
            Self::SystemOverload => "system_overload",
        }
    }

    /// Rule class used to find the applicable rule, if any.
    pub const fn rule_class(self) -> Option<RuleClass> {
        match self {
            Self::ResourceLimit | Self::SystemOverload => Some(RuleClass::Resource),
            Self::TimeLimit => Some(RuleClass::Time),
            Self::AgentMalfunction => Some(RuleClass::Agent),
            Self::ProtocolViolation => Some(RuleClass::Protocol),
            Self::DataCorruption | Self::EthicalViolation | Self::SecurityBreach => None,
        }
    }

    /// Emergency protocol trigger tags for this type.
    pub fn trigger_tags(self) -> &'static [&'static str] {
        match self {
            Self::SystemOverload => &["resource_exhaustion"],
            Self::AgentMalfunction => &["agent_unresponsive", "agent_error_cascade", "agent_safety_violation"],
            Self::DataCorruption => &["data_corruption_detected"],
            Self::SecurityBreach => &["security_breach", "unauthorized_access"],
            _ => &[],
        }
    }

    /// Whether a handled violation of this type is resolved automatically.
    pub const fn is_auto_resolvable(self) -> bool {
        matches!(self, Self::TimeLimit | Self::ResourceLimit)
    }
}

impl std::fmt::Display for ViolationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a violation was detected on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ViolationSource {
    /// A research cycle.
    Cycle(Uuid),
    /// A scheduler task.
    Task(String),
    /// A research project.
    Project(Uuid),
    /// A named host subsystem.
    System(String),
}

impl std::fmt::Display for ViolationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle(id) => write!(f, "cycle_{id}"),
            Self::Task(id) => write!(f, "task_{id}"),
            Self::Project(id) => write!(f, "project_{id}"),
            Self::System(name) => f.write_str(name),
        }
    }
}

/// A detected breach of a safety rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyViolation {
    /// Unique id.
    pub violation_id: Uuid,
    /// Kind of breach.
    pub violation_type: ViolationType,
    /// Severity.
    pub risk_level: RiskLevel,
    /// What the breach was detected on.
    pub source: ViolationSource,
    /// Rule that detected the condition.
    pub rule_id: Option<String>,
    /// Human readable summary.
    pub description: String,
    /// Detection time.
    pub detected_at: DateTime<Utc>,
    /// Readings and ids captured at detection.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Resolved by the monitor rather than an operator.
    pub auto_resolved: bool,
    /// Actions taken, in order.
    pub resolution_actions: Vec<String>,
    /// Set once resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl SafetyViolation {
    /// Not yet resolved.
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Emergency protocol held for operator approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEmergency {
    /// Approval handle.
    pub pending_id: Uuid,
    /// Protocol waiting to run.
    pub protocol_id: String,
    /// Violation that triggered it.
    pub violation_id: Uuid,
    /// When approval was requested.
    pub requested_at: DateTime<Utc>,
}

/// Events published by the safety monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SafetyEvent {
    /// A new violation was recorded.
    ViolationDetected {
        /// The violation.
        violation: SafetyViolation,
    },
    /// Emergency protocols ran for a violation.
    EmergencyTriggered {
        /// Triggering violation.
        violation_id: Uuid,
        /// Protocol ids that ran.
        protocols: Vec<String>,
    },
    /// The system safety status changed.
    StatusChanged {
        /// Status before.
        old_status: SafetyStatus,
        /// Status after.
        new_status: SafetyStatus,
    },
}

/// Monitor counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatistics {
    /// Violations recorded.
    pub violations_detected: u64,
    /// Emergency protocol runs.
    pub emergencies_triggered: u64,
    /// Violations the monitor resolved.
    pub auto_resolutions: u64,
    /// Violations an operator resolved.
    pub manual_resolutions: u64,
    /// Running mean over all resolutions.
    pub mean_time_to_resolution_minutes: f64,
}

/// Result of `get_safety_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatusReport {
    /// Current status.
    pub system_safety_status: SafetyStatus,
    /// Unresolved violations.
    pub active_violations: usize,
    /// Violations ever recorded.
    pub total_violations: usize,
    /// Registered cycles.
    pub monitored_cycles: usize,
    /// Registered projects.
    pub monitored_projects: usize,
    /// Loaded rules.
    pub safety_rules: usize,
    /// Loaded protocols.
    pub emergency_protocols: usize,
    /// Protocols waiting for approval.
    pub pending_emergencies: usize,
    /// Counters.
    pub statistics: SafetyStatistics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_max_weight() {
        assert_eq!(SafetyStatus::from_max_weight(None), SafetyStatus::Safe);
        assert_eq!(SafetyStatus::from_max_weight(Some(RiskLevel::Low.weight())), SafetyStatus::Safe);
        assert_eq!(SafetyStatus::from_max_weight(Some(RiskLevel::Moderate.weight())), SafetyStatus::Warning);
        assert_eq!(SafetyStatus::from_max_weight(Some(0.6)), SafetyStatus::Critical);
        assert_eq!(SafetyStatus::from_max_weight(Some(RiskLevel::High.weight())), SafetyStatus::Emergency);
    }

    #[test]
    fn test_violation_type_classes() {
        assert_eq!(ViolationType::SystemOverload.rule_class(), Some(RuleClass::Resource));
        assert_eq!(ViolationType::SecurityBreach.rule_class(), None);
        assert!(ViolationType::TimeLimit.is_auto_resolvable());
        assert!(!ViolationType::SystemOverload.is_auto_resolvable());
    }

    #[test]
    fn test_default_protocol_triggers() {
        let protocols = EmergencyProtocol::defaults();
        let overload = protocols.iter().find(|p| p.protocol_id == "system_overload").unwrap();
        assert!(overload.is_triggered_by(&["high_memory_usage"]));
        assert!(!overload.is_triggered_by(ViolationType::AgentMalfunction.trigger_tags()));
        let data = protocols.iter().find(|p| p.protocol_id == "data_integrity").unwrap();
        assert!(!data.auto_execute);
    }

    #[test]
    fn test_source_display() {
        let id = Uuid::nil();
        assert_eq!(
            ViolationSource::Cycle(id).to_string(),
            "cycle_00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(ViolationSource::System("system_monitor".into()).to_string(), "system_monitor");
    }

    #[test]
    fn test_rule_condition_yaml_shape() {
        let rule: SafetyRule = serde_yaml::from_str(
            "rule_id: disk\nrule_name: Disk\nrule_class: resource\ncondition:\n  kind: metric_above\n  metric: cpu_percent\n  max: 50\naction: warn\n",
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(
            rule.condition,
            RuleCondition::MetricAbove { metric: SystemMetric::CpuPercent, max: 50.0 }
        );
    }
}
