//! Configuration model.

use serde::{Deserialize, Serialize};

use super::provider::{Capability, ProviderInfo, ProviderType};
use super::safety::{EmergencyProtocol, SafetyRule};
use super::task::{PriorityLevel, ResourceType};

/// Main configuration structure for autolab
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Task scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Workflow engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Safety monitor configuration
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Providers served by the static capability directory
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderInfo>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            safety: SafetyConfig::default(),
            logging: LoggingConfig::default(),
            providers: default_providers(),
        }
    }
}

/// Per-resource-type capacity limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceLimits {
    /// Provider slots
    #[serde(default = "default_agent_limit")]
    pub agent: f64,
    /// Compute units
    #[serde(default = "default_compute_limit")]
    pub compute: f64,
    /// Memory in MB
    #[serde(default = "default_memory_limit")]
    pub memory: f64,
    /// Storage in MB
    #[serde(default = "default_storage_limit")]
    pub storage: f64,
    /// Network bandwidth units
    #[serde(default = "default_network_limit")]
    pub network: f64,
}

const fn default_agent_limit() -> f64 {
    100.0
}

const fn default_compute_limit() -> f64 {
    1000.0
}

const fn default_memory_limit() -> f64 {
    16384.0
}

const fn default_storage_limit() -> f64 {
    102_400.0
}

const fn default_network_limit() -> f64 {
    1000.0
}

impl ResourceLimits {
    /// Limit for one resource type
    pub const fn get(&self, resource_type: ResourceType) -> f64 {
        match resource_type {
            ResourceType::Agent => self.agent,
            ResourceType::Compute => self.compute,
            ResourceType::Memory => self.memory,
            ResourceType::Storage => self.storage,
            ResourceType::Network => self.network,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            agent: default_agent_limit(),
            compute: default_compute_limit(),
            memory: default_memory_limit(),
            storage: default_storage_limit(),
            network: default_network_limit(),
        }
    }
}

/// Task scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Ceiling on simultaneously assigned or executing tasks
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Dispatch loop period in milliseconds
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,

    /// Finished-task eviction period in seconds
    #[serde(default = "default_retention_secs")]
    pub cleanup_interval_secs: u64,

    /// How long finished tasks stay queryable
    #[serde(default = "default_retention_secs")]
    pub finished_task_retention_secs: u64,

    /// Retry budget for tasks that do not set one
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Delay before a failed task is requeued, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub default_retry_delay_ms: u64,

    /// Capacity of the resource ledger
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

const fn default_max_concurrent_tasks() -> usize {
    50
}

const fn default_dispatch_interval_ms() -> u64 {
    10_000
}

const fn default_retention_secs() -> u64 {
    86_400
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    300_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            cleanup_interval_secs: default_retention_secs(),
            finished_task_retention_secs: default_retention_secs(),
            default_max_retries: default_max_retries(),
            default_retry_delay_ms: default_retry_delay_ms(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

/// Workflow engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Ceiling on cycles in a non-terminal state
    #[serde(default = "default_max_concurrent_cycles")]
    pub max_concurrent_cycles: usize,

    /// Minimum satisfied-criteria ratio for a cycle to pass validation (0.0-1.0)
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Step timeout as a multiple of its estimated duration
    #[serde(default = "default_engine_timeout_multiplier")]
    pub step_timeout_multiplier: f64,

    /// How often a running step's task status is polled, in milliseconds
    #[serde(default = "default_step_poll_interval_ms")]
    pub step_poll_interval_ms: u64,

    /// Priority of the tasks a cycle submits
    #[serde(default)]
    pub step_priority: PriorityLevel,

    /// Retry budget of each step task
    #[serde(default = "default_step_max_retries")]
    pub step_max_retries: u32,

    /// Retry delay of each step task, in milliseconds
    #[serde(default = "default_step_retry_delay_ms")]
    pub step_retry_delay_ms: u64,

    /// How long terminal cycles stay queryable
    #[serde(default = "default_retention_secs")]
    pub completed_cycle_retention_secs: u64,
}

const fn default_max_concurrent_cycles() -> usize {
    5
}

const fn default_quality_threshold() -> f64 {
    0.7
}

const fn default_engine_timeout_multiplier() -> f64 {
    2.0
}

const fn default_step_poll_interval_ms() -> u64 {
    1000
}

const fn default_step_max_retries() -> u32 {
    2
}

const fn default_step_retry_delay_ms() -> u64 {
    5000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_cycles: default_max_concurrent_cycles(),
            quality_threshold: default_quality_threshold(),
            step_timeout_multiplier: default_engine_timeout_multiplier(),
            step_poll_interval_ms: default_step_poll_interval_ms(),
            step_priority: PriorityLevel::Medium,
            step_max_retries: default_step_max_retries(),
            step_retry_delay_ms: default_step_retry_delay_ms(),
            completed_cycle_retention_secs: default_retention_secs(),
        }
    }
}

/// Safety monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SafetyConfig {
    /// Period of the violation scan, in milliseconds
    #[serde(default = "default_monitoring_interval_ms")]
    pub monitoring_interval_ms: u64,

    /// Period of the status recomputation, in milliseconds
    #[serde(default = "default_risk_assessment_interval_ms")]
    pub risk_assessment_interval_ms: u64,

    /// Default runtime ceiling for the cycle timeout rule
    #[serde(default = "default_cycle_timeout_hours")]
    pub cycle_timeout_hours: f64,

    /// Default multiplier for the step timeout rule
    #[serde(default = "default_safety_timeout_multiplier")]
    pub step_timeout_multiplier: f64,

    /// Default ceiling for the provider response rule
    #[serde(default = "default_agent_response_timeout_minutes")]
    pub agent_response_timeout_minutes: f64,

    /// How long resolved violations are kept
    #[serde(default = "default_violation_retention_hours")]
    pub violation_retention_hours: u64,

    /// Safety rules, the built-in set when omitted
    #[serde(default = "SafetyRule::defaults")]
    pub rules: Vec<SafetyRule>,

    /// Emergency protocols, the built-in set when omitted
    #[serde(default = "EmergencyProtocol::defaults")]
    pub protocols: Vec<EmergencyProtocol>,
}

const fn default_monitoring_interval_ms() -> u64 {
    5000
}

const fn default_risk_assessment_interval_ms() -> u64 {
    30_000
}

const fn default_cycle_timeout_hours() -> f64 {
    24.0
}

const fn default_safety_timeout_multiplier() -> f64 {
    3.0
}

const fn default_agent_response_timeout_minutes() -> f64 {
    10.0
}

const fn default_violation_retention_hours() -> u64 {
    168
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_ms: default_monitoring_interval_ms(),
            risk_assessment_interval_ms: default_risk_assessment_interval_ms(),
            cycle_timeout_hours: default_cycle_timeout_hours(),
            step_timeout_multiplier: default_safety_timeout_multiplier(),
            agent_response_timeout_minutes: default_agent_response_timeout_minutes(),
            violation_retention_hours: default_violation_retention_hours(),
            rules: SafetyRule::defaults(),
            protocols: EmergencyProtocol::defaults(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}

/// One provider per type, covering every step of the built-in templates.
pub fn default_providers() -> Vec<ProviderInfo> {
    use Capability as C;

    vec![
        ProviderInfo::new(
            "literature-1",
            ProviderType::Literature,
            vec![C::LiteratureSearch, C::KnowledgeSynthesis],
        )
        .with_reputation(80.0),
        ProviderInfo::new(
            "theory-1",
            ProviderType::Theory,
            vec![
                C::HypothesisGeneration,
                C::MathematicalModeling,
                C::ResultInterpretation,
                C::TheoryValidation,
            ],
        )
        .with_reputation(75.0),
        ProviderInfo::new(
            "experimental-1",
            ProviderType::Experimental,
            vec![
                C::ExperimentalDesign,
                C::ProtocolDevelopment,
                C::DataCollection,
                C::InstrumentControl,
            ],
        )
        .with_reputation(70.0),
        ProviderInfo::new(
            "safety-1",
            ProviderType::Safety,
            vec![C::SafetyAssessment, C::RiskAnalysis],
        )
        .with_reputation(90.0),
        ProviderInfo::new(
            "analysis-1",
            ProviderType::Analysis,
            vec![C::DataAnalysis, C::StatisticalAnalysis],
        )
        .with_reputation(85.0),
        ProviderInfo::new(
            "meta-1",
            ProviderType::Meta,
            vec![
                C::PeerReview,
                C::QualityAssessment,
                C::ReportGeneration,
                C::ScientificWriting,
            ],
        )
        .with_reputation(65.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduler.max_concurrent_tasks, 50);
        assert_eq!(config.scheduler.resource_limits.get(ResourceType::Memory), 16384.0);
        assert!((config.engine.quality_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.engine.step_max_retries, 2);
        assert_eq!(config.safety.rules.len(), 6);
        assert_eq!(config.safety.protocols.len(), 3);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("scheduler:\n  max_concurrent_tasks: 4\n").unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.dispatch_interval_ms, 10_000);
        assert_eq!(config.providers.len(), 6);
        assert_eq!(config.logging.level, "info");
    }
}
