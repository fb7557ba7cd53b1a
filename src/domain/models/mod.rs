//! Domain data model.

pub mod config;
pub mod project;
pub mod provider;
pub mod safety;
pub mod task;
pub mod workflow;

pub use config::{
    default_providers, Config, EngineConfig, LoggingConfig, ResourceLimits, SafetyConfig, SchedulerConfig,
};
pub use project::{ProjectState, ResearchProject};
pub use provider::{Capability, ProviderInfo, ProviderStatus, ProviderType};
pub use safety::{
    EmergencyAction, EmergencyProtocol, PendingEmergency, RiskLevel, RuleAction, RuleClass,
    RuleCondition, SafetyEvent, SafetyRule, SafetyStatistics, SafetyStatus, SafetyStatusReport,
    SafetyViolation, SystemMetric, ViolationSource, ViolationType,
};
pub use task::{
    PriorityLevel, ResourceAllocation, ResourceRequirement, ResourceType, ResultMap,
    ScheduledTask, TaskSnapshot, TaskStatus,
};
pub use workflow::{
    AutomatedResearchCycle, CycleSnapshot, StepProgress, WorkflowState, WorkflowStep,
    WorkflowTemplate,
};
