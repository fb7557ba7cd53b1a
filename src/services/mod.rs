//! Orchestration services: scheduling, workflow execution and safety monitoring.

pub mod criteria;
pub mod dependency_resolver;
pub mod emergency;
pub mod event_bus;
pub mod provider_selector;
pub mod resource_ledger;
pub mod safety_monitor;
pub mod safety_rules;
pub mod task_queue;
pub mod task_scheduler;
pub mod templates;
pub mod workflow_engine;

pub use criteria::{CriteriaRegistry, CriteriaScore};
pub use dependency_resolver::DependencyResolver;
pub use emergency::{ActionContext, ActionHandler, EmergencyHandlers};
pub use event_bus::{Envelope, EventBus, EventBusConfig, EventId, SequenceNumber};
pub use provider_selector::ProviderSelector;
pub use resource_ledger::ResourceLedger;
pub use safety_monitor::{MonitorPorts, SafetyMonitor};
pub use safety_rules::{Detection, RuleBook};
pub use task_queue::TaskQueue;
pub use task_scheduler::{SchedulerStatus, TaskScheduler};
pub use templates::TemplateRegistry;
pub use workflow_engine::{CycleEvent, WorkflowEngine};
