//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines the async trait interfaces external collaborators implement:
//! - CapabilityDirectory: resolves capability requirements to providers
//! - TaskExecutor: runs a task body for one task type
//! - ProjectStore: reads projects and records cycle outcomes
//! - NotificationSink: delivers emergency notifications
//! - SystemMetricsSource: host resource readings
//! - CycleSupervisor / TaskSupervisor: the narrow state-transition surface
//!   the safety monitor uses
pub mod capability_directory;
pub mod metrics_source;
pub mod notification_sink;
pub mod project_store;
pub mod supervision;
pub mod task_executor;

pub use capability_directory::CapabilityDirectory;
pub use metrics_source::{SystemMetrics, SystemMetricsSource};
pub use notification_sink::NotificationSink;
pub use project_store::ProjectStore;
pub use supervision::{CycleSupervisor, TaskSupervisor};
pub use task_executor::{ExecutorError, ExecutorRegistry, TaskExecutor};
