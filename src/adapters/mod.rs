//! In-process adapters for the domain ports.

pub mod deliverables_executor;
pub mod memory_project_store;
pub mod metrics;
pub mod static_directory;
pub mod tracing_notifier;

pub use deliverables_executor::DeliverablesExecutor;
pub use memory_project_store::InMemoryProjectStore;
pub use metrics::{FixedMetricsSource, SysinfoMetricsSource};
pub use static_directory::StaticCapabilityDirectory;
pub use tracing_notifier::TracingNotificationSink;
