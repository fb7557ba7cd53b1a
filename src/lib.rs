//! Autolab - research cycle orchestration
//!
//! Runs multi-step research workflows as dependency-ordered DAGs of typed
//! steps. Each step is submitted to a resource-aware task scheduler and served
//! by a provider that advertises the required capabilities, while a safety
//! monitor watches cycles, tasks and projects and can pause, stop or trigger
//! emergency protocols when rules are violated.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, port traits and the error enum
//! - **Service Layer** (`services`): scheduler, workflow engine, safety monitor
//! - **Adapters** (`adapters`): in-process implementations of the ports
//! - **Application Layer** (`application`): the runtime wiring it all together
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use autolab::{Config, ResearchProject, ResearchRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (runtime, projects) = ResearchRuntime::in_memory(Config::default())?;
//!     let project_id = projects.insert(ResearchProject::new("Dark matter", "Is it cold?")).await;
//!     runtime.start().await?;
//!     let cycle_id = runtime.start_cycle(project_id, "quick_validation").await?;
//!     let snapshot = runtime.wait_for_cycle(cycle_id, std::time::Duration::from_secs(600)).await?;
//!     println!("{}", snapshot.state);
//!     runtime.stop().await
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{ResearchRuntime, RuntimeDeps, RuntimeState};
pub use domain::errors::{OrchestrationError, OrchestrationResult};
pub use domain::models::{
    Config, CycleSnapshot, ProjectState, ResearchProject, SafetyStatus, ScheduledTask, TaskStatus,
    WorkflowState, WorkflowTemplate,
};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{SafetyMonitor, TaskScheduler, WorkflowEngine};
