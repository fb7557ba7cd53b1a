//! Domain errors for the autolab orchestration core.

use thiserror::Error;
use uuid::Uuid;

/// Format a cycle path as a human-readable string: `A -> B -> C -> A`.
fn format_cycle_path(path: &[String]) -> String {
    path.join(" -> ")
}

/// Errors surfaced by the scheduler, the workflow engine and the safety monitor.
///
/// The first five variants follow the failure taxonomy of the orchestration
/// core: validation failures are synchronous rejections, scheduling failures are
/// recovered by rollback and requeue, execution failures feed the retry path,
/// dependency failures abort the owning cycle, and timeouts fail a step.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Input rejected before any state changed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Dispatch could not complete; rolled back and requeued.
    #[error("Scheduling failed: {0}")]
    Scheduling(String),

    /// An executor or step failed.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// A step or task ran before its prerequisites.
    #[error("Unmet dependency: {0}")]
    Dependency(String),

    /// A step outlived its deadline.
    #[error("Timed out after {seconds:.1}s: {what}")]
    Timeout {
        /// What timed out.
        what: String,
        /// Deadline that passed.
        seconds: f64,
    },

    /// Unknown task id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Unknown cycle id.
    #[error("Cycle not found: {0}")]
    CycleNotFound(Uuid),

    /// Unknown template id.
    #[error("Workflow template not found: {0}")]
    TemplateNotFound(String),

    /// Unknown project id.
    #[error("Project not found: {0}")]
    ProjectNotFound(Uuid),

    /// Unknown violation id.
    #[error("Violation not found: {0}")]
    ViolationNotFound(Uuid),

    /// Unknown approval handle.
    #[error("Pending emergency not found: {0}")]
    EmergencyNotFound(Uuid),

    /// A concurrency ceiling was reached.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// A lifecycle change the state machine forbids.
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A template's steps depend on each other in a loop. Holds the loop path.
    #[error("Step dependency cycle detected: {}", format_cycle_path(.0))]
    DependencyCycle(Vec<String>),

    /// The provider directory failed.
    #[error("Capability directory error: {0}")]
    Directory(String),

    /// The project store failed.
    #[error("Project store error: {0}")]
    Store(String),
}

/// Result alias used across the orchestration core.
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

impl OrchestrationError {
    /// Whether the scheduler should requeue rather than fail on this error.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Scheduling(_) | Self::CapacityExceeded(_))
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(err.to_string())
    }
}
