//! Scheduled task domain model.
//!
//! Tasks are the schedulable, retryable, resource-bound units of work the
//! task scheduler manages. Workflow steps become tasks at execution time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::provider::{Capability, ProviderType};

/// Result payload produced by a task executor.
pub type ResultMap = serde_json::Map<String, serde_json::Value>;

/// Task priority. Lower numeric value sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    /// Safety-critical work, dispatched before anything else.
    Critical = 0,
    /// Time-sensitive work.
    High = 1,
    /// Default priority.
    #[default]
    Medium = 2,
    /// Work that can wait.
    Low = 3,
    /// Runs only when nothing else is ready.
    Background = 4,
}

impl PriorityLevel {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Background => "background",
        }
    }

    /// Parse a wire name; `normal` is accepted for `medium`.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" | "normal" => Some(Self::Medium),
            "low" => Some(Self::Low),
            "background" => Some(Self::Background),
            _ => None,
        }
    }

    /// Numeric rank used by the queue ordering.
    pub const fn rank(self) -> u8 {
        self as u8
    }
}

/// Status of a task in the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the priority queue (or waiting out a retry delay)
    #[default]
    Queued,
    /// Resources and a provider have been allocated
    Assigned,
    /// Executor is running the task body
    Executing,
    /// Executor returned a result
    Completed,
    /// Failed permanently (retries exhausted or stopped)
    Failed,
    /// Withdrawn by a caller or the owning cycle
    Cancelled,
    /// Exceeded its allotted time
    Timeout,
}

impl TaskStatus {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Queued => vec![Self::Assigned, Self::Cancelled],
            // Assigned -> Queued is the allocation rollback path
            Self::Assigned => vec![Self::Executing, Self::Queued, Self::Cancelled, Self::Failed],
            Self::Executing => vec![Self::Completed, Self::Failed, Self::Cancelled, Self::Timeout, Self::Queued],
            Self::Failed | Self::Timeout => vec![Self::Queued],
            Self::Completed | Self::Cancelled => vec![],
        }
    }

    /// Whether `new_status` is a valid next status.
    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource kinds tracked by the resource ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Provider slots; one unit per assigned provider.
    Agent,
    /// Compute units.
    Compute,
    /// Memory in megabytes.
    Memory,
    /// Storage in megabytes.
    Storage,
    /// Network bandwidth units.
    Network,
}

impl ResourceType {
    /// Every resource type, in ledger order.
    pub const ALL: [Self; 5] = [
        Self::Agent,
        Self::Compute,
        Self::Memory,
        Self::Storage,
        Self::Network,
    ];

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Compute => "compute",
            Self::Memory => "memory",
            Self::Storage => "storage",
            Self::Network => "network",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared resource need of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Which resource is needed.
    pub resource_type: ResourceType,
    /// Units required for the whole run.
    pub amount: f64,
    /// Free-form unit label for display.
    #[serde(default)]
    pub unit: String,
    /// How long the task may wait for the resource.
    #[serde(default = "default_max_wait_minutes")]
    pub max_wait_time_minutes: u32,
}

const fn default_max_wait_minutes() -> u32 {
    30
}

impl ResourceRequirement {
    /// Requirement with no unit label and the default wait.
    pub fn new(resource_type: ResourceType, amount: f64) -> Self {
        Self {
            resource_type,
            amount,
            unit: String::new(),
            max_wait_time_minutes: default_max_wait_minutes(),
        }
    }
}

/// A live allocation held by a dispatched task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Unique id of this allocation.
    pub allocation_id: Uuid,
    /// Task holding the allocation.
    pub task_id: String,
    /// Allocated resource.
    pub resource_type: ResourceType,
    /// Units held.
    pub allocated_amount: f64,
    /// Handles of the concrete resources (provider ids for `agent`).
    pub allocated_resources: Vec<String>,
    /// When the units were granted.
    pub allocated_at: DateTime<Utc>,
    /// Task deadline, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Task in the scheduling system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Caller-chosen id, unique while the task is tracked.
    pub task_id: String,
    /// Selects the executor.
    pub task_type: String,
    /// Queue priority.
    pub priority: PriorityLevel,
    /// Creation time; breaks priority ties (FIFO).
    pub created_at: DateTime<Utc>,
    /// Earliest start, if deferred.
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Latest completion time.
    pub deadline: Option<DateTime<Utc>>,

    /// Step this task runs, for workflow tasks.
    pub workflow_step_id: Option<String>,
    /// Owning research cycle, for workflow tasks.
    pub cycle_id: Option<Uuid>,
    /// Provider kind the task must run on.
    pub required_provider_type: Option<ProviderType>,
    /// Capabilities the provider must cover.
    #[serde(default)]
    pub capability_requirements: Vec<Capability>,
    /// Resources allocated at dispatch.
    #[serde(default)]
    pub resource_requirements: Vec<ResourceRequirement>,
    /// Task ids that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Expected run time, used by timeout supervision.
    pub estimated_duration_minutes: Option<f64>,

    /// Current pipeline status.
    pub status: TaskStatus,
    /// Provider chosen at dispatch.
    pub assigned_provider_id: Option<String>,
    /// When allocation succeeded.
    pub assigned_at: Option<DateTime<Utc>>,
    /// When the executor was invoked.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Executor input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Executor output.
    #[serde(default)]
    pub results: ResultMap,
    /// Last failure message.
    pub error_message: Option<String>,

    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Retries used so far.
    pub retry_count: u32,
    /// Fixed wait before a retry is re-queued.
    #[serde(with = "duration_ms")]
    pub retry_delay: Duration,
}

impl ScheduledTask {
    /// Queued task with three retries five minutes apart.
    pub fn new(task_id: impl Into<String>, task_type: impl Into<String>, priority: PriorityLevel) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            priority,
            created_at: Utc::now(),
            scheduled_for: None,
            deadline: None,
            workflow_step_id: None,
            cycle_id: None,
            required_provider_type: None,
            capability_requirements: Vec::new(),
            resource_requirements: Vec::new(),
            depends_on: Vec::new(),
            estimated_duration_minutes: None,
            status: TaskStatus::Queued,
            assigned_provider_id: None,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            payload: serde_json::Value::Null,
            results: ResultMap::new(),
            error_message: None,
            max_retries: 3,
            retry_count: 0,
            retry_delay: Duration::from_secs(300),
        }
    }

    /// Require these provider capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capability_requirements = capabilities;
        self
    }

    /// Require this provider type.
    #[must_use]
    pub const fn with_provider_type(mut self, provider_type: ProviderType) -> Self {
        self.required_provider_type = Some(provider_type);
        self
    }

    /// Add a resource requirement.
    #[must_use]
    pub fn with_resource(mut self, resource_type: ResourceType, amount: f64) -> Self {
        self.resource_requirements
            .push(ResourceRequirement::new(resource_type, amount));
        self
    }

    /// Set the tasks that must complete first.
    #[must_use]
    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Set the retry budget and delay.
    #[must_use]
    pub const fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Set the executor input.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Override the creation time.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether the task needs a provider allocation at dispatch.
    pub fn needs_provider(&self) -> bool {
        self.required_provider_type.is_some() || !self.capability_requirements.is_empty()
    }

    /// Whether another execution attempt is allowed after a failure.
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Read-only view for status queries.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            status: self.status,
            priority: self.priority,
            cycle_id: self.cycle_id,
            workflow_step_id: self.workflow_step_id.clone(),
            created_at: self.created_at,
            assigned_at: self.assigned_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            deadline: self.deadline,
            estimated_duration_minutes: self.estimated_duration_minutes,
            assigned_provider_id: self.assigned_provider_id.clone(),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.error_message.clone(),
            results: self.results.clone(),
        }
    }
}

/// Status snapshot of a task, safe to hand out to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub task_id: String,
    /// Executor key.
    pub task_type: String,
    /// Current status.
    pub status: TaskStatus,
    /// Queue priority.
    pub priority: PriorityLevel,
    /// Owning cycle, for workflow tasks.
    pub cycle_id: Option<Uuid>,
    /// Step id, for workflow tasks.
    pub workflow_step_id: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Allocation time.
    pub assigned_at: Option<DateTime<Utc>>,
    /// Executor start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Latest completion time.
    pub deadline: Option<DateTime<Utc>>,
    /// Expected run time.
    pub estimated_duration_minutes: Option<f64>,
    /// Provider chosen at dispatch.
    pub assigned_provider_id: Option<String>,
    /// Retries used so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Last failure message.
    pub error_message: Option<String>,
    /// Executor output.
    pub results: ResultMap,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(PriorityLevel::Critical < PriorityLevel::High);
        assert!(PriorityLevel::Medium < PriorityLevel::Low);
        assert_eq!(PriorityLevel::Background.rank(), 4);
        assert_eq!(PriorityLevel::from_str("NORMAL"), Some(PriorityLevel::Medium));
        assert_eq!(PriorityLevel::from_str("urgent"), None);
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Executing.is_terminal());
    }

    #[test]
    fn test_needs_provider_and_retry() {
        let plain = ScheduledTask::new("t1", "generic", PriorityLevel::Low);
        assert!(!plain.needs_provider());

        let mut typed = ScheduledTask::new("t2", "generic", PriorityLevel::Low)
            .with_provider_type(ProviderType::Analysis)
            .with_retries(1, Duration::from_millis(10));
        assert!(typed.needs_provider());
        assert!(typed.can_retry());
        typed.retry_count = 1;
        assert!(!typed.can_retry());
    }

    #[test]
    fn test_retry_delay_serializes_as_millis() {
        let task = ScheduledTask::new("t3", "generic", PriorityLevel::High)
            .with_retries(2, Duration::from_millis(1500));
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["retry_delay"], 1500);
        let back: ScheduledTask = serde_json::from_value(value).unwrap();
        assert_eq!(back.retry_delay, Duration::from_millis(1500));
    }
}
