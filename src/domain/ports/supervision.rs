//! Narrow mutation surface the safety monitor holds into the engine and
//! the scheduler. Only state fields change through these traits; step
//! results and task payloads are never touched.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::OrchestrationResult;
use crate::domain::models::{CycleSnapshot, TaskSnapshot};

/// Cycle side of the supervision surface.
#[async_trait]
pub trait CycleSupervisor: Send + Sync {
    /// Every cycle the engine still tracks.
    async fn cycle_snapshots(&self) -> Vec<CycleSnapshot>;

    /// One cycle, if tracked.
    async fn cycle_snapshot(&self, cycle_id: Uuid) -> Option<CycleSnapshot>;

    /// Returns false when the cycle is unknown or cannot be paused.
    async fn pause_cycle(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<bool>;

    /// Moves the cycle to FAILED. Returns false when already terminal.
    async fn stop_cycle(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<bool>;

    /// Mark the cycle's safety status unsafe.
    async fn flag_cycle_unsafe(&self, cycle_id: Uuid) -> OrchestrationResult<()>;
}

/// Task side of the supervision surface.
#[async_trait]
pub trait TaskSupervisor: Send + Sync {
    /// Tasks currently assigned or executing.
    async fn active_task_snapshots(&self) -> Vec<TaskSnapshot>;

    /// Fails the task without retry and releases its allocations.
    async fn stop_task(&self, task_id: &str, reason: &str) -> OrchestrationResult<bool>;
}
