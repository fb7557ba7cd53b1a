//! Project persistence port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::OrchestrationResult;
use crate::domain::models::{ProjectState, ResearchProject, ResultMap};

/// Project persistence as seen by the engine and the safety monitor.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Fetch a project by id.
    async fn get_project(&self, id: Uuid) -> OrchestrationResult<Option<ResearchProject>>;

    /// Change the project state and log `note`.
    async fn update_project_state(
        &self,
        id: Uuid,
        state: ProjectState,
        note: &str,
    ) -> OrchestrationResult<()>;

    /// Merge `results` into the project's result map.
    async fn attach_results(&self, id: Uuid, results: ResultMap) -> OrchestrationResult<()>;
}
