//! In-memory project store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::{ProjectState, ResearchProject, ResultMap};
use crate::domain::ports::ProjectStore;

/// Project store held in memory. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProjectStore {
    projects: Arc<RwLock<HashMap<Uuid, ResearchProject>>>,
}

impl InMemoryProjectStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a project, replacing any with the same id.
    pub async fn insert(&self, project: ResearchProject) -> Uuid {
        let id = project.id;
        self.projects.write().await.insert(id, project);
        id
    }

    /// All projects, oldest first.
    pub async fn list(&self) -> Vec<ResearchProject> {
        let mut projects: Vec<ResearchProject> = self.projects.read().await.values().cloned().collect();
        projects.sort_by_key(|p| p.created_at);
        projects
    }

    /// Add to a project's running cost.
    pub async fn record_cost(&self, id: Uuid, cost_usd: f64) -> OrchestrationResult<f64> {
        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or(OrchestrationError::ProjectNotFound(id))?;
        project.current_cost_usd += cost_usd;
        Ok(project.current_cost_usd)
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn get_project(&self, id: Uuid) -> OrchestrationResult<Option<ResearchProject>> {
        Ok(self.projects.read().await.get(&id).cloned())
    }

    async fn update_project_state(&self, id: Uuid, state: ProjectState, note: &str) -> OrchestrationResult<()> {
        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or(OrchestrationError::ProjectNotFound(id))?;
        project.update_state(state, note);
        Ok(())
    }

    async fn attach_results(&self, id: Uuid, results: ResultMap) -> OrchestrationResult<()> {
        let mut projects = self.projects.write().await;
        let project = projects.get_mut(&id).ok_or(OrchestrationError::ProjectNotFound(id))?;
        project.results.extend(results);
        project.updated_at = chrono::Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_state_updates_and_results() {
        let store = InMemoryProjectStore::new();
        let id = store.insert(ResearchProject::new("Optics", "q")).await;

        store
            .update_project_state(id, ProjectState::Executing, "cycle started")
            .await
            .unwrap();
        let mut results = ResultMap::new();
        results.insert("quality_score".into(), json!(0.9));
        store.attach_results(id, results).await.unwrap();

        let project = store.get_project(id).await.unwrap().unwrap();
        assert_eq!(project.state, ProjectState::Executing);
        assert_eq!(project.results["quality_score"], json!(0.9));
        assert_eq!(project.logs.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_project() {
        let store = InMemoryProjectStore::new();
        let ghost = Uuid::new_v4();
        assert!(store.get_project(ghost).await.unwrap().is_none());
        assert!(matches!(
            store.update_project_state(ghost, ProjectState::Failed, "").await,
            Err(OrchestrationError::ProjectNotFound(_))
        ));
        assert!(store.record_cost(ghost, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_record_cost_accumulates() {
        let store = InMemoryProjectStore::new();
        let id = store.insert(ResearchProject::new("t", "q").with_budget(5.0)).await;
        store.record_cost(id, 3.0).await.unwrap();
        assert!((store.record_cost(id, 3.0).await.unwrap() - 6.0).abs() < f64::EPSILON);
        assert!(store.get_project(id).await.unwrap().unwrap().is_over_budget());
    }
}
