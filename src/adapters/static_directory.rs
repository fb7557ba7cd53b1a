//! Capability directory over a fixed provider list.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::errors::OrchestrationResult;
use crate::domain::models::{Capability, ProviderInfo, ProviderStatus, ProviderType};
use crate::domain::ports::CapabilityDirectory;

/// In-memory directory. Providers keep their registration order, which is
/// also the preference order handed to the selector.
#[derive(Debug, Clone, Default)]
pub struct StaticCapabilityDirectory {
    providers: Arc<RwLock<Vec<ProviderInfo>>>,
}

impl StaticCapabilityDirectory {
    /// Directory over `providers` in the given order.
    pub fn new(providers: Vec<ProviderInfo>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
        }
    }

    /// Add a provider, replacing any existing entry with the same id.
    pub async fn upsert(&self, provider: ProviderInfo) {
        let mut providers = self.providers.write().await;
        match providers.iter_mut().find(|p| p.id == provider.id) {
            Some(existing) => *existing = provider,
            None => providers.push(provider),
        }
    }

    /// Returns false when the provider is unknown.
    pub async fn set_status(&self, provider_id: &str, status: ProviderStatus) -> bool {
        let mut providers = self.providers.write().await;
        providers
            .iter_mut()
            .find(|p| p.id == provider_id)
            .map(|p| p.status = status)
            .is_some()
    }

    /// All providers in registration order.
    pub async fn providers(&self) -> Vec<ProviderInfo> {
        self.providers.read().await.clone()
    }

    /// Number of providers.
    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    /// No providers registered.
    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }
}

#[async_trait]
impl CapabilityDirectory for StaticCapabilityDirectory {
    async fn find_providers(
        &self,
        required: &[Capability],
        required_type: Option<ProviderType>,
    ) -> OrchestrationResult<Vec<ProviderInfo>> {
        let providers = self.providers.read().await;
        Ok(providers
            .iter()
            .filter(|p| required_type.map_or(true, |t| p.provider_type == t))
            .filter(|p| p.covers(required))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::default_providers;

    #[tokio::test]
    async fn test_filters_by_type_and_capabilities() {
        let directory = StaticCapabilityDirectory::new(default_providers());
        let found = directory
            .find_providers(&[Capability::DataAnalysis], Some(ProviderType::Analysis))
            .await
            .unwrap();
        assert!(!found.is_empty());
        assert!(found.iter().all(|p| p.provider_type == ProviderType::Analysis));

        let none = directory
            .find_providers(&[Capability::ProtocolOptimization], None)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_and_status() {
        let directory = StaticCapabilityDirectory::default();
        assert!(directory.is_empty().await);

        directory
            .upsert(ProviderInfo::new("p1", ProviderType::Theory, vec![Capability::TheoryValidation]))
            .await;
        directory
            .upsert(
                ProviderInfo::new("p1", ProviderType::Theory, vec![Capability::TheoryValidation])
                    .with_reputation(90.0),
            )
            .await;
        assert_eq!(directory.len().await, 1);
        assert!((directory.providers().await[0].reputation - 90.0).abs() < f64::EPSILON);

        assert!(directory.set_status("p1", ProviderStatus::Offline).await);
        assert!(!directory.set_status("ghost", ProviderStatus::Offline).await);
        assert_eq!(directory.providers().await[0].status, ProviderStatus::Offline);
    }
}
