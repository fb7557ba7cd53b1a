//! Provider lookup by type and capability.

use async_trait::async_trait;

use crate::domain::errors::OrchestrationResult;
use crate::domain::models::{Capability, ProviderInfo, ProviderType};

/// Resolves capability requirements to candidate providers.
#[async_trait]
pub trait CapabilityDirectory: Send + Sync {
    /// Providers offering every capability in `required`, optionally
    /// restricted to one provider type. Order is the directory's preference.
    async fn find_providers(
        &self,
        required: &[Capability],
        required_type: Option<ProviderType>,
    ) -> OrchestrationResult<Vec<ProviderInfo>>;
}
