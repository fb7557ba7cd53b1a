//! Provider selection and workload accounting.
//!
//! Lower score wins:
//! `score = workload - reputation / 100 - 0.1 * matched_capabilities`,
//! where workload is the directory-reported load plus the assignments this
//! scheduler currently holds on the provider.

use std::collections::HashMap;

use crate::domain::models::{Capability, ProviderInfo, ProviderType};

const CAPABILITY_MATCH_WEIGHT: f64 = 0.1;

/// Picks providers for tasks and tracks the workload it placed on each.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelector {
    workloads: HashMap<String, f64>,
}

impl ProviderSelector {
    /// Selector with no placed workload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Workload this scheduler has placed on `provider_id`.
    pub fn workload(&self, provider_id: &str) -> f64 {
        self.workloads.get(provider_id).copied().unwrap_or(0.0)
    }

    /// Lower is better: load counts against, reputation and matched capabilities count for.
    pub fn score(&self, provider: &ProviderInfo, required: &[Capability]) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let matched = provider.matched_capabilities(required) as f64;
        provider.workload + self.workload(&provider.id)
            - provider.reputation / 100.0
            - CAPABILITY_MATCH_WEIGHT * matched
    }

    /// Best eligible candidate; ties go to the first one seen.
    pub fn select<'a>(
        &self,
        candidates: &'a [ProviderInfo],
        required: &[Capability],
        required_type: Option<ProviderType>,
    ) -> Option<&'a ProviderInfo> {
        let mut best: Option<(&ProviderInfo, f64)> = None;

        for provider in candidates {
            if !provider.status.is_available() || !provider.covers(required) {
                continue;
            }
            if required_type.is_some_and(|t| t != provider.provider_type) {
                continue;
            }

            let score = self.score(provider, required);
            if best.is_none_or(|(_, s)| score < s) {
                best = Some((provider, score));
            }
        }

        best.map(|(p, _)| p)
    }

    /// Record one more task on `provider_id`.
    pub fn assign(&mut self, provider_id: &str) {
        *self.workloads.entry(provider_id.to_string()).or_insert(0.0) += 1.0;
    }

    /// Record one task leaving `provider_id`.
    pub fn release(&mut self, provider_id: &str) {
        if let Some(load) = self.workloads.get_mut(provider_id) {
            *load = (*load - 1.0).max(0.0);
            if *load == 0.0 {
                self.workloads.remove(provider_id);
            }
        }
    }

    /// Providers currently carrying work from this scheduler.
    pub fn active_providers(&self) -> usize {
        self.workloads.values().filter(|w| **w > 0.0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ProviderStatus;

    fn provider(id: &str, reputation: f64) -> ProviderInfo {
        ProviderInfo::new(id, ProviderType::Analysis, vec![Capability::DataAnalysis]).with_reputation(reputation)
    }

    #[test]
    fn test_prefers_reputation_then_load() {
        let mut selector = ProviderSelector::new();
        let candidates = vec![provider("a", 50.0), provider("b", 90.0)];

        let chosen = selector.select(&candidates, &[Capability::DataAnalysis], None).unwrap();
        assert_eq!(chosen.id, "b");

        selector.assign("b");
        let chosen = selector.select(&candidates, &[Capability::DataAnalysis], None).unwrap();
        assert_eq!(chosen.id, "a");

        selector.release("b");
        assert_eq!(selector.workload("b"), 0.0);
        assert_eq!(selector.active_providers(), 0);
    }

    #[test]
    fn test_filters_unavailable_and_wrong_type() {
        let selector = ProviderSelector::new();
        let candidates = vec![
            provider("offline", 99.0).with_status(ProviderStatus::Offline),
            ProviderInfo::new("theory", ProviderType::Theory, vec![Capability::DataAnalysis]),
            provider("ok", 10.0),
        ];

        let chosen = selector
            .select(&candidates, &[Capability::DataAnalysis], Some(ProviderType::Analysis))
            .unwrap();
        assert_eq!(chosen.id, "ok");
        assert!(selector
            .select(&candidates, &[Capability::PeerReview], None)
            .is_none());
    }

    #[test]
    fn test_ties_keep_first_seen() {
        let selector = ProviderSelector::new();
        let candidates = vec![provider("first", 50.0), provider("second", 50.0)];
        let chosen = selector.select(&candidates, &[Capability::DataAnalysis], None).unwrap();
        assert_eq!(chosen.id, "first");
    }
}
