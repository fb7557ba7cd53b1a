//! Capability providers ("agents") as seen through the capability directory.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Kind of capability provider a step or task requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Hypothesis generation and modeling.
    Theory,
    /// Experiment design and data collection.
    Experimental,
    /// Statistical analysis.
    Analysis,
    /// Literature search and synthesis.
    Literature,
    /// Safety and risk assessment.
    Safety,
    /// Review, reporting and coordination.
    Meta,
}

impl ProviderType {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Theory => "theory",
            Self::Experimental => "experimental",
            Self::Analysis => "analysis",
            Self::Literature => "literature",
            Self::Safety => "safety",
            Self::Meta => "meta",
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single capability a provider can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Build mathematical models.
    MathematicalModeling,
    /// Propose hypotheses.
    HypothesisGeneration,
    /// Design experiments.
    ExperimentalDesign,
    /// Analyse data sets.
    DataAnalysis,
    /// Collect measurements.
    DataCollection,
    /// Search prior work.
    LiteratureSearch,
    /// Assess protocol safety.
    SafetyAssessment,
    /// Tune experimental protocols.
    ProtocolOptimization,
    /// Interpret results against theory.
    ResultInterpretation,
    /// Review another provider's output.
    PeerReview,
    /// Coordinate with other providers.
    Collaboration,
    /// Summarise a body of knowledge.
    KnowledgeSynthesis,
    /// Write experimental protocols.
    ProtocolDevelopment,
    /// Analyse operational risk.
    RiskAnalysis,
    /// Drive lab instruments.
    InstrumentControl,
    /// Run statistical tests.
    StatisticalAnalysis,
    /// Check results against theory.
    TheoryValidation,
    /// Judge output quality.
    QualityAssessment,
    /// Assemble reports.
    ReportGeneration,
    /// Draft publications.
    ScientificWriting,
}

/// Registration status reported by the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Registered and accepting work.
    #[default]
    Active,
    /// Registered with nothing to do.
    Idle,
    /// At capacity.
    Busy,
    /// Not reachable.
    Offline,
    /// Reported a fault.
    Error,
}

impl ProviderStatus {
    /// Only active or idle providers may receive new work.
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

/// Provider record returned by a capability directory lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Directory id.
    pub id: String,
    /// Provider kind.
    pub provider_type: ProviderType,
    /// Availability.
    #[serde(default)]
    pub status: ProviderStatus,
    /// Load reported by the directory itself (0.0 = idle).
    #[serde(default)]
    pub workload: f64,
    /// Reputation on a 0..100 scale.
    #[serde(default = "default_reputation")]
    pub reputation: f64,
    /// Offered capabilities.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

const fn default_reputation() -> f64 {
    50.0
}

impl ProviderInfo {
    /// Active provider with the default reputation.
    pub fn new(id: impl Into<String>, provider_type: ProviderType, capabilities: Vec<Capability>) -> Self {
        Self {
            id: id.into(),
            provider_type,
            status: ProviderStatus::Active,
            workload: 0.0,
            reputation: default_reputation(),
            capabilities,
        }
    }

    /// Set the reputation (0..100).
    #[must_use]
    pub const fn with_reputation(mut self, reputation: f64) -> Self {
        self.reputation = reputation;
        self
    }

    /// Set the availability.
    #[must_use]
    pub const fn with_status(mut self, status: ProviderStatus) -> Self {
        self.status = status;
        self
    }

    /// True when this provider offers every capability in `required`.
    pub fn covers(&self, required: &[Capability]) -> bool {
        let offered: HashSet<&Capability> = self.capabilities.iter().collect();
        required.iter().all(|c| offered.contains(c))
    }

    /// Number of required capabilities this provider offers.
    pub fn matched_capabilities(&self, required: &[Capability]) -> usize {
        let offered: HashSet<&Capability> = self.capabilities.iter().collect();
        required
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|c| offered.contains(c))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covers_requires_superset() {
        let provider = ProviderInfo::new(
            "lit-1",
            ProviderType::Literature,
            vec![Capability::LiteratureSearch, Capability::KnowledgeSynthesis],
        );

        assert!(provider.covers(&[Capability::LiteratureSearch]));
        assert!(provider.covers(&[]));
        assert!(!provider.covers(&[Capability::LiteratureSearch, Capability::DataAnalysis]));
        assert_eq!(
            provider.matched_capabilities(&[Capability::LiteratureSearch, Capability::DataAnalysis]),
            1
        );
    }

    #[test]
    fn test_provider_type_serde() {
        let json = serde_json::to_string(&ProviderType::Experimental).unwrap();
        assert_eq!(json, "\"experimental\"");
        let status: ProviderStatus = serde_json::from_str("\"idle\"").unwrap();
        assert!(status.is_available());
        assert!(!ProviderStatus::Offline.is_available());
    }
}
