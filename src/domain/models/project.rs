//! Research projects that own cycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::ResultMap;

/// Project lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    /// Created, no cycle started yet.
    #[default]
    Initial,
    /// Scoping the investigation.
    Planning,
    /// Designing experiments.
    Designing,
    /// A cycle is running.
    Executing,
    /// Analysing results.
    Analyzing,
    /// Writing up.
    Reporting,
    /// Finished with results attached.
    Completed,
    /// A cycle failed or was stopped.
    Failed,
    /// Halted by an operator or the safety monitor.
    Paused,
}

impl ProjectState {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Planning => "planning",
            Self::Designing => "designing",
            Self::Executing => "executing",
            Self::Analyzing => "analyzing",
            Self::Reporting => "reporting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ProjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a project's state log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectLogEntry {
    /// When the change happened.
    pub at: DateTime<Utc>,
    /// Previous state.
    pub from: ProjectState,
    /// New state.
    pub to: ProjectState,
    /// Reason given for the change.
    pub note: String,
}

/// A research investigation that cycles run on behalf of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchProject {
    /// Project id.
    pub id: Uuid,
    /// Short title.
    pub title: String,
    /// Question the project investigates.
    pub research_question: String,
    /// Working hypothesis, may be empty.
    pub hypothesis: String,
    /// Research domain.
    pub domain: String,
    /// Lifecycle state.
    pub state: ProjectState,
    /// Budget ceiling.
    pub max_cost_usd: f64,
    /// Spend so far; above the ceiling is a safety violation.
    pub current_cost_usd: f64,
    /// Extra context handed to steps as `project_context`.
    #[serde(default)]
    pub metadata: ResultMap,
    /// Results attached by completed cycles.
    #[serde(default)]
    pub results: ResultMap,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
    /// First time the project started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached `completed` or `failed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// State change history.
    #[serde(default)]
    pub logs: Vec<ProjectLogEntry>,
}

impl ResearchProject {
    /// Project in `initial` with a 1000 USD budget.
    pub fn new(title: impl Into<String>, research_question: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            research_question: research_question.into(),
            hypothesis: String::new(),
            domain: "general".to_string(),
            state: ProjectState::Initial,
            max_cost_usd: 1000.0,
            current_cost_usd: 0.0,
            metadata: ResultMap::new(),
            results: ResultMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            logs: Vec::new(),
        }
    }

    /// Set the working hypothesis.
    #[must_use]
    pub fn with_hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.hypothesis = hypothesis.into();
        self
    }

    /// Set the research domain.
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the budget ceiling.
    #[must_use]
    pub const fn with_budget(mut self, max_cost_usd: f64) -> Self {
        self.max_cost_usd = max_cost_usd;
        self
    }

    /// Whether spend exceeds the ceiling.
    pub fn is_over_budget(&self) -> bool {
        self.current_cost_usd > self.max_cost_usd
    }

    /// Change state, stamp timing fields and append a log entry.
    pub fn update_state(&mut self, new_state: ProjectState, note: impl Into<String>) {
        let now = Utc::now();
        let old_state = self.state;
        self.state = new_state;
        self.updated_at = now;

        match new_state {
            ProjectState::Executing if self.started_at.is_none() => self.started_at = Some(now),
            ProjectState::Completed | ProjectState::Failed => self.completed_at = Some(now),
            _ => {}
        }

        self.logs.push(ProjectLogEntry {
            at: now,
            from: old_state,
            to: new_state,
            note: note.into(),
        });
    }
}
