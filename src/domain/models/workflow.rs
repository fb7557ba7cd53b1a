//! Workflow templates and automated research cycles.
//!
//! A `WorkflowTemplate` is an ordered list of steps forming a dependency
//! graph. An `AutomatedResearchCycle` is one run of a template against a
//! project; it carries per-step progress, the accumulated step results
//! (the cycle context) and the lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::provider::{Capability, ProviderType};
use super::task::ResultMap;

/// Lifecycle state of a research cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created, not yet started.
    #[default]
    Initialized,
    /// Assigning providers to steps.
    Planning,
    /// Running steps in order.
    Executing,
    /// Scoring success criteria.
    Validating,
    /// Writing results back to the project.
    Completing,
    /// Finished and passed the quality gate.
    Completed,
    /// Aborted or below the quality threshold.
    Failed,
    /// Halted; resumable.
    Paused,
}

impl WorkflowState {
    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Validating => "validating",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// `completed` or `failed`.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> Vec<Self> {
        match self {
            Self::Initialized => vec![Self::Planning, Self::Failed],
            Self::Planning => vec![Self::Executing, Self::Failed],
            Self::Executing => vec![Self::Validating, Self::Paused, Self::Failed],
            Self::Paused => vec![Self::Executing, Self::Failed],
            Self::Validating => vec![Self::Completing, Self::Failed],
            Self::Completing => vec![Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => vec![],
        }
    }

    /// Whether `new_state` is a legal next state.
    pub fn can_transition_to(&self, new_state: Self) -> bool {
        self.valid_transitions().contains(&new_state)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of a template's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the template.
    pub step_id: String,
    /// Display name.
    pub step_name: String,
    /// Kind of provider that may run the step.
    pub required_provider_type: ProviderType,
    /// Capabilities the provider must have.
    pub required_capabilities: Vec<Capability>,
    /// Names looked up in the project context and prior step outputs.
    #[serde(default)]
    pub input_requirements: Vec<String>,
    /// Keys the step is expected to produce.
    #[serde(default)]
    pub output_deliverables: Vec<String>,
    /// Planning estimate.
    pub estimated_duration_minutes: f64,
    /// Step ids that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl WorkflowStep {
    /// Step with no inputs, outputs or dependencies.
    pub fn new(
        step_id: impl Into<String>,
        step_name: impl Into<String>,
        required_provider_type: ProviderType,
        required_capabilities: Vec<Capability>,
        estimated_duration_minutes: f64,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            step_name: step_name.into(),
            required_provider_type,
            required_capabilities,
            input_requirements: Vec::new(),
            output_deliverables: Vec::new(),
            estimated_duration_minutes,
            dependencies: Vec::new(),
        }
    }

    /// Set the input requirements.
    #[must_use]
    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.input_requirements = inputs.iter().map(ToString::to_string).collect();
        self
    }

    /// Set the output deliverables.
    #[must_use]
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.output_deliverables = outputs.iter().map(ToString::to_string).collect();
        self
    }

    /// Set the dependency list.
    #[must_use]
    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(ToString::to_string).collect();
        self
    }
}

/// Reusable research workflow. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Registry key.
    pub template_id: String,
    /// Display name.
    pub template_name: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Research domain, `general` when omitted.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Steps in execution order.
    pub steps: Vec<WorkflowStep>,
    /// Planning estimate for the whole template.
    #[serde(default)]
    pub estimated_total_duration_hours: f64,
    /// Named predicates; the satisfied ratio is the cycle quality score.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Named predicates recorded at validation when they hold.
    #[serde(default)]
    pub failure_conditions: Vec<String>,
}

fn default_domain() -> String {
    "general".to_string()
}

impl WorkflowTemplate {
    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Position of a step in execution order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// End-to-end research from literature review to report.
    pub fn complete_physics_research() -> Self {
        use Capability as C;
        use ProviderType as P;

        Self {
            template_id: "complete_physics_research".to_string(),
            template_name: "Complete Physics Research Cycle".to_string(),
            description: "End-to-end physics research from hypothesis to publication".to_string(),
            domain: default_domain(),
            steps: vec![
                WorkflowStep::new(
                    "literature_review",
                    "Literature Review and Background Research",
                    P::Literature,
                    vec![C::LiteratureSearch, C::KnowledgeSynthesis],
                    45.0,
                )
                .with_inputs(&["research_question", "domain"])
                .with_outputs(&["literature_summary", "knowledge_gaps", "relevant_papers"]),
                WorkflowStep::new(
                    "hypothesis_generation",
                    "Hypothesis Generation and Theoretical Framework",
                    P::Theory,
                    vec![C::HypothesisGeneration, C::MathematicalModeling],
                    60.0,
                )
                .with_inputs(&["literature_summary", "knowledge_gaps"])
                .with_outputs(&["hypothesis", "theoretical_framework", "predictions"])
                .depends_on(&["literature_review"]),
                WorkflowStep::new(
                    "experimental_design",
                    "Experimental Protocol Design",
                    P::Experimental,
                    vec![C::ExperimentalDesign, C::ProtocolDevelopment],
                    90.0,
                )
                .with_inputs(&["hypothesis", "theoretical_framework"])
                .with_outputs(&["experimental_protocol", "equipment_list", "measurement_plan"])
                .depends_on(&["hypothesis_generation"]),
                WorkflowStep::new(
                    "safety_validation",
                    "Safety Protocol Validation",
                    P::Safety,
                    vec![C::SafetyAssessment, C::RiskAnalysis],
                    30.0,
                )
                .with_inputs(&["experimental_protocol", "equipment_list"])
                .with_outputs(&["safety_assessment", "risk_mitigation", "approval_status"])
                .depends_on(&["experimental_design"]),
                WorkflowStep::new(
                    "data_collection",
                    "Experimental Data Collection",
                    P::Experimental,
                    vec![C::DataCollection, C::InstrumentControl],
                    120.0,
                )
                .with_inputs(&["experimental_protocol", "safety_assessment"])
                .with_outputs(&["raw_data", "measurement_log", "experimental_conditions"])
                .depends_on(&["safety_validation"]),
                WorkflowStep::new(
                    "data_analysis",
                    "Statistical Analysis and Pattern Recognition",
                    P::Analysis,
                    vec![C::DataAnalysis, C::StatisticalAnalysis],
                    75.0,
                )
                .with_inputs(&["raw_data", "measurement_log"])
                .with_outputs(&["processed_data", "statistical_results", "visualizations"])
                .depends_on(&["data_collection"]),
                WorkflowStep::new(
                    "result_interpretation",
                    "Result Interpretation and Theory Validation",
                    P::Theory,
                    vec![C::ResultInterpretation, C::TheoryValidation],
                    60.0,
                )
                .with_inputs(&["processed_data", "statistical_results", "hypothesis"])
                .with_outputs(&["interpretation", "hypothesis_validation", "implications"])
                .depends_on(&["data_analysis"]),
                WorkflowStep::new(
                    "peer_review",
                    "Automated Peer Review and Quality Assessment",
                    P::Meta,
                    vec![C::PeerReview, C::QualityAssessment],
                    45.0,
                )
                .with_inputs(&["interpretation", "methodology", "results"])
                .with_outputs(&["review_feedback", "quality_score", "publication_readiness"])
                .depends_on(&["result_interpretation"]),
                WorkflowStep::new(
                    "report_generation",
                    "Research Report and Publication Preparation",
                    P::Meta,
                    vec![C::ReportGeneration, C::ScientificWriting],
                    90.0,
                )
                .with_inputs(&["all_previous_outputs"])
                .with_outputs(&["research_report", "publication_draft", "supplementary_materials"])
                .depends_on(&["peer_review"]),
            ],
            estimated_total_duration_hours: 9.0,
            success_criteria: vec![
                "All steps completed successfully".to_string(),
                "Quality score >= 0.7".to_string(),
                "Peer review approval".to_string(),
                "Safety validation passed".to_string(),
                "Statistical significance achieved".to_string(),
            ],
            failure_conditions: vec![
                "Safety violation detected".to_string(),
                "Quality score < 0.5".to_string(),
                "Critical step failure".to_string(),
                "Resource constraints exceeded".to_string(),
                "Timeout exceeded".to_string(),
            ],
        }
    }

    /// Short hypothesis check used for rapid iteration.
    pub fn quick_validation() -> Self {
        use Capability as C;
        use ProviderType as P;

        Self {
            template_id: "quick_validation".to_string(),
            template_name: "Quick Hypothesis Validation".to_string(),
            description: "Rapid validation cycle for quick hypothesis testing".to_string(),
            domain: default_domain(),
            steps: vec![
                WorkflowStep::new(
                    "hypothesis_check",
                    "Hypothesis Literature Check",
                    P::Literature,
                    vec![C::LiteratureSearch],
                    15.0,
                )
                .with_inputs(&["hypothesis"])
                .with_outputs(&["literature_check", "novelty_assessment"]),
                WorkflowStep::new(
                    "quick_experiment",
                    "Quick Experimental Validation",
                    P::Experimental,
                    vec![C::ExperimentalDesign, C::DataCollection],
                    30.0,
                )
                .with_inputs(&["hypothesis", "literature_check"])
                .with_outputs(&["experimental_results", "validation_status"])
                .depends_on(&["hypothesis_check"]),
                WorkflowStep::new(
                    "quick_analysis",
                    "Rapid Result Analysis",
                    P::Analysis,
                    vec![C::DataAnalysis],
                    15.0,
                )
                .with_inputs(&["experimental_results"])
                .with_outputs(&["analysis_summary", "recommendation"])
                .depends_on(&["quick_experiment"]),
            ],
            estimated_total_duration_hours: 1.0,
            success_criteria: vec![
                "Hypothesis validated or refuted".to_string(),
                "Results statistically significant".to_string(),
                "No safety violations".to_string(),
            ],
            failure_conditions: vec![
                "Safety violation".to_string(),
                "Inconclusive results".to_string(),
                "Agent failure".to_string(),
            ],
        }
    }

    /// Templates registered at startup.
    pub fn builtin() -> Vec<Self> {
        vec![Self::complete_physics_research(), Self::quick_validation()]
    }
}

/// Per-cycle execution record of one template step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    /// Set once the step's task completed.
    pub is_completed: bool,
    /// Provider that actually ran the step.
    pub assigned_provider_id: Option<String>,
    /// Scheduler task running the step.
    pub task_id: Option<String>,
    /// Submission time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Step output.
    pub results: ResultMap,
}

/// One run of a template bound to a project.
#[derive(Debug, Clone)]
pub struct AutomatedResearchCycle {
    /// Cycle id.
    pub cycle_id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Template being run.
    pub template: Arc<WorkflowTemplate>,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// Index of the next step to run.
    pub current_step_index: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When planning began.
    pub started_at: Option<DateTime<Utc>>,
    /// When the cycle reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Completed steps as a percentage of all steps.
    pub progress_percentage: f64,
    /// Planned provider per step id.
    pub assigned_providers: HashMap<String, String>,
    /// Per-step progress, parallel to `template.steps`.
    pub steps: Vec<StepProgress>,
    /// Step id -> step output.
    pub step_results: HashMap<String, ResultMap>,
    /// `safe` until a safety action touches the cycle.
    pub safety_status: String,
    /// Ratio of satisfied success criteria.
    pub quality_score: f64,
    /// Set when the cycle needs an operator.
    pub intervention_required: bool,
    /// Why the cycle failed, if it did.
    pub failure_reason: Option<String>,
    /// Failure conditions that held at validation. Informational only.
    pub observed_failure_conditions: Vec<String>,
    /// Set while a driver task is walking this cycle.
    pub driver_active: bool,
}

impl AutomatedResearchCycle {
    /// Fresh cycle in `initialized`.
    pub fn new(project_id: Uuid, template: Arc<WorkflowTemplate>) -> Self {
        let steps = vec![StepProgress::default(); template.steps.len()];
        Self {
            cycle_id: Uuid::new_v4(),
            project_id,
            template,
            state: WorkflowState::Initialized,
            current_step_index: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress_percentage: 0.0,
            assigned_providers: HashMap::new(),
            steps,
            step_results: HashMap::new(),
            safety_status: "safe".to_string(),
            quality_score: 0.0,
            intervention_required: false,
            failure_reason: None,
            observed_failure_conditions: Vec::new(),
            driver_active: false,
        }
    }

    /// Number of completed steps.
    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_completed).count()
    }

    /// Whether the named step completed.
    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.template
            .step_index(step_id)
            .and_then(|i| self.steps.get(i))
            .is_some_and(|s| s.is_completed)
    }

    /// Move to `new_state` if the lifecycle allows it.
    pub fn transition_to(&mut self, new_state: WorkflowState) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition cycle from {} to {}",
                self.state, new_state
            ));
        }
        self.state = new_state;
        Ok(())
    }

    /// Serializable copy of the current status.
    pub fn snapshot(&self) -> CycleSnapshot {
        CycleSnapshot {
            cycle_id: self.cycle_id,
            project_id: self.project_id,
            template_id: self.template.template_id.clone(),
            template_name: self.template.template_name.clone(),
            state: self.state,
            progress_percentage: self.progress_percentage,
            current_step: self.current_step_index,
            current_step_id: self
                .template
                .steps
                .get(self.current_step_index)
                .map(|s| s.step_id.clone()),
            total_steps: self.template.steps.len(),
            quality_score: self.quality_score,
            safety_status: self.safety_status.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            assigned_providers: self.assigned_providers.clone(),
            step_results: self.step_results.clone(),
            intervention_required: self.intervention_required,
            failure_reason: self.failure_reason.clone(),
            observed_failure_conditions: self.observed_failure_conditions.clone(),
        }
    }
}

/// Serializable status view of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    /// Cycle id.
    pub cycle_id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Template id.
    pub template_id: String,
    /// Template name.
    pub template_name: String,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// Percent of steps completed.
    pub progress_percentage: f64,
    /// Index of the next step.
    pub current_step: usize,
    /// Id of the next step, none once all ran.
    pub current_step_id: Option<String>,
    /// Number of steps in the template.
    pub total_steps: usize,
    /// Satisfied criteria ratio.
    pub quality_score: f64,
    /// Safety status label.
    pub safety_status: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Planned provider per step id.
    pub assigned_providers: HashMap<String, String>,
    /// Step id -> step output.
    pub step_results: HashMap<String, ResultMap>,
    /// Whether an operator is needed.
    pub intervention_required: bool,
    /// Failure reason, if any.
    pub failure_reason: Option<String>,
    /// Failure conditions that held at validation.
    #[serde(default)]
    pub observed_failure_conditions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(WorkflowState::Initialized.can_transition_to(WorkflowState::Planning));
        assert!(WorkflowState::Executing.can_transition_to(WorkflowState::Paused));
        assert!(WorkflowState::Paused.can_transition_to(WorkflowState::Executing));
        assert!(!WorkflowState::Planning.can_transition_to(WorkflowState::Paused));
        assert!(!WorkflowState::Completed.can_transition_to(WorkflowState::Failed));
        assert!(WorkflowState::Failed.is_terminal());
    }

    #[test]
    fn test_builtin_templates_shape() {
        let full = WorkflowTemplate::complete_physics_research();
        assert_eq!(full.steps.len(), 9);
        assert_eq!(full.success_criteria.len(), 5);
        assert_eq!(full.step_index("peer_review"), Some(7));

        let quick = WorkflowTemplate::quick_validation();
        assert_eq!(quick.steps.len(), 3);
        assert_eq!(
            quick.step("quick_analysis").map(|s| s.dependencies.clone()),
            Some(vec!["quick_experiment".to_string()])
        );
    }

    #[test]
    fn test_cycle_transition_rejects_invalid() {
        let mut cycle =
            AutomatedResearchCycle::new(Uuid::new_v4(), Arc::new(WorkflowTemplate::quick_validation()));
        assert_eq!(cycle.steps.len(), 3);
        assert!(cycle.transition_to(WorkflowState::Executing).is_err());
        assert!(cycle.transition_to(WorkflowState::Planning).is_ok());
        assert_eq!(cycle.state, WorkflowState::Planning);
    }

    #[test]
    fn test_snapshot_reports_current_step() {
        let mut cycle =
            AutomatedResearchCycle::new(Uuid::new_v4(), Arc::new(WorkflowTemplate::quick_validation()));
        cycle.current_step_index = 1;
        cycle.steps[0].is_completed = true;
        let snap = cycle.snapshot();
        assert_eq!(snap.current_step_id.as_deref(), Some("quick_experiment"));
        assert_eq!(snap.total_steps, 3);
        assert!(cycle.is_step_completed("hypothesis_check"));
        assert!(!cycle.is_step_completed("quick_analysis"));
    }
}
