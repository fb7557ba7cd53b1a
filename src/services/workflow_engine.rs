//! Research cycle state machine.
//!
//! The `WorkflowEngine` owns every `AutomatedResearchCycle`. Starting a
//! cycle spawns a driver that plans provider assignment, walks the
//! template's steps in list order (each step becomes a scheduler task),
//! validates the accumulated results against the template's criteria and
//! reports the outcome to the project store.
//!
//! The driver never holds the cycle lock across an await. Pause and stop
//! requests are cooperative: the driver observes them on its next poll.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::{
    AutomatedResearchCycle, CycleSnapshot, EngineConfig, ProjectState, ResearchProject, ResultMap,
    TaskStatus, WorkflowState, WorkflowStep, WorkflowTemplate,
};
use crate::domain::ports::{CapabilityDirectory, CycleSupervisor, ProjectStore};
use crate::services::criteria::CriteriaRegistry;
use crate::services::event_bus::{Envelope, EventBus};
use crate::services::provider_selector::ProviderSelector;
use crate::services::task_scheduler::TaskScheduler;
use crate::services::templates::TemplateRegistry;

/// Lifecycle notifications published by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CycleEvent {
    /// Planning began.
    CycleStarted {
        /// Cycle.
        cycle_id: Uuid,
        /// Owning project.
        project_id: Uuid,
        /// Template being run.
        template_id: String,
    },
    /// A step finished and its output was recorded.
    StepCompleted {
        /// Cycle.
        cycle_id: Uuid,
        /// Step that finished.
        step_id: String,
        /// Provider that ran it.
        provider_id: Option<String>,
        /// Progress after the step.
        progress_percentage: f64,
    },
    /// The cycle passed validation.
    CycleCompleted {
        /// Cycle.
        cycle_id: Uuid,
        /// Final quality score.
        quality_score: f64,
    },
    /// The cycle failed.
    CycleFailed {
        /// Cycle.
        cycle_id: Uuid,
        /// Failure reason.
        reason: String,
    },
    /// The cycle was paused.
    CyclePaused {
        /// Cycle.
        cycle_id: Uuid,
        /// Why.
        reason: String,
    },
    /// A paused cycle resumed.
    CycleResumed {
        /// Cycle.
        cycle_id: Uuid,
    },
    /// An operator was asked to look at the cycle.
    InterventionRequired {
        /// Cycle.
        cycle_id: Uuid,
        /// Why.
        reason: String,
    },
}

impl CycleEvent {
    /// Cycle the event is about.
    pub const fn cycle_id(&self) -> Uuid {
        match self {
            Self::CycleStarted { cycle_id, .. }
            | Self::StepCompleted { cycle_id, .. }
            | Self::CycleCompleted { cycle_id, .. }
            | Self::CycleFailed { cycle_id, .. }
            | Self::CyclePaused { cycle_id, .. }
            | Self::CycleResumed { cycle_id }
            | Self::InterventionRequired { cycle_id, .. } => *cycle_id,
        }
    }
}

/// How a driver left a step.
enum StepOutcome {
    Completed {
        results: ResultMap,
        provider_id: Option<String>,
    },
    Failed(String),
    /// The cycle was paused; the driver exits and resume picks up here.
    Paused,
    /// The cycle was stopped from outside.
    Aborted,
}

struct EngineInner {
    config: EngineConfig,
    scheduler: TaskScheduler,
    directory: Arc<dyn CapabilityDirectory>,
    projects: Arc<dyn ProjectStore>,
    templates: RwLock<TemplateRegistry>,
    criteria: CriteriaRegistry,
    cycles: Mutex<HashMap<Uuid, AutomatedResearchCycle>>,
    events: EventBus<CycleEvent>,
}

/// Drives research cycles through
/// `initialized -> planning -> executing -> validating -> completing -> completed`.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Engine with the built-in templates registered.
    pub fn new(
        config: EngineConfig,
        scheduler: TaskScheduler,
        directory: Arc<dyn CapabilityDirectory>,
        projects: Arc<dyn ProjectStore>,
        criteria: CriteriaRegistry,
    ) -> OrchestrationResult<Self> {
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                scheduler,
                directory,
                projects,
                templates: RwLock::new(TemplateRegistry::with_builtin()?),
                criteria,
                cycles: Mutex::new(HashMap::new()),
                events: EventBus::default(),
            }),
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Scheduler step tasks are submitted to.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.inner.scheduler
    }

    /// New receiver for cycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<CycleEvent>> {
        self.inner.events.subscribe()
    }

    /// Event bus cycle events are published on.
    pub fn events(&self) -> &EventBus<CycleEvent> {
        &self.inner.events
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Validate and register a template.
    pub async fn register_template(&self, template: WorkflowTemplate) -> OrchestrationResult<Arc<WorkflowTemplate>> {
        let template = self.inner.templates.write().await.register(template)?;
        info!(template_id = %template.template_id, steps = template.steps.len(), "Template registered");
        Ok(template)
    }

    /// Registered templates.
    pub async fn list_templates(&self) -> Vec<Arc<WorkflowTemplate>> {
        self.inner.templates.read().await.list()
    }

    /// One registered template.
    pub async fn get_template(&self, template_id: &str) -> OrchestrationResult<Arc<WorkflowTemplate>> {
        self.inner.templates.read().await.get(template_id)
    }

    // ------------------------------------------------------------------
    // Cycle control
    // ------------------------------------------------------------------

    /// Create a cycle for `project_id` and spawn its driver.
    #[instrument(skip(self), err)]
    pub async fn start_cycle(&self, project_id: Uuid, template_id: &str) -> OrchestrationResult<Uuid> {
        let template = self.get_template(template_id).await?;
        let project = self
            .inner
            .projects
            .get_project(project_id)
            .await?
            .ok_or(OrchestrationError::ProjectNotFound(project_id))?;

        let cycle_id = {
            let mut cycles = self.inner.cycles.lock().await;
            let running = cycles.values().filter(|c| !c.state.is_terminal()).count();
            if running >= self.inner.config.max_concurrent_cycles {
                return Err(OrchestrationError::CapacityExceeded(format!(
                    "{running} cycles already running (max {})",
                    self.inner.config.max_concurrent_cycles
                )));
            }

            let mut cycle = AutomatedResearchCycle::new(project.id, template);
            cycle.driver_active = true;
            let id = cycle.cycle_id;
            cycles.insert(id, cycle);
            id
        };

        self.update_project(
            project_id,
            ProjectState::Executing,
            &format!("Automated cycle {cycle_id} started"),
        )
        .await;
        self.inner.events.publish(CycleEvent::CycleStarted {
            cycle_id,
            project_id,
            template_id: template_id.to_string(),
        });
        info!(cycle_id = %cycle_id, "Research cycle started");

        tokio::spawn(self.clone().drive(cycle_id));
        Ok(cycle_id)
    }

    /// Snapshot of a tracked cycle.
    pub async fn get_cycle_status(&self, cycle_id: Uuid) -> Option<CycleSnapshot> {
        self.inner
            .cycles
            .lock()
            .await
            .get(&cycle_id)
            .map(AutomatedResearchCycle::snapshot)
    }

    /// Snapshots of every cycle that has not reached a terminal state.
    pub async fn list_active_cycles(&self) -> Vec<CycleSnapshot> {
        let cycles = self.inner.cycles.lock().await;
        let mut active: Vec<CycleSnapshot> = cycles
            .values()
            .filter(|c| !c.state.is_terminal())
            .map(AutomatedResearchCycle::snapshot)
            .collect();
        active.sort_by_key(|c| c.created_at);
        active
    }

    /// Pause an executing cycle. Returns false if the cycle is not executing.
    #[instrument(skip(self), err)]
    pub async fn pause_cycle(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<bool> {
        let paused = self
            .with_cycle(cycle_id, |c| c.transition_to(WorkflowState::Paused).is_ok())
            .await?;
        if paused {
            info!(reason, "Research cycle paused");
            self.inner.events.publish(CycleEvent::CyclePaused {
                cycle_id,
                reason: reason.to_string(),
            });
        }
        Ok(paused)
    }

    /// Resume a paused cycle at its current step index.
    #[instrument(skip(self), err)]
    pub async fn resume_cycle(&self, cycle_id: Uuid) -> OrchestrationResult<bool> {
        let respawn = {
            let mut cycles = self.inner.cycles.lock().await;
            let cycle = cycles
                .get_mut(&cycle_id)
                .ok_or(OrchestrationError::CycleNotFound(cycle_id))?;
            if cycle.transition_to(WorkflowState::Executing).is_err() {
                return Ok(false);
            }
            // a driver that has not yet noticed the pause keeps going
            let respawn = !cycle.driver_active;
            cycle.driver_active = true;
            respawn
        };

        info!(respawn, "Research cycle resumed");
        self.inner.events.publish(CycleEvent::CycleResumed { cycle_id });
        if respawn {
            tokio::spawn(self.clone().drive(cycle_id));
        }
        Ok(true)
    }

    /// Force a non-terminal cycle to `failed`.
    #[instrument(skip(self), err)]
    pub async fn stop_cycle(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<bool> {
        if !self.inner.cycles.lock().await.contains_key(&cycle_id) {
            return Err(OrchestrationError::CycleNotFound(cycle_id));
        }
        Ok(self.fail_cycle(cycle_id, reason).await)
    }

    /// Flag the cycle for an operator and publish an event.
    pub async fn request_intervention(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<()> {
        self.with_cycle(cycle_id, |c| c.intervention_required = true)
            .await?;
        warn!(cycle_id = %cycle_id, reason, "Human intervention requested");
        self.inner.events.publish(CycleEvent::InterventionRequired {
            cycle_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Evict terminal cycles older than the retention window.
    pub async fn cleanup_completed_cycles(&self) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        let retention = chrono::Duration::seconds(self.inner.config.completed_cycle_retention_secs as i64);
        let cutoff = Utc::now() - retention;

        let mut cycles = self.inner.cycles.lock().await;
        let before = cycles.len();
        cycles.retain(|_, c| !(c.state.is_terminal() && c.completed_at.is_some_and(|t| t < cutoff)));
        let evicted = before - cycles.len();
        if evicted > 0 {
            info!(count = evicted, "Cleaned up finished cycles");
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    async fn drive(self, cycle_id: Uuid) {
        loop {
            if let Err(e) = self.run_cycle(cycle_id).await {
                error!(cycle_id = %cycle_id, error = %e, "Research cycle driver error");
                self.fail_cycle(cycle_id, &format!("Unexpected error: {e}")).await;
            }

            // a resume that raced with this driver noticing the pause
            // finds driver_active still set and relies on us to go on
            let rerun = self
                .with_cycle(cycle_id, |c| {
                    let rerun = c.state == WorkflowState::Executing;
                    if !rerun {
                        c.driver_active = false;
                    }
                    rerun
                })
                .await
                .unwrap_or(false);
            if !rerun {
                break;
            }
        }
    }

    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    async fn run_cycle(&self, cycle_id: Uuid) -> OrchestrationResult<()> {
        let state = self.with_cycle(cycle_id, |c| c.state).await?;

        if state == WorkflowState::Initialized {
            if !self.transition(cycle_id, WorkflowState::Planning).await? {
                return Ok(());
            }
            self.with_cycle(cycle_id, |c| c.started_at = Some(Utc::now()))
                .await?;

            if let Err(e) = self.plan(cycle_id).await {
                self.fail_cycle(cycle_id, &format!("Planning phase failed: {e}")).await;
                return Ok(());
            }
            if !self.transition(cycle_id, WorkflowState::Executing).await? {
                return Ok(());
            }
        }

        match self.execute_steps(cycle_id).await? {
            StepOutcome::Completed { .. } => {}
            StepOutcome::Paused | StepOutcome::Aborted => return Ok(()),
            StepOutcome::Failed(reason) => {
                self.fail_cycle(cycle_id, &format!("Execution phase failed: {reason}")).await;
                return Ok(());
            }
        }

        if !self.transition(cycle_id, WorkflowState::Validating).await? {
            return Ok(());
        }
        if let Err(reason) = self.validate(cycle_id).await? {
            self.fail_cycle(cycle_id, &format!("Validation phase failed: {reason}")).await;
            return Ok(());
        }

        if !self.transition(cycle_id, WorkflowState::Completing).await? {
            return Ok(());
        }
        self.complete_cycle(cycle_id).await
    }

    /// Resolve a provider for every step; any unresolvable step fails the plan.
    async fn plan(&self, cycle_id: Uuid) -> OrchestrationResult<()> {
        let template = self.with_cycle(cycle_id, |c| Arc::clone(&c.template)).await?;
        let selector = ProviderSelector::new();
        let mut plan = HashMap::new();

        for step in &template.steps {
            let candidates = self
                .inner
                .directory
                .find_providers(&step.required_capabilities, Some(step.required_provider_type))
                .await?;
            let chosen = selector
                .select(
                    &candidates,
                    &step.required_capabilities,
                    Some(step.required_provider_type),
                )
                .ok_or_else(|| {
                    OrchestrationError::Scheduling(format!("no available provider for step {}", step.step_id))
                })?;
            debug!(step_id = %step.step_id, provider_id = %chosen.id, "Provider planned");
            plan.insert(step.step_id.clone(), chosen.id.clone());
        }

        self.with_cycle(cycle_id, |c| c.assigned_providers = plan).await
    }

    /// Walk the steps from the current index in template order.
    async fn execute_steps(&self, cycle_id: Uuid) -> OrchestrationResult<StepOutcome> {
        let (template, start) = self
            .with_cycle(cycle_id, |c| (Arc::clone(&c.template), c.current_step_index))
            .await?;

        for (index, step) in template.steps.iter().enumerate().skip(start) {
            match self.with_cycle(cycle_id, |c| c.state).await? {
                WorkflowState::Executing => {}
                WorkflowState::Paused => return Ok(StepOutcome::Paused),
                _ => return Ok(StepOutcome::Aborted),
            }

            let unmet: Vec<String> = self
                .with_cycle(cycle_id, |c| {
                    step.dependencies
                        .iter()
                        .filter(|d| !c.is_step_completed(d))
                        .cloned()
                        .collect()
                })
                .await?;
            if !unmet.is_empty() {
                let err = OrchestrationError::Dependency(format!(
                    "step {} requires {}",
                    step.step_id,
                    unmet.join(", ")
                ));
                return Ok(StepOutcome::Failed(err.to_string()));
            }

            match self.execute_step(cycle_id, index, step).await? {
                StepOutcome::Completed { results, provider_id } => {
                    self.record_step(cycle_id, index, step, results, provider_id)
                        .await?;
                }
                other => return Ok(other),
            }
        }

        Ok(StepOutcome::Completed {
            results: ResultMap::new(),
            provider_id: None,
        })
    }

    /// Submit one step (or rejoin its existing task) and wait for it.
    async fn execute_step(
        &self,
        cycle_id: Uuid,
        index: usize,
        step: &WorkflowStep,
    ) -> OrchestrationResult<StepOutcome> {
        let scheduler = &self.inner.scheduler;
        let task_id = TaskScheduler::workflow_step_task_id(cycle_id, &step.step_id);

        // a task from before a pause is rejoined whatever its status; a
        // failed one fails the step instead of getting a fresh retry budget
        let rejoin = scheduler.get_task_status(&task_id).await.is_some();

        if rejoin {
            debug!(task_id = %task_id, "Rejoining step task");
        } else {
            let payload = self.step_payload(cycle_id, step).await?;
            let config = &self.inner.config;
            if let Err(e) = scheduler
                .schedule_workflow_step(
                    cycle_id,
                    step,
                    payload,
                    config.step_priority,
                    config.step_max_retries,
                    Duration::from_millis(config.step_retry_delay_ms),
                )
                .await
            {
                return Ok(StepOutcome::Failed(format!("step {} rejected: {e}", step.step_id)));
            }

            let now = Utc::now();
            let task_ref = task_id.clone();
            self.with_cycle(cycle_id, move |c| {
                if let Some(progress) = c.steps.get_mut(index) {
                    progress.task_id = Some(task_ref);
                    progress.started_at = Some(now);
                }
            })
            .await?;
            info!(step_id = %step.step_id, task_id = %task_id, "Step submitted");
        }

        self.wait_for_step(cycle_id, index, step, &task_id).await
    }

    async fn wait_for_step(
        &self,
        cycle_id: Uuid,
        index: usize,
        step: &WorkflowStep,
        task_id: &str,
    ) -> OrchestrationResult<StepOutcome> {
        let poll = Duration::from_millis(self.inner.config.step_poll_interval_ms.max(1));
        let timeout = Duration::from_secs_f64(
            (step.estimated_duration_minutes * 60.0 * self.inner.config.step_timeout_multiplier).max(0.0),
        );

        // time already spent on this step before a pause counts
        let already = self
            .with_cycle(cycle_id, |c| {
                c.steps
                    .get(index)
                    .and_then(|s| s.started_at)
                    .and_then(|s| (Utc::now() - s).to_std().ok())
            })
            .await?
            .unwrap_or_default();
        let started = Instant::now().checked_sub(already).unwrap_or_else(Instant::now);

        loop {
            if let Some(task) = self.inner.scheduler.get_task_status(task_id).await {
                match task.status {
                    TaskStatus::Completed => {
                        return Ok(StepOutcome::Completed {
                            results: task.results,
                            provider_id: task.assigned_provider_id,
                        });
                    }
                    TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout => {
                        return Ok(StepOutcome::Failed(format!(
                            "step {} ended {}: {}",
                            step.step_id,
                            task.status,
                            task.error_message.unwrap_or_default()
                        )));
                    }
                    _ => {}
                }
            } else {
                return Ok(StepOutcome::Failed(format!("task {task_id} disappeared")));
            }

            match self.with_cycle(cycle_id, |c| c.state).await? {
                WorkflowState::Executing => {}
                WorkflowState::Paused => return Ok(StepOutcome::Paused),
                _ => {
                    self.inner
                        .scheduler
                        .cancel_task(task_id, "owning cycle stopped")
                        .await;
                    return Ok(StepOutcome::Aborted);
                }
            }

            if started.elapsed() > timeout {
                let err = OrchestrationError::Timeout {
                    what: format!("step {}", step.step_id),
                    seconds: timeout.as_secs_f64(),
                };
                self.inner.scheduler.expire_task(task_id, &err.to_string()).await;
                return Ok(StepOutcome::Failed(err.to_string()));
            }

            tokio::time::sleep(poll).await;
        }
    }

    async fn record_step(
        &self,
        cycle_id: Uuid,
        index: usize,
        step: &WorkflowStep,
        results: ResultMap,
        provider_id: Option<String>,
    ) -> OrchestrationResult<()> {
        let step_id = step.step_id.clone();
        let provider = provider_id.clone();
        let progress_percentage = self
            .with_cycle(cycle_id, move |c| {
                if let Some(progress) = c.steps.get_mut(index) {
                    progress.is_completed = true;
                    progress.completed_at = Some(Utc::now());
                    progress.assigned_provider_id = provider;
                    progress.results = results.clone();
                }
                c.step_results.insert(step_id, results);
                c.current_step_index = index + 1;
                #[allow(clippy::cast_precision_loss)]
                let pct = c.completed_steps() as f64 / c.steps.len().max(1) as f64 * 100.0;
                c.progress_percentage = pct;
                pct
            })
            .await?;

        info!(step_id = %step.step_id, progress = progress_percentage, "Step completed");
        self.inner.events.publish(CycleEvent::StepCompleted {
            cycle_id,
            step_id: step.step_id.clone(),
            provider_id,
            progress_percentage,
        });
        Ok(())
    }

    /// Step input: project context merged with prior outputs named by the
    /// step's input requirements.
    async fn step_payload(&self, cycle_id: Uuid, step: &WorkflowStep) -> OrchestrationResult<Value> {
        let (project_id, planned, prior) = self
            .with_cycle(cycle_id, |c| {
                (
                    c.project_id,
                    c.assigned_providers.get(&step.step_id).cloned(),
                    c.step_results.clone(),
                )
            })
            .await?;

        let mut inputs = ResultMap::new();
        if let Some(project) = self.inner.projects.get_project(project_id).await? {
            inputs.extend(project_context(&project));
        }
        for requirement in &step.input_requirements {
            if let Some(results) = prior.get(requirement) {
                inputs.insert(requirement.clone(), Value::Object(results.clone()));
            }
            for results in prior.values() {
                if let Some(value) = results.get(requirement) {
                    inputs.insert(requirement.clone(), value.clone());
                }
            }
        }

        Ok(json!({
            "cycle_id": cycle_id,
            "step_id": step.step_id,
            "step_name": step.step_name,
            "planned_provider_id": planned,
            "output_deliverables": step.output_deliverables,
            "inputs": inputs,
        }))
    }

    /// Score the success criteria against the quality gate. Failure
    /// conditions that hold are recorded on the cycle but do not gate it.
    /// `Err` carries the reason the gate failed.
    async fn validate(&self, cycle_id: Uuid) -> OrchestrationResult<Result<(), String>> {
        let criteria = &self.inner.criteria;
        let threshold = self.inner.config.quality_threshold;

        let verdict = self
            .with_cycle(cycle_id, |c| {
                let score = criteria.score(&c.template.success_criteria, c);
                c.quality_score = score.ratio();
                c.observed_failure_conditions = criteria.holding(&c.template.failure_conditions, c);
                debug!(
                    satisfied = score.satisfied,
                    total = score.total,
                    quality_score = c.quality_score,
                    "Success criteria evaluated"
                );
                if !c.observed_failure_conditions.is_empty() {
                    warn!(
                        conditions = %c.observed_failure_conditions.join(", "),
                        "Failure conditions observed"
                    );
                }

                if c.quality_score < threshold {
                    return Err(format!(
                        "quality score {:.2} below threshold {threshold:.2}",
                        c.quality_score
                    ));
                }
                Ok(())
            })
            .await?;

        match &verdict {
            Ok(()) => info!(cycle_id = %cycle_id, "Cycle passed validation"),
            Err(reason) => warn!(cycle_id = %cycle_id, reason = %reason, "Cycle failed validation"),
        }
        Ok(verdict)
    }

    async fn complete_cycle(&self, cycle_id: Uuid) -> OrchestrationResult<()> {
        let finished = self
            .with_cycle(cycle_id, |c| {
                c.transition_to(WorkflowState::Completed).ok()?;
                let now = Utc::now();
                c.completed_at = Some(now);
                #[allow(clippy::cast_precision_loss)]
                let hours = c
                    .started_at
                    .map_or(0.0, |s| (now - s).num_milliseconds() as f64 / 3_600_000.0);

                let mut results = ResultMap::new();
                results.insert(
                    "automated_cycle_results".to_string(),
                    serde_json::to_value(&c.step_results).unwrap_or(Value::Null),
                );
                results.insert("quality_score".to_string(), json!(c.quality_score));
                results.insert("cycle_duration_hours".to_string(), json!(hours));
                Some((c.project_id, results))
            })
            .await?;
        let Some((project_id, results)) = finished else {
            return Ok(());
        };

        if let Err(e) = self.inner.projects.attach_results(project_id, results).await {
            warn!(project_id = %project_id, error = %e, "Could not attach cycle results");
        }
        self.update_project(
            project_id,
            ProjectState::Completed,
            &format!("Automated cycle {cycle_id} completed"),
        )
        .await;

        let quality_score = self.with_cycle(cycle_id, |c| c.quality_score).await?;
        self.inner
            .events
            .publish(CycleEvent::CycleCompleted { cycle_id, quality_score });
        info!(cycle_id = %cycle_id, quality_score, "Research cycle completed");
        Ok(())
    }

    /// Move a cycle to `failed`. Returns false if it was already terminal.
    async fn fail_cycle(&self, cycle_id: Uuid, reason: &str) -> bool {
        let project_id = {
            let mut cycles = self.inner.cycles.lock().await;
            let Some(cycle) = cycles.get_mut(&cycle_id) else {
                return false;
            };
            if cycle.state.is_terminal() {
                return false;
            }
            cycle.state = WorkflowState::Failed;
            cycle.completed_at = Some(Utc::now());
            cycle.failure_reason = Some(reason.to_string());
            cycle.project_id
        };

        self.update_project(
            project_id,
            ProjectState::Failed,
            &format!("Automated cycle failed: {reason}"),
        )
        .await;
        self.inner.events.publish(CycleEvent::CycleFailed {
            cycle_id,
            reason: reason.to_string(),
        });
        error!(cycle_id = %cycle_id, reason, "Research cycle failed");
        true
    }

    /// Apply a lifecycle transition. Returns false when an outside actor
    /// moved the cycle somewhere the driver should stop at.
    async fn transition(&self, cycle_id: Uuid, to: WorkflowState) -> OrchestrationResult<bool> {
        let result = self.with_cycle(cycle_id, |c| c.transition_to(to)).await?;
        match result {
            Ok(()) => Ok(true),
            Err(reason) => {
                debug!(cycle_id = %cycle_id, to = %to, reason = %reason, "Transition skipped");
                Ok(false)
            }
        }
    }

    async fn update_project(&self, project_id: Uuid, state: ProjectState, note: &str) {
        if let Err(e) = self
            .inner
            .projects
            .update_project_state(project_id, state, note)
            .await
        {
            warn!(project_id = %project_id, error = %e, "Project state update failed");
        }
    }

    async fn with_cycle<R>(
        &self,
        cycle_id: Uuid,
        f: impl FnOnce(&mut AutomatedResearchCycle) -> R,
    ) -> OrchestrationResult<R> {
        let mut cycles = self.inner.cycles.lock().await;
        let cycle = cycles
            .get_mut(&cycle_id)
            .ok_or(OrchestrationError::CycleNotFound(cycle_id))?;
        Ok(f(cycle))
    }
}

fn project_context(project: &ResearchProject) -> ResultMap {
    let mut context = ResultMap::new();
    context.insert("research_question".to_string(), json!(project.research_question));
    context.insert("hypothesis".to_string(), json!(project.hypothesis));
    context.insert("domain".to_string(), json!(project.domain));
    context.insert("project_context".to_string(), Value::Object(project.metadata.clone()));
    context
}

#[async_trait]
impl CycleSupervisor for WorkflowEngine {
    async fn cycle_snapshots(&self) -> Vec<CycleSnapshot> {
        let cycles = self.inner.cycles.lock().await;
        cycles.values().map(AutomatedResearchCycle::snapshot).collect()
    }

    async fn cycle_snapshot(&self, cycle_id: Uuid) -> Option<CycleSnapshot> {
        self.get_cycle_status(cycle_id).await
    }

    async fn pause_cycle(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<bool> {
        Self::pause_cycle(self, cycle_id, reason).await
    }

    async fn stop_cycle(&self, cycle_id: Uuid, reason: &str) -> OrchestrationResult<bool> {
        Self::stop_cycle(self, cycle_id, reason).await
    }

    async fn flag_cycle_unsafe(&self, cycle_id: Uuid) -> OrchestrationResult<()> {
        self.with_cycle(cycle_id, |c| c.safety_status = "violation".to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::deliverables_executor::DeliverablesExecutor;
    use crate::adapters::memory_project_store::InMemoryProjectStore;
    use crate::adapters::static_directory::StaticCapabilityDirectory;
    use crate::domain::models::{default_providers, Capability, ProviderType, ScheduledTask, SchedulerConfig};
    use crate::domain::ports::{ExecutorError, ExecutorRegistry, TaskExecutor};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every execution after a short hold, counting attempts.
    struct FailingExecutor {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self, _task: &ScheduledTask) -> Result<ResultMap, ExecutorError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(40)).await;
            Err(ExecutorError::Failed("detector saturated".into()))
        }
    }

    struct Harness {
        engine: WorkflowEngine,
        projects: Arc<InMemoryProjectStore>,
        project_id: Uuid,
    }

    async fn harness(engine_config: EngineConfig) -> Harness {
        let executors = ExecutorRegistry::new().with_fallback(Arc::new(DeliverablesExecutor::with_research_defaults()));
        harness_with(engine_config, executors).await
    }

    async fn harness_with(engine_config: EngineConfig, executors: ExecutorRegistry) -> Harness {
        let directory = Arc::new(StaticCapabilityDirectory::new(default_providers()));
        let scheduler_config = SchedulerConfig {
            dispatch_interval_ms: 5,
            ..SchedulerConfig::default()
        };
        let scheduler = TaskScheduler::new(scheduler_config, directory.clone(), executors);
        scheduler.start().await;

        let projects = Arc::new(InMemoryProjectStore::new());
        let project = ResearchProject::new("Dark matter", "Does it interact?").with_hypothesis("It does");
        let project_id = projects.insert(project).await;

        let engine = WorkflowEngine::new(
            engine_config,
            scheduler,
            directory,
            projects.clone(),
            CriteriaRegistry::default(),
        )
        .unwrap();
        Harness {
            engine,
            projects,
            project_id,
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            step_poll_interval_ms: 5,
            step_retry_delay_ms: 5,
            ..EngineConfig::default()
        }
    }

    async fn wait_terminal(engine: &WorkflowEngine, cycle_id: Uuid) -> CycleSnapshot {
        for _ in 0..1000 {
            if let Some(s) = engine.get_cycle_status(cycle_id).await {
                if s.state.is_terminal() {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cycle {cycle_id} did not finish");
    }

    #[tokio::test]
    async fn test_quick_validation_completes() {
        let h = harness(fast_config()).await;
        let mut events = h.engine.subscribe();

        let cycle_id = h.engine.start_cycle(h.project_id, "quick_validation").await.unwrap();
        let snap = wait_terminal(&h.engine, cycle_id).await;

        assert_eq!(snap.state, WorkflowState::Completed, "{:?}", snap.failure_reason);
        assert!((snap.quality_score - 1.0).abs() < f64::EPSILON);
        assert!((snap.progress_percentage - 100.0).abs() < 1e-9);
        assert_eq!(snap.assigned_providers.len(), 3);

        let project = h.projects.get_project(h.project_id).await.unwrap().unwrap();
        assert_eq!(project.state, ProjectState::Completed);
        assert!(project.results.contains_key("automated_cycle_results"));

        let first = events.recv().await.unwrap();
        assert!(matches!(first.payload, CycleEvent::CycleStarted { .. }));
        h.engine.scheduler().stop().await;
    }

    #[tokio::test]
    async fn test_full_template_scores_four_of_five() {
        let h = harness(fast_config()).await;
        let cycle_id = h
            .engine
            .start_cycle(h.project_id, "complete_physics_research")
            .await
            .unwrap();
        let snap = wait_terminal(&h.engine, cycle_id).await;

        assert_eq!(snap.state, WorkflowState::Completed, "{:?}", snap.failure_reason);
        assert!((snap.quality_score - 0.8).abs() < 1e-9);
        assert_eq!(snap.step_results.len(), 9);
        h.engine.scheduler().stop().await;
    }

    #[tokio::test]
    async fn test_planning_fails_without_provider() {
        let h = harness(fast_config()).await;
        let mut template = WorkflowTemplate::quick_validation();
        template.template_id = "needs_ethics".to_string();
        template.steps[0] = WorkflowStep::new(
            "hypothesis_check",
            "Ethics check",
            ProviderType::Safety,
            vec![Capability::ProtocolOptimization],
            5.0,
        );
        h.engine.register_template(template).await.unwrap();

        let cycle_id = h.engine.start_cycle(h.project_id, "needs_ethics").await.unwrap();
        let snap = wait_terminal(&h.engine, cycle_id).await;
        assert_eq!(snap.state, WorkflowState::Failed);
        assert!(snap.failure_reason.unwrap().starts_with("Planning phase failed"));

        let project = h.projects.get_project(h.project_id).await.unwrap().unwrap();
        assert_eq!(project.state, ProjectState::Failed);
        h.engine.scheduler().stop().await;
    }

    #[tokio::test]
    async fn test_capacity_and_unknown_template() {
        let h = harness(EngineConfig {
            max_concurrent_cycles: 0,
            ..fast_config()
        })
        .await;
        assert!(matches!(
            h.engine.start_cycle(h.project_id, "quick_validation").await,
            Err(OrchestrationError::CapacityExceeded(_))
        ));
        assert!(matches!(
            h.engine.start_cycle(h.project_id, "nope").await,
            Err(OrchestrationError::TemplateNotFound(_))
        ));
        assert!(matches!(
            h.engine.start_cycle(Uuid::new_v4(), "quick_validation").await,
            Err(OrchestrationError::ProjectNotFound(_))
        ));
        h.engine.scheduler().stop().await;
    }

    #[tokio::test]
    async fn test_stop_and_intervention() {
        let h = harness(fast_config()).await;
        h.engine.scheduler().stop().await;

        let cycle_id = h.engine.start_cycle(h.project_id, "quick_validation").await.unwrap();
        h.engine.request_intervention(cycle_id, "operator check").await.unwrap();
        assert!(h.engine.stop_cycle(cycle_id, "halted").await.unwrap());
        assert!(!h.engine.stop_cycle(cycle_id, "again").await.unwrap());

        let snap = h.engine.get_cycle_status(cycle_id).await.unwrap();
        assert_eq!(snap.state, WorkflowState::Failed);
        assert!(snap.intervention_required);
        assert!(h.engine.list_active_cycles().await.is_empty());
        assert!(matches!(
            h.engine.stop_cycle(Uuid::new_v4(), "x").await,
            Err(OrchestrationError::CycleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_conditions_are_recorded_not_gating() {
        let h = harness(fast_config()).await;
        let cycle_id = h
            .engine
            .start_cycle(h.project_id, "complete_physics_research")
            .await
            .unwrap();
        CycleSupervisor::flag_cycle_unsafe(&h.engine, cycle_id).await.unwrap();

        let snap = wait_terminal(&h.engine, cycle_id).await;
        assert_eq!(snap.state, WorkflowState::Completed, "{:?}", snap.failure_reason);
        assert!((snap.quality_score - 0.8).abs() < 1e-9);
        assert!(snap
            .observed_failure_conditions
            .contains(&"Safety violation detected".to_string()));
        h.engine.scheduler().stop().await;
    }

    #[tokio::test]
    async fn test_task_exhausted_while_paused_is_not_resubmitted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let executors = ExecutorRegistry::new().with_fallback(Arc::new(FailingExecutor {
            attempts: attempts.clone(),
        }));
        let h = harness_with(
            EngineConfig {
                step_max_retries: 2,
                ..fast_config()
            },
            executors,
        )
        .await;
        let scheduler = h.engine.scheduler().clone();

        let cycle_id = h.engine.start_cycle(h.project_id, "quick_validation").await.unwrap();
        let task_id = TaskScheduler::workflow_step_task_id(cycle_id, "hypothesis_check");
        for _ in 0..1000 {
            if scheduler.get_task_status(&task_id).await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.engine.pause_cycle(cycle_id, "operator review").await.unwrap());

        for _ in 0..1000 {
            if scheduler
                .get_task_status(&task_id)
                .await
                .is_some_and(|t| t.status == TaskStatus::Failed)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let task = scheduler.get_task_status(&task_id).await.unwrap();
        assert_eq!((task.status, task.retry_count), (TaskStatus::Failed, 2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        assert!(h.engine.resume_cycle(cycle_id).await.unwrap());
        let snap = wait_terminal(&h.engine, cycle_id).await;
        assert_eq!(snap.state, WorkflowState::Failed);
        assert!(snap.failure_reason.unwrap().contains("hypothesis_check"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let task = scheduler.get_task_status(&task_id).await.unwrap();
        assert_eq!(task.retry_count, 2);
        scheduler.stop().await;
    }
}
