//! Safety monitor.
//!
//! Runs two loops: a short violation check over system readings, registered
//! cycles, active tasks and registered projects, and a longer risk
//! assessment that folds active violations into one [`SafetyStatus`].
//! Detected conditions are handled by the action of the applicable rule.
//! The monitor only changes cycle and task state through the supervision
//! ports; it never touches results or payloads.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::{
    EmergencyProtocol, PendingEmergency, ProjectState, RuleAction, SafetyConfig, SafetyEvent,
    SafetyStatistics, SafetyStatus, SafetyStatusReport, SafetyViolation, ViolationSource,
};
use crate::domain::ports::{
    CycleSupervisor, NotificationSink, ProjectStore, SystemMetricsSource, TaskSupervisor,
};
use crate::services::emergency::{ActionContext, EmergencyHandlers};
use crate::services::event_bus::{Envelope, EventBus};
use crate::services::safety_rules::{self, Detection, RuleBook};

/// Collaborators the monitor observes and acts on.
#[derive(Clone)]
pub struct MonitorPorts {
    /// Cycle state and pause/stop.
    pub cycles: Arc<dyn CycleSupervisor>,
    /// Active tasks and stop.
    pub tasks: Arc<dyn TaskSupervisor>,
    /// Project budgets and states.
    pub projects: Arc<dyn ProjectStore>,
    /// Host readings.
    pub metrics: Arc<dyn SystemMetricsSource>,
    /// Emergency notification delivery.
    pub notifier: Arc<dyn NotificationSink>,
}

#[derive(Default)]
struct MonitorState {
    monitored_cycles: HashSet<Uuid>,
    monitored_projects: HashSet<Uuid>,
    /// Every known violation; active ones have no `resolved_at`.
    violations: HashMap<Uuid, SafetyViolation>,
    pending: HashMap<Uuid, PendingEmergency>,
    status: SafetyStatus,
    stats: SafetyStatistics,
    resolution_minutes_total: f64,
}

impl MonitorState {
    fn is_duplicate(&self, detection: &Detection) -> bool {
        self.violations.values().any(|v| {
            v.is_active()
                && v.violation_type == detection.violation_type
                && v.source == detection.source
                && v.rule_id == detection.rule_id
        })
    }

    /// Stamp a violation resolved and fold it into the resolution mean.
    fn mark_resolved(&mut self, violation_id: Uuid, auto: bool, note: String) -> OrchestrationResult<()> {
        let now = Utc::now();
        let violation = self
            .violations
            .get_mut(&violation_id)
            .filter(|v| v.is_active())
            .ok_or(OrchestrationError::ViolationNotFound(violation_id))?;

        violation.resolved_at = Some(now);
        violation.auto_resolved = auto;
        violation.resolution_actions.push(note);

        #[allow(clippy::cast_precision_loss)]
        let minutes = (now - violation.detected_at).num_milliseconds() as f64 / 60_000.0;
        if auto {
            self.stats.auto_resolutions += 1;
        } else {
            self.stats.manual_resolutions += 1;
        }
        self.resolution_minutes_total += minutes.max(0.0);
        #[allow(clippy::cast_precision_loss)]
        let resolved = (self.stats.auto_resolutions + self.stats.manual_resolutions) as f64;
        self.stats.mean_time_to_resolution_minutes = self.resolution_minutes_total / resolved;
        Ok(())
    }

    fn max_active_weight(&self) -> Option<f64> {
        self.violations
            .values()
            .filter(|v| v.is_active())
            .map(|v| v.risk_level.weight())
            .reduce(f64::max)
    }
}

struct MonitorInner {
    config: SafetyConfig,
    rules: RuleBook,
    protocols: Vec<EmergencyProtocol>,
    handlers: EmergencyHandlers,
    ports: MonitorPorts,
    state: Mutex<MonitorState>,
    events: EventBus<SafetyEvent>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Rule-driven oversight of cycles, tasks, projects and the host.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SafetyMonitor {
    inner: Arc<MonitorInner>,
}

impl SafetyMonitor {
    /// Monitor with the default emergency handlers.
    pub fn new(config: SafetyConfig, ports: MonitorPorts) -> Self {
        Self::with_handlers(config, ports, EmergencyHandlers::default())
    }

    /// Monitor with a custom handler table.
    pub fn with_handlers(config: SafetyConfig, ports: MonitorPorts, handlers: EmergencyHandlers) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(MonitorInner {
                rules: RuleBook::new(config.rules.clone()),
                protocols: config.protocols.clone(),
                config,
                handlers,
                ports,
                state: Mutex::new(MonitorState::default()),
                events: EventBus::default(),
                running: AtomicBool::new(false),
                shutdown_tx,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SafetyConfig {
        &self.inner.config
    }

    /// Loaded rule book.
    pub fn rules(&self) -> &RuleBook {
        &self.inner.rules
    }

    /// New receiver for safety events.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope<SafetyEvent>> {
        self.inner.events.subscribe()
    }

    // ---- registration ----

    /// Start watching a cycle.
    pub async fn register_cycle(&self, cycle_id: Uuid) {
        if self.inner.state.lock().await.monitored_cycles.insert(cycle_id) {
            info!(%cycle_id, "Registered cycle for safety monitoring");
        }
    }

    /// Stop watching a cycle. Returns false if it was not watched.
    pub async fn unregister_cycle(&self, cycle_id: Uuid) -> bool {
        self.inner.state.lock().await.monitored_cycles.remove(&cycle_id)
    }

    /// Start watching a project.
    pub async fn register_project(&self, project_id: Uuid) {
        if self.inner.state.lock().await.monitored_projects.insert(project_id) {
            info!(%project_id, "Registered project for safety monitoring");
        }
    }

    /// Stop watching a project. Returns false if it was not watched.
    pub async fn unregister_project(&self, project_id: Uuid) -> bool {
        self.inner.state.lock().await.monitored_projects.remove(&project_id)
    }

    // ---- queries ----

    /// Current system safety status.
    pub async fn status(&self) -> SafetyStatus {
        self.inner.state.lock().await.status
    }

    /// Status, counts and statistics in one report.
    pub async fn get_safety_status(&self) -> SafetyStatusReport {
        let state = self.inner.state.lock().await;
        SafetyStatusReport {
            system_safety_status: state.status,
            active_violations: state.violations.values().filter(|v| v.is_active()).count(),
            total_violations: state.violations.len(),
            monitored_cycles: state.monitored_cycles.len(),
            monitored_projects: state.monitored_projects.len(),
            safety_rules: self.inner.rules.len(),
            emergency_protocols: self.inner.protocols.len(),
            pending_emergencies: state.pending.len(),
            statistics: state.stats.clone(),
        }
    }

    /// One violation, active or resolved.
    pub async fn get_violation_details(&self, violation_id: Uuid) -> OrchestrationResult<SafetyViolation> {
        self.inner
            .state
            .lock()
            .await
            .violations
            .get(&violation_id)
            .cloned()
            .ok_or(OrchestrationError::ViolationNotFound(violation_id))
    }

    /// Unresolved violations, oldest first.
    pub async fn list_active_violations(&self) -> Vec<SafetyViolation> {
        let state = self.inner.state.lock().await;
        let mut active: Vec<SafetyViolation> =
            state.violations.values().filter(|v| v.is_active()).cloned().collect();
        active.sort_by_key(|v| v.detected_at);
        active
    }

    /// Protocols awaiting approval, oldest first.
    pub async fn pending_emergencies(&self) -> Vec<PendingEmergency> {
        let state = self.inner.state.lock().await;
        let mut pending: Vec<PendingEmergency> = state.pending.values().cloned().collect();
        pending.sort_by_key(|p| p.requested_at);
        pending
    }

    // ---- resolution ----

    /// Resolve a violation by hand, recording `note`.
    #[instrument(skip(self, note), err)]
    pub async fn resolve_violation(&self, violation_id: Uuid, note: &str) -> OrchestrationResult<()> {
        self.inner
            .state
            .lock()
            .await
            .mark_resolved(violation_id, false, format!("manual_resolution: {note}"))?;
        info!(%violation_id, note, "Violation resolved");
        Ok(())
    }

    /// Run a protocol that was held for approval.
    #[instrument(skip(self), err)]
    pub async fn approve_emergency_protocol(&self, pending_id: Uuid) -> OrchestrationResult<Vec<String>> {
        let (pending, violation) = {
            let mut state = self.inner.state.lock().await;
            let pending = state
                .pending
                .remove(&pending_id)
                .ok_or(OrchestrationError::EmergencyNotFound(pending_id))?;
            let violation = state
                .violations
                .get(&pending.violation_id)
                .cloned()
                .ok_or(OrchestrationError::ViolationNotFound(pending.violation_id))?;
            (pending, violation)
        };

        let Some(protocol) = self
            .inner
            .protocols
            .iter()
            .find(|p| p.protocol_id == pending.protocol_id)
        else {
            return Err(OrchestrationError::Validation(format!(
                "unknown emergency protocol '{}'",
                pending.protocol_id
            )));
        };

        let outcomes = self.execute_protocol(protocol, &violation).await;
        let mut state = self.inner.state.lock().await;
        state.stats.emergencies_triggered += 1;
        if let Some(v) = state.violations.get_mut(&violation.violation_id) {
            v.resolution_actions
                .push(format!("executed_emergency_protocol_{}", protocol.protocol_id));
        }
        Ok(outcomes)
    }

    // ---- detection ----

    /// Record a detection and handle it per its rule. Returns `None` when an
    /// equivalent violation is already active.
    #[instrument(skip(self, detection), fields(violation_type = %detection.violation_type, source = %detection.source))]
    pub async fn report_violation(&self, detection: Detection) -> Option<Uuid> {
        let rule = self
            .inner
            .rules
            .applicable(detection.violation_type, detection.rule_id.as_deref())
            .cloned();
        let tags = detection.trigger_tags();

        let violation = {
            let mut state = self.inner.state.lock().await;
            if state.is_duplicate(&detection) {
                debug!("Violation already active");
                return None;
            }
            let violation = SafetyViolation {
                violation_id: Uuid::new_v4(),
                violation_type: detection.violation_type,
                risk_level: detection.risk_level,
                source: detection.source,
                rule_id: detection.rule_id,
                description: detection.description,
                detected_at: Utc::now(),
                context: detection.context,
                auto_resolved: false,
                resolution_actions: Vec::new(),
                resolved_at: None,
            };
            state.violations.insert(violation.violation_id, violation.clone());
            state.stats.violations_detected += 1;
            violation
        };
        let violation_id = violation.violation_id;

        warn!(
            %violation_id,
            risk_level = %violation.risk_level,
            description = %violation.description,
            "Safety violation detected"
        );

        if let ViolationSource::Cycle(cycle_id) = violation.source {
            if let Err(e) = self.inner.ports.cycles.flag_cycle_unsafe(cycle_id).await {
                warn!(%cycle_id, error = %e, "Failed to flag cycle");
            }
        }

        let handled = match &rule {
            Some(rule) => {
                let actions = self.apply_action(rule.action, &violation, &tags).await;
                let mut state = self.inner.state.lock().await;
                if let Some(v) = state.violations.get_mut(&violation_id) {
                    v.resolution_actions.extend(actions);
                }
                if violation.violation_type.is_auto_resolvable() {
                    // already resolved manually in the meantime is fine
                    let _ = state.mark_resolved(violation_id, true, "auto_resolved".to_string());
                    info!(%violation_id, "Auto-resolved violation");
                }
                true
            }
            None => {
                warn!(%violation_id, "No applicable rule for violation");
                false
            }
        };

        let snapshot = self
            .inner
            .state
            .lock()
            .await
            .violations
            .get(&violation_id)
            .cloned();
        if let Some(violation) = snapshot {
            self.inner
                .events
                .publish(SafetyEvent::ViolationDetected { violation });
        }
        debug!(handled, "Violation processed");
        Some(violation_id)
    }

    async fn apply_action(&self, action: RuleAction, violation: &SafetyViolation, tags: &[&str]) -> Vec<String> {
        match action {
            RuleAction::Warn => {
                warn!(description = %violation.description, "Safety warning");
                vec!["warning_issued".to_string()]
            }
            RuleAction::Pause => self.pause_source(violation).await,
            RuleAction::Stop => self.stop_source(violation).await,
            RuleAction::Emergency => self.trigger_emergency(violation, tags).await,
        }
    }

    async fn cycle_of_task(&self, task_id: &str) -> Option<Uuid> {
        self.inner
            .ports
            .tasks
            .active_task_snapshots()
            .await
            .into_iter()
            .find(|t| t.task_id == task_id)
            .and_then(|t| t.cycle_id)
    }

    async fn pause_source(&self, violation: &SafetyViolation) -> Vec<String> {
        let reason = format!("Safety pause: {}", violation.description);
        let ports = &self.inner.ports;
        let cycle = match &violation.source {
            ViolationSource::Cycle(id) => Some(*id),
            ViolationSource::Task(task_id) => self.cycle_of_task(task_id).await,
            ViolationSource::Project(project_id) => {
                return match ports
                    .projects
                    .update_project_state(*project_id, ProjectState::Paused, &reason)
                    .await
                {
                    Ok(()) => vec![format!("paused_project_{project_id}")],
                    Err(e) => {
                        warn!(%project_id, error = %e, "Failed to pause project");
                        vec![]
                    }
                };
            }
            ViolationSource::System(_) => None,
        };

        let Some(cycle_id) = cycle else {
            return vec![];
        };
        match ports.cycles.pause_cycle(cycle_id, &reason).await {
            Ok(true) => vec![format!("paused_cycle_{cycle_id}")],
            Ok(false) => vec![],
            Err(e) => {
                warn!(%cycle_id, error = %e, "Failed to pause cycle");
                vec![]
            }
        }
    }

    async fn stop_source(&self, violation: &SafetyViolation) -> Vec<String> {
        let reason = format!("Safety stop: {}", violation.description);
        let ports = &self.inner.ports;
        let outcome = match &violation.source {
            ViolationSource::Cycle(cycle_id) => ports
                .cycles
                .stop_cycle(*cycle_id, &reason)
                .await
                .map(|stopped| stopped.then(|| format!("stopped_cycle_{cycle_id}"))),
            ViolationSource::Task(task_id) => ports
                .tasks
                .stop_task(task_id, &reason)
                .await
                .map(|stopped| stopped.then(|| format!("stopped_task_{task_id}"))),
            ViolationSource::Project(project_id) => ports
                .projects
                .update_project_state(*project_id, ProjectState::Failed, &reason)
                .await
                .map(|()| Some(format!("stopped_project_{project_id}"))),
            ViolationSource::System(_) => Ok(None),
        };

        match outcome {
            Ok(action) => action.into_iter().collect(),
            Err(e) => {
                warn!(source = %violation.source, error = %e, "Failed to stop source");
                vec![]
            }
        }
    }

    async fn trigger_emergency(&self, violation: &SafetyViolation, tags: &[&str]) -> Vec<String> {
        let matched: Vec<&EmergencyProtocol> = self
            .inner
            .protocols
            .iter()
            .filter(|p| p.is_triggered_by(tags))
            .collect();

        let mut actions = Vec::new();
        for protocol in &matched {
            if protocol.auto_execute {
                self.execute_protocol(protocol, violation).await;
                self.inner.state.lock().await.stats.emergencies_triggered += 1;
                actions.push(format!("executed_emergency_protocol_{}", protocol.protocol_id));
            } else {
                let pending = PendingEmergency {
                    pending_id: Uuid::new_v4(),
                    protocol_id: protocol.protocol_id.clone(),
                    violation_id: violation.violation_id,
                    requested_at: Utc::now(),
                };
                warn!(
                    protocol = %protocol.protocol_name,
                    pending_id = %pending.pending_id,
                    "Emergency protocol awaiting approval"
                );
                actions.push(format!("pending_emergency_protocol_{}", protocol.protocol_id));
                self.inner
                    .state
                    .lock()
                    .await
                    .pending
                    .insert(pending.pending_id, pending);
            }
        }

        self.set_status(SafetyStatus::Emergency).await;
        self.inner.events.publish(SafetyEvent::EmergencyTriggered {
            violation_id: violation.violation_id,
            protocols: matched.iter().map(|p| p.protocol_id.clone()).collect(),
        });
        actions
    }

    async fn execute_protocol(&self, protocol: &EmergencyProtocol, violation: &SafetyViolation) -> Vec<String> {
        error!(
            protocol = %protocol.protocol_name,
            violation_id = %violation.violation_id,
            "Executing emergency protocol"
        );

        let monitored: Vec<Uuid> = self
            .inner
            .state
            .lock()
            .await
            .monitored_cycles
            .iter()
            .copied()
            .collect();
        let ctx = ActionContext {
            violation,
            cycles: self.inner.ports.cycles.as_ref(),
            tasks: self.inner.ports.tasks.as_ref(),
            monitored_cycles: &monitored,
        };

        let mut outcomes = Vec::with_capacity(protocol.emergency_actions.len());
        for &action in &protocol.emergency_actions {
            outcomes.push(self.inner.handlers.execute(action, &ctx).await);
        }

        let message = json!({
            "alert": "EMERGENCY PROTOCOL TRIGGERED",
            "protocol": protocol.protocol_name,
            "violation": violation.description,
            "risk_level": violation.risk_level.as_str(),
            "timestamp": violation.detected_at.to_rfc3339(),
            "actions_taken": outcomes,
        });
        for target in &protocol.notification_targets {
            if let Err(e) = self.inner.ports.notifier.notify(target, &message).await {
                warn!(target = %target, error = %e, "Emergency notification failed");
            }
        }
        outcomes
    }

    // ---- loop bodies ----

    /// One pass of the violation check. Returns the number of new violations.
    pub async fn check_now(&self) -> usize {
        let now = Utc::now();
        let inner = &self.inner;
        let mut detections = Vec::new();

        match inner.ports.metrics.sample().await {
            Ok(metrics) => detections.extend(safety_rules::check_metrics(&inner.rules, &metrics)),
            Err(e) => warn!(error = %e, "System metrics unavailable"),
        }

        let (cycle_ids, project_ids): (Vec<Uuid>, Vec<Uuid>) = {
            let state = inner.state.lock().await;
            (
                state.monitored_cycles.iter().copied().collect(),
                state.monitored_projects.iter().copied().collect(),
            )
        };

        for cycle_id in cycle_ids {
            match inner.ports.cycles.cycle_snapshot(cycle_id).await {
                Some(cycle) => detections.extend(safety_rules::check_cycle(
                    &inner.rules,
                    &inner.config,
                    &cycle,
                    now,
                )),
                None => {
                    debug!(%cycle_id, "Monitored cycle no longer exists");
                    self.unregister_cycle(cycle_id).await;
                }
            }
        }

        for task in inner.ports.tasks.active_task_snapshots().await {
            detections.extend(safety_rules::check_task(&inner.rules, &inner.config, &task, now));
        }

        for project_id in project_ids {
            match inner.ports.projects.get_project(project_id).await {
                Ok(Some(project)) => detections.extend(safety_rules::check_project(&project)),
                Ok(None) => debug!(%project_id, "Monitored project not found"),
                Err(e) => warn!(%project_id, error = %e, "Project check failed"),
            }
        }

        let mut reported = 0;
        for detection in detections {
            if self.report_violation(detection).await.is_some() {
                reported += 1;
            }
        }
        self.prune_history().await;
        reported
    }

    /// One pass of the risk assessment.
    pub async fn assess_now(&self) -> SafetyStatus {
        let max_weight = self.inner.state.lock().await.max_active_weight();
        let status = SafetyStatus::from_max_weight(max_weight);
        self.set_status(status).await;
        status
    }

    async fn set_status(&self, new_status: SafetyStatus) {
        let old_status = {
            let mut state = self.inner.state.lock().await;
            if state.status == new_status {
                return;
            }
            std::mem::replace(&mut state.status, new_status)
        };
        info!(%old_status, %new_status, "Safety status changed");
        self.inner
            .events
            .publish(SafetyEvent::StatusChanged { old_status, new_status });
    }

    /// Drop resolved violations older than the retention window.
    async fn prune_history(&self) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        let cutoff = Utc::now() - ChronoDuration::hours(self.inner.config.violation_retention_hours as i64);
        let mut state = self.inner.state.lock().await;
        let before = state.violations.len();
        state
            .violations
            .retain(|_, v| v.resolved_at.map_or(true, |r| r >= cutoff));
        before - state.violations.len()
    }

    // ---- lifecycle ----

    /// Start the violation check and risk assessment loops.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let check_every = Duration::from_millis(self.inner.config.monitoring_interval_ms.max(1));
        let assess_every = Duration::from_millis(self.inner.config.risk_assessment_interval_ms.max(1));

        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let check = tokio::spawn(async move {
            let mut ticker = interval(check_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let found = this.check_now().await;
                        if found > 0 {
                            debug!(found, "Violation check pass");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let assess = tokio::spawn(async move {
            let mut ticker = interval(assess_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { this.assess_now().await; }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        self.inner.handles.lock().await.extend([check, assess]);
        info!(
            rules = self.inner.rules.len(),
            protocols = self.inner.protocols.len(),
            "Safety monitor started"
        );
    }

    /// Stop both loops and wait for them to exit.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        let handles: Vec<_> = self.inner.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Safety loop ended abnormally");
            }
        }
        info!("Safety monitor stopped");
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}
