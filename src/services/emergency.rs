//! Emergency action dispatch.
//!
//! Each [`EmergencyAction`] maps to one handler in a table built at
//! startup. Handlers act through the supervision ports only and report a
//! short description of what they did.

use futures::future::BoxFuture;
use std::collections::HashMap;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::errors::OrchestrationResult;
use crate::domain::models::{EmergencyAction, SafetyViolation, ViolationSource, WorkflowState};
use crate::domain::ports::{CycleSupervisor, TaskSupervisor};

/// Everything a handler may touch.
pub struct ActionContext<'a> {
    /// Violation being handled.
    pub violation: &'a SafetyViolation,
    /// Cycle control.
    pub cycles: &'a dyn CycleSupervisor,
    /// Task control.
    pub tasks: &'a dyn TaskSupervisor,
    /// Cycles registered with the monitor.
    pub monitored_cycles: &'a [Uuid],
}

impl ActionContext<'_> {
    fn reason(&self) -> String {
        format!("Emergency response to violation {}", self.violation.violation_id)
    }

    /// Cycle the violation points at, directly or through its task.
    async fn affected_cycle(&self) -> Option<Uuid> {
        match &self.violation.source {
            ViolationSource::Cycle(id) => Some(*id),
            ViolationSource::Task(task_id) => self
                .tasks
                .active_task_snapshots()
                .await
                .into_iter()
                .find(|t| &t.task_id == task_id)
                .and_then(|t| t.cycle_id),
            _ => None,
        }
    }
}

/// Runs one emergency action and returns a short outcome label.
pub type ActionHandler =
    for<'a> fn(&'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>>;

/// Table from action to handler.
#[derive(Clone)]
pub struct EmergencyHandlers {
    handlers: HashMap<EmergencyAction, ActionHandler>,
}

impl std::fmt::Debug for EmergencyHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyHandlers")
            .field("actions", &self.handlers.len())
            .finish()
    }
}

impl Default for EmergencyHandlers {
    fn default() -> Self {
        use EmergencyAction as A;

        let mut handlers: HashMap<EmergencyAction, ActionHandler> = HashMap::new();
        handlers.insert(A::PauseAllNonCriticalCycles, pause_all_executing);
        handlers.insert(A::PauseAffectedWorkflows, pause_affected);
        handlers.insert(A::IsolateMalfunctioningAgent, isolate_agent);
        handlers.insert(A::StopAllDataOperations, stop_all_tasks);
        handlers.insert(A::NotifyAdministrators, log_only);
        handlers.insert(A::InitiateGracefulShutdown, log_only);
        handlers.insert(A::SaveCurrentState, snapshot_state);
        handlers.insert(A::BackupCurrentState, snapshot_state);
        handlers.insert(A::ReassignCriticalTasks, log_only);
        handlers.insert(A::InitiateAgentRecovery, log_only);
        handlers.insert(A::IsolateAffectedSystems, log_only);
        handlers.insert(A::InitiateForensicAnalysis, log_only);
        Self { handlers }
    }
}

impl EmergencyHandlers {
    /// Replace the handler for one action.
    pub fn register(&mut self, action: EmergencyAction, handler: ActionHandler) {
        self.handlers.insert(action, handler);
    }

    /// Run one action. A failing handler is reported, not propagated.
    pub async fn execute(&self, action: EmergencyAction, ctx: &ActionContext<'_>) -> String {
        let Some(handler) = self.handlers.get(&action) else {
            warn!(action = action.as_str(), "No handler for emergency action");
            return format!("{}:unhandled", action.as_str());
        };
        match handler(ctx).await {
            Ok(outcome) => {
                info!(action = action.as_str(), outcome = %outcome, "Executed emergency action");
                format!("{}:{outcome}", action.as_str())
            }
            Err(e) => {
                error!(action = action.as_str(), error = %e, "Emergency action failed");
                format!("{}:failed", action.as_str())
            }
        }
    }
}

fn pause_all_executing<'a>(ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
    Box::pin(async move {
        let reason = ctx.reason();
        let mut paused = 0;
        for &cycle_id in ctx.monitored_cycles {
            let executing = ctx
                .cycles
                .cycle_snapshot(cycle_id)
                .await
                .is_some_and(|c| c.state == WorkflowState::Executing);
            if executing && ctx.cycles.pause_cycle(cycle_id, &reason).await? {
                paused += 1;
            }
        }
        Ok(format!("paused_{paused}_cycles"))
    })
}

fn pause_affected<'a>(ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
    Box::pin(async move {
        if let Some(cycle_id) = ctx.affected_cycle().await {
            if ctx.cycles.pause_cycle(cycle_id, &ctx.reason()).await? {
                return Ok(format!("paused_cycle_{cycle_id}"));
            }
        }
        Ok("no_workflow_paused".to_string())
    })
}

fn isolate_agent<'a>(ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
    Box::pin(async move {
        if let ViolationSource::Task(task_id) = &ctx.violation.source {
            if ctx.tasks.stop_task(task_id, &ctx.reason()).await? {
                return Ok(format!("stopped_task_{task_id}"));
            }
        }
        info!(source = %ctx.violation.source, "Isolating provider");
        Ok("isolation_requested".to_string())
    })
}

fn stop_all_tasks<'a>(ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
    Box::pin(async move {
        error!("Stopping all data operations");
        let reason = ctx.reason();
        let mut stopped = 0;
        for task in ctx.tasks.active_task_snapshots().await {
            if ctx.tasks.stop_task(&task.task_id, &reason).await? {
                stopped += 1;
            }
        }
        Ok(format!("stopped_{stopped}_tasks"))
    })
}

fn snapshot_state<'a>(ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
    Box::pin(async move {
        let cycles = ctx.cycles.cycle_snapshots().await.len();
        let tasks = ctx.tasks.active_task_snapshots().await.len();
        info!(cycles, tasks, "Recorded system state");
        Ok(format!("recorded_{cycles}_cycles_{tasks}_tasks"))
    })
}

fn log_only<'a>(ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
    Box::pin(async move {
        warn!(violation_id = %ctx.violation.violation_id, "Emergency action requires operator follow-up");
        Ok("logged".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CycleSnapshot, RiskLevel, TaskSnapshot, ViolationType};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        paused: Mutex<Vec<Uuid>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CycleSupervisor for Recorder {
        async fn cycle_snapshots(&self) -> Vec<CycleSnapshot> {
            vec![]
        }
        async fn cycle_snapshot(&self, _cycle_id: Uuid) -> Option<CycleSnapshot> {
            None
        }
        async fn pause_cycle(&self, cycle_id: Uuid, _reason: &str) -> OrchestrationResult<bool> {
            self.paused.lock().unwrap().push(cycle_id);
            Ok(true)
        }
        async fn stop_cycle(&self, _cycle_id: Uuid, _reason: &str) -> OrchestrationResult<bool> {
            Ok(true)
        }
        async fn flag_cycle_unsafe(&self, _cycle_id: Uuid) -> OrchestrationResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TaskSupervisor for Recorder {
        async fn active_task_snapshots(&self) -> Vec<TaskSnapshot> {
            vec![]
        }
        async fn stop_task(&self, task_id: &str, _reason: &str) -> OrchestrationResult<bool> {
            self.stopped.lock().unwrap().push(task_id.to_string());
            Ok(true)
        }
    }

    fn violation(source: ViolationSource) -> SafetyViolation {
        SafetyViolation {
            violation_id: Uuid::new_v4(),
            violation_type: ViolationType::AgentMalfunction,
            risk_level: RiskLevel::High,
            source,
            rule_id: None,
            description: "test".into(),
            detected_at: Utc::now(),
            context: serde_json::Map::new(),
            auto_resolved: false,
            resolution_actions: vec![],
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_pause_affected_cycle() {
        let recorder = Recorder::default();
        let cycle_id = Uuid::new_v4();
        let v = violation(ViolationSource::Cycle(cycle_id));
        let ctx = ActionContext {
            violation: &v,
            cycles: &recorder,
            tasks: &recorder,
            monitored_cycles: &[],
        };

        let outcome = EmergencyHandlers::default()
            .execute(EmergencyAction::PauseAffectedWorkflows, &ctx)
            .await;
        assert_eq!(outcome, format!("pause_affected_workflows:paused_cycle_{cycle_id}"));
        assert_eq!(*recorder.paused.lock().unwrap(), vec![cycle_id]);
    }

    #[tokio::test]
    async fn test_isolate_stops_task_source() {
        let recorder = Recorder::default();
        let v = violation(ViolationSource::Task("t9".into()));
        let ctx = ActionContext {
            violation: &v,
            cycles: &recorder,
            tasks: &recorder,
            monitored_cycles: &[],
        };

        EmergencyHandlers::default()
            .execute(EmergencyAction::IsolateMalfunctioningAgent, &ctx)
            .await;
        assert_eq!(*recorder.stopped.lock().unwrap(), vec!["t9".to_string()]);
    }

    #[tokio::test]
    async fn test_registered_handler_overrides_default() {
        fn custom<'a>(_ctx: &'a ActionContext<'a>) -> BoxFuture<'a, OrchestrationResult<String>> {
            Box::pin(async { Ok("custom".to_string()) })
        }

        let recorder = Recorder::default();
        let v = violation(ViolationSource::System("system_monitor".into()));
        let ctx = ActionContext {
            violation: &v,
            cycles: &recorder,
            tasks: &recorder,
            monitored_cycles: &[],
        };
        let mut handlers = EmergencyHandlers::default();
        handlers.register(EmergencyAction::NotifyAdministrators, custom);
        assert_eq!(
            handlers.execute(EmergencyAction::NotifyAdministrators, &ctx).await,
            "notify_administrators:custom"
        );
    }
}
