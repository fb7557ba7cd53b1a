//! Safety monitor supervising live cycles through the runtime.

mod common;

use std::sync::Arc;
use std::time::Duration;

use autolab::domain::models::{
    ResearchProject, RiskLevel, SafetyEvent, SafetyStatus, ViolationType, WorkflowState,
};
use autolab::domain::ports::SystemMetrics;
use common::{eventually, fast_config, harness, harness_with, SlowExecutor};

const WAIT: Duration = Duration::from_secs(10);

/// Monitor loops run once at start and then stay idle, so checks are driven by hand.
fn manual_checks() -> autolab::Config {
    let mut config = fast_config();
    config.safety.monitoring_interval_ms = 60_000;
    config.safety.risk_assessment_interval_ms = 60_000;
    config
}

#[tokio::test]
async fn test_memory_pressure_pauses_running_cycle_until_resumed() {
    let h = harness_with(manual_checks(), Arc::new(SlowExecutor::new(Duration::from_millis(40))));
    h.runtime.start().await.unwrap();
    let monitor = h.runtime.monitor();
    let engine = h.runtime.engine();
    let mut events = monitor.subscribe();

    let project_id = h.project().await;
    let cycle_id = h.runtime.start_cycle(project_id, "quick_validation").await.unwrap();
    eventually("cycle executing", || async move {
        engine
            .get_cycle_status(cycle_id)
            .await
            .is_some_and(|s| s.state == WorkflowState::Executing)
    })
    .await;

    h.metrics
        .set(SystemMetrics { cpu_percent: 20.0, memory_percent: 95.0 })
        .await;
    // the loop's startup pass may already have seen the reading
    monitor.check_now().await;

    let snapshot = engine.get_cycle_status(cycle_id).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Paused);
    assert_eq!(monitor.status().await, SafetyStatus::Emergency);

    let mut targets = h.sink.targets().await;
    targets.sort();
    assert_eq!(
        targets,
        vec!["admin@research-institute.ai", "safety@research-institute.ai"]
    );
    let deliveries = h.sink.deliveries.lock().await;
    assert_eq!(deliveries[0].1["protocol"], "System Overload Emergency Response");
    assert_eq!(deliveries[0].1["risk_level"], "critical");
    drop(deliveries);

    let mut emergency = None;
    while let Ok(envelope) = events.try_recv() {
        if let SafetyEvent::EmergencyTriggered { protocols, .. } = envelope.payload {
            emergency = Some(protocols);
        }
    }
    assert_eq!(emergency, Some(vec!["system_overload".to_string()]));

    let violation = monitor.list_active_violations().await.remove(0);
    assert_eq!(violation.violation_type, ViolationType::SystemOverload);
    assert_eq!(violation.risk_level, RiskLevel::Critical);

    h.metrics.set(SystemMetrics::default()).await;
    monitor
        .resolve_violation(violation.violation_id, "swap added")
        .await
        .unwrap();
    assert_eq!(monitor.assess_now().await, SafetyStatus::Safe);

    assert!(engine.resume_cycle(cycle_id).await.unwrap());
    let done = h.runtime.wait_for_cycle(cycle_id, WAIT).await.unwrap();
    assert_eq!(done.state, WorkflowState::Completed, "{:?}", done.failure_reason);
    h.runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_cpu_warning_does_not_interrupt_cycle() {
    let h = harness(manual_checks());
    h.runtime.start().await.unwrap();
    h.metrics
        .set(SystemMetrics { cpu_percent: 90.0, memory_percent: 30.0 })
        .await;

    let project_id = h.project().await;
    let cycle_id = h.runtime.start_cycle(project_id, "quick_validation").await.unwrap();
    h.runtime.monitor().check_now().await;

    let snapshot = h.runtime.wait_for_cycle(cycle_id, WAIT).await.unwrap();
    assert_eq!(snapshot.state, WorkflowState::Completed, "{:?}", snapshot.failure_reason);

    let active = h.runtime.monitor().list_active_violations().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].resolution_actions, vec!["warning_issued".to_string()]);
    assert_eq!(h.runtime.monitor().assess_now().await, SafetyStatus::Warning);
    assert!(h.sink.targets().await.is_empty());
    h.runtime.stop().await.unwrap();
}

#[tokio::test]
async fn test_over_budget_project_is_flagged_and_auto_resolved() {
    let h = harness(manual_checks());
    let mut project = ResearchProject::new("Cryo-EM", "Can we resolve the spike?").with_budget(100.0);
    project.current_cost_usd = 250.0;
    let project_id = h.projects.insert(project).await;
    h.runtime.monitor().register_project(project_id).await;

    assert_eq!(h.runtime.monitor().check_now().await, 1);
    let report = h.runtime.monitor().get_safety_status().await;
    assert_eq!(report.total_violations, 1);
    assert_eq!(report.active_violations, 0);
    assert_eq!(report.statistics.auto_resolutions, 1);
}

#[tokio::test]
async fn test_monitor_loops_detect_without_manual_checks() {
    let h = harness(fast_config());
    h.metrics
        .set(SystemMetrics { cpu_percent: 90.0, memory_percent: 10.0 })
        .await;
    h.runtime.start().await.unwrap();
    let monitor = h.runtime.monitor();

    eventually("loop reports cpu violation", || async move {
        monitor.get_safety_status().await.system_safety_status == SafetyStatus::Warning
    })
    .await;
    assert_eq!(monitor.list_active_violations().await.len(), 1);
    h.runtime.stop().await.unwrap();
    assert!(!monitor.is_running());
}
