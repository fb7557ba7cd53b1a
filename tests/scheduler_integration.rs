//! Task scheduler against the in-process directory and executors.

mod common;

use std::sync::Arc;
use std::time::Duration;

use autolab::adapters::{DeliverablesExecutor, StaticCapabilityDirectory};
use autolab::domain::models::{
    Capability, PriorityLevel, ProviderInfo, ProviderType, ResourceType, ScheduledTask, SchedulerConfig,
    TaskStatus,
};
use autolab::domain::ports::{ExecutorRegistry, TaskExecutor};
use autolab::{OrchestrationError, TaskScheduler};
use common::{eventually, SlowExecutor};

fn directory() -> Arc<StaticCapabilityDirectory> {
    Arc::new(StaticCapabilityDirectory::new(vec![
        ProviderInfo::new("stats-1", ProviderType::Analysis, vec![Capability::DataAnalysis]),
        ProviderInfo::new("lab-1", ProviderType::Experimental, vec![Capability::ExperimentalDesign]),
    ]))
}

fn scheduler(config: SchedulerConfig, executor: Arc<dyn TaskExecutor>) -> TaskScheduler {
    TaskScheduler::new(config, directory(), ExecutorRegistry::new().with_fallback(executor))
}

fn limited(max_concurrent_tasks: usize, compute: f64) -> SchedulerConfig {
    let mut config = SchedulerConfig {
        max_concurrent_tasks,
        dispatch_interval_ms: 5,
        ..SchedulerConfig::default()
    };
    config.resource_limits.compute = compute;
    config
}

async fn status(s: &TaskScheduler, id: &str) -> Option<TaskStatus> {
    s.get_task_status(id).await.map(|t| t.status)
}

#[tokio::test]
async fn test_highest_priority_dispatches_first() {
    let s = &scheduler(limited(1, 100.0), Arc::new(SlowExecutor::new(Duration::from_millis(200))));
    let created = chrono::Utc::now();
    for (id, priority) in [
        ("low", PriorityLevel::Low),
        ("critical", PriorityLevel::Critical),
        ("medium", PriorityLevel::Medium),
    ] {
        s.schedule_task(ScheduledTask::new(id, "analysis", priority).with_created_at(created))
            .await
            .unwrap();
    }

    assert_eq!(s.tick().await, 1);
    assert_ne!(status(s, "critical").await, Some(TaskStatus::Queued));
    assert_eq!(status(s, "medium").await, Some(TaskStatus::Queued));
    assert_eq!(status(s, "low").await, Some(TaskStatus::Queued));

    // slot is held while the slow executor runs
    assert_eq!(s.tick().await, 0);
}

#[tokio::test]
async fn test_dependent_task_waits_for_its_dependency() {
    let s = &scheduler(limited(4, 100.0), Arc::new(DeliverablesExecutor::new()));
    s.schedule_task(ScheduledTask::new("collect", "experiment", PriorityLevel::High))
        .await
        .unwrap();
    s.schedule_task(
        ScheduledTask::new("analyse", "analysis", PriorityLevel::Low).with_dependencies(vec!["collect".into()]),
    )
    .await
    .unwrap();

    assert_eq!(s.tick().await, 1);
    assert_eq!(status(s, "analyse").await, Some(TaskStatus::Queued));

    eventually("collect completes", || async move {
        status(s, "collect").await == Some(TaskStatus::Completed)
    })
    .await;
    assert_eq!(s.tick().await, 1);
    eventually("analyse completes", || async move {
        status(s, "analyse").await == Some(TaskStatus::Completed)
    })
    .await;
}

#[tokio::test]
async fn test_blocked_head_stops_the_dispatch_pass() {
    let s = &scheduler(limited(5, 100.0), Arc::new(DeliverablesExecutor::new()));
    s.schedule_task(ScheduledTask::new("prep", "experiment", PriorityLevel::Low))
        .await
        .unwrap();
    s.schedule_task(
        ScheduledTask::new("urgent", "analysis", PriorityLevel::Critical).with_dependencies(vec!["prep".into()]),
    )
    .await
    .unwrap();
    s.schedule_task(ScheduledTask::new("ready-high", "analysis", PriorityLevel::High))
        .await
        .unwrap();

    // the blocked critical task is re-queued and nothing behind it is popped
    assert_eq!(s.tick().await, 0);
    assert_eq!(s.tick().await, 0);
    for id in ["urgent", "ready-high", "prep"] {
        assert_eq!(status(s, id).await, Some(TaskStatus::Queued), "{id}");
    }
    assert_eq!(s.get_system_status().await.queue_depth, 3);
}

#[tokio::test]
async fn test_compute_budget_limits_parallelism() {
    let s = &scheduler(limited(5, 10.0), Arc::new(SlowExecutor::new(Duration::from_millis(100))));
    for id in ["sim-a", "sim-b"] {
        s.schedule_task(ScheduledTask::new(id, "simulation", PriorityLevel::Medium).with_resource(ResourceType::Compute, 6.0))
            .await
            .unwrap();
    }

    assert_eq!(s.tick().await, 1);
    assert!((s.allocated(ResourceType::Compute).await - 6.0).abs() < f64::EPSILON);
    let system = s.get_system_status().await;
    assert_eq!(system.active_tasks, 1);
    assert_eq!(system.queue_depth, 1);

    eventually("first simulation releases compute", || async move {
        s.allocated(ResourceType::Compute).await.abs() < f64::EPSILON
    })
    .await;
    assert_eq!(s.tick().await, 1);
}

#[tokio::test]
async fn test_rejects_requirement_above_static_limit() {
    let s = &scheduler(limited(5, 10.0), Arc::new(DeliverablesExecutor::new()));
    let err = s
        .schedule_task(ScheduledTask::new("huge", "simulation", PriorityLevel::High).with_resource(ResourceType::Compute, 20.0))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Validation(_)));
    assert_eq!(s.get_system_status().await.total_tasks, 0);
}

#[tokio::test]
async fn test_provider_is_assigned_by_capability() {
    let s = &scheduler(limited(5, 100.0), Arc::new(DeliverablesExecutor::new()));
    s.schedule_task(
        ScheduledTask::new("design", "experiment", PriorityLevel::Medium)
            .with_capabilities(vec![Capability::ExperimentalDesign]),
    )
    .await
    .unwrap();
    s.tick().await;

    eventually("design completes", || async move {
        status(s, "design").await == Some(TaskStatus::Completed)
    })
    .await;
    let snapshot = s.get_task_status("design").await.unwrap();
    assert_eq!(snapshot.assigned_provider_id.as_deref(), Some("lab-1"));
    assert_eq!(s.get_system_status().await.active_providers, 0);
}

#[tokio::test]
async fn test_failed_task_is_retried_then_fails() {
    let executor = DeliverablesExecutor::new().with_failing_step("calibrate", "sensor drift");
    let s = &scheduler(limited(5, 100.0), Arc::new(executor));
    s.start().await;

    s.schedule_task(
        ScheduledTask::new("calibrate-1", "calibration", PriorityLevel::High)
            .with_payload(serde_json::json!({ "step_id": "calibrate" }))
            .with_retries(2, Duration::from_millis(5)),
    )
    .await
    .unwrap();

    eventually("calibration fails permanently", || async move {
        status(s, "calibrate-1").await == Some(TaskStatus::Failed)
    })
    .await;
    let system = s.get_system_status().await;
    assert_eq!(system.statistics.tasks_retried, 2);
    assert_eq!(system.statistics.tasks_failed, 1);
    assert_eq!(
        s.get_task_status("calibrate-1").await.unwrap().error_message.as_deref(),
        Some("Executor failed: sensor drift")
    );
    s.stop().await;
}

#[tokio::test]
async fn test_cancel_removes_queued_task() {
    let s = &scheduler(limited(5, 100.0), Arc::new(DeliverablesExecutor::new()));
    s.schedule_task(ScheduledTask::new("t1", "analysis", PriorityLevel::Low))
        .await
        .unwrap();

    assert!(s.cancel_task("t1", "operator").await);
    assert!(!s.cancel_task("t1", "again").await);
    assert_eq!(status(s, "t1").await, Some(TaskStatus::Cancelled));
    assert_eq!(s.tick().await, 0);
    assert_eq!(s.get_system_status().await.statistics.tasks_cancelled, 1);
}

#[tokio::test]
async fn test_dispatch_loop_runs_until_stopped() {
    let s = &scheduler(limited(5, 100.0), Arc::new(DeliverablesExecutor::new()));
    s.start().await;
    assert!(s.is_running());

    for i in 0..5 {
        s.schedule_task(ScheduledTask::new(format!("batch-{i}"), "analysis", PriorityLevel::Medium))
            .await
            .unwrap();
    }
    eventually("all batch tasks complete", || async move {
        s.get_system_status().await.statistics.tasks_completed == 5
    })
    .await;

    s.stop().await;
    assert!(!s.is_running());
}
