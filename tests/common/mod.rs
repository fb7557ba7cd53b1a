//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use autolab::adapters::{DeliverablesExecutor, FixedMetricsSource, InMemoryProjectStore, StaticCapabilityDirectory};
use autolab::domain::errors::OrchestrationResult;
use autolab::domain::models::{Config, ResearchProject, ResultMap, ScheduledTask};
use autolab::domain::ports::{ExecutorError, ExecutorRegistry, NotificationSink, SystemMetrics, TaskExecutor};
use autolab::services::CriteriaRegistry;
use autolab::{ResearchRuntime, RuntimeDeps};

/// Config with millisecond loop periods.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.scheduler.dispatch_interval_ms = 5;
    config.engine.step_poll_interval_ms = 5;
    config.engine.step_retry_delay_ms = 5;
    config.safety.monitoring_interval_ms = 20;
    config.safety.risk_assessment_interval_ms = 20;
    config
}

/// Notification sink that keeps every delivery.
#[derive(Default)]
pub struct RecordingSink {
    pub deliveries: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSink {
    pub async fn targets(&self) -> Vec<String> {
        self.deliveries.lock().await.iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, target: &str, payload: &serde_json::Value) -> OrchestrationResult<()> {
        self.deliveries
            .lock()
            .await
            .push((target.to_string(), payload.clone()));
        Ok(())
    }
}

/// Executor that holds each task for `delay` before delegating.
pub struct SlowExecutor {
    pub delay: Duration,
    pub inner: DeliverablesExecutor,
}

impl SlowExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: DeliverablesExecutor::with_research_defaults(),
        }
    }
}

#[async_trait]
impl TaskExecutor for SlowExecutor {
    async fn execute(&self, task: &ScheduledTask) -> Result<ResultMap, ExecutorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(task).await
    }
}

pub struct Harness {
    pub runtime: ResearchRuntime,
    pub projects: Arc<InMemoryProjectStore>,
    pub metrics: Arc<FixedMetricsSource>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub async fn project(&self) -> uuid::Uuid {
        self.projects
            .insert(
                ResearchProject::new("Quantum sensing", "Can NV centres beat SQUIDs?")
                    .with_hypothesis("NV centres reach femtotesla sensitivity"),
            )
            .await
    }
}

pub fn harness_with(config: Config, executor: Arc<dyn TaskExecutor>) -> Harness {
    let projects = Arc::new(InMemoryProjectStore::new());
    let metrics = Arc::new(FixedMetricsSource::new(SystemMetrics::default()));
    let sink = Arc::new(RecordingSink::default());
    let deps = RuntimeDeps {
        directory: Arc::new(StaticCapabilityDirectory::new(config.providers.clone())),
        projects: projects.clone(),
        executors: ExecutorRegistry::new().with_fallback(executor),
        metrics: metrics.clone(),
        notifier: sink.clone(),
        criteria: CriteriaRegistry::default(),
    };
    Harness {
        runtime: ResearchRuntime::new(config, deps).expect("runtime builds"),
        projects,
        metrics,
        sink,
    }
}

pub fn harness(config: Config) -> Harness {
    harness_with(config, Arc::new(DeliverablesExecutor::with_research_defaults()))
}

/// Poll `check` every 5ms until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}
