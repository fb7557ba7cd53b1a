//! Research runtime
//!
//! Wires the task scheduler, the workflow engine and the safety monitor
//! together and owns their background loops.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               ResearchRuntime                │
//! ├──────────────────────────────────────────────┤
//! │ TaskScheduler ◄── WorkflowEngine             │
//! │      ▲                  │ CycleEvent         │
//! │      │                  ▼                    │
//! │      └────────── SafetyMonitor               │
//! └──────────────────────────────────────────────┘
//!   dispatch loop   registration loop   check / assess loops
//! ```

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{
    DeliverablesExecutor, InMemoryProjectStore, StaticCapabilityDirectory, SysinfoMetricsSource,
    TracingNotificationSink,
};
use crate::domain::models::{Config, CycleSnapshot};
use crate::domain::ports::{
    CapabilityDirectory, ExecutorRegistry, NotificationSink, ProjectStore, SystemMetricsSource,
};
use crate::services::{
    CriteriaRegistry, CycleEvent, MonitorPorts, SafetyMonitor, TaskScheduler, WorkflowEngine,
};

/// Runtime lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Not running; `start` is allowed.
    Stopped,
    /// Services are coming up.
    Starting,
    /// Loops running; cycles may be started.
    Running,
    /// Services are shutting down.
    Stopping,
}

/// External collaborators the runtime is built from.
#[derive(Clone)]
pub struct RuntimeDeps {
    /// Provider lookup.
    pub directory: Arc<dyn CapabilityDirectory>,
    /// Project persistence.
    pub projects: Arc<dyn ProjectStore>,
    /// Task bodies by task type.
    pub executors: ExecutorRegistry,
    /// Host readings.
    pub metrics: Arc<dyn SystemMetricsSource>,
    /// Emergency notifications.
    pub notifier: Arc<dyn NotificationSink>,
    /// Success criteria and failure condition predicates.
    pub criteria: CriteriaRegistry,
}

/// Owns the scheduler, the engine and the safety monitor and wires them together.
pub struct ResearchRuntime {
    config: Config,
    projects: Arc<dyn ProjectStore>,
    scheduler: TaskScheduler,
    engine: WorkflowEngine,
    monitor: SafetyMonitor,
    state: Arc<RwLock<RuntimeState>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: RwLock<Vec<JoinHandle<()>>>,
}

impl ResearchRuntime {
    /// Build the services from `config` and `deps`. Nothing runs until [`start`](Self::start).
    pub fn new(config: Config, deps: RuntimeDeps) -> Result<Self> {
        let scheduler = TaskScheduler::new(
            config.scheduler.clone(),
            Arc::clone(&deps.directory),
            deps.executors,
        );
        let engine = WorkflowEngine::new(
            config.engine.clone(),
            scheduler.clone(),
            deps.directory,
            Arc::clone(&deps.projects),
            deps.criteria,
        )
        .context("Failed to build workflow engine")?;
        let monitor = SafetyMonitor::new(
            config.safety.clone(),
            MonitorPorts {
                cycles: Arc::new(engine.clone()),
                tasks: Arc::new(scheduler.clone()),
                projects: Arc::clone(&deps.projects),
                metrics: deps.metrics,
                notifier: deps.notifier,
            },
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            projects: deps.projects,
            scheduler,
            engine,
            monitor,
            state: Arc::new(RwLock::new(RuntimeState::Stopped)),
            shutdown_tx,
            handles: RwLock::new(Vec::new()),
        })
    }

    /// Runtime over the bundled in-process adapters: the configured static
    /// providers, the deliverables executor, host metrics and log alerts.
    pub fn in_memory(config: Config) -> Result<(Self, Arc<InMemoryProjectStore>)> {
        let projects = Arc::new(InMemoryProjectStore::new());
        let deps = RuntimeDeps {
            directory: Arc::new(StaticCapabilityDirectory::new(config.providers.clone())),
            projects: projects.clone(),
            executors: ExecutorRegistry::new()
                .with_fallback(Arc::new(DeliverablesExecutor::with_research_defaults())),
            metrics: Arc::new(SysinfoMetricsSource::new()),
            notifier: Arc::new(TracingNotificationSink::new()),
            criteria: CriteriaRegistry::default(),
        };
        Ok((Self::new(config, deps)?, projects))
    }

    /// Active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Task scheduler.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Workflow engine.
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Safety monitor.
    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    /// Project store.
    pub fn projects(&self) -> &Arc<dyn ProjectStore> {
        &self.projects
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// Start the scheduler, the monitor and the runtime's own loops.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != RuntimeState::Stopped {
                return Ok(());
            }
            *state = RuntimeState::Starting;
        }
        info!("Starting research runtime");

        self.scheduler.start().await;
        self.monitor.start().await;

        let registration = self.spawn_registration_loop();
        let cleanup = self.spawn_cleanup_loop();
        self.handles.write().await.extend([registration, cleanup]);

        *self.state.write().await = RuntimeState::Running;
        info!("Research runtime started");
        Ok(())
    }

    /// Register every started cycle and its project with the monitor, and
    /// unregister them once the cycle finishes.
    fn spawn_registration_loop(&self) -> JoinHandle<()> {
        let mut events = self.engine.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let monitor = self.monitor.clone();
        let engine = self.engine.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(envelope) => match envelope.payload {
                            CycleEvent::CycleStarted { cycle_id, project_id, .. } => {
                                monitor.register_cycle(cycle_id).await;
                                monitor.register_project(project_id).await;
                            }
                            CycleEvent::CycleCompleted { cycle_id, .. } => {
                                release_cycle(&engine, &monitor, cycle_id).await;
                            }
                            CycleEvent::CycleFailed { cycle_id, .. } => {
                                // one scan first so the failure itself is reported
                                monitor.check_now().await;
                                release_cycle(&engine, &monitor, cycle_id).await;
                            }
                            _ => {}
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Cycle event subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Registration loop stopped");
        })
    }

    fn spawn_cleanup_loop(&self) -> JoinHandle<()> {
        let every = Duration::from_secs(self.config.scheduler.cleanup_interval_secs.max(1));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let engine = self.engine.clone();

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = engine.cleanup_completed_cycles().await;
                        if evicted > 0 {
                            debug!(evicted, "Evicted finished cycles");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Start a cycle and put it under safety monitoring.
    pub async fn start_cycle(&self, project_id: Uuid, template_id: &str) -> Result<Uuid> {
        let cycle_id = self
            .engine
            .start_cycle(project_id, template_id)
            .await
            .with_context(|| format!("Failed to start cycle from template '{template_id}'"))?;
        self.monitor.register_cycle(cycle_id).await;
        self.monitor.register_project(project_id).await;
        // a cycle that already finished was released before we registered it
        if self
            .engine
            .get_cycle_status(cycle_id)
            .await
            .is_some_and(|c| c.state.is_terminal())
        {
            release_cycle(&self.engine, &self.monitor, cycle_id).await;
        }
        Ok(cycle_id)
    }

    /// Wait until the cycle reaches a terminal state.
    pub async fn wait_for_cycle(&self, cycle_id: Uuid, timeout: Duration) -> Result<CycleSnapshot> {
        let poll = Duration::from_millis(self.config.engine.step_poll_interval_ms.max(1));
        let wait = async {
            loop {
                match self.engine.get_cycle_status(cycle_id).await {
                    Some(snapshot) if snapshot.state.is_terminal() => return Ok(snapshot),
                    Some(_) => tokio::time::sleep(poll).await,
                    None => bail!("Cycle {cycle_id} is not known to the engine"),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .with_context(|| format!("Cycle {cycle_id} did not finish within {timeout:?}"))?
    }

    /// Stop all loops. Running steps are left to finish.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == RuntimeState::Stopped {
                return Ok(());
            }
            *state = RuntimeState::Stopping;
        }
        info!("Stopping research runtime");

        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.write().await.drain(..).collect();
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = ?e, "Runtime loop panicked"),
                Err(_) => warn!("Runtime loop shutdown timeout"),
            }
        }
        self.monitor.stop().await;
        self.scheduler.stop().await;

        *self.state.write().await = RuntimeState::Stopped;
        info!("Research runtime stopped");
        Ok(())
    }
}

/// Drop a finished cycle from monitoring, and its project when no other
/// cycle of that project is still running.
async fn release_cycle(engine: &WorkflowEngine, monitor: &SafetyMonitor, cycle_id: Uuid) {
    monitor.unregister_cycle(cycle_id).await;
    let Some(snapshot) = engine.get_cycle_status(cycle_id).await else {
        return;
    };
    let project_busy = engine
        .list_active_cycles()
        .await
        .iter()
        .any(|c| c.project_id == snapshot.project_id);
    if !project_busy {
        monitor.unregister_project(snapshot.project_id).await;
    }
    debug!(cycle_id = %cycle_id, "Finished cycle released from monitoring");
}
