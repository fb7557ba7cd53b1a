//! Task scheduler.
//!
//! Owns the priority queue, the resource ledger and provider workload
//! accounting. A periodic dispatch pass moves ready tasks from the queue
//! to execution, allocating a provider and any declared resources
//! atomically; executors run on spawned tokio tasks and report back into
//! the shared state.
//!
//! All scheduler state lives behind one mutex that is never held across an
//! await on a collaborator (directory lookups and executor calls happen
//! with the lock released).

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{OrchestrationError, OrchestrationResult};
use crate::domain::models::{
    PriorityLevel, ProviderInfo, ResourceType, ResultMap, ScheduledTask, SchedulerConfig,
    TaskSnapshot, TaskStatus, WorkflowStep,
};
use crate::domain::ports::{CapabilityDirectory, ExecutorError, ExecutorRegistry, TaskSupervisor};
use crate::services::provider_selector::ProviderSelector;
use crate::services::resource_ledger::{AllocationRequest, ResourceLedger, ResourceUtilization};
use crate::services::task_queue::TaskQueue;

/// Task type used for workflow steps.
pub const WORKFLOW_STEP_TASK_TYPE: &str = "workflow_step";

/// Aggregate scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatistics {
    /// Tasks admitted.
    pub tasks_scheduled: u64,
    /// Tasks that completed.
    pub tasks_completed: u64,
    /// Tasks that failed for good.
    pub tasks_failed: u64,
    /// Tasks cancelled or stopped.
    pub tasks_cancelled: u64,
    /// Retries scheduled.
    pub tasks_retried: u64,
    /// Running mean of dispatch to completion.
    pub average_execution_time_secs: f64,
    /// Running mean of admission to dispatch.
    pub average_wait_time_secs: f64,
}

/// Result of `get_system_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    /// Whether the loops are running.
    pub running: bool,
    /// Tasks waiting in the queue.
    pub queue_depth: usize,
    /// Tasks assigned or executing.
    pub active_tasks: usize,
    /// Completed task ids still remembered.
    pub completed_tasks: usize,
    /// Tasks tracked in any status.
    pub total_tasks: usize,
    /// Configured dispatch ceiling.
    pub max_concurrent_tasks: usize,
    /// Providers holding at least one task.
    pub active_providers: usize,
    /// Ledger usage per resource type.
    pub resource_utilization: BTreeMap<ResourceType, ResourceUtilization>,
    /// Counters.
    pub statistics: SchedulerStatistics,
}

struct SchedulerState {
    tasks: HashMap<String, ScheduledTask>,
    queue: TaskQueue,
    /// Tasks holding a concurrency slot: being dispatched, assigned or executing.
    active: HashSet<String>,
    completed: HashSet<String>,
    ledger: ResourceLedger,
    selector: ProviderSelector,
    stats: SchedulerStatistics,
}

impl SchedulerState {
    fn is_ready(&self, task: &ScheduledTask) -> bool {
        task.depends_on.iter().all(|dep| self.completed.contains(dep))
    }

    /// Give back every allocation `task_id` holds and free its slot.
    fn release(&mut self, task_id: &str) {
        for allocation in self.ledger.release_task(task_id) {
            if allocation.resource_type == ResourceType::Agent {
                for provider_id in &allocation.allocated_resources {
                    self.selector.release(provider_id);
                }
            }
        }
        self.active.remove(task_id);
    }

    fn requeue(&mut self, task_id: &str) {
        if let Some(task) = self.tasks.get(task_id) {
            self.queue.push(task_id, task.priority, task.created_at);
        }
    }

    fn record_completion(&mut self, task: &ScheduledTask) {
        self.stats.tasks_completed += 1;
        #[allow(clippy::cast_precision_loss)]
        let n = self.stats.tasks_completed as f64;

        if let (Some(started), Some(completed)) = (task.started_at, task.completed_at) {
            let exec = seconds_between(started, completed);
            self.stats.average_execution_time_secs =
                (self.stats.average_execution_time_secs * (n - 1.0) + exec) / n;
        }
        if let (Some(assigned), Some(started)) = (task.assigned_at, task.started_at) {
            let wait = seconds_between(assigned, started);
            self.stats.average_wait_time_secs =
                (self.stats.average_wait_time_secs * (n - 1.0) + wait) / n;
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

struct SchedulerInner {
    config: SchedulerConfig,
    directory: Arc<dyn CapabilityDirectory>,
    executors: ExecutorRegistry,
    state: Mutex<SchedulerState>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Priority, resource-aware, retrying task scheduler.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Scheduler with an empty queue. Call [`start`](Self::start) to run the loops.
    pub fn new(
        config: SchedulerConfig,
        directory: Arc<dyn CapabilityDirectory>,
        executors: ExecutorRegistry,
    ) -> Self {
        let ledger = ResourceLedger::new(&config.resource_limits);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(SchedulerInner {
                config,
                directory,
                executors,
                state: Mutex::new(SchedulerState {
                    tasks: HashMap::new(),
                    queue: TaskQueue::new(),
                    active: HashSet::new(),
                    completed: HashSet::new(),
                    ledger,
                    selector: ProviderSelector::new(),
                    stats: SchedulerStatistics::default(),
                }),
                running: AtomicBool::new(false),
                shutdown_tx,
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Validate and enqueue a task. Rejections have no side effects.
    #[instrument(skip(self, task), fields(task_id = %task.task_id, task_type = %task.task_type), err)]
    pub async fn schedule_task(&self, mut task: ScheduledTask) -> OrchestrationResult<()> {
        self.validate_task(&task).await?;

        let mut state = self.inner.state.lock().await;
        for requirement in &task.resource_requirements {
            if !state.ledger.within_static_limit(requirement) {
                return Err(OrchestrationError::Validation(format!(
                    "{} requirement of {} exceeds limit {}",
                    requirement.resource_type,
                    requirement.amount,
                    state.ledger.limit(requirement.resource_type)
                )));
            }
        }

        // ids are single-use while the task is tracked, so a finished task
        // never restarts with a fresh retry count
        if let Some(existing) = state.tasks.get(&task.task_id) {
            return Err(OrchestrationError::Validation(format!(
                "task {} is already scheduled ({})",
                task.task_id, existing.status
            )));
        }
        state.completed.remove(&task.task_id);

        task.status = TaskStatus::Queued;
        task.retry_count = 0;
        task.assigned_provider_id = None;
        task.assigned_at = None;
        task.started_at = None;
        task.completed_at = None;
        task.error_message = None;
        task.results.clear();

        state.queue.push(task.task_id.clone(), task.priority, task.created_at);
        state.stats.tasks_scheduled += 1;
        info!(priority = task.priority.as_str(), "Task scheduled");
        state.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn validate_task(&self, task: &ScheduledTask) -> OrchestrationResult<()> {
        if task.task_id.trim().is_empty() {
            return Err(OrchestrationError::Validation("task id is empty".to_string()));
        }
        if !self.inner.executors.supports(&task.task_type) {
            return Err(OrchestrationError::Validation(format!(
                "no executor for task type '{}'",
                task.task_type
            )));
        }
        if task.depends_on.iter().any(|d| d == &task.task_id) {
            return Err(OrchestrationError::Validation(format!(
                "task {} depends on itself",
                task.task_id
            )));
        }

        if task.needs_provider() {
            let candidates = self.find_candidates(task).await?;
            let selector = ProviderSelector::new();
            if selector
                .select(&candidates, &task.capability_requirements, task.required_provider_type)
                .is_none()
            {
                return Err(OrchestrationError::Validation(format!(
                    "no provider offers {:?} (type {})",
                    task.capability_requirements,
                    task.required_provider_type
                        .map_or_else(|| "any".to_string(), |t| t.to_string())
                )));
            }
        }
        Ok(())
    }

    async fn find_candidates(&self, task: &ScheduledTask) -> OrchestrationResult<Vec<ProviderInfo>> {
        self.inner
            .directory
            .find_providers(&task.capability_requirements, task.required_provider_type)
            .await
    }

    /// Build and enqueue the task for one workflow step.
    ///
    /// The task id is `"{cycle_id}_{step_id}"` and dependencies map to the
    /// task ids of the dependency steps in the same cycle.
    pub async fn schedule_workflow_step(
        &self,
        cycle_id: Uuid,
        step: &WorkflowStep,
        payload: serde_json::Value,
        priority: PriorityLevel,
        max_retries: u32,
        retry_delay: Duration,
    ) -> OrchestrationResult<String> {
        let task = Self::workflow_step_task(cycle_id, step, payload, priority, max_retries, retry_delay);
        let task_id = task.task_id.clone();
        self.schedule_task(task).await?;
        Ok(task_id)
    }

    /// Task id of a cycle step: `{cycle_id}_{step_id}`.
    pub fn workflow_step_task_id(cycle_id: Uuid, step_id: &str) -> String {
        format!("{cycle_id}_{step_id}")
    }

    /// Build the task that runs one cycle step.
    pub fn workflow_step_task(
        cycle_id: Uuid,
        step: &WorkflowStep,
        payload: serde_json::Value,
        priority: PriorityLevel,
        max_retries: u32,
        retry_delay: Duration,
    ) -> ScheduledTask {
        #[allow(clippy::cast_possible_truncation)]
        let deadline_ms = (step.estimated_duration_minutes * 2.0 * 60_000.0) as i64;

        let mut task = ScheduledTask::new(
            Self::workflow_step_task_id(cycle_id, &step.step_id),
            WORKFLOW_STEP_TASK_TYPE,
            priority,
        )
        .with_provider_type(step.required_provider_type)
        .with_capabilities(step.required_capabilities.clone())
        .with_dependencies(
            step.dependencies
                .iter()
                .map(|d| Self::workflow_step_task_id(cycle_id, d))
                .collect(),
        )
        .with_retries(max_retries, retry_delay)
        .with_payload(payload);

        task.cycle_id = Some(cycle_id);
        task.workflow_step_id = Some(step.step_id.clone());
        task.estimated_duration_minutes = Some(step.estimated_duration_minutes);
        task.deadline = Some(task.created_at + ChronoDuration::milliseconds(deadline_ms));
        task
    }

    /// Cancel a queued or running task. A running executor may finish but
    /// its result is discarded; allocations are released now.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> bool {
        self.finish_externally(task_id, TaskStatus::Cancelled, reason).await
    }

    /// Mark a task timed out, releasing its allocations.
    #[instrument(skip(self))]
    pub async fn expire_task(&self, task_id: &str, reason: &str) -> bool {
        self.finish_externally(task_id, TaskStatus::Timeout, reason).await
    }

    async fn finish_externally(&self, task_id: &str, status: TaskStatus, reason: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Some(task) = state.tasks.get(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        state.queue.remove(task_id);
        state.release(task_id);

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = status;
            task.completed_at = Some(Utc::now());
            task.error_message = Some(reason.to_string());
        }
        match status {
            TaskStatus::Cancelled => state.stats.tasks_cancelled += 1,
            TaskStatus::Failed | TaskStatus::Timeout => state.stats.tasks_failed += 1,
            _ => {}
        }
        info!(status = status.as_str(), reason, "Task finished externally");
        true
    }

    /// Snapshot of a tracked task.
    pub async fn get_task_status(&self, task_id: &str) -> Option<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        state.tasks.get(task_id).map(ScheduledTask::snapshot)
    }

    /// Queue, capacity and counter summary.
    pub async fn get_system_status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock().await;
        SchedulerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            queue_depth: state.queue.len(),
            active_tasks: state.active.len(),
            completed_tasks: state.completed.len(),
            total_tasks: state.tasks.len(),
            max_concurrent_tasks: self.inner.config.max_concurrent_tasks,
            active_providers: state.selector.active_providers(),
            resource_utilization: state.ledger.utilization(),
            statistics: state.stats.clone(),
        }
    }

    /// Live allocation total for one resource type.
    pub async fn allocated(&self, resource_type: ResourceType) -> f64 {
        self.inner.state.lock().await.ledger.live_total(resource_type)
    }

    /// Run one dispatch pass. Returns the number of tasks started.
    pub async fn tick(&self) -> usize {
        let batch = self.collect_ready().await;
        let mut dispatched = 0;

        for task_id in batch {
            match self.dispatch(&task_id).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "Dispatch deferred, task requeued");
                }
            }
        }
        dispatched
    }

    /// Pop ready tasks up to the free concurrency. Stops at the first task
    /// whose dependencies are not complete; that task goes back in the queue.
    async fn collect_ready(&self) -> Vec<String> {
        let mut state = self.inner.state.lock().await;
        let mut batch = Vec::new();

        while state.active.len() < self.inner.config.max_concurrent_tasks {
            let Some(entry) = state.queue.pop() else { break };
            let Some(task) = state.tasks.get(&entry.task_id) else {
                continue;
            };
            if task.status != TaskStatus::Queued {
                continue;
            }
            if !state.is_ready(task) {
                state.queue.push(entry.task_id, entry.priority, entry.created_at);
                break;
            }
            state.active.insert(entry.task_id.clone());
            batch.push(entry.task_id);
        }
        batch
    }

    /// Allocate a provider and resources for one collected task and start it.
    async fn dispatch(&self, task_id: &str) -> OrchestrationResult<bool> {
        let snapshot = {
            let state = self.inner.state.lock().await;
            match state.tasks.get(task_id) {
                Some(t) if t.status == TaskStatus::Queued => t.clone(),
                _ => return Ok(false),
            }
        };

        let candidates = if snapshot.needs_provider() {
            match self.find_candidates(&snapshot).await {
                Ok(c) => Some(c),
                Err(e) => {
                    let mut state = self.inner.state.lock().await;
                    state.active.remove(task_id);
                    state.requeue(task_id);
                    return Err(OrchestrationError::Scheduling(e.to_string()));
                }
            }
        } else {
            None
        };

        let mut state = self.inner.state.lock().await;
        if state.tasks.get(task_id).map(|t| t.status) != Some(TaskStatus::Queued) {
            // cancelled while the directory was consulted
            state.active.remove(task_id);
            return Ok(false);
        }

        let mut requests = Vec::with_capacity(snapshot.resource_requirements.len() + 1);
        let mut provider_id = None;
        if let Some(candidates) = &candidates {
            let chosen = state.selector.select(
                candidates,
                &snapshot.capability_requirements,
                snapshot.required_provider_type,
            );
            let Some(chosen) = chosen else {
                state.active.remove(task_id);
                state.requeue(task_id);
                return Err(OrchestrationError::Scheduling(format!(
                    "no available provider for task {task_id}"
                )));
            };
            requests.push(AllocationRequest::new(ResourceType::Agent, 1.0).with_handle(chosen.id.clone()));
            provider_id = Some(chosen.id.clone());
        }
        requests.extend(snapshot.resource_requirements.iter().map(AllocationRequest::from));

        if let Err(e) = state.ledger.allocate_all(task_id, &requests, snapshot.deadline) {
            state.active.remove(task_id);
            state.requeue(task_id);
            return Err(e);
        }

        if let Some(id) = &provider_id {
            state.selector.assign(id);
        }
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_provider_id = provider_id;
            task.assigned_at = Some(Utc::now());
        }
        drop(state);

        let this = self.clone();
        let id = task_id.to_string();
        tokio::spawn(async move { this.execute(id).await });
        Ok(true)
    }

    async fn execute(&self, task_id: String) {
        let task = {
            let mut state = self.inner.state.lock().await;
            let Some(task) = state.tasks.get_mut(&task_id) else { return };
            if task.status != TaskStatus::Assigned {
                return;
            }
            task.status = TaskStatus::Executing;
            task.started_at = Some(Utc::now());
            task.clone()
        };

        debug!(task_id = %task_id, attempt = task.retry_count + 1, "Executing task");
        let outcome = self.inner.executors.execute(&task).await;
        self.complete(&task_id, outcome).await;
    }

    async fn complete(&self, task_id: &str, outcome: Result<ResultMap, ExecutorError>) {
        let mut state = self.inner.state.lock().await;
        match state.tasks.get(task_id) {
            Some(t) if t.status == TaskStatus::Executing => {}
            _ => {
                debug!(task_id = %task_id, "Discarding result of task no longer executing");
                return;
            }
        }

        state.release(task_id);
        let now = Utc::now();

        match outcome {
            Ok(results) => {
                let Some(task) = state.tasks.get_mut(task_id) else { return };
                task.status = TaskStatus::Completed;
                task.completed_at = Some(now);
                task.results = results;
                let finished = task.clone();
                state.completed.insert(task_id.to_string());
                state.record_completion(&finished);
                info!(task_id = %task_id, "Task completed");
            }
            Err(e) => {
                let Some(task) = state.tasks.get_mut(task_id) else { return };
                task.error_message = Some(e.to_string());

                if task.can_retry() {
                    task.retry_count += 1;
                    task.status = TaskStatus::Queued;
                    task.assigned_provider_id = None;
                    let delay = task.retry_delay;
                    let attempt = task.retry_count;
                    state.stats.tasks_retried += 1;
                    warn!(task_id = %task_id, error = %e, attempt, "Task failed, retry scheduled");
                    drop(state);

                    let this = self.clone();
                    let id = task_id.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        this.requeue_after_retry(&id).await;
                    });
                } else {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(now);
                    state.stats.tasks_failed += 1;
                    warn!(task_id = %task_id, error = %e, "Task failed permanently");
                }
            }
        }
    }

    async fn requeue_after_retry(&self, task_id: &str) {
        let mut state = self.inner.state.lock().await;
        let queued = state
            .tasks
            .get(task_id)
            .is_some_and(|t| t.status == TaskStatus::Queued);
        if queued && !state.queue.contains(task_id) && !state.active.contains(task_id) {
            state.requeue(task_id);
        }
    }

    /// Evict finished tasks older than the retention window.
    pub async fn cleanup_finished(&self) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        let retention = ChronoDuration::seconds(self.inner.config.finished_task_retention_secs as i64);
        let cutoff = Utc::now() - retention;

        let mut state = self.inner.state.lock().await;
        let stale: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.completed_at.is_some_and(|c| c < cutoff))
            .map(|t| t.task_id.clone())
            .collect();

        // completed ids stay in `completed` so later dependents still see them
        for id in &stale {
            state.tasks.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Evicted finished tasks");
        }
        stale.len()
    }

    /// Start the dispatch and cleanup loops.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let dispatch_every = Duration::from_millis(self.inner.config.dispatch_interval_ms.max(1));
        let cleanup_every = Duration::from_secs(self.inner.config.cleanup_interval_secs.max(1));

        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let dispatch = tokio::spawn(async move {
            let mut ticker = interval(dispatch_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let started = this.tick().await;
                        if started > 0 {
                            debug!(started, "Dispatch pass");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let this = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let cleanup = tokio::spawn(async move {
            let mut ticker = interval(cleanup_every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => { this.cleanup_finished().await; }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        self.inner.handles.lock().await.extend([dispatch, cleanup]);
        info!(
            interval_ms = self.inner.config.dispatch_interval_ms,
            max_concurrent = self.inner.config.max_concurrent_tasks,
            "Task scheduler started"
        );
    }

    /// Stop the loops. Executing tasks are left to finish.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        let handles: Vec<_> = self.inner.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Task scheduler stopped");
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskSupervisor for TaskScheduler {
    async fn active_task_snapshots(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Executing))
            .map(ScheduledTask::snapshot)
            .collect()
    }

    async fn stop_task(&self, task_id: &str, reason: &str) -> OrchestrationResult<bool> {
        Ok(self.finish_externally(task_id, TaskStatus::Failed, reason).await)
    }
}
