//! Executors that run task bodies, keyed by task type.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::models::{ResultMap, ScheduledTask};

/// Failure reported by a task executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The task body ran and failed.
    #[error("Executor failed: {0}")]
    Failed(String),

    /// Nothing can run this task type.
    #[error("No executor registered for task type '{0}'")]
    Unsupported(String),
}

/// Runs the body of one kind of task.
///
/// Implementations must tolerate concurrent calls for distinct tasks and
/// must not block indefinitely; timeouts are enforced by the caller.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task body and return its output.
    async fn execute(&self, task: &ScheduledTask) -> Result<ResultMap, ExecutorError>;
}

/// Executors keyed by task type, with an optional fallback.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
    fallback: Option<Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_executor(mut self, task_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(task_type, executor);
        self
    }

    /// Executor used for task types with no registration.
    #[must_use]
    pub fn with_fallback(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    /// Register `executor` for `task_type`, replacing any earlier one.
    pub fn register(&mut self, task_type: impl Into<String>, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(task_type.into(), executor);
    }

    /// Executor for `task_type`, falling back when unregistered.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors
            .get(task_type)
            .cloned()
            .or_else(|| self.fallback.clone())
    }

    /// Whether some executor would run `task_type`.
    pub fn supports(&self, task_type: &str) -> bool {
        self.fallback.is_some() || self.executors.contains_key(task_type)
    }

    /// Run `task` with the executor registered for its type.
    pub async fn execute(&self, task: &ScheduledTask) -> Result<ResultMap, ExecutorError> {
        match self.get(&task.task_type) {
            Some(executor) => executor.execute(task).await,
            None => Err(ExecutorError::Unsupported(task.task_type.clone())),
        }
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.executors.keys().collect();
        types.sort();
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &types)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
