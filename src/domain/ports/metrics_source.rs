//! Host resource readings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::OrchestrationResult;
use crate::domain::models::SystemMetric;

/// Point-in-time host readings, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// CPU usage across all cores.
    pub cpu_percent: f64,
    /// Used memory over total memory.
    pub memory_percent: f64,
}

impl SystemMetrics {
    /// Reading for one metric.
    pub const fn get(&self, metric: SystemMetric) -> f64 {
        match metric {
            SystemMetric::CpuPercent => self.cpu_percent,
            SystemMetric::MemoryPercent => self.memory_percent,
        }
    }
}

/// Source of host readings for resource rules.
#[async_trait]
pub trait SystemMetricsSource: Send + Sync {
    /// Take a fresh reading.
    async fn sample(&self) -> OrchestrationResult<SystemMetrics>;
}
