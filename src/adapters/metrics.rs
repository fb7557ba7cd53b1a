//! System metrics sources.

use async_trait::async_trait;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::RwLock;

use crate::domain::errors::OrchestrationResult;
use crate::domain::ports::{SystemMetrics, SystemMetricsSource};

/// Returns whatever reading was last set. Used to inject conditions.
#[derive(Debug, Clone, Default)]
pub struct FixedMetricsSource {
    reading: Arc<RwLock<SystemMetrics>>,
}

impl FixedMetricsSource {
    /// Source that returns `reading` until changed.
    pub fn new(reading: SystemMetrics) -> Self {
        Self {
            reading: Arc::new(RwLock::new(reading)),
        }
    }

    /// Replace the reading.
    pub async fn set(&self, reading: SystemMetrics) {
        *self.reading.write().await = reading;
    }
}

#[async_trait]
impl SystemMetricsSource for FixedMetricsSource {
    async fn sample(&self) -> OrchestrationResult<SystemMetrics> {
        Ok(*self.reading.read().await)
    }
}

/// Host CPU and memory usage via `sysinfo`.
pub struct SysinfoMetricsSource {
    system: RwLock<System>,
}

impl std::fmt::Debug for SysinfoMetricsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoMetricsSource").finish_non_exhaustive()
    }
}

impl Default for SysinfoMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoMetricsSource {
    /// Source with CPU and memory refresh enabled.
    pub fn new() -> Self {
        let refresh_kind = RefreshKind::new()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());
        Self {
            system: RwLock::new(System::new_with_specifics(refresh_kind)),
        }
    }
}

#[async_trait]
impl SystemMetricsSource for SysinfoMetricsSource {
    async fn sample(&self) -> OrchestrationResult<SystemMetrics> {
        let mut sys = self.system.write().await;
        sys.refresh_cpu_all();
        sys.refresh_memory();

        let total = sys.total_memory();
        #[allow(clippy::cast_precision_loss)]
        let memory_percent = if total == 0 {
            0.0
        } else {
            sys.used_memory() as f64 / total as f64 * 100.0
        };
        Ok(SystemMetrics {
            cpu_percent: f64::from(sys.global_cpu_usage()),
            memory_percent,
        })
    }
}
