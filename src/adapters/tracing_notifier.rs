//! Notification sink that writes alerts to the log.

use async_trait::async_trait;
use tracing::error;

use crate::domain::errors::OrchestrationResult;
use crate::domain::ports::NotificationSink;

/// Logs each notification at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

impl TracingNotificationSink {
    /// New sink.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, target: &str, payload: &serde_json::Value) -> OrchestrationResult<()> {
        error!(target = %target, payload = %payload, "Emergency notification");
        Ok(())
    }
}
