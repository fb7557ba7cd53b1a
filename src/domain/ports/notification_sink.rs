//! Outbound notification port.

use async_trait::async_trait;

use crate::domain::errors::OrchestrationResult;

/// Delivery channel for emergency notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver `payload` to `target`.
    async fn notify(&self, target: &str, payload: &serde_json::Value) -> OrchestrationResult<()>;
}
