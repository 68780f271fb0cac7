//! Digest delivery-handoff persistence (§4.5 "Delivery handoff"). A narrow
//! collaborator interface, the same shape as `AiProvider`/`Store`: the
//! `ToolLoop` only needs to hand a rendered digest body to somewhere
//! external and learn whether that succeeded, not how it got there.

use async_trait::async_trait;

#[async_trait]
pub trait DeliveryOutbox: Send + Sync {
    /// Persists a rendered digest body for `(channel, conversation_type)`.
    /// Returns a record identifier/path on success.
    async fn persist(
        &self,
        channel: &str,
        conversation_type: &str,
        body: &str,
    ) -> Result<String, String>;
}

/// Default outbox for deployments that haven't wired a real destination.
/// Always reports failure so the loop records `delivery_record_status =
/// skipped` rather than silently pretending to deliver.
pub struct NullDeliveryOutbox;

#[async_trait]
impl DeliveryOutbox for NullDeliveryOutbox {
    async fn persist(&self, _channel: &str, _conversation_type: &str, _body: &str) -> Result<String, String> {
        Err("no delivery outbox configured".to_string())
    }
}
