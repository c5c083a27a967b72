//! Transport abstraction: the wire that actually carries a response.

use async_trait::async_trait;

use crate::error::DeliveryError;

/// Delivers one response to one recipient. Implementations do a single
/// attempt; retry, timeout and dedup belong to the deliverer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs.
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        to: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), DeliveryError>;
}
