//! Response generation seam.

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::inbound::InboundMessage;

/// A generated reply plus whatever the transport should see with it.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedResponse {
    pub text: String,
    pub metadata: serde_json::Value,
}

impl GeneratedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Produces the reply for one dequeued message.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        contact_id: &str,
        message: &InboundMessage,
    ) -> Result<GeneratedResponse, PipelineError>;
}

/// Replies with the message text. Used by the binary when no generator is
/// wired in.
pub struct EchoResponder;

#[async_trait]
impl ResponseGenerator for EchoResponder {
    async fn generate(
        &self,
        _contact_id: &str,
        message: &InboundMessage,
    ) -> Result<GeneratedResponse, PipelineError> {
        if message.text.trim().is_empty() {
            return Err(PipelineError::Generation("empty message".into()));
        }
        Ok(GeneratedResponse::text(format!("You said: {}", message.text)))
    }
}
