//! `ConversationStore` trait: the narrow async interface the ledger writes
//! through.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// One side of an exchange as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnRecord {
    /// `<bundle id>:user` or `<bundle id>:bot`.
    pub id: String,
    pub contact_id: String,
    pub text: String,
    pub is_from_bot: bool,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form JSON object; `{}` when nothing was attached.
    pub metadata: serde_json::Value,
}

impl TurnRecord {
    pub fn user(
        bundle_id: &str,
        contact_id: &str,
        text: &str,
        message_type: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{bundle_id}:user"),
            contact_id: contact_id.to_string(),
            text: text.to_string(),
            is_from_bot: false,
            message_type: message_type.to_string(),
            timestamp,
            metadata: serde_json::json!({}),
        }
    }

    pub fn bot(
        bundle_id: &str,
        contact_id: &str,
        text: &str,
        message_type: &str,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("{bundle_id}:bot"),
            contact_id: contact_id.to_string(),
            text: text.to_string(),
            is_from_bot: true,
            message_type: message_type.to_string(),
            timestamp,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        if !metadata.is_null() {
            self.metadata = metadata;
        }
        self
    }
}

/// Backend-agnostic conversation store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert a turn. Writing an id that already exists is a no-op;
    /// returns whether a row was inserted.
    async fn save_turn(&self, turn: &TurnRecord) -> Result<bool, DatabaseError>;

    /// Turns for a contact, oldest first, up to `limit`.
    async fn list_turns(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<TurnRecord>, DatabaseError>;

    /// Number of stored turns for a contact.
    async fn count_turns(&self, contact_id: &str) -> Result<usize, DatabaseError>;
}
