//! Write-behind units and the outcome handed back to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::TurnRecord;

/// One processed exchange awaiting its write.
#[derive(Debug, Clone)]
pub struct PersistBundle {
    /// Exchange id; also the prefix of both turn ids.
    pub id: String,
    pub contact_id: String,
    pub user_text: String,
    pub bot_text: String,
    pub message_type: String,
    pub metadata: serde_json::Value,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl PersistBundle {
    /// The user turn and the bot turn, in that order. The exchange metadata
    /// rides on the bot turn.
    pub fn turns(&self) -> (TurnRecord, TurnRecord) {
        (
            TurnRecord::user(
                &self.id,
                &self.contact_id,
                &self.user_text,
                &self.message_type,
                self.created_at,
            ),
            TurnRecord::bot(
                &self.id,
                &self.contact_id,
                &self.bot_text,
                &self.message_type,
                self.created_at,
            )
            .with_metadata(self.metadata.clone()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveSkipReason {
    /// The same exchange is already waiting to be written.
    DuplicateBlocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    /// Accepted for write-behind. Not a durability guarantee.
    pub saved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SaveSkipReason>,
    pub id: String,
}

impl SaveOutcome {
    pub(crate) fn accepted(id: String) -> Self {
        Self {
            saved: true,
            reason: None,
            id,
        }
    }

    pub(crate) fn duplicate(id: String) -> Self {
        Self {
            saved: false,
            reason: Some(SaveSkipReason::DuplicateBlocked),
            id,
        }
    }
}

/// Ledger counters and gauges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerStats {
    pub queued: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub draining: bool,
    pub accepted: u64,
    pub duplicates_blocked: u64,
    pub persisted: u64,
    pub retries: u64,
    pub dropped: u64,
}
