//! Inbound data model: payloads, queue items, admission outcomes, stats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lock::LeaseToken;

/// Default message type when a channel does not specify one.
pub const DEFAULT_MESSAGE_TYPE: &str = "text";

/// Normalized inbound payload.
///
/// Channel adapters convert their native event into this before admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Message body.
    pub text: String,
    /// Kind of message: "text", "audio", "image", ...
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// Channel-specific metadata, passed through untouched.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Provider timestamp. Never part of the dedup hash.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_message_type() -> String {
    DEFAULT_MESSAGE_TYPE.to_string()
}

impl InboundMessage {
    /// Plain text message with empty metadata.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            message_type: default_message_type(),
            metadata: serde_json::Value::Null,
            timestamp: None,
        }
    }

    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = message_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Merge several payloads into one unit, preserving arrival order.
    pub(crate) fn combine(messages: Vec<InboundMessage>) -> Self {
        let count = messages.len();
        let message_type = messages
            .first()
            .map(|m| m.message_type.clone())
            .unwrap_or_else(default_message_type);
        let timestamp = messages.first().and_then(|m| m.timestamp);
        let text = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let parts: Vec<serde_json::Value> =
            messages.into_iter().map(|m| m.metadata).collect();

        Self {
            text,
            message_type,
            metadata: serde_json::json!({
                "batched": true,
                "batched_count": count,
                "parts": parts,
            }),
            timestamp,
        }
    }
}

/// One admitted unit of work in a contact's queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub message: InboundMessage,
    pub enqueued_at: DateTime<Utc>,
    pub content_hash: String,
    /// Times this item has been handed to a consumer.
    pub attempts: u32,
}

/// Result of admitting a message. None of these are errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// Appended to the contact's FIFO queue.
    Enqueued {
        item_id: Uuid,
        /// 1-based position in the queue after insertion.
        position: usize,
        queue_len: usize,
        /// The oldest item was evicted to make room.
        overflowed: bool,
    },
    /// Seen within the duplicate window; nothing happened.
    Duplicate { content_hash: String },
    /// Held in the contact's batch accumulator.
    Batched { batch_size: usize },
}

impl EnqueueOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Duplicate { .. } => "duplicate",
            Self::Batched { .. } => "batched",
        }
    }
}

/// An item handed to a consumer, together with the lease it must release.
#[derive(Debug, Clone)]
pub struct DequeuedItem {
    pub contact_id: String,
    pub item: QueueItem,
    /// Time spent queued.
    pub wait_time: Duration,
    pub lease: LeaseToken,
}

/// Signals emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// Work landed in a queue outside a caller's `enqueue` (batch flush).
    Ready { contact_id: String },
    /// The oldest item was evicted from a full queue.
    Overflow { contact_id: String, evicted: Uuid },
    /// Every queue was discarded.
    EmergencyFlush { discarded: usize },
    /// An expired processing lease was reclaimed.
    LeaseReclaimed { contact_id: String },
}

/// Snapshot for the admin surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub active_queues: usize,
    pub total_queued: usize,
    pub processing: usize,
    pub pending_batches: usize,
    pub batched_messages: usize,
    pub tracked_hashes: usize,
    pub enqueued_total: u64,
    pub duplicates_total: u64,
    pub batched_total: u64,
    pub overflow_evictions: u64,
    pub emergency_flushes: u64,
    pub reclaimed_leases: u64,
}
