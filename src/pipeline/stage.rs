//! Lifecycle stages of one contact message, for logs and reports.

use serde::Serialize;

/// Where a message is in its lifecycle.
///
/// IDLE → ADMITTED → QUEUED → [BATCHED → FLUSHED → QUEUED] → PROCESSING →
/// RESPONSE_PENDING → SENT | SEND_DUPLICATE | SEND_FAILED → PERSIST_PENDING →
/// PERSISTED | PERSIST_DROPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Admitted,
    Queued,
    Batched,
    Flushed,
    Processing,
    ResponsePending,
    Sent,
    SendDuplicate,
    SendFailed,
    PersistPending,
    Persisted,
    PersistDropped,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Admitted => "admitted",
            Self::Queued => "queued",
            Self::Batched => "batched",
            Self::Flushed => "flushed",
            Self::Processing => "processing",
            Self::ResponsePending => "response_pending",
            Self::Sent => "sent",
            Self::SendDuplicate => "send_duplicate",
            Self::SendFailed => "send_failed",
            Self::PersistPending => "persist_pending",
            Self::Persisted => "persisted",
            Self::PersistDropped => "persist_dropped",
        }
    }

    /// Outcome stages of the send step.
    pub fn is_send_outcome(&self) -> bool {
        matches!(self, Self::Sent | Self::SendDuplicate | Self::SendFailed)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_matches_serde_name() {
        for stage in [Stage::Idle, Stage::ResponsePending, Stage::SendDuplicate, Stage::PersistDropped] {
            let json = serde_json::to_value(stage).unwrap();
            assert_eq!(json, stage.label());
        }
    }

    #[test]
    fn send_outcomes() {
        assert!(Stage::Sent.is_send_outcome());
        assert!(Stage::SendFailed.is_send_outcome());
        assert!(!Stage::PersistPending.is_send_outcome());
    }
}
