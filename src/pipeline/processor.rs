//! Conversation pipeline — drives one contact message from admission to
//! persistence.
//!
//! Flow per message:
//! 1. `InboundCoordinator::enqueue` (dedup, batching, overload shedding)
//! 2. `dequeue` under a processing lease
//! 3. `ResponseGenerator::generate`
//! 4. `OutboundDeliverer::send_response` (fallback text if it gives up)
//! 5. `PersistenceLedger::save_conversation` (write-behind)
//! 6. `mark_processing_complete`, then the next queued message

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::inbound::{DequeuedItem, EnqueueOutcome, InboundCoordinator, InboundMessage, QueueEvent};
use crate::ledger::{PersistenceLedger, SaveSkipReason};
use crate::outbound::OutboundDeliverer;
use crate::pipeline::responder::{GeneratedResponse, ResponseGenerator};
use crate::pipeline::stage::Stage;

/// What happened to one processed message.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeReport {
    pub contact_id: String,
    pub item_id: Uuid,
    /// `Sent`, `SendDuplicate` or `SendFailed`.
    pub send: Stage,
    /// The fallback text replaced the generated reply.
    pub fallback_used: bool,
    /// The ledger accepted the exchange for writing.
    pub persist_accepted: bool,
    /// Why the ledger turned the exchange away, when it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_skipped: Option<SaveSkipReason>,
}

/// Result of [`ConversationPipeline::handle`].
#[derive(Debug, Clone, Serialize)]
pub struct HandleOutcome {
    pub admission: EnqueueOutcome,
    /// Messages this call processed, oldest first. Empty when another
    /// consumer owns the contact or the message was held back.
    pub processed: Vec<ExchangeReport>,
}

/// Inbound-to-persisted glue over the three core components.
pub struct ConversationPipeline {
    coordinator: Arc<InboundCoordinator>,
    deliverer: Arc<OutboundDeliverer>,
    ledger: Arc<PersistenceLedger>,
    responder: Arc<dyn ResponseGenerator>,
    fallback_message: String,
}

impl ConversationPipeline {
    pub fn new(
        coordinator: Arc<InboundCoordinator>,
        deliverer: Arc<OutboundDeliverer>,
        ledger: Arc<PersistenceLedger>,
        responder: Arc<dyn ResponseGenerator>,
        fallback_message: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            deliverer,
            ledger,
            responder,
            fallback_message: fallback_message.into(),
        })
    }

    /// Admit a message and, if it was queued, process the contact's queue
    /// until it is empty or owned by someone else.
    pub async fn handle(&self, contact_id: &str, message: InboundMessage) -> HandleOutcome {
        let admission = self.coordinator.enqueue(contact_id, message).await;

        let processed = match &admission {
            EnqueueOutcome::Enqueued { item_id, .. } => {
                debug!(contact = contact_id, item = %item_id, stage = %Stage::Queued, "Message admitted");
                self.drain_contact(contact_id).await
            }
            EnqueueOutcome::Batched { batch_size } => {
                debug!(contact = contact_id, batch_size, stage = %Stage::Batched, "Message held for batching");
                Vec::new()
            }
            EnqueueOutcome::Duplicate { .. } => Vec::new(),
        };

        HandleOutcome {
            admission,
            processed,
        }
    }

    /// Process queued messages for one contact until `dequeue` comes back
    /// empty.
    pub async fn drain_contact(&self, contact_id: &str) -> Vec<ExchangeReport> {
        let mut reports = Vec::new();
        while let Some(dequeued) = self.coordinator.dequeue(contact_id).await {
            reports.push(self.process(&dequeued).await);
            self.coordinator
                .mark_processing_complete(contact_id, dequeued.lease)
                .await;
        }
        reports
    }

    async fn process(&self, dequeued: &DequeuedItem) -> ExchangeReport {
        let contact = dequeued.contact_id.as_str();
        let item = &dequeued.item;
        debug!(
            contact,
            item = %item.id,
            wait_ms = dequeued.wait_time.as_millis() as u64,
            stage = %Stage::Processing,
            "Processing message"
        );

        let (reply, mut fallback_used) = match self.responder.generate(contact, &item.message).await {
            Ok(reply) => (reply, false),
            Err(e) => {
                warn!(contact, item = %item.id, error = %e, "Response generation failed, using fallback");
                (GeneratedResponse::text(self.fallback_message.as_str()), true)
            }
        };
        debug!(contact, item = %item.id, stage = %Stage::ResponsePending, "Response ready");

        let send = match self
            .deliverer
            .send_response(contact, &reply.text, &reply.metadata)
            .await
        {
            Ok(outcome) if outcome.sent => Stage::Sent,
            Ok(_) => Stage::SendDuplicate,
            Err(e) => {
                error!(contact, item = %item.id, error = %e, stage = %Stage::SendFailed, "Response not delivered");
                if !fallback_used {
                    fallback_used = true;
                    self.send_fallback(contact, &reply.metadata).await;
                }
                Stage::SendFailed
            }
        };

        let bot_text = if fallback_used {
            self.fallback_message.as_str()
        } else {
            reply.text.as_str()
        };
        let metadata = serde_json::json!({
            "message_type": item.message.message_type,
            "item_id": item.id,
            "send": send.label(),
            "fallback": fallback_used,
            "wait_ms": dequeued.wait_time.as_millis() as u64,
        });
        let saved = self
            .ledger
            .save_conversation(contact, &item.message.text, bot_text, &metadata)
            .await;
        debug!(
            contact,
            item = %item.id,
            exchange = %saved.id,
            accepted = saved.saved,
            stage = %Stage::PersistPending,
            "Exchange handed to ledger"
        );

        info!(contact, item = %item.id, send = %send, fallback = fallback_used, "Message processed");

        ExchangeReport {
            contact_id: contact.to_string(),
            item_id: item.id,
            send,
            fallback_used,
            persist_accepted: saved.saved,
            persist_skipped: saved.reason,
        }
    }

    async fn send_fallback(&self, contact: &str, metadata: &serde_json::Value) {
        match self
            .deliverer
            .send_response(contact, &self.fallback_message, metadata)
            .await
        {
            Ok(_) => info!(contact, "Fallback message delivered"),
            Err(e) => error!(contact, error = %e, "Fallback message not delivered"),
        }
    }

    /// Drain contacts whose queues were filled outside `handle` (batch
    /// flushes) or whose consumer lost its lease.
    pub fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let mut events = self.coordinator.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(QueueEvent::Ready { contact_id })
                    | Ok(QueueEvent::LeaseReclaimed { contact_id }) => {
                        pipeline.spawn_drain(contact_id);
                    }
                    Ok(QueueEvent::Overflow { .. }) | Ok(QueueEvent::EmergencyFlush { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Queue event listener lagged, draining every queued contact");
                        for contact_id in pipeline.coordinator.queued_contacts().await {
                            pipeline.spawn_drain(contact_id);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_drain(self: &Arc<Self>, contact_id: String) {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let reports = pipeline.drain_contact(&contact_id).await;
            if !reports.is_empty() {
                debug!(contact = %contact_id, processed = reports.len(), "Drained after queue event");
            }
        });
    }
}
