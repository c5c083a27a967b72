//! Persistence ledger — write-behind, idempotent conversation storage.
//!
//! `save_conversation` only admits the exchange; a background drain writes
//! it through the `ConversationStore` in batches. Failed writes are retried a
//! bounded number of times and then dropped. Nothing here ever reaches the
//! caller as an error.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::bundle::{LedgerStats, PersistBundle, SaveOutcome};
use crate::clock::SharedClock;
use crate::config::LedgerConfig;
use crate::error::DatabaseError;
use crate::hashing;
use crate::store::ConversationStore;

#[derive(Default)]
struct LedgerState {
    queue: VecDeque<PersistBundle>,
    /// bundle id → admission sequence, so a stale expiry timer can't evict a
    /// newer admission of the same id.
    pending: HashMap<String, u64>,
    next_seq: u64,
    draining: bool,
    /// Bundles taken off the queue whose write hasn't settled yet.
    in_flight: usize,
    accepted: u64,
    duplicates_blocked: u64,
    persisted: u64,
    retries: u64,
    dropped: u64,
}

/// Write-behind persistence ledger.
pub struct PersistenceLedger {
    config: LedgerConfig,
    clock: SharedClock,
    store: Arc<dyn ConversationStore>,
    state: Mutex<LedgerState>,
    me: Weak<PersistenceLedger>,
}

impl PersistenceLedger {
    pub fn new(
        config: LedgerConfig,
        clock: SharedClock,
        store: Arc<dyn ConversationStore>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            clock,
            store,
            state: Mutex::new(LedgerState::default()),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Admit one exchange for writing.
    ///
    /// The same exchange (same contact, same leading text, same time bucket)
    /// admitted again while the first is still pending is refused with
    /// `DuplicateBlocked`.
    pub async fn save_conversation(
        &self,
        from: &str,
        user_message: &str,
        bot_response: &str,
        metadata: &serde_json::Value,
    ) -> SaveOutcome {
        let max = self.config.max_text_len;
        let contact_id = hashing::sanitize_text(from, max);
        let user_text = hashing::sanitize_text(user_message, max);
        let bot_text = hashing::sanitize_text(bot_response, max);

        let now = self.clock.now();
        let bucket = hashing::time_bucket(now, self.config.time_bucket);
        let id = hashing::exchange_id(
            &contact_id,
            &user_text,
            &bot_text,
            self.config.dedup_prefix_len,
            bucket,
        );

        let mut state = self.state.lock().await;
        if state.pending.contains_key(&id) {
            state.duplicates_blocked += 1;
            debug!(contact = %contact_id, id = %id, "Exchange already pending");
            return SaveOutcome::duplicate(id);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.insert(id.clone(), seq);
        state.accepted += 1;

        let message_type = metadata
            .get("message_type")
            .and_then(|v| v.as_str())
            .unwrap_or("text")
            .to_string();

        state.queue.push_back(PersistBundle {
            id: id.clone(),
            contact_id,
            user_text,
            bot_text,
            message_type,
            metadata: metadata.clone(),
            retry_count: 0,
            created_at: now,
        });

        self.schedule_pending_expiry(id.clone(), seq);
        self.kick_drain(&mut state);
        SaveOutcome::accepted(id)
    }

    /// Write everything queued, without pausing between batches, and wait
    /// for in-flight writes from the background drain to settle.
    /// Returns the number of bundles this call wrote or dropped.
    pub async fn force_process(&self) -> usize {
        let mut handled = 0;
        loop {
            let batch = self.take_batch().await;
            if batch.is_empty() {
                if self.state.lock().await.in_flight == 0 {
                    break;
                }
                tokio::time::sleep(self.config.batch_pause.max(std::time::Duration::from_millis(10)))
                    .await;
                continue;
            }
            handled += batch.len();
            self.write_batch(batch).await;
        }
        info!(handled, "Persistence queue force-processed");
        handled
    }

    /// Drop queued bundles and forget pending ids. In-flight writes finish.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.queue.len();
        state.queue.clear();
        state.pending.clear();
        warn!(cleared, "Persistence queue cleared");
        cleared
    }

    pub async fn stats(&self) -> LedgerStats {
        let state = self.state.lock().await;
        LedgerStats {
            queued: state.queue.len(),
            pending: state.pending.len(),
            in_flight: state.in_flight,
            draining: state.draining,
            accepted: state.accepted,
            duplicates_blocked: state.duplicates_blocked,
            persisted: state.persisted,
            retries: state.retries,
            dropped: state.dropped,
        }
    }

    fn schedule_pending_expiry(&self, id: String, seq: u64) {
        let me = self.me.clone();
        let ttl = self.config.pending_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(ledger) = me.upgrade() {
                let mut state = ledger.state.lock().await;
                if state.pending.get(&id) == Some(&seq) {
                    state.pending.remove(&id);
                }
            }
        });
    }

    /// Start the background drain unless one is already running.
    fn kick_drain(&self, state: &mut LedgerState) {
        if state.draining || state.queue.is_empty() {
            return;
        }
        let Some(ledger) = self.me.upgrade() else {
            return;
        };
        state.draining = true;
        tokio::spawn(async move {
            ledger.drain().await;
        });
    }

    async fn drain(&self) {
        loop {
            let batch = {
                let mut state = self.state.lock().await;
                if state.queue.is_empty() {
                    state.draining = false;
                    return;
                }
                self.take_locked(&mut state)
            };
            self.write_batch(batch).await;
            tokio::time::sleep(self.config.batch_pause).await;
        }
    }

    async fn take_batch(&self) -> Vec<PersistBundle> {
        let mut state = self.state.lock().await;
        self.take_locked(&mut state)
    }

    fn take_locked(&self, state: &mut LedgerState) -> Vec<PersistBundle> {
        let n = self.config.batch_size.min(state.queue.len());
        let batch: Vec<_> = state.queue.drain(..n).collect();
        state.in_flight += batch.len();
        batch
    }

    /// Write a batch concurrently, then settle each bundle: count it,
    /// requeue it for another attempt, or drop it.
    async fn write_batch(&self, batch: Vec<PersistBundle>) {
        let results = join_all(batch.iter().map(|bundle| self.write_bundle(bundle))).await;

        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(batch.len());

        for (mut bundle, result) in batch.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    state.persisted += 1;
                    debug!(contact = %bundle.contact_id, id = %bundle.id, "Exchange persisted");
                }
                Err(e) => {
                    bundle.retry_count += 1;
                    if bundle.retry_count <= self.config.max_retries {
                        state.retries += 1;
                        warn!(
                            contact = %bundle.contact_id,
                            id = %bundle.id,
                            retry = bundle.retry_count,
                            max_retries = self.config.max_retries,
                            error = %e,
                            "Persist failed, will retry"
                        );
                        state.queue.push_back(bundle);
                    } else {
                        state.dropped += 1;
                        error!(
                            contact = %bundle.contact_id,
                            id = %bundle.id,
                            attempts = bundle.retry_count,
                            error = %e,
                            "Persist failed permanently, dropping exchange"
                        );
                    }
                }
            }
        }

        self.kick_drain(&mut state);
    }

    async fn write_bundle(&self, bundle: &PersistBundle) -> Result<(), DatabaseError> {
        let (user, bot) = bundle.turns();
        futures::try_join!(self.store.save_turn(&user), self.store.save_turn(&bot))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::bundle::SaveSkipReason;
    use crate::store::{LibSqlBackend, TurnRecord};

    // ── Helpers ─────────────────────────────────────────────────────

    /// In-memory store. The first `fail_attempts` bundle writes fail, counted
    /// by user-turn writes since the user turn is always polled first. Can be
    /// gated shut.
    #[derive(Default)]
    struct StubStore {
        turns: StdMutex<HashMap<String, TurnRecord>>,
        calls: AtomicUsize,
        user_writes: AtomicUsize,
        fail_attempts: usize,
        gate: Option<Semaphore>,
    }

    impl StubStore {
        fn failing(fail_attempts: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_attempts,
                ..Default::default()
            })
        }

        fn gated() -> Arc<Self> {
            Arc::new(Self {
                gate: Some(Semaphore::new(0)),
                ..Default::default()
            })
        }

        fn open(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1_000);
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn user_writes(&self) -> usize {
            self.user_writes.load(Ordering::SeqCst)
        }

        fn stored(&self) -> usize {
            self.turns.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConversationStore for StubStore {
        async fn run_migrations(&self) -> Result<(), DatabaseError> {
            Ok(())
        }

        async fn save_turn(&self, turn: &TurnRecord) -> Result<bool, DatabaseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let attempt = if turn.is_from_bot {
                self.user_writes()
            } else {
                self.user_writes.fetch_add(1, Ordering::SeqCst) + 1
            };
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if attempt <= self.fail_attempts {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            let mut turns = self.turns.lock().unwrap();
            if turns.contains_key(&turn.id) {
                return Ok(false);
            }
            turns.insert(turn.id.clone(), turn.clone());
            Ok(true)
        }

        async fn list_turns(
            &self,
            contact_id: &str,
            _limit: usize,
        ) -> Result<Vec<TurnRecord>, DatabaseError> {
            Ok(self
                .turns
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.contact_id == contact_id)
                .cloned()
                .collect())
        }

        async fn count_turns(&self, contact_id: &str) -> Result<usize, DatabaseError> {
            Ok(self.list_turns(contact_id, usize::MAX).await?.len())
        }
    }

    fn ledger_with(store: Arc<dyn ConversationStore>, config: LedgerConfig) -> Arc<PersistenceLedger> {
        PersistenceLedger::new(config, ManualClock::fixed(), store)
    }

    // ── Admission ───────────────────────────────────────────────────

    #[tokio::test]
    async fn saved_exchange_lands_as_two_turns() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        let outcome = ledger
            .save_conversation("alice", "what time?", "3pm works", &json!({}))
            .await;
        assert!(outcome.saved);
        assert_eq!(outcome.reason, None);

        ledger.force_process().await;

        let turns = store.list_turns("alice", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].id, format!("{}:user", outcome.id));
        assert_eq!(turns[0].text, "what time?");
        assert_eq!(turns[1].id, format!("{}:bot", outcome.id));
        assert_eq!(turns[1].text, "3pm works");
        assert_eq!(ledger.stats().await.persisted, 1);
    }

    #[tokio::test]
    async fn pending_exchange_is_blocked() {
        let store = StubStore::gated();
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        let first = ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        let second = ledger.save_conversation("alice", "hi", "hello", &json!({})).await;

        assert!(first.saved);
        assert!(!second.saved);
        assert_eq!(second.reason, Some(SaveSkipReason::DuplicateBlocked));
        assert_eq!(first.id, second.id);

        store.open();
        ledger.force_process().await;
        assert_eq!(store.stored(), 2);
        assert_eq!(ledger.stats().await.duplicates_blocked, 1);
    }

    #[tokio::test]
    async fn texts_differing_past_the_prefix_share_an_id() {
        let store = StubStore::gated();
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        let head = "x".repeat(100);
        let a = ledger
            .save_conversation("alice", &format!("{head} one"), "ok", &json!({}))
            .await;
        let b = ledger
            .save_conversation("alice", &format!("{head} two"), "ok", &json!({}))
            .await;
        assert_eq!(a.id, b.id);
        assert!(!b.saved);
        store.open();
    }

    #[tokio::test(start_paused = true)]
    async fn pending_id_expires_after_ttl() {
        let store = StubStore::failing(0);
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        let first = ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        ledger.force_process().await;
        assert_eq!(ledger.stats().await.pending, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(ledger.stats().await.pending, 0);

        // Same clock bucket, so same id; the store write is idempotent.
        let again = ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        assert!(again.saved);
        assert_eq!(again.id, first.id);
        ledger.force_process().await;
        assert_eq!(store.stored(), 2);
    }

    #[tokio::test]
    async fn text_is_sanitized_before_storage() {
        let store = StubStore::failing(0);
        let config = LedgerConfig {
            max_text_len: 10,
            ..LedgerConfig::default()
        };
        let ledger = ledger_with(store.clone(), config);

        ledger
            .save_conversation("alice", "he\u{0}llo\u{7}\tworld, long text", "ok\r\n", &json!({}))
            .await;
        ledger.force_process().await;

        let turns = store.list_turns("alice", 10).await.unwrap();
        let user = turns.iter().find(|t| !t.is_from_bot).unwrap();
        let bot = turns.iter().find(|t| t.is_from_bot).unwrap();
        assert_eq!(user.text, "hello\tworl");
        assert_eq!(bot.text, "ok");
    }

    #[tokio::test]
    async fn message_type_comes_from_metadata() {
        let store = StubStore::failing(0);
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        ledger
            .save_conversation("alice", "[photo]", "nice", &json!({"message_type": "image"}))
            .await;
        ledger.force_process().await;

        let turns = store.list_turns("alice", 10).await.unwrap();
        assert!(turns.iter().all(|t| t.message_type == "image"));
    }

    #[tokio::test]
    async fn exchange_metadata_is_stored_on_the_bot_turn() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        ledger
            .save_conversation(
                "alice",
                "hi",
                "Sorry, something went wrong.",
                &json!({"send": "send_failed", "fallback": true}),
            )
            .await;
        ledger.force_process().await;

        let turns = store.list_turns("alice", 10).await.unwrap();
        assert_eq!(turns[0].metadata, json!({}));
        assert_eq!(turns[1].metadata["send"], "send_failed");
        assert_eq!(turns[1].metadata["fallback"], true);
    }

    // ── Retry ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let store = StubStore::failing(1);
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        ledger.force_process().await;

        let stats = ledger.stats().await;
        assert_eq!(stats.persisted, 1);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(store.stored(), 2);
    }

    #[tokio::test]
    async fn bundle_dropped_after_initial_attempt_plus_three_retries() {
        let store = StubStore::failing(usize::MAX);
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        ledger.force_process().await;

        let stats = ledger.stats().await;
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.persisted, 0);
        assert_eq!(stats.queued, 0);
        assert_eq!(store.user_writes(), 4);
    }

    #[tokio::test]
    async fn one_failing_bundle_does_not_block_the_batch() {
        let store = StubStore::failing(1);
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        for i in 0..5 {
            ledger
                .save_conversation("alice", &format!("msg {i}"), "ok", &json!({}))
                .await;
        }
        ledger.force_process().await;

        let stats = ledger.stats().await;
        assert_eq!(stats.persisted, 5);
        assert_eq!(stats.dropped, 0);
        assert_eq!(store.stored(), 10);
    }

    // ── Drain ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn background_drain_writes_without_force() {
        let store = StubStore::failing(0);
        let ledger = ledger_with(store.clone(), LedgerConfig::default());

        ledger.save_conversation("alice", "hi", "hello", &json!({})).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.stored() < 2 || ledger.stats().await.draining {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("drain should finish");

        assert_eq!(ledger.stats().await.persisted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_pulls_in_batches() {
        let store = StubStore::failing(0);
        let config = LedgerConfig {
            batch_size: 2,
            batch_pause: Duration::from_millis(100),
            ..LedgerConfig::default()
        };
        let ledger = ledger_with(store.clone(), config);

        for i in 0..5 {
            ledger
                .save_conversation("alice", &format!("msg {i}"), "ok", &json!({}))
                .await;
        }

        // First batch written right away, the rest wait on the pause.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.stored(), 4);
        assert_eq!(ledger.stats().await.queued, 3);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.stored(), 10);
        assert!(!ledger.stats().await.draining);
    }

    #[tokio::test]
    async fn clear_drops_queued_bundles() {
        let store = StubStore::gated();
        let config = LedgerConfig {
            batch_size: 1,
            ..LedgerConfig::default()
        };
        let ledger = ledger_with(store.clone(), config);

        ledger.save_conversation("alice", "first", "ok", &json!({})).await;
        ledger.save_conversation("alice", "second", "ok", &json!({})).await;
        while store.calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(ledger.clear().await, 1);
        assert_eq!(ledger.stats().await.pending, 0);

        store.open();
        ledger.force_process().await;
        assert_eq!(store.stored(), 2);
        assert_eq!(ledger.stats().await.persisted, 1);
    }
}
