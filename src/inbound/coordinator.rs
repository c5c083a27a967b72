//! Inbound coordinator — per-contact FIFO admission with duplicate
//! suppression, burst batching and overload shedding.
//!
//! All mutable state lives behind one async mutex, so every operation is
//! atomic with respect to every other. Processing ownership is delegated to
//! a [`LockProvider`] lease; the coordinator only remembers which token it
//! handed out per contact.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::lock::{LeaseToken, LockProvider};
use super::model::{
    CoordinatorStats, DequeuedItem, EnqueueOutcome, InboundMessage, QueueEvent, QueueItem,
};
use crate::clock::{self, SharedClock};
use crate::config::CoordinatorConfig;
use crate::hashing;

/// Event channel capacity.
const EVENT_CAPACITY: usize = 256;

/// One contact's ordered stream.
struct ConversationQueue {
    items: VecDeque<QueueItem>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl ConversationQueue {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            items: VecDeque::new(),
            created_at: now,
            last_activity: now,
        }
    }
}

/// Payloads held back while a contact is over the rate threshold.
struct Batch {
    messages: Vec<InboundMessage>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// What caused a batch to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timeout,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    duplicates: u64,
    batched: u64,
    overflow_evictions: u64,
    emergency_flushes: u64,
    reclaimed_leases: u64,
}

#[derive(Default)]
struct CoordinatorState {
    queues: HashMap<String, ConversationQueue>,
    /// contact → content hash → recorded at.
    duplicates: HashMap<String, HashMap<String, DateTime<Utc>>>,
    /// contact → admission timestamps inside the rate window.
    rates: HashMap<String, VecDeque<DateTime<Utc>>>,
    batches: HashMap<String, Batch>,
    /// contact → lease currently handed out. Survives queue flushes so the
    /// consumer can still release it.
    leases: HashMap<String, LeaseToken>,
    next_generation: u64,
    counters: Counters,
}

impl CoordinatorState {
    fn is_duplicate(
        &self,
        contact_id: &str,
        hash: &str,
        now: DateTime<Utc>,
        window: std::time::Duration,
    ) -> bool {
        self.duplicates
            .get(contact_id)
            .and_then(|seen| seen.get(hash))
            .is_some_and(|at| clock::elapsed(now, *at) < window)
    }

    /// Admissions for `contact_id` inside the trailing window, pruning older ones.
    fn recent_rate(
        &mut self,
        contact_id: &str,
        now: DateTime<Utc>,
        window: std::time::Duration,
    ) -> usize {
        let Some(samples) = self.rates.get_mut(contact_id) else {
            return 0;
        };
        while let Some(front) = samples.front() {
            if clock::elapsed(now, *front) >= window {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.len()
    }

    /// Drop every queue and pending batch. Leases are kept.
    fn discard_all(&mut self) -> usize {
        let mut discarded: usize = self.queues.values().map(|q| q.items.len()).sum();
        for (_, batch) in self.batches.drain() {
            discarded += batch.messages.len();
            if let Some(timer) = batch.timer {
                timer.abort();
            }
        }
        self.queues.clear();
        discarded
    }
}

/// Inbound coordinator.
pub struct InboundCoordinator {
    config: CoordinatorConfig,
    clock: SharedClock,
    locks: Arc<dyn LockProvider>,
    state: Mutex<CoordinatorState>,
    events: broadcast::Sender<QueueEvent>,
    /// Handle to ourselves for batch timers.
    me: Weak<InboundCoordinator>,
}

impl InboundCoordinator {
    /// Create a coordinator.
    pub fn new(
        config: CoordinatorConfig,
        clock: SharedClock,
        locks: Arc<dyn LockProvider>,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Arc::new_cyclic(|me| Self {
            config,
            clock,
            locks,
            state: Mutex::new(CoordinatorState::default()),
            events,
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Subscribe to queue events (batch flushes, overflow, reclaim).
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // Ok if nobody is listening
        let _ = self.events.send(event);
    }

    /// Admit a message for `contact_id`.
    pub async fn enqueue(&self, contact_id: &str, message: InboundMessage) -> EnqueueOutcome {
        let now = self.clock.now();
        let hash = hashing::inbound_hash(&message.text, &message.message_type);
        let mut state = self.state.lock().await;

        if state.is_duplicate(contact_id, &hash, now, self.config.duplicate_window) {
            state.counters.duplicates += 1;
            debug!(contact = contact_id, hash = %hash, "Duplicate inbound message suppressed");
            return EnqueueOutcome::Duplicate { content_hash: hash };
        }

        state
            .duplicates
            .entry(contact_id.to_string())
            .or_default()
            .insert(hash.clone(), now);

        let rate = state.recent_rate(contact_id, now, self.config.rate_window);
        state
            .rates
            .entry(contact_id.to_string())
            .or_default()
            .push_back(now);

        // Once a batch is open everything joins it, otherwise a message could
        // overtake the batch and break FIFO order.
        let batch_open = state.batches.contains_key(contact_id);
        if batch_open || rate >= self.config.batch_threshold {
            return self.add_to_batch(&mut state, contact_id, message);
        }

        self.push_item(&mut state, contact_id, message, hash, now)
    }

    /// Append to the contact's batch, arming or firing its flush.
    fn add_to_batch(
        &self,
        state: &mut CoordinatorState,
        contact_id: &str,
        message: InboundMessage,
    ) -> EnqueueOutcome {
        state.counters.batched += 1;

        if !state.batches.contains_key(contact_id) {
            state.next_generation += 1;
            let generation = state.next_generation;
            let timer = self.arm_batch_timer(contact_id.to_string(), generation);
            state.batches.insert(
                contact_id.to_string(),
                Batch {
                    messages: Vec::new(),
                    generation,
                    timer: Some(timer),
                },
            );
            debug!(contact = contact_id, generation, "Batch opened");
        }

        let (batch_size, generation) = match state.batches.get_mut(contact_id) {
            Some(batch) => {
                batch.messages.push(message);
                (batch.messages.len(), batch.generation)
            }
            None => (0, 0),
        };

        if batch_size >= self.config.batch_max_size {
            self.flush_batch_locked(state, contact_id, generation, FlushTrigger::Size);
        }

        EnqueueOutcome::Batched { batch_size }
    }

    fn arm_batch_timer(&self, contact_id: String, generation: u64) -> JoinHandle<()> {
        let me = self.me.clone();
        let timeout = self.config.batch_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(coordinator) = me.upgrade() {
                coordinator.flush_batch(&contact_id, generation).await;
            }
        })
    }

    /// Timer-driven flush.
    async fn flush_batch(&self, contact_id: &str, generation: u64) {
        let mut state = self.state.lock().await;
        self.flush_batch_locked(&mut state, contact_id, generation, FlushTrigger::Timeout);
    }

    /// Turn a batch into a single queue item. A stale generation is ignored.
    fn flush_batch_locked(
        &self,
        state: &mut CoordinatorState,
        contact_id: &str,
        generation: u64,
        trigger: FlushTrigger,
    ) {
        if state
            .batches
            .get(contact_id)
            .is_none_or(|b| b.generation != generation)
        {
            return;
        }
        let Some(mut batch) = state.batches.remove(contact_id) else {
            return;
        };

        if let Some(timer) = batch.timer.take() {
            // The timer task must not abort itself mid-flush
            if trigger == FlushTrigger::Size {
                timer.abort();
            }
        }

        if batch.messages.is_empty() {
            return;
        }

        let count = batch.messages.len();
        let combined = InboundMessage::combine(batch.messages);
        let hash = hashing::inbound_hash(&combined.text, &combined.message_type);
        let now = self.clock.now();

        info!(contact = contact_id, count, trigger = ?trigger, "Flushing batch into queue");
        self.push_item(state, contact_id, combined, hash, now);
        self.emit(QueueEvent::Ready {
            contact_id: contact_id.to_string(),
        });
    }

    /// Push onto the queue tail, enforcing the contact and length ceilings.
    fn push_item(
        &self,
        state: &mut CoordinatorState,
        contact_id: &str,
        message: InboundMessage,
        content_hash: String,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        if !state.queues.contains_key(contact_id) && state.queues.len() >= self.config.max_contacts
        {
            let discarded = state.discard_all();
            state.counters.emergency_flushes += 1;
            warn!(
                max_contacts = self.config.max_contacts,
                discarded, "Live contact ceiling reached, flushing all queues"
            );
            self.emit(QueueEvent::EmergencyFlush { discarded });
        }

        let queue = state
            .queues
            .entry(contact_id.to_string())
            .or_insert_with(|| ConversationQueue::new(now));

        let mut overflowed = false;
        let mut evicted_id = None;
        if queue.items.len() >= self.config.max_queue_size
            && let Some(evicted) = queue.items.pop_front()
        {
            overflowed = true;
            evicted_id = Some(evicted.id);
        }

        let item = QueueItem {
            id: Uuid::new_v4(),
            message,
            enqueued_at: now,
            content_hash,
            attempts: 0,
        };
        let item_id = item.id;
        queue.items.push_back(item);
        queue.last_activity = now;
        let queue_len = queue.items.len();

        state.counters.enqueued += 1;
        if let Some(evicted) = evicted_id {
            state.counters.overflow_evictions += 1;
            warn!(
                contact = contact_id,
                evicted = %evicted,
                max = self.config.max_queue_size,
                "Queue overflow, evicted oldest item"
            );
            self.emit(QueueEvent::Overflow {
                contact_id: contact_id.to_string(),
                evicted,
            });
        }

        debug!(contact = contact_id, item = %item_id, queue_len, "Message enqueued");
        EnqueueOutcome::Enqueued {
            item_id,
            position: queue_len,
            queue_len,
            overflowed,
        }
    }

    /// Take the head of the contact's queue and lease the contact.
    ///
    /// Returns `None` if there is nothing to do or another consumer holds a
    /// live lease. The caller must call [`Self::mark_processing_complete`];
    /// if it never does, the lease expires and is reclaimed.
    pub async fn dequeue(&self, contact_id: &str) -> Option<DequeuedItem> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.queues.get(contact_id).is_none_or(|q| q.items.is_empty()) {
            return None;
        }

        if state.leases.contains_key(contact_id) {
            if self.locks.is_held(contact_id).await {
                debug!(contact = contact_id, "Contact busy, dequeue deferred");
                return None;
            }
            self.reclaim_locked(&mut state, contact_id);
        }

        let lease = self
            .locks
            .try_acquire(contact_id, self.config.processing_lease_ttl)
            .await?;

        let Some(queue) = state.queues.get_mut(contact_id) else {
            self.locks.release(contact_id, lease).await;
            return None;
        };
        let Some(mut item) = queue.items.pop_front() else {
            self.locks.release(contact_id, lease).await;
            return None;
        };
        item.attempts += 1;
        queue.last_activity = now;
        state.leases.insert(contact_id.to_string(), lease);

        let wait_time = clock::elapsed(now, item.enqueued_at);
        debug!(
            contact = contact_id,
            item = %item.id,
            wait_ms = wait_time.as_millis() as u64,
            "Message dequeued"
        );

        Some(DequeuedItem {
            contact_id: contact_id.to_string(),
            item,
            wait_time,
            lease,
        })
    }

    /// Release the contact's processing lease if `lease` is still the one
    /// handed out. A consumer whose lease was reclaimed gets `false` and
    /// leaves the current holder alone.
    pub async fn mark_processing_complete(&self, contact_id: &str, lease: LeaseToken) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        match state.leases.get(contact_id) {
            Some(current) if *current == lease => {}
            Some(_) => {
                warn!(contact = contact_id, lease = %lease, "Stale completion ignored, lease taken over");
                return false;
            }
            None => {
                debug!(contact = contact_id, lease = %lease, "Completion reported without a lease");
                return false;
            }
        }
        state.leases.remove(contact_id);
        if !self.locks.release(contact_id, lease).await {
            warn!(contact = contact_id, "Lease already expired at completion");
        }
        if let Some(queue) = state.queues.get_mut(contact_id) {
            queue.last_activity = now;
        }
        true
    }

    fn reclaim_locked(&self, state: &mut CoordinatorState, contact_id: &str) {
        if state.leases.remove(contact_id).is_some() {
            state.counters.reclaimed_leases += 1;
            warn!(contact = contact_id, "Processing lease expired, reclaimed");
            self.emit(QueueEvent::LeaseReclaimed {
                contact_id: contact_id.to_string(),
            });
        }
    }

    /// Discard one contact's queue and pending batch.
    pub async fn flush_queue(&self, contact_id: &str) -> usize {
        let mut state = self.state.lock().await;
        let mut discarded = state
            .queues
            .remove(contact_id)
            .map(|q| q.items.len())
            .unwrap_or(0);
        if let Some(batch) = state.batches.remove(contact_id) {
            discarded += batch.messages.len();
            if let Some(timer) = batch.timer {
                timer.abort();
            }
        }
        info!(contact = contact_id, discarded, "Queue flushed");
        discarded
    }

    /// Discard every queue and pending batch.
    pub async fn emergency_flush_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let discarded = state.discard_all();
        state.counters.emergency_flushes += 1;
        warn!(discarded, "Emergency flush of all queues");
        self.emit(QueueEvent::EmergencyFlush { discarded });
        discarded
    }

    /// Remove queues that are empty, idle and not being processed.
    pub async fn sweep_idle_queues(&self) -> usize {
        let now = self.clock.now();
        let idle_after = self.config.inactivity_timeout;
        let mut state = self.state.lock().await;
        let CoordinatorState {
            queues,
            leases,
            batches,
            ..
        } = &mut *state;

        let before = queues.len();
        queues.retain(|contact, queue| {
            let idle = clock::elapsed(now, queue.last_activity) >= idle_after;
            let removable = queue.items.is_empty()
                && idle
                && !leases.contains_key(contact)
                && !batches.contains_key(contact);
            if removable {
                debug!(
                    contact = %contact,
                    age_secs = clock::elapsed(now, queue.created_at).as_secs(),
                    "Idle queue removed"
                );
            }
            !removable
        });
        let removed = before - queues.len();
        if removed > 0 {
            info!(removed, "Swept idle queues");
        }
        removed
    }

    /// Expire duplicate records and stale rate samples.
    pub async fn purge_expired_duplicates(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.duplicate_window;
        let rate_window = self.config.rate_window;
        let mut state = self.state.lock().await;

        let mut purged = 0;
        state.duplicates.retain(|_, seen| {
            let before = seen.len();
            seen.retain(|_, at| clock::elapsed(now, *at) < window);
            purged += before - seen.len();
            !seen.is_empty()
        });
        state.rates.retain(|_, samples| {
            samples.retain(|at| clock::elapsed(now, *at) < rate_window);
            !samples.is_empty()
        });

        if purged > 0 {
            debug!(purged, "Purged expired duplicate records");
        }
        purged
    }

    /// Drop leases whose expiry passed without a completion report.
    pub async fn reclaim_expired_leases(&self) -> usize {
        let mut state = self.state.lock().await;
        let contacts: Vec<String> = state.leases.keys().cloned().collect();

        let mut reclaimed = 0;
        for contact in contacts {
            if !self.locks.is_held(&contact).await {
                self.reclaim_locked(&mut state, &contact);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Number of items queued for a contact.
    pub async fn queue_len(&self, contact_id: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(contact_id)
            .map(|q| q.items.len())
            .unwrap_or(0)
    }

    /// Contacts with at least one queued item.
    pub async fn queued_contacts(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .queues
            .iter()
            .filter(|(_, q)| !q.items.is_empty())
            .map(|(contact, _)| contact.clone())
            .collect()
    }

    /// Whether a consumer currently holds the contact's lease.
    pub async fn is_processing(&self, contact_id: &str) -> bool {
        self.state.lock().await.leases.contains_key(contact_id)
    }

    pub async fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock().await;
        CoordinatorStats {
            active_queues: state.queues.len(),
            total_queued: state.queues.values().map(|q| q.items.len()).sum(),
            processing: state.leases.len(),
            pending_batches: state.batches.len(),
            batched_messages: state.batches.values().map(|b| b.messages.len()).sum(),
            tracked_hashes: state.duplicates.values().map(|m| m.len()).sum(),
            enqueued_total: state.counters.enqueued,
            duplicates_total: state.counters.duplicates,
            batched_total: state.counters.batched,
            overflow_evictions: state.counters.overflow_evictions,
            emergency_flushes: state.counters.emergency_flushes,
            reclaimed_leases: state.counters.reclaimed_leases,
        }
    }
}
