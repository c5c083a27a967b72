//! Outbound deliverer — send-side dedup, request collapsing, bounded retry.
//!
//! Flow per `send_response`:
//! 1. Identical send already in flight → share its outcome
//! 2. Sent record inside the window → skip as duplicate
//! 3. Otherwise record optimistically and spawn the send with retries
//!
//! The send itself runs on its own task, so a caller dropping its future
//! never strands the in-flight entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::transport::Transport;
use crate::clock::{self, SharedClock};
use crate::config::DelivererConfig;
use crate::error::DeliveryError;
use crate::hashing;

type SharedSend = Shared<BoxFuture<'static, Result<SendOutcome, DeliveryError>>>;

/// Why a send was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Duplicate,
}

/// Result of a send that did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    /// Transport attempts used; zero when skipped.
    pub attempts: u32,
}

impl SendOutcome {
    fn delivered(attempts: u32) -> Self {
        Self {
            sent: true,
            reason: None,
            attempts,
        }
    }

    fn duplicate() -> Self {
        Self {
            sent: false,
            reason: Some(SkipReason::Duplicate),
            attempts: 0,
        }
    }
}

/// One entry of a batch send.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub to: String,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl OutboundRequest {
    pub fn new(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: content.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Per-item result of `send_batch`.
#[derive(Debug, Clone)]
pub struct BatchSendResult {
    pub to: String,
    pub result: Result<SendOutcome, DeliveryError>,
}

/// Health snapshot for upstream admission decisions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DelivererHealth {
    pub total_requests: u64,
    pub sent: u64,
    pub duplicates_blocked: u64,
    pub collapsed: u64,
    pub failures: u64,
    /// Share of requests blocked as duplicates.
    pub duplicate_rate: f64,
    pub in_flight: usize,
    pub tracked_records: usize,
}

#[derive(Default)]
struct DelivererState {
    /// send hash → recorded at.
    sent: HashMap<String, DateTime<Utc>>,
    in_flight: HashMap<String, SharedSend>,
    total_requests: u64,
    sent_count: u64,
    duplicates_blocked: u64,
    collapsed: u64,
    failures: u64,
}

/// Outbound deliverer.
pub struct OutboundDeliverer {
    config: DelivererConfig,
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<DelivererState>>,
}

impl OutboundDeliverer {
    pub fn new(
        config: DelivererConfig,
        clock: SharedClock,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            transport,
            state: Arc::new(Mutex::new(DelivererState::default())),
        })
    }

    pub fn config(&self) -> &DelivererConfig {
        &self.config
    }

    /// Send `content` to `to`, at most once per dedup window.
    ///
    /// Returns `Err(DeliveryError::Exhausted)` once every attempt failed; the
    /// sent record is dropped then so a later legitimate send is not blocked.
    pub async fn send_response(
        &self,
        to: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<SendOutcome, DeliveryError> {
        let now = self.clock.now();
        let bucket = hashing::time_bucket(now, self.config.time_bucket);
        let key = hashing::outbound_hash(to, content, bucket);

        let pending = {
            let mut state = self.state.lock().await;
            state.total_requests += 1;

            if let Some(pending) = state.in_flight.get(&key).cloned() {
                state.collapsed += 1;
                debug!(to, key = %key, "Collapsing into in-flight send");
                pending
            } else if state
                .sent
                .get(&key)
                .is_some_and(|at| clock::elapsed(now, *at) < self.config.dedup_window)
            {
                state.duplicates_blocked += 1;
                debug!(to, key = %key, "Duplicate send blocked");
                return Ok(SendOutcome::duplicate());
            } else {
                state.sent.insert(key.clone(), now);
                let pending = self.spawn_send(key.clone(), to, content, metadata);
                state.in_flight.insert(key, pending.clone());
                pending
            }
        };

        pending.await
    }

    /// Start the retrying send on its own task and return a shareable handle.
    fn spawn_send(
        &self,
        key: String,
        to: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> SharedSend {
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let to = to.to_string();
        let content = content.to_string();
        let metadata = metadata.clone();

        let handle = tokio::spawn(async move {
            let result = deliver_with_retry(transport.as_ref(), &config, &to, &content, &metadata)
                .await;

            let mut state = state.lock().await;
            state.in_flight.remove(&key);
            match result {
                Ok(attempts) => {
                    state.sent_count += 1;
                    info!(to = %to, attempts, transport = transport.name(), "Response delivered");
                    Ok(SendOutcome::delivered(attempts))
                }
                Err(e) => {
                    state.sent.remove(&key);
                    state.failures += 1;
                    error!(to = %to, error = %e, "Response delivery exhausted retries");
                    Err(e)
                }
            }
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(DeliveryError::transport(format!("send task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Send several responses concurrently. One failure never aborts the rest.
    pub async fn send_batch(&self, requests: Vec<OutboundRequest>) -> Vec<BatchSendResult> {
        let count = requests.len();
        let results = join_all(requests.into_iter().map(|req| async move {
            let result = self.send_response(&req.to, &req.content, &req.metadata).await;
            BatchSendResult { to: req.to, result }
        }))
        .await;

        let failed = results.iter().filter(|r| r.result.is_err()).count();
        info!(count, failed, "Batch send complete");
        results
    }

    /// Drop sent records older than the dedup window.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let window = self.config.dedup_window;
        let mut state = self.state.lock().await;
        let before = state.sent.len();
        state.sent.retain(|_, at| clock::elapsed(now, *at) < window);
        let removed = before - state.sent.len();
        if removed > 0 {
            debug!(removed, "Expired sent records");
        }
        removed
    }

    /// Forget every sent record. In-flight sends are untouched.
    pub async fn clear_cache(&self) -> usize {
        let mut state = self.state.lock().await;
        let cleared = state.sent.len();
        state.sent.clear();
        info!(cleared, "Outbound dedup cache cleared");
        cleared
    }

    pub async fn health(&self) -> DelivererHealth {
        let state = self.state.lock().await;
        let duplicate_rate = if state.total_requests == 0 {
            0.0
        } else {
            state.duplicates_blocked as f64 / state.total_requests as f64
        };
        DelivererHealth {
            total_requests: state.total_requests,
            sent: state.sent_count,
            duplicates_blocked: state.duplicates_blocked,
            collapsed: state.collapsed,
            failures: state.failures,
            duplicate_rate,
            in_flight: state.in_flight.len(),
            tracked_records: state.sent.len(),
        }
    }
}

/// Backoff before the attempt following `attempt` (1-based).
pub fn backoff_for(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Up to `max_attempts` transport calls, each under a hard timeout.
/// Returns the number of attempts used on success.
async fn deliver_with_retry(
    transport: &dyn Transport,
    config: &DelivererConfig,
    to: &str,
    content: &str,
    metadata: &serde_json::Value,
) -> Result<u32, DeliveryError> {
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = DeliveryError::transport("no attempt made");

    for attempt in 1..=max_attempts {
        let outcome =
            tokio::time::timeout(config.attempt_timeout, transport.deliver(to, content, metadata))
                .await;

        last_error = match outcome {
            Ok(Ok(())) => return Ok(attempt),
            Ok(Err(e)) => e,
            Err(_) => DeliveryError::Timeout {
                after: config.attempt_timeout,
            },
        };

        if attempt < max_attempts {
            let delay = backoff_for(config.base_backoff, attempt);
            warn!(
                to,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Send attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(DeliveryError::Exhausted {
        to: to.to_string(),
        attempts: max_attempts,
        last_error: last_error.to_string(),
    })
}

/// Spawn a background task that periodically expires sent records.
pub fn spawn_cleanup_task(deliverer: Arc<OutboundDeliverer>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(deliverer.config().cleanup_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            deliverer.cleanup_expired().await;
        }
    })
}
