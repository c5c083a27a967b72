//! Processing lock provider.
//!
//! The coordinator marks a contact as "being processed" by holding a lease
//! from a [`LockProvider`]. Leases expire on their own, so a consumer that
//! never reports completion cannot starve a contact forever. Release is
//! ownership-checked: only the token returned by `try_acquire` frees a key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::clock::SharedClock;

/// Proof of ownership for a held lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conditional set-with-expiry plus ownership-checked release.
///
/// A store-backed implementation makes the processing marker safe across
/// several process instances.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Take the lease on `key` if nobody holds a live one.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LeaseToken>;

    /// Release `key` if `token` still owns it. Returns whether it did.
    async fn release(&self, key: &str, token: LeaseToken) -> bool;

    /// Whether a live (unexpired) lease exists on `key`.
    async fn is_held(&self, key: &str) -> bool;
}

struct Lease {
    token: LeaseToken,
    expires_at: DateTime<Utc>,
}

/// Single-process lock provider.
pub struct InMemoryLockProvider {
    clock: SharedClock,
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockProvider {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LeaseToken> {
        let now = self.clock.now();
        let mut leases = self.leases();

        if let Some(existing) = leases.get(key)
            && existing.expires_at > now
        {
            return None;
        }

        let token = LeaseToken::new();
        let ttl = chrono::Duration::milliseconds(ttl.as_millis() as i64);
        leases.insert(
            key.to_string(),
            Lease {
                token,
                expires_at: now + ttl,
            },
        );
        debug!(key, token = %token, "Lease acquired");
        Some(token)
    }

    async fn release(&self, key: &str, token: LeaseToken) -> bool {
        let mut leases = self.leases();
        match leases.get(key) {
            Some(lease) if lease.token == token => {
                leases.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn is_held(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.leases()
            .get(key)
            .is_some_and(|lease| lease.expires_at > now)
    }
}
