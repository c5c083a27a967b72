//! Content hashing for dedup keys.
//!
//! Three keys are derived here and they deliberately differ:
//! - inbound: normalized `{text, type}`, no time component
//! - outbound: recipient + normalized content + time bucket
//! - exchange: contact + text prefixes + time bucket

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Lowercase, trim and collapse runs of whitespace.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of the given parts joined with a separator that cannot
/// appear in normalized text.
fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Index of the `width`-sized bucket containing `at`.
pub fn time_bucket(at: DateTime<Utc>, width: Duration) -> i64 {
    let width_ms = (width.as_millis() as i64).max(1);
    at.timestamp_millis().div_euclid(width_ms)
}

/// Dedup key for an inbound payload. Timestamps never feed into it.
pub fn inbound_hash(text: &str, message_type: &str) -> String {
    digest(&[&normalize(text), &message_type.trim().to_lowercase()])
}

/// Dedup key for an outbound send.
pub fn outbound_hash(to: &str, content: &str, bucket: i64) -> String {
    digest(&[to.trim(), &normalize(content), &bucket.to_string()])
}

/// Key for one exact payload to one recipient. Unlike [`outbound_hash`]
/// the content is taken verbatim.
pub fn payload_key(to: &str, content: &str) -> String {
    digest(&[to, content])
}

/// Idempotency id for one persisted exchange.
///
/// Only the first `prefix_len` characters of each text count, so replays of
/// the same logical exchange collapse even if trailing content drifts.
pub fn exchange_id(
    from: &str,
    user_text: &str,
    bot_text: &str,
    prefix_len: usize,
    bucket: i64,
) -> String {
    digest(&[
        from.trim(),
        truncate_chars(user_text, prefix_len),
        truncate_chars(bot_text, prefix_len),
        &bucket.to_string(),
    ])
}

/// First `max` characters of `s`, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Strip control characters (newline and tab survive), trim, and cap length.
pub fn sanitize_text(s: &str, max: usize) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    truncate_chars(cleaned.trim(), max).to_string()
}
