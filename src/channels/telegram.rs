//! Telegram transport — delivers responses through the Bot API `sendMessage`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;

use crate::error::DeliveryError;
use crate::hashing;
use crate::outbound::Transport;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// How long a partly delivered message remembers its progress.
const PARTIAL_TTL: Duration = Duration::from_secs(600);

/// Chunks of one message already accepted by the Bot API.
struct PartialSend {
    delivered: usize,
    updated: Instant,
}

/// Outbound transport over the Telegram Bot API.
///
/// The recipient is the chat id. A `chat_id` in the send metadata wins over
/// the contact id when present.
///
/// Long content goes out in several `sendMessage` calls. When a later chunk
/// fails, the next delivery of the same content to the same chat resumes at
/// that chunk, so a retried send never repeats what the chat already shows.
pub struct TelegramTransport {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
    partial: Mutex<HashMap<String, PartialSend>>,
}

impl TelegramTransport {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
            partial: Mutex::new(HashMap::new()),
        }
    }

    /// Point the transport at a different API host (tests, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    fn partial(&self) -> std::sync::MutexGuard<'_, HashMap<String, PartialSend>> {
        self.partial.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Chunks already delivered for `key`; forgets stale progress.
    fn resume_from(&self, key: &str) -> usize {
        let mut partial = self.partial();
        partial.retain(|_, p| p.updated.elapsed() < PARTIAL_TTL);
        partial.get(key).map_or(0, |p| p.delivered)
    }

    fn record_progress(&self, key: &str, delivered: usize) {
        self.partial().insert(
            key.to_string(),
            PartialSend {
                delivered,
                updated: Instant::now(),
            },
        );
    }

    /// Send a single message chunk (≤4096 chars), Markdown-first with fallback.
    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        let markdown_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown"
        });

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&markdown_body)
            .send()
            .await
            .map_err(|e| DeliveryError::transport(e.without_url().to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| DeliveryError::transport(e.without_url().to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_status = plain_resp.status();
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(DeliveryError::transport(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_status} {plain_err})"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(
        &self,
        to: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let chat_id = metadata
            .get("chat_id")
            .and_then(|v| v.as_str())
            .unwrap_or(to);

        let chunks = split_message(content, TELEGRAM_MAX_MESSAGE_LENGTH);
        if chunks.len() == 1 {
            return self.send_message_chunk(chat_id, &chunks[0]).await;
        }

        let key = hashing::payload_key(chat_id, content);
        let start = self.resume_from(&key);
        if start > 0 {
            tracing::info!(
                chat_id,
                resumed_at = start,
                total = chunks.len(),
                "Resuming partly delivered message"
            );
        }
        for (index, chunk) in chunks.iter().enumerate().skip(start) {
            self.send_message_chunk(chat_id, chunk).await?;
            self.record_progress(&key, index + 1);
        }
        self.partial().remove(&key);
        Ok(())
    }
}

/// Split a message into chunks of at most `max_len` characters.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((limit, _)) = remaining.char_indices().nth(max_len) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(limit);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use serde_json::{Value, json};

    use super::*;

    fn token() -> SecretString {
        SecretString::from("123:abc".to_string())
    }

    #[test]
    fn telegram_transport_name() {
        assert_eq!(TelegramTransport::new(token()).name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        let transport = TelegramTransport::new(token());
        assert_eq!(
            transport.api_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );

        let transport = transport.with_api_base("http://127.0.0.1:9/");
        assert_eq!(
            transport.api_url("sendMessage"),
            "http://127.0.0.1:9/bot123:abc/sendMessage"
        );
    }

    // ── Message splitting tests ─────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_over_limit_on_space() {
        let msg = format!("{} {}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_counts_characters_not_bytes() {
        let msg = "é".repeat(4100);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 4096);
        assert_eq!(chunks[1].chars().count(), 4);
    }

    // ── Bot API round trips against a local stub ────────────────────

    type Seen = Arc<Mutex<Vec<Value>>>;

    /// Rejects Markdown bodies with 400 when `reject_markdown`, and every
    /// body when `reject_all`.
    async fn spawn_bot_api(reject_markdown: bool, reject_all: bool) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let app = Router::new()
            .route(
                "/{bot}/sendMessage",
                post(
                    move |State(seen): State<Seen>, Json(body): Json<Value>| async move {
                        let markdown = body.get("parse_mode").is_some();
                        seen.lock().unwrap().push(body);
                        if reject_all || (reject_markdown && markdown) {
                            (StatusCode::BAD_REQUEST, "can't parse entities")
                        } else {
                            (StatusCode::OK, "{\"ok\":true}")
                        }
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), seen)
    }

    #[tokio::test]
    async fn markdown_accepted_sends_once() {
        let (base, seen) = spawn_bot_api(false, false).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);

        transport.deliver("42", "*hi*", &json!({})).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["chat_id"], "42");
        assert_eq!(seen[0]["parse_mode"], "Markdown");
    }

    #[tokio::test]
    async fn markdown_rejected_falls_back_to_plain() {
        let (base, seen) = spawn_bot_api(true, false).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);

        transport.deliver("42", "bad *markdown", &json!({})).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].get("parse_mode").is_none());
        assert_eq!(seen[1]["text"], "bad *markdown");
    }

    #[tokio::test]
    async fn both_modes_rejected_is_a_transport_error() {
        let (base, _seen) = spawn_bot_api(true, true).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);

        let err = transport.deliver("42", "hello", &json!({})).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport { .. }));
    }

    #[tokio::test]
    async fn metadata_chat_id_overrides_recipient() {
        let (base, seen) = spawn_bot_api(false, false).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);

        transport
            .deliver("contact-7", "hello", &json!({"chat_id": "99887766"}))
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap()[0]["chat_id"], "99887766");
    }

    /// Accepts every chunk except a text starting with "b", which fails
    /// `failures` times before it goes through.
    async fn spawn_flaky_bot_api(failures: usize) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let remaining = Arc::new(Mutex::new(failures));
        let app = Router::new()
            .route(
                "/{bot}/sendMessage",
                post(
                    move |State(seen): State<Seen>, Json(body): Json<Value>| {
                        let remaining = remaining.clone();
                        async move {
                            let second = body["text"].as_str().is_some_and(|t| t.starts_with('b'));
                            seen.lock().unwrap().push(body);
                            let mut remaining = remaining.lock().unwrap();
                            if second && *remaining > 0 {
                                *remaining -= 1;
                                (StatusCode::INTERNAL_SERVER_ERROR, "try later")
                            } else {
                                (StatusCode::OK, "{\"ok\":true}")
                            }
                        }
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), seen)
    }

    fn texts(seen: &Seen) -> Vec<String> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|b| b["text"].as_str().map(|t| t[..1].to_string()))
            .collect()
    }

    #[tokio::test]
    async fn retry_after_partial_delivery_resumes_at_failed_chunk() {
        // Markdown and plain attempt of chunk two both fail once each.
        let (base, seen) = spawn_flaky_bot_api(2).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);
        let content = format!("{}\n{}", "a".repeat(4000), "b".repeat(1000));

        let err = transport.deliver("42", &content, &json!({})).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport { .. }));
        transport.deliver("42", &content, &json!({})).await.unwrap();

        // Chunk one reached the chat exactly once.
        assert_eq!(texts(&seen), vec!["a", "b", "b", "b"]);
        assert!(transport.partial().is_empty());
    }

    #[tokio::test]
    async fn deliverer_retries_do_not_repeat_delivered_chunks() {
        use crate::clock::ManualClock;
        use crate::config::DelivererConfig;
        use crate::outbound::OutboundDeliverer;

        let (base, seen) = spawn_flaky_bot_api(2).await;
        let transport = Arc::new(TelegramTransport::new(token()).with_api_base(base));
        let deliverer = OutboundDeliverer::new(
            DelivererConfig {
                base_backoff: Duration::from_millis(1),
                ..DelivererConfig::default()
            },
            ManualClock::fixed(),
            transport,
        );
        let content = format!("{}\n{}", "a".repeat(4000), "b".repeat(1000));

        let outcome = deliverer.send_response("42", &content, &json!({})).await.unwrap();
        assert!(outcome.sent);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(texts(&seen).iter().filter(|t| *t == "a").count(), 1);
    }

    #[tokio::test]
    async fn other_content_starts_from_the_first_chunk() {
        let (base, seen) = spawn_flaky_bot_api(2).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);
        let content = format!("{}\n{}", "a".repeat(4000), "b".repeat(1000));
        transport.deliver("42", &content, &json!({})).await.unwrap_err();

        let other = format!("{}\n{}", "a".repeat(4000), "c".repeat(10));
        transport.deliver("42", &other, &json!({})).await.unwrap();

        assert_eq!(texts(&seen), vec!["a", "b", "b", "a", "c"]);
    }

    #[tokio::test]
    async fn long_content_is_sent_in_chunks() {
        let (base, seen) = spawn_bot_api(false, false).await;
        let transport = TelegramTransport::new(token()).with_api_base(base);

        let content = format!("{}\n{}", "a".repeat(4000), "b".repeat(200));
        transport.deliver("42", &content, &json!({})).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["text"], "b".repeat(200));
    }
}
