//! Integration tests for the admin HTTP surface.
//!
//! Each test spins up an Axum server on a random port around a real
//! `Services` container (in-memory libSQL, recording transport) and drives
//! it over HTTP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use contact_flow::admin::admin_routes;
use contact_flow::clock::ManualClock;
use contact_flow::config::AppConfig;
use contact_flow::error::DeliveryError;
use contact_flow::inbound::InboundMessage;
use contact_flow::outbound::Transport;
use contact_flow::pipeline::{EchoResponder, Services};
use contact_flow::store::{ConversationStore, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingTransport {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(
        &self,
        _to: &str,
        content: &str,
        _metadata: &Value,
    ) -> Result<(), DeliveryError> {
        self.delivered.lock().unwrap().push(content.to_string());
        Ok(())
    }
}

struct Server {
    base: String,
    services: Arc<Services>,
    store: Arc<LibSqlBackend>,
    client: reqwest::Client,
}

impl Server {
    async fn get(&self, path: &str) -> Value {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success(), "GET {path} -> {}", resp.status());
        resp.json().await.unwrap()
    }

    async fn post(&self, path: &str) -> Value {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success(), "POST {path} -> {}", resp.status());
        resp.json().await.unwrap()
    }
}

/// Start services plus the admin server on a random port.
async fn start_server() -> Server {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let services = Services::new(
        AppConfig::default(),
        ManualClock::fixed(),
        store.clone(),
        Arc::new(RecordingTransport::default()),
        Arc::new(EchoResponder),
    );
    services.start();

    let app = admin_routes(Arc::clone(&services));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        services,
        store,
        client: reqwest::Client::new(),
    }
}

// ── Health / stats ──────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let body = server.get("/api/health").await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running"], true);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stats_reflect_processed_traffic() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let pipeline = &server.services.pipeline;
        pipeline.handle("alice", InboundMessage::text("hello")).await;
        pipeline.handle("alice", InboundMessage::text("hello")).await;

        let body = server.get("/api/stats").await;
        assert_eq!(body["inbound"]["enqueued_total"], 1);
        assert_eq!(body["inbound"]["duplicates_total"], 1);
        assert_eq!(body["outbound"]["sent"], 1);
        assert_eq!(body["ledger"]["accepted"], 1);
        assert_eq!(body["running"], true);
    })
    .await
    .expect("test timed out");
}

// ── Levers ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn emergency_flush_discards_every_queue() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let coordinator = &server.services.coordinator;
        coordinator.enqueue("alice", InboundMessage::text("one")).await;
        coordinator.enqueue("bob", InboundMessage::text("two")).await;

        let body = server.post("/api/admin/flush").await;
        assert_eq!(body["discarded"], 2);

        let stats = server.get("/api/stats").await;
        assert_eq!(stats["inbound"]["total_queued"], 0);
        assert_eq!(stats["inbound"]["emergency_flushes"], 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn flush_contact_leaves_others_alone() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let coordinator = &server.services.coordinator;
        coordinator.enqueue("alice", InboundMessage::text("one")).await;
        coordinator.enqueue("alice", InboundMessage::text("two")).await;
        coordinator.enqueue("bob", InboundMessage::text("three")).await;

        let body = server.post("/api/admin/flush/alice").await;
        assert_eq!(body["contact"], "alice");
        assert_eq!(body["discarded"], 2);
        assert_eq!(coordinator.queue_len("bob").await, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn clear_outbound_allows_an_immediate_resend() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let deliverer = &server.services.deliverer;

        assert!(deliverer.send_response("alice", "hi", &json!({})).await.unwrap().sent);
        assert!(!deliverer.send_response("alice", "hi", &json!({})).await.unwrap().sent);

        let body = server.post("/api/admin/clear/outbound").await;
        assert_eq!(body["cleared"], 1);

        assert!(deliverer.send_response("alice", "hi", &json!({})).await.unwrap().sent);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn persist_flush_writes_pending_exchanges() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server
            .services
            .ledger
            .save_conversation("alice", "hi", "hello", &json!({}))
            .await;

        server.post("/api/admin/persist/flush").await;

        assert_eq!(server.store.count_turns("alice").await.unwrap(), 2);
        let stats = server.get("/api/stats").await;
        assert_eq!(stats["ledger"]["queued"], 0);
        assert_eq!(stats["ledger"]["persisted"], 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn clear_ledger_forgets_pending_ids() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let ledger = &server.services.ledger;
        ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        ledger.force_process().await;
        assert_eq!(ledger.stats().await.pending, 1);

        server.post("/api/admin/clear/ledger").await;

        assert_eq!(ledger.stats().await.pending, 0);
        let again = ledger.save_conversation("alice", "hi", "hello", &json!({})).await;
        assert!(again.saved);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_route_is_404() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = server
            .client
            .get(format!("{}/api/nope", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    })
    .await
    .expect("test timed out");
}
