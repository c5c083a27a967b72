//! Admin HTTP surface — stats, health and the operator levers (flushes and
//! cache clears).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::inbound::CoordinatorStats;
use crate::ledger::LedgerStats;
use crate::outbound::DelivererHealth;
use crate::pipeline::Services;

/// Combined snapshot returned by `GET /api/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub inbound: CoordinatorStats,
    pub outbound: DelivererHealth,
    pub ledger: LedgerStats,
    pub running: bool,
}

/// Build the admin router.
pub fn admin_routes(services: Arc<Services>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/admin/flush", post(emergency_flush))
        .route("/api/admin/flush/{contact}", post(flush_contact))
        .route("/api/admin/clear/outbound", post(clear_outbound))
        .route("/api/admin/clear/ledger", post(clear_ledger))
        .route("/api/admin/persist/flush", post(force_persist))
        .layer(CorsLayer::permissive())
        .with_state(services)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(services): State<Arc<Services>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "contact-flow",
        "running": services.is_running(),
    }))
}

async fn stats(State(services): State<Arc<Services>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        inbound: services.coordinator.stats().await,
        outbound: services.deliverer.health().await,
        ledger: services.ledger.stats().await,
        running: services.is_running(),
    })
}

// ── Levers ──────────────────────────────────────────────────────────────

async fn emergency_flush(State(services): State<Arc<Services>>) -> impl IntoResponse {
    let discarded = services.coordinator.emergency_flush_all().await;
    warn!(discarded, "Emergency flush requested over admin API");
    Json(serde_json::json!({ "discarded": discarded }))
}

async fn flush_contact(
    State(services): State<Arc<Services>>,
    Path(contact): Path<String>,
) -> impl IntoResponse {
    let discarded = services.coordinator.flush_queue(&contact).await;
    Json(serde_json::json!({ "contact": contact, "discarded": discarded }))
}

async fn clear_outbound(State(services): State<Arc<Services>>) -> impl IntoResponse {
    let cleared = services.deliverer.clear_cache().await;
    Json(serde_json::json!({ "cleared": cleared }))
}

async fn clear_ledger(State(services): State<Arc<Services>>) -> impl IntoResponse {
    let cleared = services.ledger.clear().await;
    Json(serde_json::json!({ "cleared": cleared }))
}

async fn force_persist(State(services): State<Arc<Services>>) -> impl IntoResponse {
    let processed = services.ledger.force_process().await;
    Json(serde_json::json!({ "processed": processed }))
}
