use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use contact_flow::admin::admin_routes;
use contact_flow::channels::{Channel, CliChannel, StdoutTransport, TelegramTransport};
use contact_flow::clock;
use contact_flow::config::AppConfig;
use contact_flow::outbound::Transport;
use contact_flow::pipeline::{EchoResponder, Services};
use contact_flow::store::{ConversationStore, LibSqlBackend};

/// Stderr logging, plus a daily rolling file under `log_dir` when set.
/// The returned guard must live as long as the process.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "contact-flow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("contact-flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Admin API: http://0.0.0.0:{}/api/stats", config.admin_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn ConversationStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    // ── Transport ────────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> = match &config.telegram_bot_token {
        Some(token) => {
            eprintln!("   Transport: telegram");
            Arc::new(TelegramTransport::new(token.clone()))
        }
        None => {
            eprintln!("   Transport: stdout");
            Arc::new(StdoutTransport)
        }
    };
    eprintln!("   Type `contact: message` and press Enter. Ctrl-C to exit.\n");

    let admin_port = config.admin_port;
    let services = Services::new(
        config,
        clock::system(),
        store,
        transport,
        Arc::new(EchoResponder),
    );
    services.start();

    // ── Admin API ────────────────────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", admin_port))
        .await
        .with_context(|| format!("failed to bind admin port {admin_port}"))?;
    let app = admin_routes(Arc::clone(&services));
    tokio::spawn(async move {
        tracing::info!(port = admin_port, "Admin server started");
        axum::serve(listener, app).await.ok();
    });

    // ── CLI input ────────────────────────────────────────────────────────
    let channel = CliChannel::new();
    let mut messages = channel.start().await?;
    let mut handling = JoinSet::new();

    loop {
        tokio::select! {
            next = messages.next() => {
                let Some(incoming) = next else { break };
                let pipeline = Arc::clone(&services.pipeline);
                handling.spawn(async move {
                    pipeline.handle(&incoming.contact_id, incoming.message).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received, shutting down");
                break;
            }
        }
    }

    while handling.join_next().await.is_some() {}
    services.shutdown().await;
    Ok(())
}
