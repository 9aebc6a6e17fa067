//! Escrow Engine server
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌────────────┐
//! │  Axum    │───▶│ EscrowService│───▶│ EscrowStore│ (Postgres | memory)
//! │  routes  │    │  (FSM)       │    └────────────┘
//! └──────────┘    │              │───▶ PaymentGateway
//! ┌──────────┐    │              │───▶ NotificationSink
//! │  Worker  │───▶│              │
//! └──────────┘    └──────────────┘
//! ```
//!
//! Usage: `escrow_engine [--env dev] [--port 8080]`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;

use escrow_engine::api::{self, AppState};
use escrow_engine::auth::{JwtAuth, WebhookKey};
use escrow_engine::config::AppConfig;
use escrow_engine::db::Database;
use escrow_engine::escrow::{
    EscrowService, EscrowStore, EscrowWorker, HttpChatSink, HttpPaymentGateway, LogSink,
    MemoryStore, NotificationSink, PaymentGateway, PgEscrowStore, WebhookIngress,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

fn webhook_key(hex_key: Option<&str>, source: &str) -> anyhow::Result<Option<WebhookKey>> {
    match hex_key {
        Some(k) => Ok(Some(
            WebhookKey::from_hex(k).with_context(|| format!("Invalid {} webhook key", source))?,
        )),
        None => {
            tracing::warn!(source, "No webhook key configured; callbacks will be rejected");
            Ok(None)
        }
    }
}

fn payment_gateway(config: &AppConfig) -> anyhow::Result<Arc<dyn PaymentGateway>> {
    let pg = &config.payment_gateway;
    match &pg.base_url {
        Some(url) => Ok(Arc::new(HttpPaymentGateway::new(
            url.clone(),
            pg.api_key.clone(),
            pg.provider.clone(),
            Duration::from_millis(pg.timeout_ms),
        )?)),
        #[cfg(feature = "mock-api")]
        None => {
            tracing::warn!("payment_gateway.base_url not set; using the in-process mock gateway");
            Ok(Arc::new(
                escrow_engine::escrow::gateway::mock::MockPaymentGateway::new(),
            ))
        }
        #[cfg(not(feature = "mock-api"))]
        None => anyhow::bail!("payment_gateway.base_url is required"),
    }
}

fn notification_sink(config: &AppConfig) -> anyhow::Result<Arc<dyn NotificationSink>> {
    let n = &config.notifications;
    match &n.chat_url {
        Some(url) => Ok(Arc::new(HttpChatSink::new(
            url.clone(),
            Duration::from_millis(n.timeout_ms),
        )?)),
        None => Ok(Arc::new(LogSink)),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = escrow_engine::logging::init_logging(&config);

    tracing::info!(
        env = %env,
        version = env!("CARGO_PKG_VERSION"),
        build = env!("GIT_HASH"),
        "Starting escrow engine"
    );

    let database = match &config.postgres_url {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            db.migrate().await.context("Failed to apply schema")?;
            Some(db)
        }
        None => None,
    };

    let store: Arc<dyn EscrowStore> = match &database {
        Some(db) => Arc::new(PgEscrowStore::new(db.pool().clone())),
        None => {
            tracing::warn!("postgres_url not set; running on the in-memory store (data is lost on exit)");
            Arc::new(MemoryStore::new())
        }
    };

    let service = Arc::new(EscrowService::new(
        store,
        payment_gateway(&config)?,
        notification_sink(&config)?,
        config.escrow_config(),
    ));

    let ingress = Arc::new(WebhookIngress::new(
        service.clone(),
        webhook_key(config.webhooks.pg_public_key.as_deref(), "pg")?,
        webhook_key(config.webhooks.courier_public_key.as_deref(), "courier")?,
    ));

    let state = Arc::new(AppState::new(
        service.clone(),
        ingress,
        JwtAuth::new(config.jwt_secret.clone()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = EscrowWorker::new(service, config.worker_config());
    let worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let port = get_port_override().unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, port))?;

    let mut server_shutdown = shutdown_tx.subscribe();
    let mut server = tokio::spawn(api::run_server(addr, state, async move {
        let _ = server_shutdown.changed().await;
    }));

    let server_result = tokio::select! {
        joined = &mut server => joined,
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(true);
            server.await
        }
    };
    // Server may have exited on its own; stop the worker either way.
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "Worker task panicked");
    }
    if let Some(db) = database {
        db.close().await;
    }

    server_result
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;
    tracing::info!("Escrow engine stopped");
    Ok(())
}
