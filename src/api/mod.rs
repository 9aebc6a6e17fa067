//! HTTP surface
//!
//! - `/api/v1/health`, `/api/v1/webhook/*`: public (webhooks carry their own signature)
//! - `/api/v1/transaction/*`, `/api/v1/payment/*`, `/api/v1/dispute/*`: JWT

pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tokio::net::TcpListener;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::{jwt_auth_middleware, require_admin};
pub use state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let transaction_routes = Router::new()
        .route("/open", post(handlers::open_transaction))
        .route("/{id}", get(handlers::get_transaction))
        .layer(from_fn_with_state(state.clone(), jwt_auth_middleware));

    let payment_routes = Router::new()
        .route("/initiate", post(handlers::initiate_payment))
        .route("/cancel-request", post(handlers::request_cancel))
        .route("/cancel-approve", post(handlers::approve_cancel))
        .route("/ship", post(handlers::register_shipment))
        .route("/confirm", post(handlers::confirm_delivery))
        .route("/final-confirm", post(handlers::final_confirm))
        .route("/refund", post(handlers::process_refund))
        .route(
            "/refund/retry",
            post(handlers::retry_refund).route_layer(from_fn(require_admin)),
        )
        .layer(from_fn_with_state(state.clone(), jwt_auth_middleware));

    let dispute_routes = Router::new()
        .route("/open", post(handlers::open_dispute))
        .route("/upload-evidence", post(handlers::upload_evidence))
        .route(
            "/resolve",
            post(handlers::resolve_dispute).route_layer(from_fn(require_admin)),
        )
        .layer(from_fn_with_state(state.clone(), jwt_auth_middleware));

    let webhook_routes = Router::new()
        .route("/pg", post(handlers::pg_webhook))
        .route("/courier", post(handlers::courier_webhook));

    Router::new()
        .route("/api/v1/health", get(handlers::health_check))
        .nest("/api/v1/transaction", transaction_routes)
        .nest("/api/v1/payment", payment_routes)
        .nest("/api/v1/dispute", dispute_routes)
        .nest("/api/v1/webhook", webhook_routes)
        .with_state(state)
        // stateless, added after with_state
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Escrow API listening");
    tracing::info!("API Docs: http://{}/docs", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
