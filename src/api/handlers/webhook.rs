//! Provider callbacks
//!
//! No JWT here. The body is taken raw so the signature can be checked over
//! the exact bytes that were signed.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::HeaderMap,
};

use super::super::state::AppState;
use super::super::types::{ApiResult, WebhookAck, ok};
use crate::escrow::WebhookOutcome;

pub const SIGNATURE_HEADER: &str = "x-signature";

fn signature(headers: &HeaderMap) -> Option<&str> {
    headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok())
}

/// Payment gateway callback (charges and refunds)
///
/// POST /api/v1/webhook/pg
#[utoipa::path(
    post,
    path = "/api/v1/webhook/pg",
    request_body(content = String, description = "{transactionId, pgTransactionId, status}", content_type = "application/json"),
    params(
        ("X-Signature" = String, Header, description = "base64 ed25519 signature over the raw body")
    ),
    responses(
        (status = 200, description = "Applied or duplicate", body = WebhookAck, content_type = "application/json"),
        (status = 401, description = "Missing or invalid signature"),
        (status = 404, description = "Unknown pgTransactionId"),
        (status = 422, description = "Unknown status")
    ),
    tag = "Webhook"
)]
pub async fn pg_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let outcome = state.ingress.ingest_payment(signature(&headers), &body).await?;
    ok(match outcome {
        WebhookOutcome::Applied(status) => WebhookAck {
            result: "applied",
            transaction_status: Some(status.as_str().to_string()),
        },
        WebhookOutcome::Duplicate => WebhookAck {
            result: "duplicate",
            transaction_status: None,
        },
    })
}

/// Courier callback
///
/// POST /api/v1/webhook/courier
///
/// Out-of-order or repeated events answer 409 with `retryable = true`.
#[utoipa::path(
    post,
    path = "/api/v1/webhook/courier",
    request_body(content = String, description = "{transactionId, eventType, data}", content_type = "application/json"),
    params(
        ("X-Signature" = String, Header, description = "base64 ed25519 signature over the raw body")
    ),
    responses(
        (status = 200, description = "Applied", body = WebhookAck, content_type = "application/json"),
        (status = 401, description = "Missing or invalid signature"),
        (status = 409, description = "Event does not fit the current status (retryable)"),
        (status = 422, description = "Unknown event type")
    ),
    tag = "Webhook"
)]
pub async fn courier_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookAck> {
    let status = state.ingress.ingest_courier(signature(&headers), &body).await?;
    ok(WebhookAck {
        result: "applied",
        transaction_status: Some(status.as_str().to_string()),
    })
}
