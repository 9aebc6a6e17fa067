//! Payment, cancellation, shipment and refund handlers

use std::sync::Arc;

use axum::{Extension, Json, extract::State};

use super::super::state::AppState;
use super::super::types::{
    ApiResult, CancelRequestBody, InitiatePaymentBody, RefundBody, RefundRetryBody, ShipBody,
    TransactionIdBody, ok, validated,
};
use crate::escrow::{Actor, PaymentResult, RefundOutcome, Transaction};

/// Charge the buyer (INITIATED → PAID)
///
/// POST /api/v1/payment/initiate
///
/// Idempotent per `idempotencyKey`: a retry returns the first result.
#[utoipa::path(
    post,
    path = "/api/v1/payment/initiate",
    request_body = InitiatePaymentBody,
    responses(
        (status = 200, description = "Payment approved (or existing result for the key)", content_type = "application/json"),
        (status = 400, description = "Amount mismatch or invalid body"),
        (status = 403, description = "Caller is not the buyer"),
        (status = 409, description = "Transaction already paid with another key"),
        (status = 502, description = "Gateway declined or unreachable")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<InitiatePaymentBody>,
) -> ApiResult<PaymentResult> {
    let req = validated(req)?;
    ok(state.service.initiate_payment(actor, req.into()).await?)
}

/// Buyer requests cancellation
///
/// POST /api/v1/payment/cancel-request
#[utoipa::path(
    post,
    path = "/api/v1/payment/cancel-request",
    request_body = CancelRequestBody,
    responses(
        (status = 200, description = "CANCEL_REQUESTED", content_type = "application/json"),
        (status = 403, description = "Caller is not the buyer"),
        (status = 409, description = "Not cancellable from the current status, or reason missing")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn request_cancel(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<CancelRequestBody>,
) -> ApiResult<Transaction> {
    let req = validated(req)?;
    ok(state
        .service
        .request_cancel(actor, req.transaction_id, &req.reason)
        .await?)
}

/// Seller approves the cancel request; the full refund follows
///
/// POST /api/v1/payment/cancel-approve
#[utoipa::path(
    post,
    path = "/api/v1/payment/cancel-approve",
    request_body = TransactionIdBody,
    responses(
        (status = 200, description = "CANCELLED, refund started", content_type = "application/json"),
        (status = 403, description = "Caller is not the seller"),
        (status = 409, description = "No pending cancel request")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn approve_cancel(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<TransactionIdBody>,
) -> ApiResult<Transaction> {
    ok(state.service.approve_cancel(actor, req.transaction_id).await?)
}

/// Seller registers the tracking number
///
/// POST /api/v1/payment/ship
#[utoipa::path(
    post,
    path = "/api/v1/payment/ship",
    request_body = ShipBody,
    responses(
        (status = 200, description = "SHIPPED", content_type = "application/json"),
        (status = 403, description = "Caller is not the seller"),
        (status = 409, description = "Not awaiting shipment, or already registered")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn register_shipment(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<ShipBody>,
) -> ApiResult<Transaction> {
    let req = validated(req)?;
    ok(state.service.register_shipment(actor, req.into()).await?)
}

/// Buyer confirms delivery
///
/// POST /api/v1/payment/confirm
#[utoipa::path(
    post,
    path = "/api/v1/payment/confirm",
    request_body = TransactionIdBody,
    responses(
        (status = 200, description = "DELIVERY_CONFIRMED", content_type = "application/json"),
        (status = 403, description = "Caller is not the buyer"),
        (status = 409, description = "Not delivered yet")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn confirm_delivery(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<TransactionIdBody>,
) -> ApiResult<Transaction> {
    ok(state.service.confirm_delivery(actor, req.transaction_id).await?)
}

/// Buyer confirms the purchase and releases escrow to the seller
///
/// POST /api/v1/payment/final-confirm
#[utoipa::path(
    post,
    path = "/api/v1/payment/final-confirm",
    request_body = TransactionIdBody,
    responses(
        (status = 200, description = "BUYER_CONFIRMED", content_type = "application/json"),
        (status = 403, description = "Caller is not the buyer"),
        (status = 409, description = "Delivery not confirmed, or already confirmed")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn final_confirm(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<TransactionIdBody>,
) -> ApiResult<Transaction> {
    ok(state.service.final_confirm(actor, req.transaction_id).await?)
}

/// Refund a cancelled (or, for admins, disputed) transaction
///
/// POST /api/v1/payment/refund
///
/// A gateway failure is not an error here: the refund comes back
/// `failed` with `queuedForRetry = true`. On a disputed transaction the
/// dispute is resolved in the buyer's favour with the refunded amount.
#[utoipa::path(
    post,
    path = "/api/v1/payment/refund",
    request_body = RefundBody,
    responses(
        (status = 200, description = "Refund outcome", content_type = "application/json"),
        (status = 400, description = "Amount exceeds escrow"),
        (status = 403, description = "Caller may not refund this transaction"),
        (status = 409, description = "A refund is already in progress or the dispute is resolved")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn process_refund(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<RefundBody>,
) -> ApiResult<RefundOutcome> {
    let req = validated(req)?;
    ok(state.service.process_refund(actor, req.into()).await?)
}

/// Operator retry of a failed or dead-lettered refund
///
/// POST /api/v1/payment/refund/retry
#[utoipa::path(
    post,
    path = "/api/v1/payment/refund/retry",
    request_body = RefundRetryBody,
    responses(
        (status = 200, description = "Refund outcome after the new attempt", content_type = "application/json"),
        (status = 403, description = "Administrator role required"),
        (status = 404, description = "Refund not found"),
        (status = 409, description = "Refund already completed or awaiting the gateway")
    ),
    security(("bearer_jwt" = [])),
    tag = "Payment"
)]
pub async fn retry_refund(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<RefundRetryBody>,
) -> ApiResult<RefundOutcome> {
    ok(state.service.retry_refund(actor, req.refund_id).await?)
}
