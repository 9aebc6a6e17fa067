//! Transaction creation and lookup

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
};

use super::super::state::AppState;
use super::super::types::{ApiError, ApiResult, OpenTransactionBody, ok, validated};
use crate::escrow::{Actor, Transaction, TransactionId, TransactionView};

/// Open a transaction for a listing
///
/// POST /api/v1/transaction/open
#[utoipa::path(
    post,
    path = "/api/v1/transaction/open",
    request_body = OpenTransactionBody,
    responses(
        (status = 200, description = "Transaction created in INITIATED", content_type = "application/json"),
        (status = 400, description = "Invalid amount or listing"),
        (status = 401, description = "Missing or invalid token")
    ),
    security(("bearer_jwt" = [])),
    tag = "Transaction"
)]
pub async fn open_transaction(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<OpenTransactionBody>,
) -> ApiResult<Transaction> {
    let req = validated(req)?;
    ok(state.service.open_transaction(actor, req.into()).await?)
}

/// Full aggregate with the last 10 events
///
/// GET /api/v1/transaction/{id}
#[utoipa::path(
    get,
    path = "/api/v1/transaction/{id}",
    params(
        ("id" = String, Path, description = "Transaction ID (ULID)")
    ),
    responses(
        (status = 200, description = "Transaction, payments, shipment, refunds, dispute and recent events", content_type = "application/json"),
        (status = 400, description = "Malformed id"),
        (status = 403, description = "Caller is not buyer, seller or admin"),
        (status = 404, description = "Transaction not found")
    ),
    security(("bearer_jwt" = [])),
    tag = "Transaction"
)]
pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<String>,
) -> ApiResult<TransactionView> {
    let id: TransactionId = id
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid transaction ID format"))?;
    ok(state.service.get_transaction(actor, id).await?)
}
