//! Dispute handlers

use std::sync::Arc;

use axum::{Extension, Json, extract::State};

use super::super::state::AppState;
use super::super::types::{
    ApiResult, OpenDisputeBody, ResolveDisputeBody, UploadEvidenceBody, ok, validated,
};
use crate::escrow::{Actor, Dispute, Transaction};

/// Buyer escalates to an administrator
///
/// POST /api/v1/dispute/open
#[utoipa::path(
    post,
    path = "/api/v1/dispute/open",
    request_body = OpenDisputeBody,
    responses(
        (status = 200, description = "DISPUTE", content_type = "application/json"),
        (status = 400, description = "Invalid evidence url"),
        (status = 403, description = "Caller is not the buyer"),
        (status = 409, description = "Not disputable from the current status")
    ),
    security(("bearer_jwt" = [])),
    tag = "Dispute"
)]
pub async fn open_dispute(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<OpenDisputeBody>,
) -> ApiResult<Dispute> {
    let req = validated(req)?;
    ok(state.service.open_dispute(actor, req.into()).await?)
}

/// Append evidence to an open dispute
///
/// POST /api/v1/dispute/upload-evidence
#[utoipa::path(
    post,
    path = "/api/v1/dispute/upload-evidence",
    request_body = UploadEvidenceBody,
    responses(
        (status = 200, description = "Dispute with the merged evidence list", content_type = "application/json"),
        (status = 404, description = "No dispute for the transaction"),
        (status = 409, description = "Dispute already resolved")
    ),
    security(("bearer_jwt" = [])),
    tag = "Dispute"
)]
pub async fn upload_evidence(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<UploadEvidenceBody>,
) -> ApiResult<Dispute> {
    let req = validated(req)?;
    ok(state
        .service
        .upload_evidence(actor, req.transaction_id, req.evidence_urls)
        .await?)
}

/// Administrator decision: refund (full or partial) or release
///
/// POST /api/v1/dispute/resolve
#[utoipa::path(
    post,
    path = "/api/v1/dispute/resolve",
    request_body = ResolveDisputeBody,
    responses(
        (status = 200, description = "REFUNDED / REFUND in progress / BUYER_CONFIRMED", content_type = "application/json"),
        (status = 400, description = "Refund amount exceeds escrow"),
        (status = 403, description = "Administrator role required"),
        (status = 409, description = "Dispute already resolved")
    ),
    security(("bearer_jwt" = [])),
    tag = "Dispute"
)]
pub async fn resolve_dispute(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Json(req): Json<ResolveDisputeBody>,
) -> ApiResult<Transaction> {
    ok(state.service.resolve_dispute(actor, req.into()).await?)
}
