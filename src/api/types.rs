//! API Response types, error mapping and request DTOs
//!
//! - `ApiResponse<T>`: Unified response wrapper
//! - `ApiError`: every rejection, rendered in the same envelope
//! - `error_codes`: Standard error code constants
//! - Request bodies, validated with `validator` before reaching the service

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::{AuthError, AuthErrorCode};
use crate::escrow::types::{
    InitiatePaymentRequest, OpenDisputeRequest, OpenTransactionRequest, RefundRequest,
    RegisterShipmentRequest, ResolveDisputeRequest,
};
use crate::escrow::{
    BankAccount, DisputeResolution, DisputeType, EscrowError, TransactionId, UserId, WebhookError,
};

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or null (error)
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Response code: 0 for success, non-zero for errors
    #[schema(example = 0)]
    pub code: i32,
    /// Response message
    #[schema(example = "ok")]
    pub msg: String,
    /// Response data (only present when code == 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Create success response
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    /// Create error response
    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Standard API error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;

    // Auth errors (2xxx) live in `AuthErrorCode`

    // Authorization (3xxx)
    pub const FORBIDDEN: i32 = 3001;

    // Resource / state errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4002;
    pub const INVALID_TRANSITION: i32 = 4003;
    pub const UNKNOWN_EVENT: i32 = 4004;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
    pub const GATEWAY_ERROR: i32 = 5002;
}

// ============================================================================
// Errors
// ============================================================================

/// Error body: `{code, error, msg, retryable?}`
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    #[schema(example = 4003)]
    pub code: i32,
    #[schema(value_type = String, example = "INVALID_TRANSITION")]
    pub error: &'static str,
    /// Human-readable reason, the same text the transition table produces
    pub msg: String,
    /// Safe to redeliver later (webhooks)
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub error: &'static str,
    pub msg: String,
    pub retryable: bool,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Wrap data in the success envelope
pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, error: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            error,
            msg: msg.into(),
            retryable: false,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_PARAMETER,
            "INVALID_REQUEST",
            msg,
        )
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            "SERVICE_UNAVAILABLE",
            msg,
        )
    }
}

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        let code = match &e {
            EscrowError::NotFound(_) => error_codes::NOT_FOUND,
            EscrowError::Forbidden(_) => error_codes::FORBIDDEN,
            EscrowError::Conflict(_) => error_codes::CONFLICT,
            EscrowError::InvalidTransition { .. } => error_codes::INVALID_TRANSITION,
            EscrowError::UnknownEvent(_) => error_codes::UNKNOWN_EVENT,
            EscrowError::InvalidRequest(_) => error_codes::INVALID_PARAMETER,
            EscrowError::GatewayError(_) => error_codes::GATEWAY_ERROR,
            EscrowError::Storage(_) => error_codes::INTERNAL_ERROR,
        };
        if matches!(e, EscrowError::Storage(_)) {
            tracing::error!(error = %e, "Storage failure surfaced to caller");
        }
        Self {
            status: StatusCode::from_u16(e.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            code,
            error: e.code(),
            msg: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        Self::new(e.code.http_status(), e.code.code(), e.code.name(), e.message)
    }
}

impl From<WebhookError> for ApiError {
    fn from(e: WebhookError) -> Self {
        match e {
            WebhookError::MissingSignature => {
                AuthError::from_code(AuthErrorCode::MissingSignature).into()
            }
            WebhookError::NotConfigured(source) => AuthError::new(
                AuthErrorCode::KeyNotConfigured,
                format!("no verification key configured for {} webhooks", source),
            )
            .into(),
            WebhookError::Signature(s) => {
                AuthError::new(AuthErrorCode::InvalidSignature, s.to_string()).into()
            }
            WebhookError::Payload(msg) => ApiError::bad_request(msg),
            WebhookError::Escrow(e) => e.into(),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            code: self.code,
            error: self.error,
            msg: self.msg,
            retryable: self.retryable,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Run the derive validators, mapping failures to 400
pub fn validated<T: Validate>(req: T) -> Result<T, ApiError> {
    req.validate()?;
    Ok(req)
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenTransactionBody {
    #[validate(length(min = 1, max = 64))]
    #[schema(example = "listing-42")]
    pub listing_id: String,
    #[schema(example = 2002)]
    pub seller_id: UserId,
    #[schema(value_type = String, example = "100000")]
    pub amount: Decimal,
}

impl From<OpenTransactionBody> for OpenTransactionRequest {
    fn from(b: OpenTransactionBody) -> Self {
        Self {
            listing_id: b.listing_id,
            seller_id: b.seller_id,
            amount: b.amount,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentBody {
    #[schema(value_type = String, example = "01HZX3Q5V9M2J8K7N6P4R3T2W1")]
    pub transaction_id: TransactionId,
    #[schema(value_type = String, example = "100000")]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 32))]
    #[schema(example = "card")]
    pub method: String,
    #[validate(length(min = 1, max = 32))]
    #[schema(example = "toss")]
    pub pg_provider: String,
    /// Client-generated; retries with the same key return the same result
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: String,
}

impl From<InitiatePaymentBody> for InitiatePaymentRequest {
    fn from(b: InitiatePaymentBody) -> Self {
        Self {
            transaction_id: b.transaction_id,
            amount: b.amount,
            method: b.method,
            pg_provider: b.pg_provider,
            idempotency_key: b.idempotency_key,
        }
    }
}

/// Body of the single-id actions (approve, confirm, final-confirm)
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransactionIdBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequestBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
    /// Required by the transition table; an empty reason is rejected there
    #[validate(length(max = 500))]
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShipBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
    #[validate(length(min = 1, max = 32))]
    #[schema(example = "cj")]
    pub courier: String,
    #[validate(length(max = 64))]
    #[serde(default)]
    pub tracking_number: String,
}

impl From<ShipBody> for RegisterShipmentRequest {
    fn from(b: ShipBody) -> Self {
        Self {
            transaction_id: b.transaction_id,
            courier: b.courier,
            tracking_number: b.tracking_number,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
    /// Defaults to the full escrow-held amount
    #[schema(value_type = Option<String>)]
    pub amount: Option<Decimal>,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[validate(length(max = 16))]
    pub bank_code: Option<String>,
    #[validate(length(max = 32))]
    pub account_number: Option<String>,
    #[validate(length(max = 64))]
    pub account_holder: Option<String>,
}

impl From<RefundBody> for RefundRequest {
    fn from(b: RefundBody) -> Self {
        let bank = match (b.bank_code, b.account_number, b.account_holder) {
            (Some(bank_code), Some(account_number), Some(account_holder)) => Some(BankAccount {
                bank_code,
                account_number,
                account_holder,
            }),
            _ => None,
        };
        Self {
            transaction_id: b.transaction_id,
            amount: b.amount,
            reason: b.reason,
            bank,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundRetryBody {
    pub refund_id: Uuid,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OpenDisputeBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
    #[serde(rename = "type")]
    #[schema(value_type = String, example = "quality_issue")]
    pub dispute_type: DisputeType,
    #[validate(length(min = 1, max = 1000))]
    pub reason: String,
    #[validate(length(max = 20))]
    #[serde(default)]
    pub evidence_urls: Vec<String>,
}

impl From<OpenDisputeBody> for OpenDisputeRequest {
    fn from(b: OpenDisputeBody) -> Self {
        Self {
            transaction_id: b.transaction_id,
            dispute_type: b.dispute_type,
            reason: b.reason,
            evidence_urls: b.evidence_urls,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvidenceBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
    #[validate(length(min = 1, max = 20))]
    pub evidence_urls: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDisputeBody {
    #[schema(value_type = String)]
    pub transaction_id: TransactionId,
    #[schema(value_type = String, example = "refund")]
    pub resolution: DisputeResolution,
    #[schema(value_type = Option<String>, example = "50000")]
    pub refund_amount: Option<Decimal>,
}

impl From<ResolveDisputeBody> for ResolveDisputeRequest {
    fn from(b: ResolveDisputeBody) -> Self {
        Self {
            transaction_id: b.transaction_id,
            resolution: b.resolution,
            refund_amount: b.refund_amount,
        }
    }
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Webhook acknowledgement
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    /// `applied` | `duplicate`
    #[schema(value_type = String)]
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::state::TransactionStatus;
    use crate::escrow::state_machine::TransitionRejection;

    #[test]
    fn test_escrow_error_mapping() {
        let e: ApiError = EscrowError::Forbidden("nope".to_string()).into();
        assert_eq!(e.status, StatusCode::FORBIDDEN);
        assert_eq!(e.code, error_codes::FORBIDDEN);
        assert_eq!(e.error, "FORBIDDEN");

        let e: ApiError = EscrowError::invalid_transition(
            TransactionStatus::Shipped,
            TransactionStatus::Delivered,
            TransitionRejection::NoSuchTransition,
        )
        .into();
        assert_eq!(e.status, StatusCode::CONFLICT);
        assert!(e.retryable);
        assert!(e.msg.contains("no such transition"));
    }

    #[test]
    fn test_webhook_error_mapping() {
        let e: ApiError = WebhookError::MissingSignature.into();
        assert_eq!(e.status, StatusCode::UNAUTHORIZED);
        assert_eq!(e.code, AuthErrorCode::MissingSignature.code());

        let e: ApiError = WebhookError::Payload("bad json".to_string()).into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);

        let e: ApiError = WebhookError::Escrow(EscrowError::UnknownEvent("x".to_string())).into();
        assert_eq!(e.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_error_body_omits_false_retryable() {
        let body = ApiErrorBody {
            code: 1001,
            error: "INVALID_REQUEST",
            msg: "x".to_string(),
            retryable: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("retryable").is_none());
    }

    #[test]
    fn test_refund_body_bank_requires_all_fields() {
        let body: RefundBody = serde_json::from_value(serde_json::json!({
            "transactionId": TransactionId::new().to_string(),
            "reason": "broken",
            "bankCode": "004",
            "accountNumber": "123-456",
            "accountHolder": "Kim",
        }))
        .unwrap();
        let req: RefundRequest = body.into();
        assert_eq!(req.bank.unwrap().bank_code, "004");

        let body: RefundBody = serde_json::from_value(serde_json::json!({
            "transactionId": TransactionId::new().to_string(),
            "reason": "broken",
            "bankCode": "004",
        }))
        .unwrap();
        let req: RefundRequest = body.into();
        assert!(req.bank.is_none());
    }

    #[test]
    fn test_validation_rejects_empty_listing() {
        let body = OpenTransactionBody {
            listing_id: String::new(),
            seller_id: 2,
            amount: Decimal::from(10),
        };
        let err = validated(body).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_dispute_body_type_field() {
        let body: OpenDisputeBody = serde_json::from_value(serde_json::json!({
            "transactionId": TransactionId::new().to_string(),
            "type": "not_received",
            "reason": "never arrived",
        }))
        .unwrap();
        assert_eq!(body.dispute_type, DisputeType::NotReceived);
        assert!(body.evidence_urls.is_empty());
    }
}
