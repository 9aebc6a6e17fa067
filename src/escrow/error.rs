//! Escrow Error Types
//!
//! Domain errors returned by the escrow service, plus the persistence and
//! gateway error types they are built from.

use thiserror::Error;

use super::state::TransactionStatus;
use super::state_machine::TransitionRejection;

/// Failure reported by the external payment gateway
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayFailure {
    /// Gateway answered and refused the operation
    #[error("declined by gateway: {0}")]
    Declined(String),

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway timed out")]
    Timeout,
}

/// Persistence errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// Another writer committed first (optimistic version check failed)
    #[error("Version conflict on transaction {0}")]
    VersionConflict(String),

    #[error("Payment with this idempotency key already exists")]
    DuplicatePayment,

    #[error("An outstanding refund already exists for this transaction")]
    ActiveRefundExists,

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound(e.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                match db.constraint() {
                    Some(c) if c.contains("payments") => StoreError::DuplicatePayment,
                    Some(c) if c.contains("refund") => StoreError::ActiveRefundExists,
                    _ => StoreError::Database(e.to_string()),
                }
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Escrow error taxonomy
///
/// Every variant carries a human-readable message; `code()` and
/// `http_status()` drive the API envelope.
#[derive(Error, Debug, Clone)]
pub enum EscrowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Transition already applied, duplicate key, or an outstanding refund
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
        reason: TransitionRejection,
    },

    #[error("Gateway error: {0}")]
    GatewayError(#[from] GatewayFailure),

    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EscrowError {
    pub fn not_found(id: impl std::fmt::Display) -> Self {
        EscrowError::NotFound(format!("transaction {}", id))
    }

    pub fn invalid_transition(
        from: TransactionStatus,
        to: TransactionStatus,
        reason: TransitionRejection,
    ) -> Self {
        EscrowError::InvalidTransition { from, to, reason }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EscrowError::NotFound(_) => "NOT_FOUND",
            EscrowError::Forbidden(_) => "FORBIDDEN",
            EscrowError::Conflict(_) => "CONFLICT",
            EscrowError::InvalidTransition { .. } => "INVALID_TRANSITION",
            EscrowError::GatewayError(_) => "GATEWAY_ERROR",
            EscrowError::UnknownEvent(_) => "UNKNOWN_EVENT",
            EscrowError::InvalidRequest(_) => "INVALID_REQUEST",
            EscrowError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EscrowError::NotFound(_) => 404,
            EscrowError::Forbidden(_) => 403,
            EscrowError::Conflict(_) | EscrowError::InvalidTransition { .. } => 409,
            EscrowError::UnknownEvent(_) => 422,
            EscrowError::InvalidRequest(_) => 400,
            EscrowError::GatewayError(_) => 502,
            EscrowError::Storage(_) => 500,
        }
    }

    /// Whether redelivering the same request later may succeed
    ///
    /// Webhook senders use this to keep an out-of-order event in their
    /// redelivery queue.
    pub fn is_retryable(&self) -> bool {
        match self {
            EscrowError::InvalidTransition { .. } | EscrowError::Storage(_) => true,
            EscrowError::GatewayError(f) => !matches!(f, GatewayFailure::Declined(_)),
            _ => false,
        }
    }
}

impl From<StoreError> for EscrowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => EscrowError::NotFound(what),
            StoreError::VersionConflict(id) => {
                EscrowError::Conflict(format!("transaction {} was modified concurrently", id))
            }
            StoreError::DuplicatePayment => {
                EscrowError::Conflict("payment already processed".to_string())
            }
            StoreError::ActiveRefundExists => {
                EscrowError::Conflict("a refund is already in progress".to_string())
            }
            StoreError::Database(msg) => EscrowError::Storage(msg),
        }
    }
}
