//! Authentication error types.
//!
//! Rejections raised before a request reaches the escrow service:
//! caller tokens and webhook signatures.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Authentication error codes (2001-2008).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthErrorCode {
    /// 2001: Authorization header missing
    MissingAuth = 2001,
    /// 2002: Token malformed or signed with another secret
    InvalidToken = 2002,
    /// 2003: Token past its `exp`
    TokenExpired = 2003,
    /// 2004: Webhook arrived without `X-Signature`
    MissingSignature = 2004,
    /// 2005: Webhook signature does not verify
    InvalidSignature = 2005,
    /// 2006: No public key configured for the webhook source
    KeyNotConfigured = 2006,
    /// 2007: Route restricted to operators
    PermissionDenied = 2007,
    /// 2008: Internal server error
    InternalError = 2008,
}

impl AuthErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MissingAuth => "MISSING_AUTH",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::KeyNotConfigured => "KEY_NOT_CONFIGURED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::InternalError | Self::KeyNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Authentication error with message.
#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub message: String,
}

impl AuthError {
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create error with default message.
    pub fn from_code(code: AuthErrorCode) -> Self {
        let message = match code {
            AuthErrorCode::MissingAuth => "Missing Authorization header",
            AuthErrorCode::InvalidToken => "Invalid token",
            AuthErrorCode::TokenExpired => "Token expired",
            AuthErrorCode::MissingSignature => "Missing X-Signature header",
            AuthErrorCode::InvalidSignature => "Signature verification failed",
            AuthErrorCode::KeyNotConfigured => "Webhook key not configured",
            AuthErrorCode::PermissionDenied => "Administrator role required",
            AuthErrorCode::InternalError => "Internal server error",
        };
        Self::new(code, message)
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.name(), self.message)
    }
}

impl std::error::Error for AuthError {}

/// JSON response body for auth errors, in the `{code, msg}` envelope shape.
#[derive(Debug, Serialize)]
pub struct AuthErrorResponse {
    pub code: i32,
    pub error: &'static str,
    pub msg: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = AuthErrorResponse {
            code: self.code.code(),
            error: self.code.name(),
            msg: self.message,
        };
        (self.code.http_status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthErrorCode::MissingAuth.code(), 2001);
        assert_eq!(AuthErrorCode::InternalError.code(), 2008);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(
            AuthErrorCode::InvalidSignature.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthErrorCode::PermissionDenied.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthErrorCode::KeyNotConfigured.http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_from_code() {
        let err = AuthError::from_code(AuthErrorCode::MissingSignature);
        assert_eq!(err.code, AuthErrorCode::MissingSignature);
        assert!(err.message.contains("X-Signature"));
    }
}
