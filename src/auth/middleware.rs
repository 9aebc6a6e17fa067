//! Authentication middleware for Axum.
//!
//! Resolves `Authorization: Bearer <jwt>` once into an [`Actor`] request
//! extension; handlers never look at tokens.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::error::{AuthError, AuthErrorCode};
use crate::api::state::AppState;
use crate::escrow::Actor;

/// Extract the bearer token from request headers.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| AuthError::from_code(AuthErrorCode::MissingAuth))?
        .to_str()
        .map_err(|_| AuthError::new(AuthErrorCode::InvalidToken, "Non-ASCII Authorization header"))?;

    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::new(AuthErrorCode::InvalidToken, "Invalid token format"))
}

pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let token = extract_bearer(request.headers())?;
    let actor = state.jwt.authenticate(token).inspect_err(|e| {
        tracing::debug!(error = %e, "Bearer token rejected");
    })?;

    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}

/// Operator-only routes. Runs inside [`jwt_auth_middleware`].
pub async fn require_admin(request: Request<Body>, next: Next) -> Result<Response, AuthError> {
    match request.extensions().get::<Actor>() {
        Some(actor) if actor.is_admin() => Ok(next.run(request).await),
        Some(actor) => {
            tracing::debug!(actor = %actor, path = %request.uri().path(), "Operator route refused");
            Err(AuthError::from_code(AuthErrorCode::PermissionDenied))
        }
        None => Err(AuthError::from_code(AuthErrorCode::MissingAuth)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            extract_bearer(&headers).unwrap_err().code,
            AuthErrorCode::MissingAuth
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(
            extract_bearer(&headers).unwrap_err().code,
            AuthErrorCode::InvalidToken
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer(&headers).unwrap(), "abc.def");
    }
}
