//! Caller identity from HS256 bearer tokens.
//!
//! Tokens are issued by the marketplace's account service; this engine
//! only verifies them. `sub` is the user id, `role` is `user` or `admin`.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use super::error::{AuthError, AuthErrorCode};
use crate::escrow::Actor;

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

fn default_role() -> String {
    ROLE_USER.to_string()
}

impl Claims {
    pub fn to_actor(&self) -> Result<Actor, AuthError> {
        let id: u64 = self
            .sub
            .parse()
            .map_err(|_| AuthError::new(AuthErrorCode::InvalidToken, "sub is not a user id"))?;
        match self.role.as_str() {
            ROLE_ADMIN => Ok(Actor::Admin(id)),
            ROLE_USER => Ok(Actor::User(id)),
            other => Err(AuthError::new(
                AuthErrorCode::InvalidToken,
                format!("unknown role: {}", other),
            )),
        }
    }
}

#[derive(Clone)]
pub struct JwtAuth {
    secret: String,
}

impl JwtAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a token (tests and local tooling)
    pub fn issue(&self, user_id: u64, role: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (now + ttl).timestamp().max(0) as usize,
            iat: now.timestamp().max(0) as usize,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::new(AuthErrorCode::InternalError, e.to_string()))
    }

    /// Verify JWT token
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let decoding_key = DecodingKey::from_secret(self.secret.as_bytes());
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::from_code(AuthErrorCode::TokenExpired),
                _ => AuthError::from_code(AuthErrorCode::InvalidToken),
            })
    }

    /// Verify and resolve to the engine's caller identity
    pub fn authenticate(&self, token: &str) -> Result<Actor, AuthError> {
        self.verify(token)?.to_actor()
    }
}
