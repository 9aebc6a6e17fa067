//! Caller authentication and webhook signature verification.

pub mod error;
pub mod jwt;
pub mod middleware;
pub mod signature;

pub use error::{AuthError, AuthErrorCode};
pub use jwt::{Claims, JwtAuth, ROLE_ADMIN, ROLE_USER};
pub use middleware::{jwt_auth_middleware, require_admin};
pub use signature::{SignatureError, WebhookKey};
