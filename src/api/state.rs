use std::sync::Arc;

use crate::auth::JwtAuth;
use crate::escrow::{EscrowService, WebhookIngress};

/// Shared state behind every route
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EscrowService>,
    /// Signature-checked entry for provider callbacks
    pub ingress: Arc<WebhookIngress>,
    /// Caller token verification
    pub jwt: JwtAuth,
}

impl AppState {
    pub fn new(service: Arc<EscrowService>, ingress: Arc<WebhookIngress>, jwt: JwtAuth) -> Self {
        Self {
            service,
            ingress,
            jwt,
        }
    }
}
