//! Webhook Ingress
//!
//! Authenticates provider callbacks and translates them into service calls.
//! The signature is checked over the raw body before any JSON parsing; a
//! request that fails it never reaches [`EscrowService`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::error::EscrowError;
use super::service::EscrowService;
use super::state::TransactionStatus;
use super::types::TransactionId;
use crate::auth::signature::{SignatureError, WebhookKey};

/// Payment gateway callback body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhook {
    pub transaction_id: TransactionId,
    pub pg_transaction_id: String,
    /// `completed` | `failed`
    pub status: String,
}

/// Courier callback body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentWebhook {
    pub transaction_id: TransactionId,
    /// `picked_up` | `delivered`
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// What a webhook delivery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied(TransactionStatus),
    /// Already processed; acknowledged without changes
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookSource {
    PaymentGateway,
    Courier,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookSource::PaymentGateway => "pg",
            WebhookSource::Courier => "courier",
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum WebhookError {
    #[error("missing signature")]
    MissingSignature,

    #[error("no verification key configured for {0} webhooks")]
    NotConfigured(&'static str),

    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

pub struct WebhookIngress {
    service: Arc<EscrowService>,
    pg_key: Option<WebhookKey>,
    courier_key: Option<WebhookKey>,
}

impl WebhookIngress {
    pub fn new(
        service: Arc<EscrowService>,
        pg_key: Option<WebhookKey>,
        courier_key: Option<WebhookKey>,
    ) -> Self {
        Self {
            service,
            pg_key,
            courier_key,
        }
    }

    fn verify(
        &self,
        source: WebhookSource,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<(), WebhookError> {
        let key = match source {
            WebhookSource::PaymentGateway => self.pg_key.as_ref(),
            WebhookSource::Courier => self.courier_key.as_ref(),
        }
        .ok_or(WebhookError::NotConfigured(source.as_str()))?;
        let signature = signature.ok_or(WebhookError::MissingSignature)?;

        key.verify(body, signature).map_err(|e| {
            warn!(source = source.as_str(), error = %e, "Webhook signature rejected");
            WebhookError::Signature(e)
        })
    }

    /// `POST webhook/pg`
    pub async fn ingest_payment(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookError> {
        self.verify(WebhookSource::PaymentGateway, signature, body)?;
        let payload: PaymentWebhook =
            serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;
        Ok(self.service.handle_payment_webhook(payload).await?)
    }

    /// `POST webhook/courier`
    pub async fn ingest_courier(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<TransactionStatus, WebhookError> {
        self.verify(WebhookSource::Courier, signature, body)?;
        let payload: ShipmentWebhook =
            serde_json::from_slice(body).map_err(|e| WebhookError::Payload(e.to_string()))?;
        Ok(self.service.handle_shipment_webhook(payload).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::signature::{generate_keypair, sign_body};
    use crate::escrow::gateway::mock::MockPaymentGateway;
    use crate::escrow::notify::LogSink;
    use crate::escrow::service::EscrowConfig;
    use crate::escrow::store::MemoryStore;

    fn ingress() -> ([u8; 32], [u8; 32], WebhookIngress) {
        let service = Arc::new(EscrowService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockPaymentGateway::new()),
            Arc::new(LogSink),
            EscrowConfig::default(),
        ));
        let (pg_priv, pg_pub) = generate_keypair();
        let (courier_priv, courier_pub) = generate_keypair();
        let ingress = WebhookIngress::new(
            service,
            Some(WebhookKey::from_hex(&pg_pub).unwrap()),
            Some(WebhookKey::from_hex(&courier_pub).unwrap()),
        );
        (pg_priv, courier_priv, ingress)
    }

    fn body(tx: TransactionId) -> Vec<u8> {
        format!(
            r#"{{"transactionId":"{}","pgTransactionId":"pg-1","status":"completed"}}"#,
            tx
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_missing_signature_rejected() {
        let (_, _, ingress) = ingress();
        let err = ingress
            .ingest_payment(None, &body(TransactionId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MissingSignature));
    }

    #[tokio::test]
    async fn test_signature_from_other_provider_rejected() {
        let (_, courier_priv, ingress) = ingress();
        let body = body(TransactionId::new());
        let sig = sign_body(&courier_priv, &body);
        let err = ingress.ingest_payment(Some(&sig), &body).await.unwrap_err();
        assert!(matches!(err, WebhookError::Signature(SignatureError::Mismatch)));
    }

    #[tokio::test]
    async fn test_valid_signature_reaches_service() {
        let (pg_priv, _, ingress) = ingress();
        let body = body(TransactionId::new());
        let sig = sign_body(&pg_priv, &body);
        // Signature passes; the unknown pg id is the service's answer
        let err = ingress.ingest_payment(Some(&sig), &body).await.unwrap_err();
        assert!(matches!(err, WebhookError::Escrow(EscrowError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_signed_garbage_is_payload_error() {
        let (_, courier_priv, ingress) = ingress();
        let body = b"not json";
        let sig = sign_body(&courier_priv, body);
        let err = ingress.ingest_courier(Some(&sig), body).await.unwrap_err();
        assert!(matches!(err, WebhookError::Payload(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_source_fails_closed() {
        let service = Arc::new(EscrowService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockPaymentGateway::new()),
            Arc::new(LogSink),
            EscrowConfig::default(),
        ));
        let ingress = WebhookIngress::new(service, None, None);
        let err = ingress
            .ingest_courier(Some("sig"), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::NotConfigured("courier")));
    }
}
