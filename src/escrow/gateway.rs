//! Payment Gateway Adapter
//!
//! The engine only needs two calls from a payment provider: charge and refund.
//! Both MUST be idempotent on the order id the engine sends (the payment's
//! idempotency key, or the refund id), so a retried call after a crash never
//! moves money twice.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::GatewayFailure;
use super::types::{BankAccount, TransactionId};

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    /// Equal to the client idempotency key
    pub order_id: String,
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub method: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub pg_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefundOrder {
    pub refund_id: Uuid,
    pub transaction_id: TransactionId,
    /// Gateway id of the original charge, when known
    pub original_pg_transaction_id: Option<String>,
    pub amount: Decimal,
    pub reason: String,
    pub bank: Option<BankAccount>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundReceipt {
    pub pg_transaction_id: String,
    /// `false` when the gateway accepted the refund but will confirm by webhook
    pub completed: bool,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    async fn charge(&self, req: &ChargeRequest) -> Result<ChargeReceipt, GatewayFailure>;

    async fn refund(&self, order: &RefundOrder) -> Result<RefundReceipt, GatewayFailure>;
}

// ============================================================================
// HTTP gateway
// ============================================================================

/// JSON-over-HTTP gateway client
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    provider: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChargeBody<'a> {
    order_id: &'a str,
    reference: String,
    amount: Decimal,
    method: &'a str,
    provider: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefundBody<'a> {
    order_id: String,
    reference: String,
    original_pg_transaction_id: Option<&'a str>,
    amount: Decimal,
    reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bank: Option<&'a BankAccount>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GatewayReply {
    pg_transaction_id: Option<String>,
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        provider: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayFailure> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayFailure::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            provider: provider.into(),
        })
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        idempotency_key: &str,
        body: &B,
    ) -> Result<GatewayReply, GatewayFailure> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        let reply: GatewayReply = response
            .json()
            .await
            .map_err(|e| GatewayFailure::Transport(format!("Failed to parse response: {}", e)))?;

        if status.is_server_error() {
            return Err(GatewayFailure::Transport(format!("gateway returned {}", status)));
        }
        if !status.is_success() || reply.status == "failed" || reply.status == "declined" {
            let msg = reply.message.unwrap_or_else(|| reply.status.clone());
            return Err(GatewayFailure::Declined(msg));
        }
        Ok(reply)
    }
}

fn map_transport(e: reqwest::Error) -> GatewayFailure {
    if e.is_timeout() {
        GatewayFailure::Timeout
    } else {
        GatewayFailure::Transport(format!("HTTP request failed: {}", e))
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn charge(&self, req: &ChargeRequest) -> Result<ChargeReceipt, GatewayFailure> {
        let body = ChargeBody {
            order_id: &req.order_id,
            reference: req.transaction_id.to_string(),
            amount: req.amount,
            method: &req.method,
            provider: &req.provider,
        };
        let reply = self.post("/v1/payments", &req.order_id, &body).await?;
        let pg_transaction_id = reply.pg_transaction_id.ok_or_else(|| {
            warn!(order_id = %req.order_id, "Gateway approved charge without an id");
            GatewayFailure::Transport("missing pgTransactionId".to_string())
        })?;

        debug!(order_id = %req.order_id, pg_tx = %pg_transaction_id, "Charge approved");
        Ok(ChargeReceipt { pg_transaction_id })
    }

    async fn refund(&self, order: &RefundOrder) -> Result<RefundReceipt, GatewayFailure> {
        let order_id = order.refund_id.to_string();
        let body = RefundBody {
            order_id: order_id.clone(),
            reference: order.transaction_id.to_string(),
            original_pg_transaction_id: order.original_pg_transaction_id.as_deref(),
            amount: order.amount,
            reason: &order.reason,
            bank: order.bank.as_ref(),
        };
        let reply = self.post("/v1/refunds", &order_id, &body).await?;
        let pg_transaction_id = reply
            .pg_transaction_id
            .ok_or_else(|| GatewayFailure::Transport("missing pgTransactionId".to_string()))?;

        Ok(RefundReceipt {
            pg_transaction_id,
            completed: reply.status == "completed",
        })
    }
}

// ============================================================================
// Mock gateway
// ============================================================================

/// In-process gateway for development and tests
#[cfg(any(test, feature = "mock-api"))]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Mock gateway
    ///
    /// Charges are deduplicated by order id like a real provider would.
    pub struct MockPaymentGateway {
        /// order id -> pg transaction id
        charges: Mutex<HashMap<String, String>>,
        charge_count: AtomicUsize,
        refund_count: AtomicUsize,
        fail_charge: AtomicBool,
        /// Number of upcoming refund calls that fail
        refund_failures: AtomicUsize,
        /// Refunds are accepted but confirmed later by webhook
        async_refunds: AtomicBool,
        delay: Mutex<Option<Duration>>,
    }

    impl Default for MockPaymentGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockPaymentGateway {
        pub fn new() -> Self {
            Self {
                charges: Mutex::new(HashMap::new()),
                charge_count: AtomicUsize::new(0),
                refund_count: AtomicUsize::new(0),
                fail_charge: AtomicBool::new(false),
                refund_failures: AtomicUsize::new(0),
                async_refunds: AtomicBool::new(false),
                delay: Mutex::new(None),
            }
        }

        pub fn set_fail_charge(&self, fail: bool) {
            self.fail_charge.store(fail, Ordering::SeqCst);
        }

        pub fn fail_next_refunds(&self, n: usize) {
            self.refund_failures.store(n, Ordering::SeqCst);
        }

        pub fn set_async_refunds(&self, on: bool) {
            self.async_refunds.store(on, Ordering::SeqCst);
        }

        /// Sleep inside each call, to widen race windows in tests
        pub async fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock().await = delay;
        }

        pub fn charge_count(&self) -> usize {
            self.charge_count.load(Ordering::SeqCst)
        }

        pub fn refund_count(&self) -> usize {
            self.refund_count.load(Ordering::SeqCst)
        }

        /// Distinct orders actually charged
        pub async fn distinct_charges(&self) -> usize {
            self.charges.lock().await.len()
        }

        async fn pause(&self) {
            let delay = *self.delay.lock().await;
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for MockPaymentGateway {
        fn name(&self) -> &str {
            "mock"
        }

        async fn charge(&self, req: &ChargeRequest) -> Result<ChargeReceipt, GatewayFailure> {
            self.charge_count.fetch_add(1, Ordering::SeqCst);
            self.pause().await;

            if self.fail_charge.load(Ordering::SeqCst) {
                return Err(GatewayFailure::Declined("Mock charge failure".to_string()));
            }

            let mut charges = self.charges.lock().await;
            let pg_id = charges
                .entry(req.order_id.clone())
                .or_insert_with(|| format!("pg_{}", Uuid::new_v4().simple()))
                .clone();
            Ok(ChargeReceipt {
                pg_transaction_id: pg_id,
            })
        }

        async fn refund(&self, order: &RefundOrder) -> Result<RefundReceipt, GatewayFailure> {
            self.refund_count.fetch_add(1, Ordering::SeqCst);
            self.pause().await;

            let failing = self
                .refund_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(GatewayFailure::Transport("Mock refund failure".to_string()));
            }

            Ok(RefundReceipt {
                pg_transaction_id: format!("rf_{}", order.refund_id.simple()),
                completed: !self.async_refunds.load(Ordering::SeqCst),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn charge_req(order_id: &str) -> ChargeRequest {
            ChargeRequest {
                order_id: order_id.to_string(),
                transaction_id: TransactionId::new(),
                amount: Decimal::from(100000),
                method: "card".to_string(),
                provider: "mock".to_string(),
            }
        }

        fn refund_order() -> RefundOrder {
            RefundOrder {
                refund_id: Uuid::new_v4(),
                transaction_id: TransactionId::new(),
                original_pg_transaction_id: None,
                amount: Decimal::from(100000),
                reason: "cancel".to_string(),
                bank: None,
            }
        }

        #[tokio::test]
        async fn test_mock_charge_dedupes_by_order_id() {
            let gw = MockPaymentGateway::new();
            let a = gw.charge(&charge_req("key-1")).await.unwrap();
            let b = gw.charge(&charge_req("key-1")).await.unwrap();
            assert_eq!(a, b);
            assert_eq!(gw.charge_count(), 2);
            assert_eq!(gw.distinct_charges().await, 1);
        }

        #[tokio::test]
        async fn test_mock_charge_failure() {
            let gw = MockPaymentGateway::new();
            gw.set_fail_charge(true);
            let err = gw.charge(&charge_req("key-1")).await.unwrap_err();
            assert!(matches!(err, GatewayFailure::Declined(_)));
            assert_eq!(gw.distinct_charges().await, 0);
        }

        #[tokio::test]
        async fn test_mock_refund_failures_countdown() {
            let gw = MockPaymentGateway::new();
            gw.fail_next_refunds(2);
            assert!(gw.refund(&refund_order()).await.is_err());
            assert!(gw.refund(&refund_order()).await.is_err());
            let receipt = gw.refund(&refund_order()).await.unwrap();
            assert!(receipt.completed);
            assert_eq!(gw.refund_count(), 3);
        }

        #[tokio::test]
        async fn test_mock_async_refund() {
            let gw = MockPaymentGateway::new();
            gw.set_async_refunds(true);
            let receipt = gw.refund(&refund_order()).await.unwrap();
            assert!(!receipt.completed);
            assert!(receipt.pg_transaction_id.starts_with("rf_"));
        }
    }
}
