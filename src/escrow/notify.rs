//! Chat / Notification Sink
//!
//! The engine never renders UI. It emits a system message with free text and
//! zero or more suggested `{label, api, method}` actions; the chat layer turns
//! them into buttons.
//!
//! Notifications are written to the outbox in the same commit as the state
//! change, then handed to a [`NotificationSink`] after commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::types::{Transaction, TransactionId, UserId};

#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Who should see the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Buyer,
    Seller,
    /// Buyer and seller chat room
    Parties,
    /// Operator queue
    Admins,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Buyer => "buyer",
            Audience::Seller => "seller",
            Audience::Parties => "parties",
            Audience::Admins => "admins",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buyer" => Some(Audience::Buyer),
            "seller" => Some(Audience::Seller),
            "parties" => Some(Audience::Parties),
            "admins" => Some(Audience::Admins),
            _ => None,
        }
    }
}

/// A button the UI may render under the message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub api: String,
    pub method: String,
}

impl SuggestedAction {
    pub fn post(label: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            api: api.into(),
            method: "POST".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub transaction_id: TransactionId,
    pub audience: Audience,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub text: String,
    pub actions: Vec<SuggestedAction>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(tx: &Transaction, audience: Audience, text: impl Into<String>) -> Self {
        Self {
            transaction_id: tx.id,
            audience,
            buyer_id: tx.buyer_id,
            seller_id: tx.seller_id,
            text: text.into(),
            actions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_action(mut self, action: SuggestedAction) -> Self {
        self.actions.push(action);
        self
    }

    /// User ids that receive the message (empty for the admin queue)
    pub fn recipients(&self) -> Vec<UserId> {
        match self.audience {
            Audience::Buyer => vec![self.buyer_id],
            Audience::Seller => vec![self.seller_id],
            Audience::Parties => vec![self.buyer_id, self.seller_id],
            Audience::Admins => Vec::new(),
        }
    }
}

/// Outbox row: a notification plus its storage id
#[derive(Debug, Clone, PartialEq)]
pub struct PendingNotification {
    pub id: i64,
    pub notification: Notification,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only (dev, tests without a chat service)
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        info!(
            transaction_id = %n.transaction_id,
            audience = n.audience.as_str(),
            actions = n.actions.len(),
            "{}",
            n.text
        );
        Ok(())
    }
}

/// Posts system messages to the chat service
pub struct HttpChatSink {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatMessage<'a> {
    transaction_id: String,
    message_type: &'static str,
    recipients: Vec<UserId>,
    audience: &'static str,
    text: &'a str,
    actions: &'a [SuggestedAction],
}

impl HttpChatSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for HttpChatSink {
    fn name(&self) -> &'static str {
        "http_chat"
    }

    async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
        let body = ChatMessage {
            transaction_id: n.transaction_id.to_string(),
            message_type: "system",
            recipients: n.recipients(),
            audience: n.audience.as_str(),
            text: &n.text,
            actions: &n.actions,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Unavailable(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(format!("chat service returned {}", status)));
        }

        debug!(transaction_id = %n.transaction_id, "Chat message delivered");
        Ok(())
    }
}

/// Mock sink for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct RecordingSink {
        delivered: Mutex<Vec<Notification>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn delivered(&self) -> Vec<Notification> {
            self.delivered.lock().unwrap().clone()
        }

        pub fn texts_for(&self, tx: TransactionId) -> Vec<String> {
            self.delivered()
                .into_iter()
                .filter(|n| n.transaction_id == tx)
                .map(|n| n.text)
                .collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn deliver(&self, n: &Notification) -> Result<(), NotifyError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Unavailable("mock sink down".to_string()));
            }
            self.delivered.lock().unwrap().push(n.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn tx() -> Transaction {
        Transaction::new("listing-9", 1001, 2002, Decimal::from(50000), Decimal::ZERO)
    }

    #[test]
    fn test_recipients_by_audience() {
        let t = tx();
        assert_eq!(Notification::new(&t, Audience::Buyer, "x").recipients(), vec![1001]);
        assert_eq!(Notification::new(&t, Audience::Seller, "x").recipients(), vec![2002]);
        assert_eq!(
            Notification::new(&t, Audience::Parties, "x").recipients(),
            vec![1001, 2002]
        );
        assert!(Notification::new(&t, Audience::Admins, "x").recipients().is_empty());
    }

    #[test]
    fn test_actions_serialize_as_label_api_method() {
        let n = Notification::new(&tx(), Audience::Buyer, "delivered")
            .with_action(SuggestedAction::post("Confirm purchase", "/api/v1/payment/confirm"));
        let json = serde_json::to_value(&n.actions).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"label": "Confirm purchase", "api": "/api/v1/payment/confirm", "method": "POST"}])
        );
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = mock::RecordingSink::new();
        let t = tx();
        sink.deliver(&Notification::new(&t, Audience::Parties, "hello"))
            .await
            .unwrap();
        assert_eq!(sink.texts_for(t.id), vec!["hello".to_string()]);

        sink.set_fail(true);
        assert!(sink.deliver(&Notification::new(&t, Audience::Parties, "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_log_sink_accepts_everything() {
        assert!(LogSink.deliver(&Notification::new(&tx(), Audience::Admins, "x")).await.is_ok());
    }
}
