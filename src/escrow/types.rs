//! Escrow Core Types
//!
//! Aggregate root, child records and request types for the escrow FSM.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TransactionStatus;
use super::state_machine::Trigger;

/// Marketplace user identifier (issued by the identity layer)
pub type UserId = u64;

/// Transaction ID - ULID-based unique identifier
///
/// Monotonic and sortable, so `ORDER BY transaction_id` follows creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(ulid::Ulid);

impl TransactionId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for TransactionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid transaction id: {}", s)))
    }
}

/// Who is calling the engine. Resolved once at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    /// Authenticated marketplace user (buyer or seller role derived per transaction)
    User(UserId),
    /// Platform operator
    Admin(UserId),
    /// Webhooks and background sweeps
    System,
}

impl Actor {
    /// User id recorded in the audit trail (`None` for the system)
    pub fn id(&self) -> Option<UserId> {
        match self {
            Actor::User(id) | Actor::Admin(id) => Some(*id),
            Actor::System => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Actor::Admin(_))
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Admin(id) => write!(f, "admin:{}", id),
            Actor::System => f.write_str("system"),
        }
    }
}

/// Transaction aggregate root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: TransactionId,
    pub listing_id: String,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub status: TransactionStatus,
    /// Gross price paid by the buyer
    pub amount: Decimal,
    /// Portion currently held by the platform
    pub escrow_amount: Decimal,
    pub platform_fee: Decimal,
    /// Key of the payment that moved the transaction to PAID
    pub idempotency_key: Option<String>,
    pub cancel_reason: Option<String>,
    /// Optimistic concurrency token, bumped on every commit
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Create a new transaction in INITIATED state
    pub fn new(
        listing_id: impl Into<String>,
        buyer_id: UserId,
        seller_id: UserId,
        amount: Decimal,
        platform_fee: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            listing_id: listing_id.into(),
            buyer_id,
            seller_id,
            status: TransactionStatus::Initiated,
            amount,
            escrow_amount: Decimal::ZERO,
            platform_fee,
            idempotency_key: None,
            cancel_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
            paid_at: None,
            shipped_at: None,
            delivered_at: None,
            delivery_confirmed_at: None,
            confirmed_at: None,
            cancel_requested_at: None,
            cancelled_at: None,
            refunded_at: None,
        }
    }

    /// Role the user plays on this transaction, derived from the record itself
    pub fn role_of(&self, user_id: UserId) -> Option<Trigger> {
        if user_id == self.buyer_id {
            Some(Trigger::Buyer)
        } else if user_id == self.seller_id {
            Some(Trigger::Seller)
        } else {
            None
        }
    }

    pub fn is_party(&self, user_id: UserId) -> bool {
        self.role_of(user_id).is_some()
    }

    pub fn parties(&self) -> Vec<UserId> {
        vec![self.buyer_id, self.seller_id]
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[{}] listing={} buyer={} seller={} amount={} status={}",
            self.id, self.listing_id, self.buyer_id, self.seller_id, self.amount, self.status
        )
    }
}

/// Gateway-side payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Charge authorised, settlement not yet confirmed by webhook
    Approved,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Approved => "approved",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(PaymentStatus::Approved),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub method: String,
    pub provider: String,
    /// Client idempotency key, also sent to the gateway as its order id
    pub idempotency_key: String,
    pub pg_transaction_id: Option<String>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Registered,
    InTransit,
    Delivered,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Registered => "registered",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::Delivered => "delivered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(ShipmentStatus::Registered),
            "in_transit" => Some(ShipmentStatus::InTransit),
            "delivered" => Some(ShipmentStatus::Delivered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipment {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub courier: String,
    pub tracking_number: String,
    pub status: ShipmentStatus,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Last courier webhook body, kept for forensics
    pub raw_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    /// Active refunds block a second refund for the same transaction
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RefundStatus::Pending | RefundStatus::Processing | RefundStatus::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Processing => "processing",
            RefundStatus::Completed => "completed",
            RefundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RefundStatus::Pending),
            "processing" => Some(RefundStatus::Processing),
            "completed" => Some(RefundStatus::Completed),
            "failed" => Some(RefundStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankAccount {
    pub bank_code: String,
    pub account_number: String,
    pub account_holder: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refund {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub reason: String,
    pub bank: Option<BankAccount>,
    pub status: RefundStatus,
    pub pg_transaction_id: Option<String>,
    /// Gateway attempts made so far
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Retry budget exhausted; waits for an operator
    pub dead_lettered: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Refund {
    pub fn new(
        transaction_id: TransactionId,
        amount: Decimal,
        reason: impl Into<String>,
        bank: Option<BankAccount>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            amount,
            reason: reason.into(),
            bank,
            status: RefundStatus::Pending,
            pg_transaction_id: None,
            attempts: 0,
            next_retry_at: None,
            dead_lettered: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Active, or failed but still owned by the retry queue.
    /// A transaction with an outstanding refund cannot get another one.
    pub fn is_outstanding(&self) -> bool {
        self.status.is_active() || self.status == RefundStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeType {
    QualityIssue,
    NotAsDescribed,
    NotReceived,
    CancelRejected,
    Other,
}

impl DisputeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeType::QualityIssue => "quality_issue",
            DisputeType::NotAsDescribed => "not_as_described",
            DisputeType::NotReceived => "not_received",
            DisputeType::CancelRejected => "cancel_rejected",
            DisputeType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quality_issue" => Some(DisputeType::QualityIssue),
            "not_as_described" => Some(DisputeType::NotAsDescribed),
            "not_received" => Some(DisputeType::NotReceived),
            "cancel_rejected" => Some(DisputeType::CancelRejected),
            "other" => Some(DisputeType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Buyer gets money back (full or partial)
    Refund,
    /// Seller keeps the sale
    Release,
}

impl DisputeResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeResolution::Refund => "refund",
            DisputeResolution::Release => "release",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refund" => Some(DisputeResolution::Refund),
            "release" => Some(DisputeResolution::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispute {
    pub transaction_id: TransactionId,
    pub dispute_type: DisputeType,
    pub reason: String,
    /// Append-only
    pub evidence_urls: Vec<String>,
    pub opened_by: UserId,
    pub resolution: Option<DisputeResolution>,
    pub refund_amount: Option<Decimal>,
    pub resolved_by: Option<UserId>,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PaymentInitiated,
    EscrowHeld,
    ShipmentRequested,
    ShipmentRegistered,
    ShipmentPickedUp,
    ShipmentDelivered,
    DeliveryConfirmed,
    PurchaseConfirmed,
    CancelRequested,
    CancelApproved,
    CancelAutoApproved,
    RefundRequested,
    RefundCompleted,
    DisputeOpened,
    DisputeResolved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentInitiated => "payment_initiated",
            EventType::EscrowHeld => "escrow_held",
            EventType::ShipmentRequested => "shipment_requested",
            EventType::ShipmentRegistered => "shipment_registered",
            EventType::ShipmentPickedUp => "shipment_picked_up",
            EventType::ShipmentDelivered => "shipment_delivered",
            EventType::DeliveryConfirmed => "delivery_confirmed",
            EventType::PurchaseConfirmed => "purchase_confirmed",
            EventType::CancelRequested => "cancel_requested",
            EventType::CancelApproved => "cancel_approved",
            EventType::CancelAutoApproved => "cancel_auto_approved",
            EventType::RefundRequested => "refund_requested",
            EventType::RefundCompleted => "refund_completed",
            EventType::DisputeOpened => "dispute_opened",
            EventType::DisputeResolved => "dispute_resolved",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the append-only audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    /// Assigned by the store on append; authoritative ordering
    pub seq: i64,
    pub transaction_id: TransactionId,
    pub actor_id: Option<UserId>,
    pub trigger: Trigger,
    pub event_type: String,
    pub from_status: TransactionStatus,
    pub to_status: TransactionStatus,
    pub description: String,
    /// Schemaless, event-specific payload
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    /// The only way to build an audit row
    pub fn transition(
        transaction_id: TransactionId,
        actor: Actor,
        trigger: Trigger,
        event_type: EventType,
        from_status: TransactionStatus,
        to_status: TransactionStatus,
        description: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            seq: 0,
            transaction_id,
            actor_id: actor.id(),
            trigger,
            event_type: event_type.as_str().to_string(),
            from_status,
            to_status,
            description: description.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenTransactionRequest {
    pub listing_id: String,
    pub seller_id: UserId,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct InitiatePaymentRequest {
    pub transaction_id: TransactionId,
    pub amount: Decimal,
    pub method: String,
    pub pg_provider: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct RegisterShipmentRequest {
    pub transaction_id: TransactionId,
    pub courier: String,
    pub tracking_number: String,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub transaction_id: TransactionId,
    /// `None` refunds the full escrow-held amount
    pub amount: Option<Decimal>,
    pub reason: String,
    pub bank: Option<BankAccount>,
}

impl RefundRequest {
    pub fn full(transaction_id: TransactionId, reason: impl Into<String>) -> Self {
        Self {
            transaction_id,
            amount: None,
            reason: reason.into(),
            bank: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenDisputeRequest {
    pub transaction_id: TransactionId,
    pub dispute_type: DisputeType,
    pub reason: String,
    pub evidence_urls: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolveDisputeRequest {
    pub transaction_id: TransactionId,
    pub resolution: DisputeResolution,
    pub refund_amount: Option<Decimal>,
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of InitiatePayment. Retrying with the same key yields an equal value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    pub transaction_id: TransactionId,
    pub payment_id: Uuid,
    pub idempotency_key: String,
    pub pg_transaction_id: Option<String>,
    pub amount: Decimal,
    pub payment_status: PaymentStatus,
}

impl PaymentResult {
    pub fn from_payment(payment: &Payment) -> Self {
        Self {
            transaction_id: payment.transaction_id,
            payment_id: payment.id,
            idempotency_key: payment.idempotency_key.clone(),
            pg_transaction_id: payment.pg_transaction_id.clone(),
            amount: payment.amount,
            payment_status: payment.status,
        }
    }
}

/// Outcome of ProcessRefund
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundOutcome {
    pub refund_id: Uuid,
    pub amount: Decimal,
    pub refund_status: RefundStatus,
    pub transaction_status: TransactionStatus,
    /// Gateway failed; the worker will retry
    pub queued_for_retry: bool,
}

/// Full aggregate for `GET transaction/:id`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub transaction: Transaction,
    pub payments: Vec<Payment>,
    pub shipment: Option<Shipment>,
    pub refunds: Vec<Refund>,
    pub dispute: Option<Dispute>,
    pub recent_events: Vec<EventLogEntry>,
}
