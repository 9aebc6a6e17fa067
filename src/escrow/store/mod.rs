//! Escrow Persistence
//!
//! Every state change of a transaction aggregate is committed as one
//! [`ChangeSet`]: the parent row (with a version compare-and-swap), the child
//! rows it owns, the audit events and the outbox notifications. Either all of
//! it lands or none of it does.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgEscrowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use super::error::StoreError;
use super::notify::{Notification, PendingNotification};
use super::types::{
    Dispute, EventLogEntry, Payment, Refund, Shipment, Transaction, TransactionId,
};

/// Insert a new child row or overwrite an existing one
#[derive(Debug, Clone, PartialEq)]
pub enum Write<T> {
    Insert(T),
    Update(T),
}

impl<T> Write<T> {
    pub fn record(&self) -> &T {
        match self {
            Write::Insert(r) | Write::Update(r) => r,
        }
    }
}

/// Atomic unit of work against one transaction aggregate
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// `None` creates the transaction; `Some(v)` requires the stored version to be `v`
    pub expected_version: Option<i64>,
    pub transaction: Transaction,
    pub payment: Option<Write<Payment>>,
    /// Upserted by transaction id
    pub shipment: Option<Shipment>,
    pub refund: Option<Write<Refund>>,
    /// Upserted by transaction id
    pub dispute: Option<Dispute>,
    pub events: Vec<EventLogEntry>,
    pub notifications: Vec<Notification>,
}

impl ChangeSet {
    /// Create a brand-new aggregate
    pub fn create(transaction: Transaction) -> Self {
        Self {
            expected_version: None,
            transaction,
            payment: None,
            shipment: None,
            refund: None,
            dispute: None,
            events: Vec::new(),
            notifications: Vec::new(),
        }
    }

    /// Update an aggregate loaded at `transaction.version`
    pub fn update(transaction: Transaction) -> Self {
        let expected = transaction.version;
        Self {
            expected_version: Some(expected),
            ..Self::create(transaction)
        }
    }

    pub fn with_payment(mut self, payment: Write<Payment>) -> Self {
        self.payment = Some(payment);
        self
    }

    pub fn with_shipment(mut self, shipment: Shipment) -> Self {
        self.shipment = Some(shipment);
        self
    }

    pub fn with_refund(mut self, refund: Write<Refund>) -> Self {
        self.refund = Some(refund);
        self
    }

    pub fn with_dispute(mut self, dispute: Dispute) -> Self {
        self.dispute = Some(dispute);
        self
    }

    pub fn event(mut self, event: EventLogEntry) -> Self {
        self.events.push(event);
        self
    }

    pub fn notify(mut self, notification: Notification) -> Self {
        self.notifications.push(notification);
        self
    }
}

/// Result of a successful commit
#[derive(Debug, Clone)]
pub struct Committed {
    /// Transaction as stored, with the bumped version
    pub transaction: Transaction,
    /// Outbox rows written by this commit, in order
    pub notifications: Vec<PendingNotification>,
}

/// Storage for escrow aggregates
///
/// Implementations MUST apply a [`ChangeSet`] atomically, serialised per
/// transaction, and reject it with [`StoreError::VersionConflict`] when the
/// stored version differs from `expected_version`.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    async fn commit(&self, changes: ChangeSet) -> Result<Committed, StoreError>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    async fn find_payment(
        &self,
        id: TransactionId,
        idempotency_key: &str,
    ) -> Result<Option<Payment>, StoreError>;

    async fn find_payment_by_pg_id(&self, pg_tx_id: &str) -> Result<Option<Payment>, StoreError>;

    async fn list_payments(&self, id: TransactionId) -> Result<Vec<Payment>, StoreError>;

    async fn get_shipment(&self, id: TransactionId) -> Result<Option<Shipment>, StoreError>;

    async fn get_refund(&self, refund_id: Uuid) -> Result<Option<Refund>, StoreError>;

    async fn find_refund_by_pg_id(&self, pg_tx_id: &str) -> Result<Option<Refund>, StoreError>;

    async fn list_refunds(&self, id: TransactionId) -> Result<Vec<Refund>, StoreError>;

    async fn get_dispute(&self, id: TransactionId) -> Result<Option<Dispute>, StoreError>;

    /// Newest first
    async fn recent_events(
        &self,
        id: TransactionId,
        limit: usize,
    ) -> Result<Vec<EventLogEntry>, StoreError>;

    /// Oldest first
    async fn list_events(&self, id: TransactionId) -> Result<Vec<EventLogEntry>, StoreError>;

    /// CANCEL_REQUESTED transactions whose request is older than `cutoff`
    async fn find_stale_cancel_requests(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn find_by_status(
        &self,
        status: super::state::TransactionStatus,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Pending or failed, not dead-lettered refunds with `next_retry_at <= now`.
    /// A pending refund's `next_retry_at` is the lease of its inline gateway call.
    async fn find_refunds_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Refund>, StoreError>;

    async fn pending_notifications(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingNotification>, StoreError>;

    async fn mark_notification_delivered(&self, id: i64) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
