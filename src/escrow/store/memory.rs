//! In-memory escrow store
//!
//! Used by tests and by `--env dev` without PostgreSQL. Commits are
//! serialised behind a single lock and enforce the same constraints as the
//! relational schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ChangeSet, Committed, EscrowStore, StoreError, Write};
use crate::escrow::notify::PendingNotification;
use crate::escrow::state::TransactionStatus;
use crate::escrow::types::{
    Dispute, EventLogEntry, Payment, Refund, RefundStatus, Shipment, Transaction, TransactionId,
};

#[derive(Default)]
struct Inner {
    transactions: HashMap<TransactionId, Transaction>,
    payments: Vec<Payment>,
    shipments: HashMap<TransactionId, Shipment>,
    refunds: Vec<Refund>,
    disputes: HashMap<TransactionId, Dispute>,
    events: Vec<EventLogEntry>,
    outbox: Vec<(PendingNotification, bool)>,
    next_event_seq: i64,
    next_notification_id: i64,
}

impl Inner {
    /// Check every constraint before touching anything
    fn check(&self, changes: &ChangeSet) -> Result<(), StoreError> {
        let id = changes.transaction.id;
        match (changes.expected_version, self.transactions.get(&id)) {
            (None, Some(_)) => {
                return Err(StoreError::Database(format!("transaction {} already exists", id)));
            }
            (Some(_), None) => return Err(StoreError::NotFound(format!("transaction {}", id))),
            (Some(expected), Some(stored)) if stored.version != expected => {
                return Err(StoreError::VersionConflict(id.to_string()));
            }
            _ => {}
        }

        match &changes.payment {
            Some(Write::Insert(p)) => {
                if self
                    .payments
                    .iter()
                    .any(|x| x.transaction_id == p.transaction_id && x.idempotency_key == p.idempotency_key)
                {
                    return Err(StoreError::DuplicatePayment);
                }
            }
            Some(Write::Update(p)) => {
                if !self.payments.iter().any(|x| x.id == p.id) {
                    return Err(StoreError::NotFound(format!("payment {}", p.id)));
                }
            }
            None => {}
        }

        match &changes.refund {
            Some(Write::Insert(r)) => {
                if self
                    .refunds
                    .iter()
                    .any(|x| x.transaction_id == r.transaction_id && x.is_outstanding())
                {
                    return Err(StoreError::ActiveRefundExists);
                }
            }
            Some(Write::Update(r)) => {
                if !self.refunds.iter().any(|x| x.id == r.id) {
                    return Err(StoreError::NotFound(format!("refund {}", r.id)));
                }
            }
            None => {}
        }

        Ok(())
    }
}

/// In-memory [`EscrowStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn commit(&self, changes: ChangeSet) -> Result<Committed, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check(&changes)?;

        let ChangeSet {
            expected_version,
            mut transaction,
            payment,
            shipment,
            refund,
            dispute,
            events,
            notifications,
        } = changes;

        transaction.version = expected_version.map_or(1, |v| v + 1);
        transaction.updated_at = Utc::now();
        inner.transactions.insert(transaction.id, transaction.clone());

        match payment {
            Some(Write::Insert(p)) => inner.payments.push(p),
            Some(Write::Update(p)) => {
                if let Some(slot) = inner.payments.iter_mut().find(|x| x.id == p.id) {
                    *slot = p;
                }
            }
            None => {}
        }

        if let Some(s) = shipment {
            inner.shipments.insert(s.transaction_id, s);
        }

        match refund {
            Some(Write::Insert(r)) => inner.refunds.push(r),
            Some(Write::Update(r)) => {
                if let Some(slot) = inner.refunds.iter_mut().find(|x| x.id == r.id) {
                    *slot = r;
                }
            }
            None => {}
        }

        if let Some(d) = dispute {
            inner.disputes.insert(d.transaction_id, d);
        }

        for mut event in events {
            inner.next_event_seq += 1;
            event.seq = inner.next_event_seq;
            inner.events.push(event);
        }

        let mut written = Vec::with_capacity(notifications.len());
        for notification in notifications {
            inner.next_notification_id += 1;
            let pending = PendingNotification {
                id: inner.next_notification_id,
                notification,
            };
            inner.outbox.push((pending.clone(), false));
            written.push(pending);
        }

        Ok(Committed {
            transaction,
            notifications: written,
        })
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.inner.lock().await.transactions.get(&id).cloned())
    }

    async fn find_payment(
        &self,
        id: TransactionId,
        idempotency_key: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .iter()
            .find(|p| p.transaction_id == id && p.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn find_payment_by_pg_id(&self, pg_tx_id: &str) -> Result<Option<Payment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .iter()
            .find(|p| p.pg_transaction_id.as_deref() == Some(pg_tx_id))
            .cloned())
    }

    async fn list_payments(&self, id: TransactionId) -> Result<Vec<Payment>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .iter()
            .filter(|p| p.transaction_id == id)
            .cloned()
            .collect())
    }

    async fn get_shipment(&self, id: TransactionId) -> Result<Option<Shipment>, StoreError> {
        Ok(self.inner.lock().await.shipments.get(&id).cloned())
    }

    async fn get_refund(&self, refund_id: Uuid) -> Result<Option<Refund>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.refunds.iter().find(|r| r.id == refund_id).cloned())
    }

    async fn find_refund_by_pg_id(&self, pg_tx_id: &str) -> Result<Option<Refund>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .refunds
            .iter()
            .find(|r| r.pg_transaction_id.as_deref() == Some(pg_tx_id))
            .cloned())
    }

    async fn list_refunds(&self, id: TransactionId) -> Result<Vec<Refund>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .refunds
            .iter()
            .filter(|r| r.transaction_id == id)
            .cloned()
            .collect())
    }

    async fn get_dispute(&self, id: TransactionId) -> Result<Option<Dispute>, StoreError> {
        Ok(self.inner.lock().await.disputes.get(&id).cloned())
    }

    async fn recent_events(
        &self,
        id: TransactionId,
        limit: usize,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .rev()
            .filter(|e| e.transaction_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_events(&self, id: TransactionId) -> Result<Vec<EventLogEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.transaction_id == id)
            .cloned()
            .collect())
    }

    async fn find_stale_cancel_requests(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::CancelRequested)
            .filter(|t| t.cancel_requested_at.is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.cancel_requested_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn find_by_status(
        &self,
        status: TransactionStatus,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let inner = self.inner.lock().await;
        let mut found: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.updated_at);
        found.truncate(limit);
        Ok(found)
    }

    async fn find_refunds_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Refund>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<Refund> = inner
            .refunds
            .iter()
            .filter(|r| {
                matches!(r.status, RefundStatus::Pending | RefundStatus::Failed) && !r.dead_lettered
            })
            .filter(|r| r.next_retry_at.is_none_or(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn pending_notifications(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingNotification>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|(_, delivered)| !delivered)
            .take(limit)
            .map(|(n, _)| n.clone())
            .collect())
    }

    async fn mark_notification_delivered(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.outbox.iter_mut().find(|(n, _)| n.id == id) {
            Some((_, delivered)) => {
                *delivered = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("notification {}", id))),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::notify::{Audience, Notification};
    use crate::escrow::state_machine::Trigger;
    use crate::escrow::types::{Actor, EventType, PaymentStatus};
    use rust_decimal::Decimal;

    fn new_tx() -> Transaction {
        Transaction::new("listing-1", 1001, 2002, Decimal::from(100000), Decimal::from(3500))
    }

    fn payment(tx: &Transaction, key: &str) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            transaction_id: tx.id,
            amount: tx.amount,
            method: "card".into(),
            provider: "mock".into(),
            idempotency_key: key.into(),
            pg_transaction_id: Some(format!("pg-{}", key)),
            status: PaymentStatus::Approved,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_then_version_bumps() {
        let store = MemoryStore::new();
        let committed = store.commit(ChangeSet::create(new_tx())).await.unwrap();
        assert_eq!(committed.transaction.version, 1);

        let again = store
            .commit(ChangeSet::update(committed.transaction.clone()))
            .await
            .unwrap();
        assert_eq!(again.transaction.version, 2);

        // Stale version is rejected
        let err = store
            .commit(ChangeSet::update(committed.transaction))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict(_)));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = MemoryStore::new();
        let tx = new_tx();
        store.commit(ChangeSet::create(tx.clone())).await.unwrap();
        assert!(store.commit(ChangeSet::create(tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_payment_key_rejected() {
        let store = MemoryStore::new();
        let tx = store.commit(ChangeSet::create(new_tx())).await.unwrap().transaction;

        let tx = store
            .commit(ChangeSet::update(tx.clone()).with_payment(Write::Insert(payment(&tx, "k1"))))
            .await
            .unwrap()
            .transaction;
        let err = store
            .commit(ChangeSet::update(tx.clone()).with_payment(Write::Insert(payment(&tx, "k1"))))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicatePayment));

        // Nothing from the failed commit landed
        assert_eq!(store.list_payments(tx.id).await.unwrap().len(), 1);
        assert_eq!(store.get_transaction(tx.id).await.unwrap().unwrap().version, tx.version);
    }

    #[tokio::test]
    async fn test_outstanding_refund_blocks_second() {
        let store = MemoryStore::new();
        let tx = store.commit(ChangeSet::create(new_tx())).await.unwrap().transaction;

        let mut first = Refund::new(tx.id, tx.amount, "cancel", None);
        let tx = store
            .commit(ChangeSet::update(tx.clone()).with_refund(Write::Insert(first.clone())))
            .await
            .unwrap()
            .transaction;

        let second = Refund::new(tx.id, tx.amount, "again", None);
        let err = store
            .commit(ChangeSet::update(tx.clone()).with_refund(Write::Insert(second.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ActiveRefundExists));

        // Failed refunds stay in the retry queue and still block
        first.status = RefundStatus::Failed;
        let tx = store
            .commit(ChangeSet::update(tx.clone()).with_refund(Write::Update(first)))
            .await
            .unwrap()
            .transaction;
        assert!(
            store
                .commit(ChangeSet::update(tx).with_refund(Write::Insert(second)))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_events_and_outbox() {
        let store = MemoryStore::new();
        let tx = new_tx();
        let event = EventLogEntry::transition(
            tx.id,
            Actor::User(1001),
            Trigger::Buyer,
            EventType::PaymentInitiated,
            TransactionStatus::Initiated,
            TransactionStatus::Paid,
            "paid",
            serde_json::Value::Null,
        );
        let committed = store
            .commit(
                ChangeSet::create(tx.clone())
                    .event(event.clone())
                    .event(event)
                    .notify(Notification::new(&tx, Audience::Parties, "hi")),
            )
            .await
            .unwrap();

        let events = store.list_events(tx.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].seq < events[1].seq);
        assert_eq!(store.recent_events(tx.id, 1).await.unwrap()[0].seq, events[1].seq);

        assert_eq!(committed.notifications.len(), 1);
        let id = committed.notifications[0].id;
        assert_eq!(store.pending_notifications(10).await.unwrap().len(), 1);
        store.mark_notification_delivered(id).await.unwrap();
        assert!(store.pending_notifications(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_cancel_requests() {
        let store = MemoryStore::new();
        let mut tx = new_tx();
        tx.status = TransactionStatus::CancelRequested;
        tx.cancel_requested_at = Some(Utc::now() - chrono::Duration::hours(25));
        store.commit(ChangeSet::create(tx.clone())).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let stale = store.find_stale_cancel_requests(cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, tx.id);

        let earlier = Utc::now() - chrono::Duration::hours(48);
        assert!(store.find_stale_cancel_requests(earlier, 10).await.unwrap().is_empty());
    }
}
