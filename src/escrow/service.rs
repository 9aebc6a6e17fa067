//! Escrow Service
//!
//! Orchestrates every operation on a transaction aggregate:
//! load → authorize → validate through the transition table → (external call)
//! → commit one [`ChangeSet`] → deliver outbox notifications.
//!
//! Authorization is always re-derived from the stored record (`buyer_id`,
//! `seller_id`); the caller only supplies an [`Actor`]. Check order is
//! NotFound → Forbidden → Conflict / InvalidTransition.

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{EscrowError, GatewayFailure, StoreError};
use super::gateway::{ChargeRequest, PaymentGateway, RefundOrder};
use super::notify::{Audience, Notification, NotificationSink, PendingNotification, SuggestedAction};
use super::state::TransactionStatus;
use super::state_machine::{Condition, StateMachine, TransitionConditions, TransitionRejection, Trigger};
use super::store::{ChangeSet, EscrowStore, Write};
use super::webhook::{PaymentWebhook, ShipmentWebhook, WebhookOutcome};
use super::types::{
    Actor, Dispute, DisputeResolution, EventLogEntry, EventType, InitiatePaymentRequest,
    OpenDisputeRequest, OpenTransactionRequest, Payment, PaymentResult, PaymentStatus, Refund,
    RefundOutcome, RefundRequest, RefundStatus, RegisterShipmentRequest, ResolveDisputeRequest,
    Shipment, ShipmentStatus, Transaction, TransactionId, TransactionView,
};

/// Events returned by `GetTransaction`
pub const RECENT_EVENTS: usize = 10;

/// Attempts at recording a gateway result when the aggregate moves underneath
const RECORD_RETRIES: usize = 3;

/// Routes offered as suggested actions in chat messages
mod actions {
    pub const CANCEL_REQUEST: &str = "/api/v1/payment/cancel-request";
    pub const CANCEL_APPROVE: &str = "/api/v1/payment/cancel-approve";
    pub const SHIP: &str = "/api/v1/payment/ship";
    pub const CONFIRM: &str = "/api/v1/payment/confirm";
    pub const FINAL_CONFIRM: &str = "/api/v1/payment/final-confirm";
    pub const REFUND_RETRY: &str = "/api/v1/payment/refund/retry";
    pub const DISPUTE_OPEN: &str = "/api/v1/dispute/open";
}

/// Refund retry policy
///
/// Backoff after the n-th failed attempt is `base × 2^(n−1)`, capped at `max_backoff`.
/// After `max_attempts` failures the refund is dead-lettered for an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = attempts.saturating_sub(1).clamp(0, 30) as u32;
        let secs = self.base_backoff.as_secs().saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.max_backoff.as_secs()))
    }

    pub fn exhausted(&self, attempts: i32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Platform fee in basis points of the gross amount
    pub platform_fee_bps: u32,
    /// Seller response window for cancel requests
    pub cancel_timeout: Duration,
    pub refund_retry: RetryPolicy,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 350,
            cancel_timeout: super::state_machine::CANCEL_RESPONSE_TIMEOUT,
            refund_retry: RetryPolicy::default(),
        }
    }
}

/// Result of one gateway refund call
#[derive(Debug, Clone)]
enum RefundAttempt {
    Completed(String),
    /// Accepted; completion arrives by webhook
    Accepted(String),
    Failed(String),
}

enum PaymentClaim {
    /// Caller may charge; carries the transaction at its claimed version
    Held(Transaction),
    /// A concurrent call with the same key already finished
    Paid(PaymentResult),
}

fn payment_in_progress(id: TransactionId) -> EscrowError {
    EscrowError::Conflict(format!(
        "transaction {} has a payment in progress under another idempotency key",
        id
    ))
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs().min(i32::MAX as u64) as i64)
}

fn conditions(list: &[Condition]) -> TransitionConditions {
    list.iter()
        .fold(TransitionConditions::none(), |c, cond| c.with(*cond))
}

/// Resolve the caller to the trigger it plays on this transaction
fn resolve_trigger(tx: &Transaction, actor: Actor) -> Result<Trigger, EscrowError> {
    match actor {
        Actor::User(id) => tx.role_of(id).ok_or_else(|| {
            EscrowError::Forbidden(format!("user {} is not a party to transaction {}", id, tx.id))
        }),
        Actor::Admin(_) => Ok(Trigger::Admin),
        Actor::System => Ok(Trigger::System),
    }
}

fn authorize(tx: &Transaction, actor: Actor, allowed: &[Trigger]) -> Result<Trigger, EscrowError> {
    let trigger = resolve_trigger(tx, actor)?;
    if allowed.contains(&trigger) {
        Ok(trigger)
    } else {
        Err(EscrowError::Forbidden(format!(
            "{} may not perform this action on transaction {}",
            trigger, tx.id
        )))
    }
}

fn require_positive(amount: Decimal, what: &str) -> Result<(), EscrowError> {
    if amount <= Decimal::ZERO {
        return Err(EscrowError::InvalidRequest(format!("{} must be greater than zero", what)));
    }
    Ok(())
}

fn require_text(value: &str, what: &str) -> Result<(), EscrowError> {
    if value.trim().is_empty() {
        return Err(EscrowError::InvalidRequest(format!("{} is required", what)));
    }
    Ok(())
}

fn validate_urls(urls: &[String]) -> Result<(), EscrowError> {
    match urls
        .iter()
        .find(|u| !(u.starts_with("https://") || u.starts_with("http://")))
    {
        Some(bad) => Err(EscrowError::InvalidRequest(format!("invalid evidence url: {}", bad))),
        None => Ok(()),
    }
}

/// Validate a move through the transition table and apply it to the aggregate.
/// Returns the audit row for the change set.
fn transition(
    tx: &mut Transaction,
    to: TransactionStatus,
    trigger: Trigger,
    conds: TransitionConditions,
    actor: Actor,
    event_type: EventType,
    metadata: serde_json::Value,
) -> Result<EventLogEntry, EscrowError> {
    let from = tx.status;
    let rule = StateMachine::validate_transition(from, to, trigger, &conds)
        .map_err(|reason| EscrowError::invalid_transition(from, to, reason))?;

    tx.status = to;
    tx.updated_at = Utc::now();
    Ok(EventLogEntry::transition(
        tx.id,
        actor,
        trigger,
        event_type,
        from,
        to,
        rule.description,
        metadata,
    ))
}

/// Escrow Service
pub struct EscrowService {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn PaymentGateway>,
    sink: Arc<dyn NotificationSink>,
    config: EscrowConfig,
}

impl EscrowService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        sink: Arc<dyn NotificationSink>,
        config: EscrowConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            sink,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn EscrowStore> {
        &self.store
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    async fn load(&self, id: TransactionId) -> Result<Transaction, EscrowError> {
        self.store
            .get_transaction(id)
            .await?
            .ok_or_else(|| EscrowError::not_found(id))
    }

    /// Commit and hand the outbox rows to the sink
    async fn commit(&self, changes: ChangeSet) -> Result<Transaction, EscrowError> {
        let committed = self.store.commit(changes).await?;
        self.deliver(&committed.notifications).await;
        Ok(committed.transaction)
    }

    async fn deliver(&self, pending: &[PendingNotification]) -> usize {
        let mut delivered = 0;
        for p in pending {
            match self.sink.deliver(&p.notification).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_notification_delivered(p.id).await {
                        warn!(notification_id = p.id, error = %e, "Failed to mark notification delivered");
                    }
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        notification_id = p.id,
                        sink = self.sink.name(),
                        error = %e,
                        "Notification delivery failed, left in outbox"
                    );
                }
            }
        }
        delivered
    }

    /// Redeliver undelivered outbox rows
    pub async fn flush_outbox(&self, limit: usize) -> Result<usize, EscrowError> {
        let pending = self.store.pending_notifications(limit).await?;
        if pending.is_empty() {
            return Ok(0);
        }
        Ok(self.deliver(&pending).await)
    }

    // ========================================================================
    // Creation and payment
    // ========================================================================

    /// Create a transaction for a listing purchase (INITIATED)
    pub async fn open_transaction(
        &self,
        actor: Actor,
        req: OpenTransactionRequest,
    ) -> Result<Transaction, EscrowError> {
        let buyer_id = match actor {
            Actor::User(id) => id,
            _ => {
                return Err(EscrowError::Forbidden(
                    "only a buyer can open a transaction".to_string(),
                ));
            }
        };
        require_text(&req.listing_id, "listingId")?;
        require_positive(req.amount, "amount")?;
        if req.seller_id == buyer_id {
            return Err(EscrowError::InvalidRequest(
                "buyer and seller must differ".to_string(),
            ));
        }

        let fee = (req.amount * Decimal::from(self.config.platform_fee_bps)
            / Decimal::from(10_000))
        .round_dp(2);
        let tx = Transaction::new(req.listing_id, buyer_id, req.seller_id, req.amount, fee);

        let notice = Notification::new(&tx, Audience::Parties, "Order created. Waiting for payment.");
        let tx = self.commit(ChangeSet::create(tx).notify(notice)).await?;

        info!(
            transaction_id = %tx.id,
            buyer_id = tx.buyer_id,
            seller_id = tx.seller_id,
            amount = %tx.amount,
            "Transaction opened"
        );
        Ok(tx)
    }

    /// Charge the buyer and move INITIATED → PAID.
    ///
    /// Safe to retry with the same idempotency key indefinitely: an existing
    /// payment for the key is returned without calling the gateway. A second
    /// key is refused before the gateway while the first holds the claim.
    pub async fn initiate_payment(
        &self,
        actor: Actor,
        req: InitiatePaymentRequest,
    ) -> Result<PaymentResult, EscrowError> {
        let tx = self.load(req.transaction_id).await?;
        authorize(&tx, actor, &[Trigger::Buyer])?;
        require_text(&req.idempotency_key, "idempotencyKey")?;

        if let Some(existing) = self.store.find_payment(tx.id, &req.idempotency_key).await? {
            debug!(
                transaction_id = %tx.id,
                idempotency_key = %req.idempotency_key,
                "Payment already exists for key - returning existing result"
            );
            return Ok(PaymentResult::from_payment(&existing));
        }

        if tx.status != TransactionStatus::Initiated {
            return Err(EscrowError::Conflict(format!(
                "transaction {} already processed (status {})",
                tx.id, tx.status
            )));
        }
        require_positive(req.amount, "amount")?;
        if req.amount != tx.amount {
            return Err(EscrowError::InvalidRequest(format!(
                "amount {} does not match transaction amount {}",
                req.amount, tx.amount
            )));
        }
        require_text(&req.method, "method")?;

        let tx = match self.claim_payment(tx, &req.idempotency_key).await? {
            PaymentClaim::Held(tx) => tx,
            PaymentClaim::Paid(result) => return Ok(result),
        };

        let charge = ChargeRequest {
            order_id: req.idempotency_key.clone(),
            transaction_id: tx.id,
            amount: req.amount,
            method: req.method.clone(),
            provider: req.pg_provider.clone(),
        };
        let receipt = match self.gateway.charge(&charge).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(transaction_id = %tx.id, gateway = self.gateway.name(), error = %e, "Charge failed");
                self.release_payment_claim(tx).await;
                return Err(EscrowError::GatewayError(e));
            }
        };

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            transaction_id: tx.id,
            amount: req.amount,
            method: req.method,
            provider: req.pg_provider,
            idempotency_key: req.idempotency_key.clone(),
            pg_transaction_id: Some(receipt.pg_transaction_id.clone()),
            status: PaymentStatus::Approved,
            created_at: now,
            updated_at: now,
        };

        let mut next = tx.clone();
        let event = transition(
            &mut next,
            TransactionStatus::Paid,
            Trigger::Buyer,
            conditions(&[Condition::PaymentApproved]),
            actor,
            EventType::PaymentInitiated,
            json!({
                "amount": payment.amount.to_string(),
                "method": payment.method,
                "provider": payment.provider,
                "pgTransactionId": receipt.pg_transaction_id,
                "idempotencyKey": payment.idempotency_key,
            }),
        )?;
        next.paid_at = Some(now);
        next.escrow_amount = payment.amount;
        next.idempotency_key = Some(payment.idempotency_key.clone());

        let notice = Notification::new(
            &next,
            Audience::Parties,
            format!(
                "Payment of {} received. Funds are held in escrow until the buyer confirms the purchase.",
                payment.amount
            ),
        )
        .with_action(SuggestedAction::post("Request cancellation", actions::CANCEL_REQUEST));

        let result = PaymentResult::from_payment(&payment);
        let changes = ChangeSet::update(next)
            .with_payment(Write::Insert(payment))
            .event(event)
            .notify(notice);

        match self.commit(changes).await {
            Ok(_) => {
                info!(
                    transaction_id = %tx.id,
                    amount = %result.amount,
                    pg_tx = ?result.pg_transaction_id,
                    "Payment approved, transaction PAID"
                );
                Ok(result)
            }
            Err(EscrowError::Conflict(msg)) => {
                // Lost a race. Same key: the winner's payment is our answer.
                match self.store.find_payment(tx.id, &req.idempotency_key).await? {
                    Some(p) => Ok(PaymentResult::from_payment(&p)),
                    None => Err(EscrowError::Conflict(msg)),
                }
            }
            Err(e) => {
                // Claim stays held: a retry with the same key re-records the charge
                error!(
                    transaction_id = %tx.id,
                    idempotency_key = %req.idempotency_key,
                    pg_tx = ?result.pg_transaction_id,
                    error = %e,
                    "Charge succeeded but payment could not be recorded"
                );
                Err(e)
            }
        }
    }

    /// Record `key` on the INITIATED transaction before the gateway is called.
    ///
    /// The write is version checked, so of two concurrent keys only one ever
    /// reaches the gateway. The same key may re-enter: its charge is
    /// idempotent at the gateway by order id.
    async fn claim_payment(&self, tx: Transaction, key: &str) -> Result<PaymentClaim, EscrowError> {
        match tx.idempotency_key.as_deref() {
            Some(held) if held == key => return Ok(PaymentClaim::Held(tx)),
            Some(_) => return Err(payment_in_progress(tx.id)),
            None => {}
        }

        let id = tx.id;
        let mut claimed = tx;
        claimed.idempotency_key = Some(key.to_string());
        match self.commit(ChangeSet::update(claimed)).await {
            Ok(tx) => Ok(PaymentClaim::Held(tx)),
            Err(EscrowError::Conflict(msg)) => {
                if let Some(p) = self.store.find_payment(id, key).await? {
                    return Ok(PaymentClaim::Paid(PaymentResult::from_payment(&p)));
                }
                let current = self.load(id).await?;
                match current.idempotency_key.as_deref() {
                    Some(held)
                        if held == key && current.status == TransactionStatus::Initiated =>
                    {
                        Ok(PaymentClaim::Held(current))
                    }
                    Some(_) => Err(payment_in_progress(id)),
                    None => Err(EscrowError::Conflict(msg)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Declined charge: free the transaction for another attempt
    async fn release_payment_claim(&self, tx: Transaction) {
        let id = tx.id;
        let mut released = tx;
        released.idempotency_key = None;
        if let Err(e) = self.commit(ChangeSet::update(released)).await {
            warn!(transaction_id = %id, error = %e, "Failed to release payment claim");
        }
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Buyer asks to cancel (PAID..DELIVERED → CANCEL_REQUESTED)
    pub async fn request_cancel(
        &self,
        actor: Actor,
        id: TransactionId,
        reason: &str,
    ) -> Result<Transaction, EscrowError> {
        let mut tx = self.load(id).await?;
        authorize(&tx, actor, &[Trigger::Buyer])?;
        if tx.status == TransactionStatus::CancelRequested {
            return Err(EscrowError::Conflict("cancellation already requested".to_string()));
        }

        let mut conds = TransitionConditions::none();
        if !reason.trim().is_empty() {
            conds = conds.with(Condition::ReasonGiven);
        }
        let from = tx.status;
        let event = transition(
            &mut tx,
            TransactionStatus::CancelRequested,
            Trigger::Buyer,
            conds,
            actor,
            EventType::CancelRequested,
            json!({ "reason": reason, "previousStatus": from.as_str() }),
        )?;
        tx.cancel_requested_at = Some(Utc::now());
        tx.cancel_reason = Some(reason.trim().to_string());

        let hours = self.config.cancel_timeout.as_secs() / 3600;
        let notice = Notification::new(
            &tx,
            Audience::Seller,
            format!(
                "The buyer requested a cancellation: {}. If you do not respond within {} hours the order is cancelled automatically.",
                reason.trim(),
                hours
            ),
        )
        .with_action(SuggestedAction::post("Approve cancellation", actions::CANCEL_APPROVE));

        let tx = self.commit(ChangeSet::update(tx).event(event).notify(notice)).await?;
        info!(transaction_id = %id, from = %from, "Cancellation requested");
        Ok(tx)
    }

    /// Seller approves the cancel request; the refund follows automatically
    pub async fn approve_cancel(
        &self,
        actor: Actor,
        id: TransactionId,
    ) -> Result<Transaction, EscrowError> {
        let mut tx = self.load(id).await?;
        authorize(&tx, actor, &[Trigger::Seller])?;
        if tx.cancelled_at.is_some() {
            return Err(EscrowError::Conflict("transaction already cancelled".to_string()));
        }

        let metadata = json!({ "reason": tx.cancel_reason });
        let event = transition(
            &mut tx,
            TransactionStatus::Cancelled,
            Trigger::Seller,
            conditions(&[Condition::SellerApproved]),
            actor,
            EventType::CancelApproved,
            metadata,
        )?;
        tx.cancelled_at = Some(Utc::now());

        let notice = Notification::new(
            &tx,
            Audience::Parties,
            format!(
                "The seller approved the cancellation. A refund of {} will follow.",
                tx.escrow_amount
            ),
        );
        self.commit(ChangeSet::update(tx).event(event).notify(notice)).await?;
        info!(transaction_id = %id, "Cancellation approved by seller");

        self.chain_refund(id, "cancellation approved by seller").await;
        self.load(id).await
    }

    /// Sweep target: seller did not answer within the cancel timeout.
    ///
    /// Re-validated at fire time; returns `None` when the request was
    /// answered in the meantime or has not timed out.
    pub async fn auto_cancel(&self, id: TransactionId) -> Result<Option<Transaction>, EscrowError> {
        let mut tx = self.load(id).await?;
        if tx.status != TransactionStatus::CancelRequested {
            debug!(transaction_id = %id, status = %tx.status, "Auto-cancel skipped, request already answered");
            return Ok(None);
        }
        let due = tx
            .cancel_requested_at
            .is_some_and(|at| at + to_chrono(self.config.cancel_timeout) <= Utc::now());
        if !due {
            return Ok(None);
        }

        let metadata = json!({
            "cancelRequestedAt": tx.cancel_requested_at,
            "reason": tx.cancel_reason,
        });
        let event = transition(
            &mut tx,
            TransactionStatus::Cancelled,
            Trigger::System,
            TransitionConditions::none(),
            Actor::System,
            EventType::CancelAutoApproved,
            metadata,
        )?;
        tx.cancelled_at = Some(Utc::now());

        let notice = Notification::new(
            &tx,
            Audience::Parties,
            "The seller did not respond in time. The order was cancelled automatically and a refund will follow.",
        );
        match self.commit(ChangeSet::update(tx).event(event).notify(notice)).await {
            Ok(_) => {}
            Err(EscrowError::Conflict(_)) => {
                debug!(transaction_id = %id, "Auto-cancel lost a race, skipping");
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        info!(transaction_id = %id, "Cancel request timed out, transaction CANCELLED");

        self.chain_refund(id, "cancel request timed out").await;
        Ok(Some(self.load(id).await?))
    }

    /// Start the automatic full refund after a cancellation.
    /// Failures are left for the worker's auto-refund sweep.
    async fn chain_refund(&self, id: TransactionId, reason: &str) {
        if let Err(e) = self
            .process_refund(Actor::System, RefundRequest::full(id, reason))
            .await
        {
            warn!(transaction_id = %id, error = %e, "Automatic refund not started, left for sweep");
        }
    }

    // ========================================================================
    // Shipment
    // ========================================================================

    /// Seller registers the tracking number (AWAITING_SHIPMENT → SHIPPED)
    pub async fn register_shipment(
        &self,
        actor: Actor,
        req: RegisterShipmentRequest,
    ) -> Result<Transaction, EscrowError> {
        let mut tx = self.load(req.transaction_id).await?;
        authorize(&tx, actor, &[Trigger::Seller])?;
        if self.store.get_shipment(tx.id).await?.is_some() {
            return Err(EscrowError::Conflict("shipment already registered".to_string()));
        }
        require_text(&req.courier, "courier")?;

        let mut conds = TransitionConditions::none();
        if !req.tracking_number.trim().is_empty() {
            conds = conds.with(Condition::TrackingRegistered);
        }
        let event = transition(
            &mut tx,
            TransactionStatus::Shipped,
            Trigger::Seller,
            conds,
            actor,
            EventType::ShipmentRegistered,
            json!({ "courier": req.courier, "trackingNumber": req.tracking_number }),
        )?;
        let now = Utc::now();
        tx.shipped_at = Some(now);

        let shipment = Shipment {
            id: Uuid::new_v4(),
            transaction_id: tx.id,
            courier: req.courier.trim().to_string(),
            tracking_number: req.tracking_number.trim().to_string(),
            status: ShipmentStatus::Registered,
            picked_up_at: None,
            delivered_at: None,
            raw_payload: None,
            created_at: now,
            updated_at: now,
        };
        let notice = Notification::new(
            &tx,
            Audience::Buyer,
            format!(
                "Your item has been shipped with {} (tracking number {}).",
                shipment.courier, shipment.tracking_number
            ),
        );

        let tx = self
            .commit(
                ChangeSet::update(tx)
                    .with_shipment(shipment)
                    .event(event)
                    .notify(notice),
            )
            .await?;
        info!(transaction_id = %tx.id, "Shipment registered");
        Ok(tx)
    }

    /// Courier callback: `picked_up` → IN_TRANSIT, `delivered` → DELIVERED.
    ///
    /// Out-of-order and duplicate deliveries fail the transition check and
    /// leave the aggregate untouched.
    pub async fn handle_shipment_webhook(
        &self,
        payload: ShipmentWebhook,
    ) -> Result<TransactionStatus, EscrowError> {
        let (to, condition, event_type) = match payload.event_type.as_str() {
            "picked_up" => (
                TransactionStatus::InTransit,
                Condition::CourierPickedUp,
                EventType::ShipmentPickedUp,
            ),
            "delivered" => (
                TransactionStatus::Delivered,
                Condition::CourierDelivered,
                EventType::ShipmentDelivered,
            ),
            other => return Err(EscrowError::UnknownEvent(other.to_string())),
        };

        let mut tx = self.load(payload.transaction_id).await?;
        let event = transition(
            &mut tx,
            to,
            Trigger::System,
            conditions(&[condition]),
            Actor::System,
            event_type,
            payload.data.clone(),
        )
        .inspect_err(|e| {
            warn!(transaction_id = %payload.transaction_id, event_type = %payload.event_type, error = %e, "Courier event rejected");
        })?;

        let now = Utc::now();
        let mut shipment = match self.store.get_shipment(tx.id).await? {
            Some(s) => s,
            None => Shipment {
                id: Uuid::new_v4(),
                transaction_id: tx.id,
                courier: payload.data["courier"].as_str().unwrap_or("unknown").to_string(),
                tracking_number: payload.data["trackingNumber"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                status: ShipmentStatus::Registered,
                picked_up_at: None,
                delivered_at: None,
                raw_payload: None,
                created_at: now,
                updated_at: now,
            },
        };
        shipment.raw_payload = Some(json!({
            "eventType": payload.event_type,
            "data": payload.data,
        }));
        shipment.updated_at = now;

        let notice = if to == TransactionStatus::Delivered {
            shipment.status = ShipmentStatus::Delivered;
            shipment.delivered_at = Some(now);
            tx.delivered_at = Some(now);
            Notification::new(
                &tx,
                Audience::Buyer,
                "Your item was delivered. Please confirm the purchase or request a return.",
            )
            .with_action(SuggestedAction::post("Confirm purchase", actions::CONFIRM))
            .with_action(SuggestedAction::post("Request return", actions::CANCEL_REQUEST))
        } else {
            shipment.status = ShipmentStatus::InTransit;
            shipment.picked_up_at = Some(now);
            Notification::new(&tx, Audience::Buyer, "The courier picked up your parcel.")
        };

        let tx = self
            .commit(
                ChangeSet::update(tx)
                    .with_shipment(shipment)
                    .event(event)
                    .notify(notice),
            )
            .await?;
        info!(transaction_id = %tx.id, status = %tx.status, "Courier event applied");
        Ok(tx.status)
    }

    /// Buyer confirms receipt (DELIVERED → DELIVERY_CONFIRMED)
    pub async fn confirm_delivery(
        &self,
        actor: Actor,
        id: TransactionId,
    ) -> Result<Transaction, EscrowError> {
        let mut tx = self.load(id).await?;
        authorize(&tx, actor, &[Trigger::Buyer])?;
        if tx.delivery_confirmed_at.is_some() {
            return Err(EscrowError::Conflict("delivery already confirmed".to_string()));
        }

        let event = transition(
            &mut tx,
            TransactionStatus::DeliveryConfirmed,
            Trigger::Buyer,
            TransitionConditions::none(),
            actor,
            EventType::DeliveryConfirmed,
            serde_json::Value::Null,
        )?;
        tx.delivery_confirmed_at = Some(Utc::now());

        let notice = Notification::new(
            &tx,
            Audience::Buyer,
            "Delivery confirmed. Confirm the purchase to release the payment to the seller.",
        )
        .with_action(SuggestedAction::post("Confirm purchase", actions::FINAL_CONFIRM));

        self.commit(ChangeSet::update(tx).event(event).notify(notice)).await
    }

    /// Buyer confirms the purchase (DELIVERY_CONFIRMED → BUYER_CONFIRMED), releasing escrow
    pub async fn final_confirm(
        &self,
        actor: Actor,
        id: TransactionId,
    ) -> Result<Transaction, EscrowError> {
        let mut tx = self.load(id).await?;
        authorize(&tx, actor, &[Trigger::Buyer])?;
        if tx.status == TransactionStatus::BuyerConfirmed {
            return Err(EscrowError::Conflict("purchase already confirmed".to_string()));
        }

        let payout = tx.escrow_amount - tx.platform_fee;
        let metadata = json!({
            "payout": payout.to_string(),
            "platformFee": tx.platform_fee.to_string(),
        });
        let event = transition(
            &mut tx,
            TransactionStatus::BuyerConfirmed,
            Trigger::Buyer,
            TransitionConditions::none(),
            actor,
            EventType::PurchaseConfirmed,
            metadata,
        )?;
        tx.confirmed_at = Some(Utc::now());
        tx.escrow_amount = Decimal::ZERO;

        let notice = Notification::new(
            &tx,
            Audience::Parties,
            format!("Purchase confirmed. {} has been released to the seller.", payout),
        );
        let tx = self.commit(ChangeSet::update(tx).event(event).notify(notice)).await?;
        info!(transaction_id = %id, payout = %payout, "Purchase confirmed, escrow released");
        Ok(tx)
    }

    // ========================================================================
    // Refunds
    // ========================================================================

    /// Open a refund for a CANCELLED or DISPUTE transaction and drive the gateway.
    ///
    /// Gateway failures are never returned: the refund is marked failed and
    /// queued for retry.
    pub async fn process_refund(
        &self,
        actor: Actor,
        req: RefundRequest,
    ) -> Result<RefundOutcome, EscrowError> {
        let mut tx = self.load(req.transaction_id).await?;
        let trigger = authorize(
            &tx,
            actor,
            &[Trigger::Buyer, Trigger::Seller, Trigger::Admin, Trigger::System],
        )?;
        if tx.status == TransactionStatus::Dispute
            && !matches!(trigger, Trigger::Admin | Trigger::System)
        {
            return Err(EscrowError::Forbidden(
                "only an administrator may refund a disputed transaction".to_string(),
            ));
        }

        let refunds = self.store.list_refunds(tx.id).await?;
        if refunds.iter().any(Refund::is_outstanding) {
            return Err(EscrowError::Conflict("a refund is already in progress".to_string()));
        }
        match tx.status {
            TransactionStatus::Cancelled | TransactionStatus::Dispute => {}
            TransactionStatus::RefundPending | TransactionStatus::Refunded => {
                return Err(EscrowError::Conflict("transaction already refunded".to_string()));
            }
            other => {
                return Err(EscrowError::invalid_transition(
                    other,
                    TransactionStatus::RefundPending,
                    TransitionRejection::NoSuchTransition,
                ));
            }
        }

        let amount = req.amount.unwrap_or(tx.escrow_amount);
        require_positive(amount, "refund amount")?;
        if amount > tx.escrow_amount {
            return Err(EscrowError::InvalidRequest(format!(
                "refund amount {} exceeds escrow amount {}",
                amount, tx.escrow_amount
            )));
        }
        require_text(&req.reason, "reason")?;

        // Refunding a dispute is its resolution; recorded with the refund row
        let resolution = if tx.status == TransactionStatus::Dispute {
            let mut dispute = self.store.get_dispute(tx.id).await?.ok_or_else(|| {
                EscrowError::NotFound(format!("dispute for transaction {}", tx.id))
            })?;
            if dispute.resolution.is_some() {
                return Err(EscrowError::Conflict("dispute already resolved".to_string()));
            }
            dispute.resolution = Some(DisputeResolution::Refund);
            dispute.refund_amount = Some(amount);
            dispute.resolved_by = actor.id();
            dispute.resolved_at = Some(Utc::now());
            Some(dispute)
        } else {
            None
        };

        let mut refund = Refund::new(tx.id, amount, req.reason.trim(), req.bank);
        // Lease: if the inline gateway call never records a result, the worker picks it up
        refund.next_retry_at = Some(Utc::now() + to_chrono(self.config.refund_retry.base_backoff));

        let mut events = Vec::new();
        if tx.status == TransactionStatus::Cancelled {
            events.push(transition(
                &mut tx,
                TransactionStatus::RefundPending,
                Trigger::System,
                conditions(&[Condition::RefundRequested]),
                actor,
                EventType::RefundRequested,
                json!({ "refundId": refund.id, "amount": amount.to_string(), "reason": refund.reason }),
            )?);
        }

        let notice = Notification::new(
            &tx,
            Audience::Parties,
            format!("A refund of {} has been requested.", amount),
        );
        let refund_id = refund.id;
        let mut changes = ChangeSet::update(tx)
            .with_refund(Write::Insert(refund))
            .notify(notice);
        changes.events = events;
        if let Some(dispute) = resolution {
            changes = changes.with_dispute(dispute);
        }
        self.commit(changes).await?;

        info!(transaction_id = %req.transaction_id, refund_id = %refund_id, amount = %amount, "Refund opened");
        self.drive_refund(refund_id, actor).await
    }

    /// Operator retry of a failed or dead-lettered refund; resets the attempt budget
    pub async fn retry_refund(
        &self,
        actor: Actor,
        refund_id: Uuid,
    ) -> Result<RefundOutcome, EscrowError> {
        let mut refund = self
            .store
            .get_refund(refund_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("refund {}", refund_id)))?;
        let tx = self.load(refund.transaction_id).await?;
        authorize(&tx, actor, &[Trigger::Admin, Trigger::System])?;

        match refund.status {
            RefundStatus::Completed => {
                return Err(EscrowError::Conflict("refund already completed".to_string()));
            }
            RefundStatus::Processing => {
                return Err(EscrowError::Conflict(
                    "refund is awaiting gateway confirmation".to_string(),
                ));
            }
            RefundStatus::Pending | RefundStatus::Failed => {}
        }

        refund.attempts = 0;
        refund.dead_lettered = false;
        refund.next_retry_at = Some(Utc::now() + to_chrono(self.config.refund_retry.base_backoff));
        refund.updated_at = Utc::now();
        self.commit(ChangeSet::update(tx).with_refund(Write::Update(refund)))
            .await?;

        info!(refund_id = %refund_id, actor = %actor, "Refund retry requested");
        self.drive_refund(refund_id, actor).await
    }

    /// Call the gateway for a pending or failed refund and record the result
    pub async fn drive_refund(
        &self,
        refund_id: Uuid,
        actor: Actor,
    ) -> Result<RefundOutcome, EscrowError> {
        let refund = self
            .store
            .get_refund(refund_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("refund {}", refund_id)))?;
        if !matches!(refund.status, RefundStatus::Pending | RefundStatus::Failed) {
            let tx = self.load(refund.transaction_id).await?;
            return Ok(outcome(&refund, &tx));
        }

        let order = RefundOrder {
            refund_id: refund.id,
            transaction_id: refund.transaction_id,
            original_pg_transaction_id: self.charged_pg_id(refund.transaction_id).await?,
            amount: refund.amount,
            reason: refund.reason.clone(),
            bank: refund.bank.clone(),
        };

        let attempt = match self.gateway.refund(&order).await {
            Ok(r) if r.completed => RefundAttempt::Completed(r.pg_transaction_id),
            Ok(r) => RefundAttempt::Accepted(r.pg_transaction_id),
            Err(e) => e.into(),
        };
        self.record_refund(refund_id, attempt, actor).await
    }

    async fn charged_pg_id(&self, id: TransactionId) -> Result<Option<String>, EscrowError> {
        let payments = self.store.list_payments(id).await?;
        Ok(payments
            .into_iter()
            .find(|p| p.status != PaymentStatus::Failed)
            .and_then(|p| p.pg_transaction_id))
    }

    /// Persist a gateway refund result, retrying when the aggregate moved meanwhile
    async fn record_refund(
        &self,
        refund_id: Uuid,
        attempt: RefundAttempt,
        actor: Actor,
    ) -> Result<RefundOutcome, EscrowError> {
        for _ in 0..RECORD_RETRIES {
            let refund = self
                .store
                .get_refund(refund_id)
                .await?
                .ok_or_else(|| EscrowError::NotFound(format!("refund {}", refund_id)))?;
            let tx = self.load(refund.transaction_id).await?;
            if refund.status == RefundStatus::Completed {
                return Ok(outcome(&refund, &tx));
            }

            let changes = match &attempt {
                RefundAttempt::Completed(pg_id) => {
                    self.refund_completed(tx, refund, pg_id, actor).await?
                }
                RefundAttempt::Accepted(pg_id) => {
                    let mut refund = refund;
                    refund.status = RefundStatus::Processing;
                    refund.pg_transaction_id = Some(pg_id.clone());
                    refund.attempts += 1;
                    refund.next_retry_at = None;
                    refund.updated_at = Utc::now();
                    ChangeSet::update(tx).with_refund(Write::Update(refund))
                }
                RefundAttempt::Failed(reason) => self.refund_failed(tx, refund, reason),
            };

            let refund_after = match &changes.refund {
                Some(w) => w.record().clone(),
                None => continue,
            };
            match self.store.commit(changes).await {
                Ok(committed) => {
                    self.deliver(&committed.notifications).await;
                    return Ok(outcome(&refund_after, &committed.transaction));
                }
                Err(StoreError::VersionConflict(_)) => {
                    debug!(refund_id = %refund_id, "Refund result raced another writer, reloading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EscrowError::Conflict(format!(
            "refund {} result could not be recorded",
            refund_id
        )))
    }

    /// Refund completed: REFUND_PENDING → REFUNDED (system) or DISPUTE → REFUNDED (admin)
    async fn refund_completed(
        &self,
        mut tx: Transaction,
        mut refund: Refund,
        pg_id: &str,
        actor: Actor,
    ) -> Result<ChangeSet, EscrowError> {
        let now = Utc::now();
        refund.status = RefundStatus::Completed;
        refund.pg_transaction_id = Some(pg_id.to_string());
        refund.attempts += 1;
        refund.next_retry_at = None;
        refund.last_error = None;
        refund.completed_at = Some(now);
        refund.updated_at = now;

        let metadata = json!({
            "refundId": refund.id,
            "amount": refund.amount.to_string(),
            "pgTransactionId": pg_id,
        });
        let event = match tx.status {
            TransactionStatus::Dispute => {
                let dispute = self.store.get_dispute(tx.id).await?;
                let mut conds = conditions(&[Condition::RefundCompleted]);
                let mut resolver = actor;
                if let Some(d) = dispute
                    .as_ref()
                    .filter(|d| d.resolution == Some(DisputeResolution::Refund))
                {
                    conds = conds.with(Condition::AdminResolution);
                    if let Some(admin) = d.resolved_by {
                        resolver = Actor::Admin(admin);
                    }
                }
                transition(
                    &mut tx,
                    TransactionStatus::Refunded,
                    Trigger::Admin,
                    conds,
                    resolver,
                    EventType::DisputeResolved,
                    metadata,
                )?
            }
            _ => transition(
                &mut tx,
                TransactionStatus::Refunded,
                Trigger::System,
                conditions(&[Condition::RefundCompleted]),
                Actor::System,
                EventType::RefundCompleted,
                metadata,
            )?,
        };
        tx.refunded_at = Some(now);
        tx.escrow_amount = Decimal::ZERO;

        let notice = Notification::new(
            &tx,
            Audience::Parties,
            format!("The refund of {} has been completed.", refund.amount),
        );
        info!(transaction_id = %tx.id, refund_id = %refund.id, amount = %refund.amount, "Refund completed");
        Ok(ChangeSet::update(tx)
            .with_refund(Write::Update(refund))
            .event(event)
            .notify(notice))
    }

    /// Gateway refused or timed out: schedule a retry or dead-letter
    fn refund_failed(&self, tx: Transaction, mut refund: Refund, reason: &str) -> ChangeSet {
        let policy = &self.config.refund_retry;
        let now = Utc::now();
        refund.status = RefundStatus::Failed;
        refund.attempts += 1;
        refund.last_error = Some(reason.to_string());
        refund.updated_at = now;

        let changes = if policy.exhausted(refund.attempts) {
            refund.dead_lettered = true;
            refund.next_retry_at = None;
            error!(
                transaction_id = %tx.id,
                refund_id = %refund.id,
                attempts = refund.attempts,
                error = %reason,
                "CRITICAL: Refund retry budget exhausted, dead-lettered"
            );
            let notice = Notification::new(
                &tx,
                Audience::Admins,
                format!(
                    "Refund {} of {} failed {} times ({}). Manual retry required.",
                    refund.id, refund.amount, refund.attempts, reason
                ),
            )
            .with_action(SuggestedAction::post("Retry refund", actions::REFUND_RETRY));
            ChangeSet::update(tx).notify(notice)
        } else {
            let backoff = policy.backoff(refund.attempts);
            refund.next_retry_at = Some(now + to_chrono(backoff));
            warn!(
                transaction_id = %tx.id,
                refund_id = %refund.id,
                attempts = refund.attempts,
                retry_in_secs = backoff.as_secs(),
                error = %reason,
                "Refund failed at gateway, retry scheduled"
            );
            ChangeSet::update(tx)
        };
        changes.with_refund(Write::Update(refund))
    }

    // ========================================================================
    // Disputes
    // ========================================================================

    /// Buyer escalates (CANCEL_REQUESTED | DELIVERED → DISPUTE)
    pub async fn open_dispute(
        &self,
        actor: Actor,
        req: OpenDisputeRequest,
    ) -> Result<Dispute, EscrowError> {
        let mut tx = self.load(req.transaction_id).await?;
        let opened_by = match actor {
            Actor::User(id) => id,
            _ => return Err(EscrowError::Forbidden("only the buyer can open a dispute".to_string())),
        };
        authorize(&tx, actor, &[Trigger::Buyer])?;
        if self.store.get_dispute(tx.id).await?.is_some() {
            return Err(EscrowError::Conflict("dispute already opened".to_string()));
        }
        require_text(&req.reason, "reason")?;
        validate_urls(&req.evidence_urls)?;

        let event = transition(
            &mut tx,
            TransactionStatus::Dispute,
            Trigger::Buyer,
            conditions(&[Condition::DisputeOpened]),
            actor,
            EventType::DisputeOpened,
            json!({ "type": req.dispute_type.as_str(), "reason": req.reason }),
        )?;

        let dispute = Dispute {
            transaction_id: tx.id,
            dispute_type: req.dispute_type,
            reason: req.reason.trim().to_string(),
            evidence_urls: req.evidence_urls,
            opened_by,
            resolution: None,
            refund_amount: None,
            resolved_by: None,
            opened_at: Utc::now(),
            resolved_at: None,
        };
        let to_parties = Notification::new(
            &tx,
            Audience::Parties,
            format!(
                "A dispute was opened ({}). An administrator will review the case.",
                dispute.dispute_type.as_str()
            ),
        );
        let to_admins = Notification::new(
            &tx,
            Audience::Admins,
            format!("New dispute on transaction {}: {}", tx.id, dispute.reason),
        );

        self.commit(
            ChangeSet::update(tx)
                .with_dispute(dispute.clone())
                .event(event)
                .notify(to_parties)
                .notify(to_admins),
        )
        .await?;
        info!(transaction_id = %req.transaction_id, dispute_type = dispute.dispute_type.as_str(), "Dispute opened");
        Ok(dispute)
    }

    /// Append evidence URLs to an open dispute. Existing URLs are never replaced.
    pub async fn upload_evidence(
        &self,
        actor: Actor,
        id: TransactionId,
        urls: Vec<String>,
    ) -> Result<Dispute, EscrowError> {
        let tx = self.load(id).await?;
        authorize(&tx, actor, &[Trigger::Buyer, Trigger::Seller, Trigger::Admin])?;
        let mut dispute = self
            .store
            .get_dispute(id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("dispute for transaction {}", id)))?;
        if dispute.resolution.is_some() {
            return Err(EscrowError::Conflict("dispute already resolved".to_string()));
        }
        if urls.is_empty() {
            return Err(EscrowError::InvalidRequest("evidenceUrls is required".to_string()));
        }
        validate_urls(&urls)?;

        for url in urls {
            if !dispute.evidence_urls.contains(&url) {
                dispute.evidence_urls.push(url);
            }
        }
        self.commit(ChangeSet::update(tx).with_dispute(dispute.clone()))
            .await?;
        Ok(dispute)
    }

    /// Admin decision, the only way out of DISPUTE
    pub async fn resolve_dispute(
        &self,
        actor: Actor,
        req: ResolveDisputeRequest,
    ) -> Result<Transaction, EscrowError> {
        let mut tx = self.load(req.transaction_id).await?;
        authorize(&tx, actor, &[Trigger::Admin])?;
        let admin_id = actor.id();

        let mut dispute = self.store.get_dispute(tx.id).await?.ok_or_else(|| {
            EscrowError::NotFound(format!("dispute for transaction {}", tx.id))
        })?;
        if dispute.resolution.is_some() {
            return Err(EscrowError::Conflict("dispute already resolved".to_string()));
        }
        let now = Utc::now();

        match req.resolution {
            DisputeResolution::Release => {
                if self
                    .store
                    .list_refunds(tx.id)
                    .await?
                    .iter()
                    .any(Refund::is_outstanding)
                {
                    return Err(EscrowError::Conflict(
                        "cannot release escrow while a refund is in progress".to_string(),
                    ));
                }
                let payout = tx.escrow_amount - tx.platform_fee;
                let event = transition(
                    &mut tx,
                    TransactionStatus::BuyerConfirmed,
                    Trigger::Admin,
                    conditions(&[Condition::AdminResolution]),
                    actor,
                    EventType::DisputeResolved,
                    json!({ "resolution": "release", "payout": payout.to_string() }),
                )?;
                tx.confirmed_at = Some(now);
                tx.escrow_amount = Decimal::ZERO;

                dispute.resolution = Some(DisputeResolution::Release);
                dispute.resolved_by = admin_id;
                dispute.resolved_at = Some(now);

                let notice = Notification::new(
                    &tx,
                    Audience::Parties,
                    format!("The dispute was resolved in favour of the seller. {} has been released.", payout),
                );
                let tx = self
                    .commit(
                        ChangeSet::update(tx)
                            .with_dispute(dispute)
                            .event(event)
                            .notify(notice),
                    )
                    .await?;
                info!(transaction_id = %tx.id, "Dispute resolved: release");
                Ok(tx)
            }
            DisputeResolution::Refund => {
                if tx.status != TransactionStatus::Dispute {
                    return Err(EscrowError::invalid_transition(
                        tx.status,
                        TransactionStatus::Refunded,
                        TransitionRejection::NoSuchTransition,
                    ));
                }
                let amount = req.refund_amount.unwrap_or(tx.escrow_amount);
                require_positive(amount, "refundAmount")?;
                if amount > tx.escrow_amount {
                    return Err(EscrowError::InvalidRequest(format!(
                        "refund amount {} exceeds escrow amount {}",
                        amount, tx.escrow_amount
                    )));
                }
                if self
                    .store
                    .list_refunds(tx.id)
                    .await?
                    .iter()
                    .any(Refund::is_outstanding)
                {
                    return Err(EscrowError::Conflict("a refund is already in progress".to_string()));
                }

                dispute.resolution = Some(DisputeResolution::Refund);
                dispute.refund_amount = Some(amount);
                dispute.resolved_by = admin_id;
                dispute.resolved_at = Some(now);

                let mut refund = Refund::new(tx.id, amount, "dispute resolved in buyer's favour", None);
                refund.next_retry_at =
                    Some(now + to_chrono(self.config.refund_retry.base_backoff));
                let refund_id = refund.id;

                let notice = Notification::new(
                    &tx,
                    Audience::Parties,
                    format!("The dispute was resolved in favour of the buyer. A refund of {} will follow.", amount),
                );
                self.commit(
                    ChangeSet::update(tx)
                        .with_dispute(dispute)
                        .with_refund(Write::Insert(refund))
                        .notify(notice),
                )
                .await?;
                info!(transaction_id = %req.transaction_id, amount = %amount, "Dispute resolved: refund");

                self.drive_refund(refund_id, actor).await?;
                self.load(req.transaction_id).await
            }
        }
    }

    // ========================================================================
    // Webhooks
    // ========================================================================

    /// Payment gateway callback for charges and refunds.
    ///
    /// An already-completed `pgTransactionId` is acknowledged as a no-op.
    pub async fn handle_payment_webhook(
        &self,
        payload: PaymentWebhook,
    ) -> Result<WebhookOutcome, EscrowError> {
        let completed = match payload.status.as_str() {
            "completed" => true,
            "failed" => false,
            other => return Err(EscrowError::UnknownEvent(other.to_string())),
        };

        if let Some(refund) = self.store.find_refund_by_pg_id(&payload.pg_transaction_id).await? {
            if refund.transaction_id != payload.transaction_id {
                return Err(EscrowError::InvalidRequest(
                    "pgTransactionId belongs to another transaction".to_string(),
                ));
            }
            if refund.status == RefundStatus::Completed {
                debug!(pg_tx = %payload.pg_transaction_id, "Refund already completed, duplicate webhook");
                return Ok(WebhookOutcome::Duplicate);
            }
            let attempt = if completed {
                RefundAttempt::Completed(payload.pg_transaction_id.clone())
            } else {
                RefundAttempt::Failed("gateway reported refund failure".to_string())
            };
            let result = self.record_refund(refund.id, attempt, Actor::System).await?;
            return Ok(WebhookOutcome::Applied(result.transaction_status));
        }

        let mut payment = self
            .store
            .find_payment_by_pg_id(&payload.pg_transaction_id)
            .await?
            .ok_or_else(|| {
                EscrowError::NotFound(format!("payment {}", payload.pg_transaction_id))
            })?;
        if payment.transaction_id != payload.transaction_id {
            return Err(EscrowError::InvalidRequest(
                "pgTransactionId belongs to another transaction".to_string(),
            ));
        }
        if payment.status == PaymentStatus::Completed {
            debug!(pg_tx = %payload.pg_transaction_id, "Payment already completed, duplicate webhook");
            return Ok(WebhookOutcome::Duplicate);
        }

        let mut tx = self.load(payment.transaction_id).await?;
        payment.updated_at = Utc::now();

        let changes = if completed {
            payment.status = PaymentStatus::Completed;
            if tx.status == TransactionStatus::Paid {
                let held = transition(
                    &mut tx,
                    TransactionStatus::InEscrow,
                    Trigger::System,
                    conditions(&[Condition::PaymentConfirmed]),
                    Actor::System,
                    EventType::EscrowHeld,
                    json!({ "pgTransactionId": payload.pg_transaction_id }),
                )?;
                let awaiting = transition(
                    &mut tx,
                    TransactionStatus::AwaitingShipment,
                    Trigger::System,
                    TransitionConditions::none(),
                    Actor::System,
                    EventType::ShipmentRequested,
                    serde_json::Value::Null,
                )?;
                let notice = Notification::new(
                    &tx,
                    Audience::Seller,
                    "Payment confirmed and held in escrow. Please ship the item and register the tracking number.",
                )
                .with_action(SuggestedAction::post("Register shipment", actions::SHIP));
                ChangeSet::update(tx).event(held).event(awaiting).notify(notice)
            } else {
                // Buyer already moved on (e.g. cancel requested); only the payment row changes
                info!(transaction_id = %tx.id, status = %tx.status, "Payment settled outside PAID");
                ChangeSet::update(tx)
            }
        } else {
            payment.status = PaymentStatus::Failed;
            warn!(transaction_id = %tx.id, pg_tx = %payload.pg_transaction_id, "Gateway reported payment failure");
            let notice = Notification::new(
                &tx,
                Audience::Parties,
                "The payment could not be settled by the payment provider.",
            )
            .with_action(SuggestedAction::post("Open dispute", actions::DISPUTE_OPEN));
            ChangeSet::update(tx).notify(notice)
        };

        let tx = self
            .commit(changes.with_payment(Write::Update(payment)))
            .await?;
        Ok(WebhookOutcome::Applied(tx.status))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Full aggregate with the last events, for buyer, seller or admin
    pub async fn get_transaction(
        &self,
        actor: Actor,
        id: TransactionId,
    ) -> Result<TransactionView, EscrowError> {
        let tx = self.load(id).await?;
        authorize(
            &tx,
            actor,
            &[Trigger::Buyer, Trigger::Seller, Trigger::Admin, Trigger::System],
        )?;

        Ok(TransactionView {
            payments: self.store.list_payments(id).await?,
            shipment: self.store.get_shipment(id).await?,
            refunds: self.store.list_refunds(id).await?,
            dispute: self.store.get_dispute(id).await?,
            recent_events: self.store.recent_events(id, RECENT_EVENTS).await?,
            transaction: tx,
        })
    }
}

fn outcome(refund: &Refund, tx: &Transaction) -> RefundOutcome {
    RefundOutcome {
        refund_id: refund.id,
        amount: refund.amount,
        refund_status: refund.status,
        transaction_status: tx.status,
        queued_for_retry: refund.status == RefundStatus::Failed && !refund.dead_lettered,
    }
}

impl From<GatewayFailure> for RefundAttempt {
    fn from(f: GatewayFailure) -> Self {
        RefundAttempt::Failed(f.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        assert_eq!(policy.backoff(4), Duration::from_secs(480));
        assert_eq!(policy.backoff(10), Duration::from_secs(3600));
        assert_eq!(policy.backoff(1000), Duration::from_secs(3600));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[test]
    fn test_escrow_config_default() {
        let config = EscrowConfig::default();
        assert_eq!(config.platform_fee_bps, 350);
        assert_eq!(config.cancel_timeout, Duration::from_secs(86_400));
    }

    #[test]
    fn test_authorize_derives_role_from_record() {
        let tx = Transaction::new("l", 1001, 2002, Decimal::from(1000), Decimal::ZERO);
        assert_eq!(authorize(&tx, Actor::User(1001), &[Trigger::Buyer]).unwrap(), Trigger::Buyer);
        assert!(matches!(
            authorize(&tx, Actor::User(2002), &[Trigger::Buyer]),
            Err(EscrowError::Forbidden(_))
        ));
        assert!(matches!(
            authorize(&tx, Actor::User(3003), &[Trigger::Buyer, Trigger::Seller]),
            Err(EscrowError::Forbidden(_))
        ));
        assert_eq!(authorize(&tx, Actor::Admin(1), &[Trigger::Admin]).unwrap(), Trigger::Admin);
        assert!(authorize(&tx, Actor::System, &[Trigger::Buyer]).is_err());
    }

    #[test]
    fn test_transition_helper_records_event() {
        let mut tx = Transaction::new("l", 1001, 2002, Decimal::from(1000), Decimal::ZERO);
        let event = transition(
            &mut tx,
            TransactionStatus::Paid,
            Trigger::Buyer,
            conditions(&[Condition::PaymentApproved]),
            Actor::User(1001),
            EventType::PaymentInitiated,
            serde_json::Value::Null,
        )
        .unwrap();
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert_eq!(event.from_status, TransactionStatus::Initiated);
        assert_eq!(event.to_status, TransactionStatus::Paid);
        assert_eq!(event.actor_id, Some(1001));
    }

    #[test]
    fn test_transition_helper_leaves_status_on_rejection() {
        let mut tx = Transaction::new("l", 1001, 2002, Decimal::from(1000), Decimal::ZERO);
        let err = transition(
            &mut tx,
            TransactionStatus::Paid,
            Trigger::Buyer,
            TransitionConditions::none(),
            Actor::User(1001),
            EventType::PaymentInitiated,
            serde_json::Value::Null,
        )
        .unwrap_err();
        assert_eq!(tx.status, TransactionStatus::Initiated);
        assert!(err.to_string().contains("missing condition: payment_approved"));
    }

    #[test]
    fn test_evidence_url_validation() {
        assert!(validate_urls(&["https://cdn.example.com/a.jpg".to_string()]).is_ok());
        assert!(validate_urls(&["ftp://x".to_string()]).is_err());
        assert!(validate_urls(&[]).is_ok());
    }
}
