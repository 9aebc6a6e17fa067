//! Transition Table
//!
//! Declarative registry of every legal `(from, to, trigger)` move of an escrow
//! transaction. Pure and stateless: the service asks it three questions
//! (can-I, what-can-I, why-not) and it never touches storage.
//!
//! ```text
//! INITIATED → PAID → IN_ESCROW → AWAITING_SHIPMENT → SHIPPED → IN_TRANSIT → DELIVERED
//!     → DELIVERY_CONFIRMED → BUYER_CONFIRMED
//!
//! PAID..DELIVERED → CANCEL_REQUESTED → CANCELLED → REFUND_PENDING → REFUNDED
//! CANCEL_REQUESTED | DELIVERED → DISPUTE → (admin) REFUNDED | BUYER_CONFIRMED
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::TransactionStatus;

/// Seller silence on a cancel request before the system cancels on their behalf
pub const CANCEL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// The party a transition is attributed to. Exactly one per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Buyer,
    Seller,
    System,
    Admin,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Buyer => "buyer",
            Trigger::Seller => "seller",
            Trigger::System => "system",
            Trigger::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buyer" => Some(Trigger::Buyer),
            "seller" => Some(Trigger::Seller),
            "system" => Some(Trigger::System),
            "admin" => Some(Trigger::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named precondition of a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    PaymentApproved,
    PaymentConfirmed,
    TrackingRegistered,
    CourierPickedUp,
    CourierDelivered,
    ReasonGiven,
    SellerApproved,
    DisputeOpened,
    RefundRequested,
    RefundCompleted,
    AdminResolution,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::PaymentApproved => "payment_approved",
            Condition::PaymentConfirmed => "payment_confirmed",
            Condition::TrackingRegistered => "tracking_registered",
            Condition::CourierPickedUp => "courier_picked_up",
            Condition::CourierDelivered => "courier_delivered",
            Condition::ReasonGiven => "reason_given",
            Condition::SellerApproved => "seller_approved",
            Condition::DisputeOpened => "dispute_opened",
            Condition::RefundRequested => "refund_requested",
            Condition::RefundCompleted => "refund_completed",
            Condition::AdminResolution => "admin_resolution",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaymentConditions {
    pub approved: bool,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShipmentConditions {
    pub tracking_registered: bool,
    pub picked_up: bool,
    pub delivered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelConditions {
    pub reason_given: bool,
    pub seller_approved: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefundConditions {
    pub requested: bool,
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisputeConditions {
    pub opened: bool,
    pub admin_resolution: bool,
}

/// Facts the caller asserts when asking for a transition, grouped per family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionConditions {
    pub payment: PaymentConditions,
    pub shipment: ShipmentConditions,
    pub cancel: CancelConditions,
    pub refund: RefundConditions,
    pub dispute: DisputeConditions,
}

impl TransitionConditions {
    pub fn none() -> Self {
        Self::default()
    }

    /// Set one flag
    pub fn with(mut self, condition: Condition) -> Self {
        *self.flag_mut(condition) = true;
        self
    }

    pub fn is_met(&self, condition: Condition) -> bool {
        match condition {
            Condition::PaymentApproved => self.payment.approved,
            Condition::PaymentConfirmed => self.payment.confirmed,
            Condition::TrackingRegistered => self.shipment.tracking_registered,
            Condition::CourierPickedUp => self.shipment.picked_up,
            Condition::CourierDelivered => self.shipment.delivered,
            Condition::ReasonGiven => self.cancel.reason_given,
            Condition::SellerApproved => self.cancel.seller_approved,
            Condition::DisputeOpened => self.dispute.opened,
            Condition::RefundRequested => self.refund.requested,
            Condition::RefundCompleted => self.refund.completed,
            Condition::AdminResolution => self.dispute.admin_resolution,
        }
    }

    fn flag_mut(&mut self, condition: Condition) -> &mut bool {
        match condition {
            Condition::PaymentApproved => &mut self.payment.approved,
            Condition::PaymentConfirmed => &mut self.payment.confirmed,
            Condition::TrackingRegistered => &mut self.shipment.tracking_registered,
            Condition::CourierPickedUp => &mut self.shipment.picked_up,
            Condition::CourierDelivered => &mut self.shipment.delivered,
            Condition::ReasonGiven => &mut self.cancel.reason_given,
            Condition::SellerApproved => &mut self.cancel.seller_approved,
            Condition::DisputeOpened => &mut self.dispute.opened,
            Condition::RefundRequested => &mut self.refund.requested,
            Condition::RefundCompleted => &mut self.refund.completed,
            Condition::AdminResolution => &mut self.dispute.admin_resolution,
        }
    }
}

/// One legal edge of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
    pub trigger: Trigger,
    pub conditions: &'static [Condition],
    /// Driven by the background worker rather than a request
    pub auto_transition: bool,
    /// Only fires once this long has elapsed in `from`
    pub timeout: Option<Duration>,
    pub description: &'static str,
}

impl TransitionRule {
    const fn manual(
        from: TransactionStatus,
        to: TransactionStatus,
        trigger: Trigger,
        conditions: &'static [Condition],
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            trigger,
            conditions,
            auto_transition: false,
            timeout: None,
            description,
        }
    }

    const fn auto(
        from: TransactionStatus,
        to: TransactionStatus,
        conditions: &'static [Condition],
        timeout: Option<Duration>,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            trigger: Trigger::System,
            conditions,
            auto_transition: true,
            timeout,
            description,
        }
    }
}

/// Why a transition was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    /// The edge does not exist for this trigger (a programming or ordering error)
    NoSuchTransition,
    /// The edge exists but a business precondition is not satisfied
    MissingCondition(Condition),
}

impl fmt::Display for TransitionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionRejection::NoSuchTransition => f.write_str("no such transition"),
            TransitionRejection::MissingCondition(c) => write!(f, "missing condition: {}", c),
        }
    }
}

use Condition as C;
use TransactionStatus as S;

static RULES: &[TransitionRule] = &[
    // Payment
    TransitionRule::manual(S::Initiated, S::Paid, Trigger::Buyer, &[C::PaymentApproved], "buyer paid"),
    TransitionRule::auto(S::Paid, S::InEscrow, &[C::PaymentConfirmed], None, "gateway confirmed funds held in escrow"),
    TransitionRule::auto(S::InEscrow, S::AwaitingShipment, &[], None, "seller asked to ship"),
    // Shipment
    TransitionRule::manual(S::AwaitingShipment, S::Shipped, Trigger::Seller, &[C::TrackingRegistered], "seller registered tracking number"),
    TransitionRule::manual(S::Shipped, S::InTransit, Trigger::System, &[C::CourierPickedUp], "courier picked up parcel"),
    TransitionRule::manual(S::InTransit, S::Delivered, Trigger::System, &[C::CourierDelivered], "courier delivered parcel"),
    TransitionRule::manual(S::Delivered, S::DeliveryConfirmed, Trigger::Buyer, &[], "buyer confirmed delivery"),
    TransitionRule::manual(S::DeliveryConfirmed, S::BuyerConfirmed, Trigger::Buyer, &[], "buyer confirmed purchase"),
    // Cancel requests
    TransitionRule::manual(S::Paid, S::CancelRequested, Trigger::Buyer, &[C::ReasonGiven], "buyer requested cancellation"),
    TransitionRule::manual(S::InEscrow, S::CancelRequested, Trigger::Buyer, &[C::ReasonGiven], "buyer requested cancellation"),
    TransitionRule::manual(S::AwaitingShipment, S::CancelRequested, Trigger::Buyer, &[C::ReasonGiven], "buyer requested cancellation"),
    TransitionRule::manual(S::Shipped, S::CancelRequested, Trigger::Buyer, &[C::ReasonGiven], "buyer requested cancellation"),
    TransitionRule::manual(S::InTransit, S::CancelRequested, Trigger::Buyer, &[C::ReasonGiven], "buyer requested cancellation"),
    TransitionRule::manual(S::Delivered, S::CancelRequested, Trigger::Buyer, &[C::ReasonGiven], "buyer requested return"),
    TransitionRule::manual(S::CancelRequested, S::Cancelled, Trigger::Seller, &[C::SellerApproved], "seller approved cancellation"),
    TransitionRule::auto(S::CancelRequested, S::Cancelled, &[], Some(CANCEL_RESPONSE_TIMEOUT), "seller did not answer within 24h"),
    // Disputes
    TransitionRule::manual(S::CancelRequested, S::Dispute, Trigger::Buyer, &[C::DisputeOpened], "buyer escalated cancellation"),
    TransitionRule::manual(S::Delivered, S::Dispute, Trigger::Buyer, &[C::DisputeOpened], "buyer reported an issue"),
    TransitionRule::manual(S::Dispute, S::Refunded, Trigger::Admin, &[C::AdminResolution, C::RefundCompleted], "admin resolved in buyer's favour"),
    TransitionRule::manual(S::Dispute, S::BuyerConfirmed, Trigger::Admin, &[C::AdminResolution], "admin released funds to seller"),
    // Refunds
    TransitionRule::auto(S::Cancelled, S::RefundPending, &[C::RefundRequested], None, "refund opened"),
    TransitionRule::manual(S::RefundPending, S::Refunded, Trigger::System, &[C::RefundCompleted], "gateway completed refund"),
];

/// Stateless view over the transition table
pub struct StateMachine;

impl StateMachine {
    pub fn rules() -> &'static [TransitionRule] {
        RULES
    }

    fn find(
        from: TransactionStatus,
        to: TransactionStatus,
        trigger: Trigger,
    ) -> Option<&'static TransitionRule> {
        RULES
            .iter()
            .find(|r| r.from == from && r.to == to && r.trigger == trigger)
    }

    pub fn can_transition(from: TransactionStatus, to: TransactionStatus, trigger: Trigger) -> bool {
        Self::find(from, to, trigger).is_some()
    }

    /// States reachable from `from` in one step by `trigger`
    pub fn valid_transitions(from: TransactionStatus, trigger: Trigger) -> Vec<TransactionStatus> {
        let mut out: Vec<TransactionStatus> = Vec::new();
        for rule in RULES.iter().filter(|r| r.from == from && r.trigger == trigger) {
            if !out.contains(&rule.to) {
                out.push(rule.to);
            }
        }
        out
    }

    /// Look up the edge and check every required condition is set.
    pub fn validate_transition(
        from: TransactionStatus,
        to: TransactionStatus,
        trigger: Trigger,
        conditions: &TransitionConditions,
    ) -> Result<&'static TransitionRule, TransitionRejection> {
        let rule = Self::find(from, to, trigger).ok_or(TransitionRejection::NoSuchTransition)?;

        if let Some(missing) = rule.conditions.iter().find(|c| !conditions.is_met(**c)) {
            return Err(TransitionRejection::MissingCondition(*missing));
        }

        Ok(rule)
    }

    /// Rules intended for the background scheduler
    pub fn auto_transitions() -> Vec<&'static TransitionRule> {
        RULES.iter().filter(|r| r.auto_transition).collect()
    }

    /// Every state reachable from `start` through any chain of edges
    pub fn reachable_from(start: TransactionStatus) -> HashSet<TransactionStatus> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);

        while let Some(state) = queue.pop_front() {
            for rule in RULES.iter().filter(|r| r.from == state) {
                if seen.insert(rule.to) {
                    queue.push_back(rule.to);
                }
            }
        }

        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::{Condition as C, TransactionStatus as S};

    #[test]
    fn test_happy_path_edges_exist() {
        let path = [
            (S::Initiated, S::Paid, Trigger::Buyer),
            (S::Paid, S::InEscrow, Trigger::System),
            (S::InEscrow, S::AwaitingShipment, Trigger::System),
            (S::AwaitingShipment, S::Shipped, Trigger::Seller),
            (S::Shipped, S::InTransit, Trigger::System),
            (S::InTransit, S::Delivered, Trigger::System),
            (S::Delivered, S::DeliveryConfirmed, Trigger::Buyer),
            (S::DeliveryConfirmed, S::BuyerConfirmed, Trigger::Buyer),
        ];
        for (from, to, trigger) in path {
            assert!(
                StateMachine::can_transition(from, to, trigger),
                "{} -> {} by {}",
                from,
                to,
                trigger
            );
        }
    }

    #[test]
    fn test_trigger_must_match() {
        assert!(!StateMachine::can_transition(S::Initiated, S::Paid, Trigger::Seller));
        assert!(!StateMachine::can_transition(S::CancelRequested, S::Cancelled, Trigger::Buyer));
        assert!(!StateMachine::can_transition(S::Dispute, S::Refunded, Trigger::System));
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for state in S::ALL.into_iter().filter(|s| s.is_terminal()) {
            for trigger in [Trigger::Buyer, Trigger::Seller, Trigger::System, Trigger::Admin] {
                assert!(StateMachine::valid_transitions(state, trigger).is_empty());
            }
        }
    }

    #[test]
    fn test_dispute_exits_only_via_admin() {
        for trigger in [Trigger::Buyer, Trigger::Seller, Trigger::System] {
            assert!(StateMachine::valid_transitions(S::Dispute, trigger).is_empty());
        }
        let mut admin = StateMachine::valid_transitions(S::Dispute, Trigger::Admin);
        admin.sort_by_key(|s| s.id());
        assert_eq!(admin, vec![S::Refunded, S::BuyerConfirmed]);
    }

    #[test]
    fn test_cancel_request_window() {
        for state in S::ALL {
            assert_eq!(
                StateMachine::can_transition(state, S::CancelRequested, Trigger::Buyer),
                state.is_cancellable(),
                "{}",
                state
            );
        }
    }

    #[test]
    fn test_validate_distinguishes_missing_edge_from_missing_condition() {
        let err = StateMachine::validate_transition(
            S::AwaitingShipment,
            S::Delivered,
            Trigger::System,
            &TransitionConditions::none().with(C::CourierDelivered),
        )
        .unwrap_err();
        assert_eq!(err, TransitionRejection::NoSuchTransition);
        assert_eq!(err.to_string(), "no such transition");

        let err = StateMachine::validate_transition(
            S::CancelRequested,
            S::Cancelled,
            Trigger::Seller,
            &TransitionConditions::none(),
        )
        .unwrap_err();
        assert_eq!(err, TransitionRejection::MissingCondition(C::SellerApproved));
        assert_eq!(err.to_string(), "missing condition: seller_approved");
    }

    #[test]
    fn test_validate_checks_every_condition() {
        let only_resolution = TransitionConditions::none().with(C::AdminResolution);
        assert_eq!(
            StateMachine::validate_transition(S::Dispute, S::Refunded, Trigger::Admin, &only_resolution),
            Err(TransitionRejection::MissingCondition(C::RefundCompleted))
        );

        let both = only_resolution.with(C::RefundCompleted);
        let rule =
            StateMachine::validate_transition(S::Dispute, S::Refunded, Trigger::Admin, &both).unwrap();
        assert_eq!(rule.to, S::Refunded);
    }

    #[test]
    fn test_auto_transitions() {
        let autos = StateMachine::auto_transitions();
        assert!(autos.iter().all(|r| r.trigger == Trigger::System));

        let timed: Vec<_> = autos.iter().filter(|r| r.timeout.is_some()).collect();
        assert_eq!(timed.len(), 1);
        assert_eq!(timed[0].from, S::CancelRequested);
        assert_eq!(timed[0].to, S::Cancelled);
        assert_eq!(timed[0].timeout, Some(CANCEL_RESPONSE_TIMEOUT));
    }

    #[test]
    fn test_every_state_reachable_from_initiated() {
        let reachable = StateMachine::reachable_from(S::Initiated);
        for state in S::ALL {
            assert!(reachable.contains(&state), "{} unreachable", state);
        }
    }

    #[test]
    fn test_conditions_flags_are_independent() {
        let c = TransitionConditions::none().with(C::TrackingRegistered);
        assert!(c.is_met(C::TrackingRegistered));
        assert!(!c.is_met(C::CourierPickedUp));
        assert!(c.shipment.tracking_registered);
        assert_eq!(c.payment, PaymentConditions::default());
    }
}
