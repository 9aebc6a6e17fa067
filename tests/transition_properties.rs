//! Property-based tests over the transition table
//!
//! These hold for every (from, to, trigger) combination, not just the
//! handful of paths the service exercises.

use escrow_engine::escrow::{
    Condition, StateMachine, TransactionStatus, TransitionConditions, TransitionRejection, Trigger,
};
use proptest::prelude::*;

const TRIGGERS: [Trigger; 4] = [Trigger::Buyer, Trigger::Seller, Trigger::System, Trigger::Admin];

const CONDITIONS: [Condition; 11] = [
    Condition::PaymentApproved,
    Condition::PaymentConfirmed,
    Condition::TrackingRegistered,
    Condition::CourierPickedUp,
    Condition::CourierDelivered,
    Condition::ReasonGiven,
    Condition::SellerApproved,
    Condition::DisputeOpened,
    Condition::RefundRequested,
    Condition::RefundCompleted,
    Condition::AdminResolution,
];

fn all_conditions() -> TransitionConditions {
    CONDITIONS
        .into_iter()
        .fold(TransitionConditions::none(), |c, flag| c.with(flag))
}

fn status() -> impl Strategy<Value = TransactionStatus> {
    (0..TransactionStatus::ALL.len()).prop_map(|i| TransactionStatus::ALL[i])
}

fn trigger() -> impl Strategy<Value = Trigger> {
    (0..TRIGGERS.len()).prop_map(|i| TRIGGERS[i])
}

proptest! {
    /// With every condition asserted, validation agrees with the edge lookup
    #[test]
    fn validation_matches_edge_lookup(from in status(), to in status(), by in trigger()) {
        let result = StateMachine::validate_transition(from, to, by, &all_conditions());
        prop_assert_eq!(result.is_ok(), StateMachine::can_transition(from, to, by));
        if result.is_err() {
            prop_assert_eq!(result.unwrap_err(), TransitionRejection::NoSuchTransition);
        }
    }

    /// Dropping one required condition names exactly that condition
    #[test]
    fn missing_condition_is_reported(rule_idx in 0..StateMachine::rules().len(), pick in 0usize..4) {
        let rule = &StateMachine::rules()[rule_idx];
        prop_assume!(!rule.conditions.is_empty());
        let dropped = rule.conditions[pick % rule.conditions.len()];

        let conditions = rule
            .conditions
            .iter()
            .filter(|c| **c != dropped)
            .fold(TransitionConditions::none(), |acc, c| acc.with(*c));

        prop_assert_eq!(
            StateMachine::validate_transition(rule.from, rule.to, rule.trigger, &conditions),
            Err(TransitionRejection::MissingCondition(dropped))
        );
    }

    /// Terminal states never move, whatever the trigger or target
    #[test]
    fn terminal_states_are_final(to in status(), by in trigger()) {
        for from in [TransactionStatus::BuyerConfirmed, TransactionStatus::Refunded] {
            prop_assert!(!StateMachine::can_transition(from, to, by));
        }
    }

    /// Only an administrator moves a transaction out of DISPUTE
    #[test]
    fn dispute_exits_only_by_admin(to in status(), by in trigger()) {
        if StateMachine::can_transition(TransactionStatus::Dispute, to, by) {
            prop_assert_eq!(by, Trigger::Admin);
        }
    }

    /// A random walk from INITIATED always ends somewhere the table allows
    #[test]
    fn random_walk_stays_on_the_graph(choices in prop::collection::vec(0usize..64, 1..24)) {
        let mut state = TransactionStatus::Initiated;
        let reachable = StateMachine::reachable_from(TransactionStatus::Initiated);

        for choice in choices {
            let next: Vec<_> = StateMachine::rules().iter().filter(|r| r.from == state).collect();
            if next.is_empty() {
                prop_assert!(state.is_terminal());
                break;
            }
            let rule = next[choice % next.len()];
            prop_assert!(StateMachine::can_transition(rule.from, rule.to, rule.trigger));
            state = rule.to;
            prop_assert!(reachable.contains(&state));
        }
    }

    /// Stored ids decode only to the status that produced them
    #[test]
    fn status_ids_decode_consistently(id in any::<i16>()) {
        match TransactionStatus::from_id(id) {
            Some(s) => prop_assert_eq!(s.id(), id),
            None => prop_assert!(TransactionStatus::ALL.iter().all(|s| s.id() != id)),
        }
    }
}

#[test]
fn every_status_reachable_from_initiated() {
    let reachable = StateMachine::reachable_from(TransactionStatus::Initiated);
    for s in TransactionStatus::ALL {
        assert!(reachable.contains(&s), "{} unreachable", s);
    }
}

#[test]
fn auto_transitions_are_system_triggered() {
    let autos = StateMachine::auto_transitions();
    assert!(!autos.is_empty());
    assert!(autos.iter().all(|r| r.trigger == Trigger::System));
    assert!(
        autos
            .iter()
            .any(|r| r.from == TransactionStatus::CancelRequested && r.timeout.is_some())
    );
}
