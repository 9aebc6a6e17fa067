//! Escrow Transaction Engine
//!
//! Holds a buyer's payment between checkout and the buyer's confirmation,
//! driving each transaction through a fixed transition table:
//!
//! ```text
//! INITIATED → PAID → IN_ESCROW → AWAITING_SHIPMENT → SHIPPED → IN_TRANSIT
//!   → DELIVERED → DELIVERY_CONFIRMED → BUYER_CONFIRMED
//!
//! PAID..DELIVERED → CANCEL_REQUESTED → CANCELLED → REFUND_PENDING → REFUNDED
//! CANCEL_REQUESTED | DELIVERED → DISPUTE → REFUNDED | BUYER_CONFIRMED
//! ```
//!
//! Every mutation is one atomic [`store::ChangeSet`]: aggregate row with a
//! version check, child rows, audit events and outbox notifications.

pub mod error;
pub mod gateway;
pub mod notify;
pub mod service;
pub mod state;
pub mod state_machine;
pub mod store;
pub mod types;
pub mod webhook;
pub mod worker;


pub use error::{EscrowError, GatewayFailure, StoreError};
pub use gateway::{HttpPaymentGateway, PaymentGateway};
pub use notify::{HttpChatSink, LogSink, Notification, NotificationSink};
pub use service::{EscrowConfig, EscrowService, RetryPolicy};
pub use state::TransactionStatus;
pub use state_machine::{Condition, StateMachine, TransitionConditions, TransitionRejection, Trigger};
pub use store::{EscrowStore, MemoryStore, PgEscrowStore};
pub use types::{
    Actor, BankAccount, Dispute, DisputeResolution, DisputeType, EventLogEntry, Payment,
    PaymentResult, Refund, RefundOutcome, RefundStatus, Shipment, Transaction, TransactionId,
    TransactionView, UserId,
};
pub use webhook::{PaymentWebhook, ShipmentWebhook, WebhookError, WebhookIngress, WebhookOutcome};
pub use worker::{EscrowWorker, SweepReport, WorkerConfig};
