//! HTTP handlers
//!
//! Each handler resolves the caller from the `Actor` extension set by the JWT
//! middleware, validates the body and makes exactly one service call.

pub mod dispute;
pub mod health;
pub mod payment;
pub mod transaction;
pub mod webhook;

pub use dispute::{open_dispute, resolve_dispute, upload_evidence};
pub use health::{HealthResponse, health_check};
pub use payment::{
    approve_cancel, confirm_delivery, final_confirm, initiate_payment, process_refund,
    register_shipment, request_cancel, retry_refund,
};
pub use transaction::{get_transaction, open_transaction};
pub use webhook::{courier_webhook, pg_webhook};
