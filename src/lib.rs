//! Escrow Engine
//!
//! Holds marketplace payments in escrow from checkout until the buyer
//! confirms the purchase, with cancellation, refund and dispute paths.
//!
//! # Modules
//!
//! - [`escrow`] - Transition table, service, storage, gateway, worker
//! - [`api`] - Axum routes, DTOs and OpenAPI document
//! - [`auth`] - JWT callers and signed webhooks
//! - [`db`] - PostgreSQL pool and schema
//! - [`config`] - YAML configuration per environment
//! - [`logging`] - tracing subscriber setup

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod escrow;
pub mod logging;

pub use escrow::{EscrowError, EscrowService, TransactionStatus};
