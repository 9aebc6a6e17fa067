//! Escrow FSM State Definitions
//!
//! State IDs are stable SMALLINT values for PostgreSQL storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transaction status
///
/// Happy path: INITIATED → PAID → IN_ESCROW → AWAITING_SHIPMENT → SHIPPED
/// → IN_TRANSIT → DELIVERED → DELIVERY_CONFIRMED → BUYER_CONFIRMED.
/// Terminal states: BUYER_CONFIRMED (90), REFUNDED (-40).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum TransactionStatus {
    /// Created from a listing purchase, nothing charged yet
    Initiated = 0,
    /// Gateway approved the charge
    Paid = 10,
    /// Gateway confirmed settlement into the escrow account
    InEscrow = 20,
    AwaitingShipment = 30,
    Shipped = 40,
    InTransit = 50,
    Delivered = 60,
    DeliveryConfirmed = 70,
    /// Terminal: funds released to the seller
    BuyerConfirmed = 90,

    /// Buyer asked to cancel; seller has 24h to answer
    CancelRequested = -10,
    Cancelled = -20,
    /// Refund row exists, gateway refund in flight or awaiting retry
    RefundPending = -30,
    /// Terminal: buyer made whole
    Refunded = -40,
    /// Semi-terminal: exits only through an admin resolution
    Dispute = -50,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 14] = [
        TransactionStatus::Initiated,
        TransactionStatus::Paid,
        TransactionStatus::InEscrow,
        TransactionStatus::AwaitingShipment,
        TransactionStatus::Shipped,
        TransactionStatus::InTransit,
        TransactionStatus::Delivered,
        TransactionStatus::DeliveryConfirmed,
        TransactionStatus::BuyerConfirmed,
        TransactionStatus::CancelRequested,
        TransactionStatus::Cancelled,
        TransactionStatus::RefundPending,
        TransactionStatus::Refunded,
        TransactionStatus::Dispute,
    ];

    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::BuyerConfirmed | TransactionStatus::Refunded
        )
    }

    /// Buyer funds are held by the platform (charged, not yet released or returned)
    #[inline]
    pub fn holds_funds(&self) -> bool {
        !matches!(
            self,
            TransactionStatus::Initiated
                | TransactionStatus::BuyerConfirmed
                | TransactionStatus::Refunded
        )
    }

    /// States from which the buyer may still ask to cancel
    #[inline]
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Paid
                | TransactionStatus::InEscrow
                | TransactionStatus::AwaitingShipment
                | TransactionStatus::Shipped
                | TransactionStatus::InTransit
                | TransactionStatus::Delivered
        )
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "INITIATED",
            TransactionStatus::Paid => "PAID",
            TransactionStatus::InEscrow => "IN_ESCROW",
            TransactionStatus::AwaitingShipment => "AWAITING_SHIPMENT",
            TransactionStatus::Shipped => "SHIPPED",
            TransactionStatus::InTransit => "IN_TRANSIT",
            TransactionStatus::Delivered => "DELIVERED",
            TransactionStatus::DeliveryConfirmed => "DELIVERY_CONFIRMED",
            TransactionStatus::BuyerConfirmed => "BUYER_CONFIRMED",
            TransactionStatus::CancelRequested => "CANCEL_REQUESTED",
            TransactionStatus::Cancelled => "CANCELLED",
            TransactionStatus::RefundPending => "REFUND_PENDING",
            TransactionStatus::Refunded => "REFUNDED",
            TransactionStatus::Dispute => "DISPUTE",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown transaction status: {}", s))
    }
}

impl TryFrom<i16> for TransactionStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        TransactionStatus::from_id(value).ok_or(())
    }
}
