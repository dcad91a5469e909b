//! Durable payout records and their state machine.

use crate::balance::Bucket;
use crate::currency::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an external withdrawal.
///
/// ```text
/// CREATED -> RESERVED -> SUBMITTED -> {CONFIRMED | FAILED -> REFUNDED}
///                    \-> REFUNDED
/// ```
///
/// `Confirmed` and `Refunded` are terminal; a record in a terminal state
/// never transitions again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutState {
    Created,
    Reserved,
    Submitted,
    Confirmed,
    Failed,
    Refunded,
}

impl PayoutState {
    pub fn name(&self) -> &'static str {
        match self {
            PayoutState::Created => "CREATED",
            PayoutState::Reserved => "RESERVED",
            PayoutState::Submitted => "SUBMITTED",
            PayoutState::Confirmed => "CONFIRMED",
            PayoutState::Failed => "FAILED",
            PayoutState::Refunded => "REFUNDED",
        }
    }

    pub fn from_name(name: &str) -> Option<PayoutState> {
        match name {
            "CREATED" => Some(PayoutState::Created),
            "RESERVED" => Some(PayoutState::Reserved),
            "SUBMITTED" => Some(PayoutState::Submitted),
            "CONFIRMED" => Some(PayoutState::Confirmed),
            "FAILED" => Some(PayoutState::Failed),
            "REFUNDED" => Some(PayoutState::Refunded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PayoutState::Confirmed | PayoutState::Refunded)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: PayoutState) -> bool {
        matches!(
            (self, next),
            (PayoutState::Created, PayoutState::Reserved)
                | (PayoutState::Reserved, PayoutState::Submitted)
                | (PayoutState::Reserved, PayoutState::Refunded)
                | (PayoutState::Submitted, PayoutState::Confirmed)
                | (PayoutState::Submitted, PayoutState::Failed)
                | (PayoutState::Failed, PayoutState::Refunded)
        )
    }
}

impl fmt::Display for PayoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A durable withdrawal record. The id doubles as the client nonce sent to
/// the processor, making submission idempotent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub user: String,
    pub currency: Currency,
    pub quantity: Decimal,
    pub destination: String,
    /// Bucket the reserve debited.
    pub source_bucket: Bucket,
    /// Processor-assigned id, set on successful submission.
    pub external_id: Option<String>,
    /// Chain transaction hash, set on confirmation.
    pub chain_tx_hash: Option<String>,
    pub state: PayoutState,
    pub attempts: u32,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Set when the payout enters a terminal state.
    pub terminal_at_ms: Option<u64>,
}
