//! The unified error surface of the engine.

use crate::balance::Bucket;
use crate::currency::Currency;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to callers of the engine.
///
/// Every error except `Ambiguous` guarantees no durable state change.
/// `Ambiguous` is returned only after a payout was durably reserved, so the
/// caller can resolve it later via `payout_status`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad address, unknown currency, non-positive amount.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A debit would drive a balance cell below zero.
    #[error("insufficient {bucket} balance: requested {requested} {currency}, available {available}")]
    InsufficientBalance {
        currency: Currency,
        bucket: Bucket,
        requested: Decimal,
        available: Decimal,
    },

    /// Optimistic-concurrency mismatch; the caller should retry.
    #[error("concurrent modification, retry")]
    Conflict,

    /// No acceptably fresh rate exists for the requested pair.
    #[error("rate unavailable for {from}/{to}")]
    RateUnavailable { from: Currency, to: Currency },

    /// An external dependency failed before the operation committed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// An external call may or may not have had effect. The payout is
    /// durably reserved and recovery will reconcile it.
    #[error("payout {payout_id} submission ambiguous")]
    Ambiguous { payout_id: Uuid },

    /// Transient backend failure; retrying is sensible.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        EngineError::Upstream(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        EngineError::Unavailable(message.into())
    }
}
