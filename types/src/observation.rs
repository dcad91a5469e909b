//! External observations: rate quotes and on-chain balance readings.

use crate::currency::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A conversion rate between two currencies at a point in time.
///
/// Computed as `USD(base) / USD(quote)`; the engine always quotes in this
/// one canonical direction rather than assuming reciprocal symmetry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    pub base: Currency,
    pub quote: Currency,
    /// Strictly positive.
    pub rate: Decimal,
    pub observed_at_ms: u64,
    /// True when served past TTL but within the stale grace window.
    pub stale: bool,
    pub source: String,
}

/// A balance reading for one address on its home chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainObservation {
    pub address: String,
    pub currency: Currency,
    pub confirmed: Decimal,
    pub unconfirmed: Decimal,
    /// Which external explorer produced this reading.
    pub source: String,
    pub observed_at_ms: u64,
}
