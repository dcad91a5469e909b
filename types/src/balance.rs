//! Balance buckets and quantity arithmetic.

use crate::currency::Currency;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A named partition of a user's balance. Exactly three exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Freely spendable; credited by deposit sweeps and conversions.
    Deposit,
    /// Credited by game wins. Spendable and withdrawable.
    Winnings,
    /// Credited by game losses. Withdrawable; bettable only after promotion.
    Savings,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Deposit, Bucket::Winnings, Bucket::Savings];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Deposit => "deposit",
            Bucket::Winnings => "winnings",
            Bucket::Savings => "savings",
        }
    }

    pub fn from_name(name: &str) -> Option<Bucket> {
        match name {
            "deposit" => Some(Bucket::Deposit),
            "winnings" => Some(Bucket::Winnings),
            "savings" => Some(Bucket::Savings),
            _ => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Round a quantity down to the currency's fixed-point scale.
///
/// Conversion credits always round toward zero so the ledger never creates
/// value out of rounding.
pub fn quantize_down(quantity: Decimal, currency: Currency) -> Decimal {
    quantity.round_dp_with_strategy(currency.decimals(), RoundingStrategy::ToZero)
}

/// One (bucket, currency) cell and its quantity, as captured in journal
/// snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCell {
    pub bucket: Bucket,
    pub currency: Currency,
    pub quantity: Decimal,
}

/// A point-in-time snapshot of the balance cells an operation touched,
/// keyed by (bucket, currency). Missing entries are zero.
pub type BalanceSnapshot = BTreeMap<(Bucket, Currency), Decimal>;

/// One (system account, currency) cell and its quantity, as captured in
/// journal snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCell {
    pub account: String,
    pub currency: Currency,
    pub quantity: Decimal,
}

/// Snapshot of the system-account cells (in-flight, liquidity, house) an
/// operation touched, keyed by (account, currency).
pub type SystemSnapshot = BTreeMap<(String, Currency), Decimal>;

/// Serialize snapshots as a list of cells so they survive JSON, whose map
/// keys must be strings.
pub mod snapshot_serde {
    use super::{BalanceCell, BalanceSnapshot};
    use serde::{Deserialize, Deserializer, Serialize as _, Serializer};

    pub fn serialize<S>(snapshot: &BalanceSnapshot, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let cells: Vec<BalanceCell> = snapshot
            .iter()
            .map(|(&(bucket, currency), &quantity)| BalanceCell {
                bucket,
                currency,
                quantity,
            })
            .collect();
        cells.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BalanceSnapshot, D::Error>
    where
        D: Deserializer<'de>,
    {
        let cells = Vec::<BalanceCell>::deserialize(deserializer)?;
        Ok(cells
            .into_iter()
            .map(|cell| ((cell.bucket, cell.currency), cell.quantity))
            .collect())
    }
}

/// Same cell-list encoding for system-account snapshots.
pub mod system_serde {
    use super::{SystemCell, SystemSnapshot};
    use serde::{Deserialize, Deserializer, Serialize as _, Serializer};

    pub fn serialize<S>(snapshot: &SystemSnapshot, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let cells: Vec<SystemCell> = snapshot
            .iter()
            .map(|((account, currency), &quantity)| SystemCell {
                account: account.clone(),
                currency: *currency,
                quantity,
            })
            .collect();
        cells.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemSnapshot, D::Error>
    where
        D: Deserializer<'de>,
    {
        let cells = Vec::<SystemCell>::deserialize(deserializer)?;
        Ok(cells
            .into_iter()
            .map(|cell| ((cell.account, cell.currency), cell.quantity))
            .collect())
    }
}
