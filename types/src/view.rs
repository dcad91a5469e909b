//! Reconciled wallet views and operation receipts.

use crate::balance::Bucket;
use crate::currency::Currency;
use crate::payout::PayoutState;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Where the display figures for a currency came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceSource {
    /// Ledger activity exists; no usable chain observation.
    Ledger,
    /// No ledger activity; the chain observation is authoritative.
    Chain,
    /// Ledger figures shown with the chain observation attached.
    Hybrid,
}

/// Per-currency slice of the reconciled wallet view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyView {
    pub deposit: Decimal,
    pub winnings: Decimal,
    pub savings: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_chain_confirmed: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_chain_unconfirmed: Option<Decimal>,
    pub source: BalanceSource,
}

impl CurrencyView {
    pub fn bucket(&self, bucket: Bucket) -> Decimal {
        match bucket {
            Bucket::Deposit => self.deposit,
            Bucket::Winnings => self.winnings,
            Bucket::Savings => self.savings,
        }
    }
}

/// The canonical balance view external consumers see.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletView {
    pub user: String,
    pub currencies: BTreeMap<Currency, CurrencyView>,
}

/// Result of an on-demand or periodic deposit sweep for one currency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositCredit {
    pub currency: Currency,
    /// Delta credited to the deposit bucket; zero when nothing was owed.
    pub credited: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_seq: Option<u64>,
}

/// Receipt for a completed conversion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertReceipt {
    pub from_currency: Currency,
    pub to_currency: Currency,
    pub quantity_in: Decimal,
    pub quantity_out: Decimal,
    pub rate: Decimal,
    pub rate_observed_at_ms: u64,
    pub journal_seq: u64,
}

/// Receipt for a settled bet: the resulting bucket deltas plus journal seq.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleReceipt {
    pub currency: Currency,
    /// Signed deltas per bucket (stake debits negative, credits positive).
    pub deltas: BTreeMap<Bucket, Decimal>,
    pub journal_seq: u64,
}

/// Receipt for a created withdrawal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawReceipt {
    pub payout_id: Uuid,
    pub state: PayoutState,
    pub journal_seq: u64,
}

/// Current status of a payout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutStatus {
    pub payout_id: Uuid,
    pub state: PayoutState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_tx_hash: Option<String>,
}

/// Receipt for promoting savings into the deposit bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteReceipt {
    pub currency: Currency,
    pub quantity: Decimal,
    pub journal_seq: u64,
}
