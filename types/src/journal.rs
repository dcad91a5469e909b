//! Append-only journal entries.
//!
//! Every balance mutation commits atomically with exactly one journal entry
//! describing it. Entries are never mutated after insertion.

use crate::balance::{BalanceSnapshot, SystemSnapshot};
use crate::currency::Currency;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of balance mutation a journal entry records.
///
/// `DepositCredit` and `PayoutSettle` are the sole source and sink of value;
/// every other kind nets to zero within each currency (wins are funded by an
/// explicit house counter-leg).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalKind {
    DepositCredit,
    Convert,
    BetDebit,
    BetWinCredit,
    BetLossToSavings,
    SavingsPromote,
    PayoutReserve,
    PayoutSettle,
    PayoutRefund,
}

impl JournalKind {
    pub fn name(&self) -> &'static str {
        match self {
            JournalKind::DepositCredit => "DEPOSIT_CREDIT",
            JournalKind::Convert => "CONVERT",
            JournalKind::BetDebit => "BET_DEBIT",
            JournalKind::BetWinCredit => "BET_WIN_CREDIT",
            JournalKind::BetLossToSavings => "BET_LOSS_TO_SAVINGS",
            JournalKind::SavingsPromote => "SAVINGS_PROMOTE",
            JournalKind::PayoutReserve => "PAYOUT_RESERVE",
            JournalKind::PayoutSettle => "PAYOUT_SETTLE",
            JournalKind::PayoutRefund => "PAYOUT_REFUND",
        }
    }

    pub fn from_name(name: &str) -> Option<JournalKind> {
        match name {
            "DEPOSIT_CREDIT" => Some(JournalKind::DepositCredit),
            "CONVERT" => Some(JournalKind::Convert),
            "BET_DEBIT" => Some(JournalKind::BetDebit),
            "BET_WIN_CREDIT" => Some(JournalKind::BetWinCredit),
            "BET_LOSS_TO_SAVINGS" => Some(JournalKind::BetLossToSavings),
            "SAVINGS_PROMOTE" => Some(JournalKind::SavingsPromote),
            "PAYOUT_RESERVE" => Some(JournalKind::PayoutReserve),
            "PAYOUT_SETTLE" => Some(JournalKind::PayoutSettle),
            "PAYOUT_REFUND" => Some(JournalKind::PayoutRefund),
            _ => None,
        }
    }
}

impl fmt::Display for JournalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Conversion metadata attached to `Convert` entries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionLeg {
    pub from_currency: Currency,
    pub to_currency: Currency,
    pub quantity_in: Decimal,
    pub quantity_out: Decimal,
    pub rate: Decimal,
    /// When the rate was observed, unix milliseconds.
    pub rate_observed_at_ms: u64,
    /// House liquidity contribution booked alongside this conversion.
    pub liquidity_contribution: Decimal,
}

/// One immutable journal record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Strictly increasing and gap-free per store.
    pub seq: u64,
    pub timestamp_ms: u64,
    /// The user whose balances this entry touched.
    pub actor: String,
    pub kind: JournalKind,
    #[serde(with = "crate::balance::snapshot_serde")]
    pub before: BalanceSnapshot,
    #[serde(with = "crate::balance::snapshot_serde")]
    pub after: BalanceSnapshot,
    /// System-account cells this entry touched (in-flight, liquidity,
    /// house counter-legs).
    #[serde(with = "crate::balance::system_serde")]
    pub system_before: SystemSnapshot,
    #[serde(with = "crate::balance::system_serde")]
    pub system_after: SystemSnapshot,
    /// Conversion legs, present only for `Convert`.
    pub conversion: Option<ConversionLeg>,
    /// External reference (payout id, provider id, or chain observation tag).
    pub external_ref: Option<String>,
}

impl JournalEntry {
    /// Net quantity delta this entry induced for a currency across all
    /// user buckets and system accounts in the snapshots.
    ///
    /// Zero for every kind except `DepositCredit` (money enters) and
    /// `PayoutSettle` (money leaves).
    pub fn net_delta(&self, currency: Currency) -> Decimal {
        let user = |snapshot: &BalanceSnapshot| {
            snapshot
                .iter()
                .filter(|((_, c), _)| *c == currency)
                .map(|(_, q)| *q)
                .sum::<Decimal>()
        };
        let system = |snapshot: &SystemSnapshot| {
            snapshot
                .iter()
                .filter(|((_, c), _)| *c == currency)
                .map(|(_, q)| *q)
                .sum::<Decimal>()
        };
        (user(&self.after) + system(&self.system_after))
            - (user(&self.before) + system(&self.system_before))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::Bucket;
    use rust_decimal_macros::dec;

    #[test]
    fn kind_names_roundtrip() {
        let kinds = [
            JournalKind::DepositCredit,
            JournalKind::Convert,
            JournalKind::BetDebit,
            JournalKind::BetWinCredit,
            JournalKind::BetLossToSavings,
            JournalKind::SavingsPromote,
            JournalKind::PayoutReserve,
            JournalKind::PayoutSettle,
            JournalKind::PayoutRefund,
        ];
        for kind in kinds {
            assert_eq!(JournalKind::from_name(kind.name()), Some(kind));
        }
    }

    #[test]
    fn net_delta_sums_touched_buckets() {
        let mut before = BalanceSnapshot::new();
        before.insert((Bucket::Deposit, Currency::Usdc), dec!(100));
        before.insert((Bucket::Savings, Currency::Usdc), dec!(0));
        let mut after = BalanceSnapshot::new();
        after.insert((Bucket::Deposit, Currency::Usdc), dec!(90));
        after.insert((Bucket::Savings, Currency::Usdc), dec!(10));

        let entry = JournalEntry {
            seq: 1,
            timestamp_ms: 0,
            actor: "u1".into(),
            kind: JournalKind::BetLossToSavings,
            before,
            after,
            system_before: SystemSnapshot::new(),
            system_after: SystemSnapshot::new(),
            conversion: None,
            external_ref: None,
        };
        assert_eq!(entry.net_delta(Currency::Usdc), Decimal::ZERO);
        assert_eq!(entry.net_delta(Currency::Doge), Decimal::ZERO);
    }

    #[test]
    fn net_delta_counts_system_counter_legs() {
        // Win: stake 10 leaves deposit, 20 lands in winnings, the house
        // counter-leg absorbs the difference.
        let mut before = BalanceSnapshot::new();
        before.insert((Bucket::Deposit, Currency::Usdc), dec!(100));
        before.insert((Bucket::Winnings, Currency::Usdc), dec!(0));
        let mut after = BalanceSnapshot::new();
        after.insert((Bucket::Deposit, Currency::Usdc), dec!(90));
        after.insert((Bucket::Winnings, Currency::Usdc), dec!(20));
        let mut system_before = SystemSnapshot::new();
        system_before.insert(("house".to_string(), Currency::Usdc), dec!(0));
        let mut system_after = SystemSnapshot::new();
        system_after.insert(("house".to_string(), Currency::Usdc), dec!(-10));

        let entry = JournalEntry {
            seq: 2,
            timestamp_ms: 0,
            actor: "u1".into(),
            kind: JournalKind::BetWinCredit,
            before,
            after,
            system_before,
            system_after,
            conversion: None,
            external_ref: None,
        };
        assert_eq!(entry.net_delta(Currency::Usdc), Decimal::ZERO);
    }

    #[test]
    fn entry_json_roundtrips() {
        let mut after = BalanceSnapshot::new();
        after.insert((Bucket::Deposit, Currency::Crt), dec!(1000));
        let entry = JournalEntry {
            seq: 7,
            timestamp_ms: 1_700_000_000_000,
            actor: "u1".into(),
            kind: JournalKind::DepositCredit,
            before: BalanceSnapshot::new(),
            after,
            system_before: SystemSnapshot::new(),
            system_after: SystemSnapshot::new(),
            conversion: None,
            external_ref: Some("obs-1".into()),
        };
        let json = serde_json::to_string(&entry).expect("serialize");
        let decoded: JournalEntry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, entry);
    }
}
