//! Bet settler: applies pre-decided game outcomes to the ledger.
//!
//! Outcomes arrive already decided; settlement only moves money. A win is
//! funded by the house counter-party account, a loss routes the stake into
//! the savings bucket rather than to the house.

use crate::config::BetSourcePolicy;
use crate::store::{LedgerStore, SYSTEM_HOUSE};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tigerbank_types::{
    quantize_down, Bucket, Currency, EngineError, JournalKind, Result, SettleReceipt,
};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetOutcome {
    Win,
    Loss,
}

pub struct BetSettler {
    store: Arc<LedgerStore>,
    source_policy: BetSourcePolicy,
}

impl BetSettler {
    pub fn new(store: Arc<LedgerStore>, source_policy: BetSourcePolicy) -> Self {
        Self {
            store,
            source_policy,
        }
    }

    /// Settle one bet: debit the stake, then credit winnings (win) or
    /// savings (loss). `multiplier` applies to wins only.
    pub async fn settle(
        &self,
        user: &str,
        currency: Currency,
        stake: Decimal,
        outcome: BetOutcome,
        multiplier: Decimal,
    ) -> Result<SettleReceipt> {
        if stake <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "stake must be positive, got {stake}"
            )));
        }
        if outcome == BetOutcome::Win && multiplier <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "payout multiplier must be positive, got {multiplier}"
            )));
        }

        let policy = self.source_policy;
        let receipt = self
            .store
            .transaction(user, move |tx| {
                let mut deltas: BTreeMap<Bucket, Decimal> = BTreeMap::new();

                // Stake debit, split across buckets per policy.
                match policy {
                    BetSourcePolicy::DepositOnly => {
                        tx.debit(Bucket::Deposit, currency, stake)?;
                        deltas.insert(Bucket::Deposit, -stake);
                    }
                    BetSourcePolicy::DepositThenWinnings => {
                        let deposit = tx.balance(Bucket::Deposit, currency)?;
                        let from_deposit = deposit.min(stake);
                        let from_winnings = stake - from_deposit;
                        if from_deposit > Decimal::ZERO {
                            tx.debit(Bucket::Deposit, currency, from_deposit)?;
                            deltas.insert(Bucket::Deposit, -from_deposit);
                        }
                        if from_winnings > Decimal::ZERO {
                            tx.debit(Bucket::Winnings, currency, from_winnings)?;
                            deltas.insert(Bucket::Winnings, -from_winnings);
                        }
                    }
                }

                let kind = match outcome {
                    BetOutcome::Win => {
                        let win = quantize_down(stake * multiplier, currency);
                        tx.credit(Bucket::Winnings, currency, win)?;
                        *deltas.entry(Bucket::Winnings).or_default() += win;
                        // The house keeps the stake and funds the win; the
                        // counter-leg balances the entry.
                        tx.system_adjust(SYSTEM_HOUSE, currency, stake - win)?;
                        JournalKind::BetWinCredit
                    }
                    BetOutcome::Loss => {
                        tx.credit(Bucket::Savings, currency, stake)?;
                        *deltas.entry(Bucket::Savings).or_default() += stake;
                        JournalKind::BetLossToSavings
                    }
                };

                let seq = tx.append_journal(kind, None, None)?;
                Ok(SettleReceipt {
                    currency,
                    deltas,
                    journal_seq: seq,
                })
            })
            .await?;

        info!(
            user,
            %currency,
            %stake,
            outcome = ?outcome,
            seq = receipt.journal_seq,
            "bet settled"
        );
        Ok(receipt)
    }

    /// Move savings back into the deposit bucket so it becomes bettable.
    pub async fn promote_savings(
        &self,
        user: &str,
        currency: Currency,
        quantity: Decimal,
    ) -> Result<tigerbank_types::PromoteReceipt> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "promotion quantity must be positive, got {quantity}"
            )));
        }
        let seq = self
            .store
            .transaction(user, move |tx| {
                tx.debit(Bucket::Savings, currency, quantity)?;
                tx.credit(Bucket::Deposit, currency, quantity)?;
                tx.append_journal(JournalKind::SavingsPromote, None, None)
            })
            .await?;
        Ok(tigerbank_types::PromoteReceipt {
            currency,
            quantity,
            journal_seq: seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn seeded(policy: BetSourcePolicy) -> (Arc<LedgerStore>, BetSettler) {
        let store = Arc::new(LedgerStore::open_in_memory().expect("store"));
        store
            .transaction("alice", |tx| {
                tx.credit(Bucket::Deposit, Currency::Usdc, dec!(100))?;
                tx.append_journal(JournalKind::DepositCredit, None, None)?;
                Ok(())
            })
            .await
            .expect("seed");
        let settler = BetSettler::new(Arc::clone(&store), policy);
        (store, settler)
    }

    #[tokio::test]
    async fn loss_routes_stake_to_savings() {
        let (store, settler) = seeded(BetSourcePolicy::DepositOnly).await;
        let receipt = settler
            .settle("alice", Currency::Usdc, dec!(10), BetOutcome::Loss, Decimal::ZERO)
            .await
            .expect("settle");

        assert_eq!(receipt.deltas[&Bucket::Deposit], dec!(-10));
        assert_eq!(receipt.deltas[&Bucket::Savings], dec!(10));
        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Usdc][&Bucket::Deposit], dec!(90));
        assert_eq!(balances[&Currency::Usdc][&Bucket::Savings], dec!(10));

        // A loss nets to zero for the user; nothing reaches the house.
        let entries = store.journal_for("alice").await.expect("journal");
        assert_eq!(entries.last().unwrap().net_delta(Currency::Usdc), dec!(0));
        assert_eq!(
            store
                .system_balance(SYSTEM_HOUSE, Currency::Usdc)
                .await
                .expect("house"),
            dec!(0)
        );
    }

    #[tokio::test]
    async fn win_credits_stake_times_multiplier() {
        let (store, settler) = seeded(BetSourcePolicy::DepositOnly).await;
        let receipt = settler
            .settle("alice", Currency::Usdc, dec!(10), BetOutcome::Win, dec!(2))
            .await
            .expect("settle");

        assert_eq!(receipt.deltas[&Bucket::Deposit], dec!(-10));
        assert_eq!(receipt.deltas[&Bucket::Winnings], dec!(20));
        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Usdc][&Bucket::Deposit], dec!(90));
        assert_eq!(balances[&Currency::Usdc][&Bucket::Winnings], dec!(20));

        // The house leg mirrors the user gain, so the entry nets to zero.
        let entries = store.journal_for("alice").await.expect("journal");
        assert_eq!(entries.last().unwrap().net_delta(Currency::Usdc), dec!(0));
        assert_eq!(
            store
                .system_balance(SYSTEM_HOUSE, Currency::Usdc)
                .await
                .expect("house"),
            dec!(-10)
        );
    }

    #[tokio::test]
    async fn deposit_only_policy_never_touches_winnings() {
        let (store, settler) = seeded(BetSourcePolicy::DepositOnly).await;
        settler
            .settle("alice", Currency::Usdc, dec!(50), BetOutcome::Win, dec!(2))
            .await
            .expect("build winnings");

        // deposit = 50, winnings = 100; a 60 stake exceeds deposit alone.
        let err = settler
            .settle("alice", Currency::Usdc, dec!(60), BetOutcome::Loss, Decimal::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Usdc][&Bucket::Deposit], dec!(50));
    }

    #[tokio::test]
    async fn deposit_then_winnings_policy_drains_in_order() {
        let (store, settler) = seeded(BetSourcePolicy::DepositThenWinnings).await;
        settler
            .settle("alice", Currency::Usdc, dec!(50), BetOutcome::Win, dec!(2))
            .await
            .expect("build winnings");

        // deposit = 50, winnings = 100; stake 60 drains deposit then 10 more.
        let receipt = settler
            .settle("alice", Currency::Usdc, dec!(60), BetOutcome::Loss, Decimal::ZERO)
            .await
            .expect("settle");
        assert_eq!(receipt.deltas[&Bucket::Deposit], dec!(-50));
        assert_eq!(receipt.deltas[&Bucket::Winnings], dec!(-10));
        assert_eq!(receipt.deltas[&Bucket::Savings], dec!(60));

        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Usdc][&Bucket::Deposit], dec!(0));
        assert_eq!(balances[&Currency::Usdc][&Bucket::Winnings], dec!(90));
        assert_eq!(balances[&Currency::Usdc][&Bucket::Savings], dec!(60));
    }

    #[tokio::test]
    async fn zero_stake_is_rejected() {
        let (_store, settler) = seeded(BetSourcePolicy::DepositOnly).await;
        let err = settler
            .settle("alice", Currency::Usdc, dec!(0), BetOutcome::Loss, Decimal::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn promote_moves_savings_to_deposit() {
        let (store, settler) = seeded(BetSourcePolicy::DepositOnly).await;
        settler
            .settle("alice", Currency::Usdc, dec!(40), BetOutcome::Loss, Decimal::ZERO)
            .await
            .expect("loss");

        let receipt = settler
            .promote_savings("alice", Currency::Usdc, dec!(25))
            .await
            .expect("promote");
        assert_eq!(receipt.quantity, dec!(25));

        let balances = store.balances("alice").await.expect("balances");
        assert_eq!(balances[&Currency::Usdc][&Bucket::Deposit], dec!(85));
        assert_eq!(balances[&Currency::Usdc][&Bucket::Savings], dec!(15));

        let err = settler
            .promote_savings("alice", Currency::Usdc, dec!(100))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    }
}
