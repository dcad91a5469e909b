//! Conversion engine: swaps between deposit-bucket balances at oracle rates.
//!
//! The rate is quoted before the ledger transaction opens; the transaction
//! itself is pure arithmetic and never waits on the network. Output is
//! quantized down to the target currency's scale, and a house-funded
//! fraction of each output is booked to the liquidity pool.

use crate::oracle::{PriceFeed, RateOracle};
use crate::store::{LedgerStore, SYSTEM_HOUSE, SYSTEM_LIQUIDITY};
use rust_decimal::Decimal;
use std::sync::Arc;
use tigerbank_types::{
    quantize_down, Bucket, ConversionLeg, ConvertReceipt, Currency, EngineError, JournalKind,
    Result,
};
use tracing::info;

pub struct ConversionEngine<F: PriceFeed> {
    store: Arc<LedgerStore>,
    oracle: Arc<RateOracle<F>>,
    liquidity_fraction: Decimal,
}

impl<F: PriceFeed> ConversionEngine<F> {
    pub fn new(
        store: Arc<LedgerStore>,
        oracle: Arc<RateOracle<F>>,
        liquidity_fraction: Decimal,
    ) -> Self {
        Self {
            store,
            oracle,
            liquidity_fraction,
        }
    }

    /// Convert `quantity` of `from` into `to` within the user's deposit
    /// bucket. Fails without side effects when the amount is non-positive,
    /// the currencies are equal, the output rounds to zero at the target
    /// scale, or the balance is insufficient.
    pub async fn convert(
        &self,
        user: &str,
        from: Currency,
        to: Currency,
        quantity: Decimal,
    ) -> Result<ConvertReceipt> {
        if quantity <= Decimal::ZERO {
            return Err(EngineError::validation(format!(
                "conversion quantity must be positive, got {quantity}"
            )));
        }
        if from == to {
            return Err(EngineError::validation(format!(
                "cannot convert {from} to itself"
            )));
        }

        let quote = self.oracle.quote(from, to).await?;
        let quantity_out = quantize_down(quantity * quote.rate, to);
        if quantity_out < to.smallest_unit() {
            return Err(EngineError::validation(format!(
                "{quantity} {from} converts to less than one unit of {to}"
            )));
        }
        let liquidity_contribution =
            quantize_down(quantity_out * self.liquidity_fraction, to);

        let leg = ConversionLeg {
            from_currency: from,
            to_currency: to,
            quantity_in: quantity,
            quantity_out,
            rate: quote.rate,
            rate_observed_at_ms: quote.observed_at_ms,
            liquidity_contribution,
        };

        let seq = self
            .store
            .transaction(user, |tx| {
                tx.debit(Bucket::Deposit, from, quantity)?;
                tx.credit(Bucket::Deposit, to, quantity_out)?;
                // The house is the counter-party: it absorbs the converted-away
                // currency and funds the credited one, so the entry nets to
                // zero per currency.
                tx.system_adjust(SYSTEM_HOUSE, from, quantity)?;
                tx.system_adjust(SYSTEM_HOUSE, to, -quantity_out)?;
                if liquidity_contribution > Decimal::ZERO {
                    // The house funds the liquidity pool contribution; the
                    // user receives the full quoted output.
                    tx.system_adjust(SYSTEM_HOUSE, to, -liquidity_contribution)?;
                    tx.system_credit(SYSTEM_LIQUIDITY, to, liquidity_contribution)?;
                }
                tx.append_journal(JournalKind::Convert, Some(&leg), None)
            })
            .await?;

        info!(
            user,
            %from,
            %to,
            quantity_in = %quantity,
            quantity_out = %quantity_out,
            rate = %quote.rate,
            stale = quote.stale,
            "conversion committed"
        );

        Ok(ConvertReceipt {
            from_currency: from,
            to_currency: to,
            quantity_in: quantity,
            quantity_out,
            rate: quote.rate,
            rate_observed_at_ms: quote.observed_at_ms,
            journal_seq: seq,
        })
    }
}
