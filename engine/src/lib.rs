//! Custodial multi-currency wallet and settlement engine.
//!
//! The [`Engine`] facade wires the ledger store, rate oracle, chain probes,
//! reconciler, conversion engine, bet settler, and payout router behind the
//! operations the transport layer exposes.

pub mod config;
pub mod convert;
pub mod oracle;
pub mod payout;
pub mod probe;
pub mod reconcile;
pub mod settle;
pub mod store;

use config::EngineConfig;
use convert::ConversionEngine;
use oracle::{PriceFeed, RateOracle};
use payout::{PayoutProcessor, PayoutRouter};
use probe::{ChainProbe, ChainSource};
use reconcile::Reconciler;
use rust_decimal::Decimal;
use settle::{BetOutcome, BetSettler};
use std::collections::BTreeMap;
use std::sync::Arc;
use store::{LedgerStore, SYSTEM_LIQUIDITY};
use tigerbank_types::{
    Bucket, Chain, ConvertReceipt, Currency, DepositCredit, JournalEntry, PayoutStatus,
    PromoteReceipt, Result, SettleReceipt, WalletView, WithdrawReceipt,
};
use uuid::Uuid;

/// Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// The wallet engine: one instance per process, shared across request
/// handlers.
pub struct Engine<F: PriceFeed, C: ChainSource, P: PayoutProcessor> {
    store: Arc<LedgerStore>,
    reconciler: Reconciler<C>,
    converter: ConversionEngine<F>,
    settler: BetSettler,
    router: PayoutRouter<P>,
}

impl<F: PriceFeed, C: ChainSource, P: PayoutProcessor> Engine<F, C, P> {
    pub fn new(
        store: Arc<LedgerStore>,
        feed: F,
        chain_source: C,
        processor: P,
        config: &EngineConfig,
    ) -> Self {
        let oracle = Arc::new(RateOracle::new(feed, config));
        let probe = Arc::new(ChainProbe::new(chain_source, config));
        Self {
            reconciler: Reconciler::new(
                Arc::clone(&store),
                probe,
                config.deposit_credit_cooldown,
            ),
            converter: ConversionEngine::new(
                Arc::clone(&store),
                oracle,
                config.conversion_liquidity_fraction,
            ),
            settler: BetSettler::new(Arc::clone(&store), config.bet_source_policy),
            router: PayoutRouter::new(
                Arc::clone(&store),
                processor,
                config.payout_submit_retries,
                config.ipn_secret.clone(),
            ),
            store,
        }
    }

    /// Register the deposit address probed for a user on one chain.
    pub async fn bind_address(&self, user: &str, chain: Chain, address: &str) -> Result<()> {
        if !chain.validate_address(address) {
            return Err(tigerbank_types::EngineError::validation(format!(
                "address {address:?} is not a valid {chain} address"
            )));
        }
        self.store.bind_address(user, chain, address).await
    }

    pub async fn view_wallet(&self, user: &str) -> Result<WalletView> {
        self.reconciler.wallet_view(user).await
    }

    pub async fn credit_deposit(&self, user: &str, currency: Currency) -> Result<DepositCredit> {
        self.reconciler.credit_deposit(user, currency).await
    }

    pub async fn convert(
        &self,
        user: &str,
        from: Currency,
        to: Currency,
        quantity: Decimal,
    ) -> Result<ConvertReceipt> {
        self.converter.convert(user, from, to, quantity).await
    }

    pub async fn settle_bet(
        &self,
        user: &str,
        currency: Currency,
        stake: Decimal,
        outcome: BetOutcome,
        multiplier: Decimal,
    ) -> Result<SettleReceipt> {
        self.settler
            .settle(user, currency, stake, outcome, multiplier)
            .await
    }

    pub async fn promote_savings(
        &self,
        user: &str,
        currency: Currency,
        quantity: Decimal,
    ) -> Result<PromoteReceipt> {
        self.settler.promote_savings(user, currency, quantity).await
    }

    pub async fn withdraw(
        &self,
        user: &str,
        currency: Currency,
        quantity: Decimal,
        destination: &str,
        bucket: Bucket,
    ) -> Result<WithdrawReceipt> {
        self.router
            .withdraw(user, currency, quantity, destination, bucket)
            .await
    }

    pub async fn payout_status(&self, id: Uuid) -> Result<PayoutStatus> {
        self.router.payout_status(id).await
    }

    /// Verify and apply a processor webhook over the raw request body.
    pub async fn handle_payout_webhook(&self, raw_body: &[u8], signature: &str) -> Result<()> {
        self.router.handle_webhook(raw_body, signature).await
    }

    /// Startup recovery for payouts interrupted mid-flight.
    pub async fn recover_payouts(&self) -> Result<u64> {
        self.router.recover().await
    }

    /// One pass of the periodic deposit sweep over all bound addresses.
    pub async fn run_deposit_sweep(&self) -> Result<u64> {
        self.reconciler.run_sweep().await
    }

    /// Accumulated conversion liquidity contributions, per currency.
    pub async fn liquidity_pool(&self) -> Result<BTreeMap<Currency, Decimal>> {
        let mut out = BTreeMap::new();
        for currency in Currency::ALL {
            let quantity = self.store.system_balance(SYSTEM_LIQUIDITY, currency).await?;
            if quantity != Decimal::ZERO {
                out.insert(currency, quantity);
            }
        }
        Ok(out)
    }

    /// The user's journal, in sequence order.
    pub async fn journal(&self, user: &str) -> Result<Vec<JournalEntry>> {
        self.store.journal_for(user).await
    }
}
