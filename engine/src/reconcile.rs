//! Reconciler: merges on-chain observations with ledger state.
//!
//! Produces the canonical wallet view and runs the deposit-credit sweep
//! that turns new confirmed on-chain funds into ledger credits.

use crate::probe::{ChainProbe, ChainSource};
use crate::store::LedgerStore;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tigerbank_types::{
    BalanceSource, Bucket, ChainObservation, Currency, CurrencyView, DepositCredit, EngineError,
    JournalKind, Result, WalletView,
};
use tracing::{debug, warn};

pub struct Reconciler<C: ChainSource> {
    store: Arc<LedgerStore>,
    probe: Arc<ChainProbe<C>>,
    credit_cooldown: Duration,
}

impl<C: ChainSource> Reconciler<C> {
    pub fn new(store: Arc<LedgerStore>, probe: Arc<ChainProbe<C>>, cooldown: Duration) -> Self {
        Self {
            store,
            probe,
            credit_cooldown: cooldown,
        }
    }

    /// The canonical per-currency balance view.
    ///
    /// Precedence per currency: chain-only when the ledger has never seen
    /// activity and an address is bound; ledger figures with the chain
    /// observation attached when activity exists; plain ledger when the
    /// probe fails. A probe failure never fails the whole view.
    pub async fn wallet_view(&self, user: &str) -> Result<WalletView> {
        let balances = self.store.balances(user).await?;
        let mut currencies = BTreeMap::new();

        for currency in Currency::ALL {
            let buckets = balances.get(&currency);
            let cell = |bucket: Bucket| {
                buckets
                    .and_then(|map| map.get(&bucket))
                    .copied()
                    .unwrap_or(Decimal::ZERO)
            };
            let has_activity = buckets.is_some();

            let observation = match self.observe(user, currency).await {
                Ok(observation) => observation,
                Err(err) => {
                    debug!(user, currency = %currency, error = %err, "probe skipped in view");
                    None
                }
            };

            let view = match (has_activity, observation) {
                (false, Some(obs)) => CurrencyView {
                    deposit: obs.confirmed,
                    winnings: Decimal::ZERO,
                    savings: Decimal::ZERO,
                    on_chain_confirmed: Some(obs.confirmed),
                    on_chain_unconfirmed: Some(obs.unconfirmed),
                    source: BalanceSource::Chain,
                },
                (true, Some(obs)) => CurrencyView {
                    deposit: cell(Bucket::Deposit),
                    winnings: cell(Bucket::Winnings),
                    savings: cell(Bucket::Savings),
                    on_chain_confirmed: Some(obs.confirmed),
                    on_chain_unconfirmed: Some(obs.unconfirmed),
                    source: BalanceSource::Hybrid,
                },
                (_, None) => CurrencyView {
                    deposit: cell(Bucket::Deposit),
                    winnings: cell(Bucket::Winnings),
                    savings: cell(Bucket::Savings),
                    on_chain_confirmed: None,
                    on_chain_unconfirmed: None,
                    source: BalanceSource::Ledger,
                },
            };
            currencies.insert(currency, view);
        }

        Ok(WalletView {
            user: user.to_string(),
            currencies,
        })
    }

    /// Probe the bound address for a currency, if any.
    async fn observe(&self, user: &str, currency: Currency) -> Result<Option<ChainObservation>> {
        let address = match self
            .store
            .bound_address(user, currency.home_chain())
            .await?
        {
            Some(address) => address,
            None => return Ok(None),
        };
        Ok(Some(self.probe.balance(&address, currency).await?))
    }

    /// Compare the confirmed on-chain balance against the credit watermark
    /// and credit the positive delta to the deposit bucket.
    ///
    /// Idempotent: an observation equal to the watermark credits zero, and
    /// a per-(user, currency) cooldown prevents re-crediting a burst of
    /// identical observations.
    pub async fn credit_deposit(&self, user: &str, currency: Currency) -> Result<DepositCredit> {
        let observation = match self.observe(user, currency).await? {
            Some(observation) => observation,
            None => {
                return Ok(DepositCredit {
                    currency,
                    credited: Decimal::ZERO,
                    journal_seq: None,
                })
            }
        };

        // Only the confirmed component is creditable; unconfirmed funds wait.
        let observed = observation.confirmed;
        let source = observation.source.clone();
        let cooldown_ms = self.credit_cooldown.as_millis() as u64;

        self.store
            .transaction(user, move |tx| {
                let (watermark, last_at) = tx.watermark(currency)?.unwrap_or((Decimal::ZERO, 0));
                let delta = observed - watermark;
                if delta <= Decimal::ZERO {
                    return Ok(DepositCredit {
                        currency,
                        credited: Decimal::ZERO,
                        journal_seq: None,
                    });
                }
                if tx.now_ms().saturating_sub(last_at) < cooldown_ms {
                    return Ok(DepositCredit {
                        currency,
                        credited: Decimal::ZERO,
                        journal_seq: None,
                    });
                }

                tx.credit(Bucket::Deposit, currency, delta)?;
                let now = tx.now_ms();
                tx.set_watermark(currency, observed, now)?;
                let seq = tx.append_journal(JournalKind::DepositCredit, None, Some(&source))?;
                Ok(DepositCredit {
                    currency,
                    credited: delta,
                    journal_seq: Some(seq),
                })
            })
            .await
    }

    /// Periodic sweep over every bound address. Probe failures are logged
    /// and skipped; the sweep itself never fails.
    pub async fn run_sweep(&self) -> Result<u64> {
        let bindings = self.store.address_bindings().await?;
        let mut credits = 0u64;
        for (user, chain, _address) in bindings {
            for currency in Currency::ALL {
                if currency.home_chain() != chain {
                    continue;
                }
                match self.credit_deposit(&user, currency).await {
                    Ok(credit) if credit.credited > Decimal::ZERO => {
                        debug!(
                            user,
                            currency = %currency,
                            credited = %credit.credited,
                            "deposit credited by sweep"
                        );
                        credits += 1;
                    }
                    Ok(_) => {}
                    Err(EngineError::Upstream(err)) => {
                        warn!(user, currency = %currency, error = %err, "sweep probe failed");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(credits)
    }
}
