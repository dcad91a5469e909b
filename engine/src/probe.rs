//! Chain probes: confirmed and unconfirmed balances of external addresses.
//!
//! Each home chain has exactly one probe strategy. Addresses are validated
//! against the chain format before any network call. Probes never retry;
//! retry and fallback policy belongs to the reconciler so a single probe
//! has unambiguous latency.

use crate::config::EngineConfig;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tigerbank_types::{Chain, ChainObservation, Currency, EngineError, Result};

/// Raw balance reading in the chain's smallest units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawBalance {
    pub confirmed_units: u128,
    pub unconfirmed_units: u128,
}

/// One balance lookup per supported chain. Implementations perform a single
/// upstream request with the configured deadline and no retries.
pub trait ChainSource: Send + Sync {
    fn fetch(
        &self,
        currency: Currency,
        address: &str,
        min_confirmations: u32,
    ) -> impl Future<Output = anyhow::Result<RawBalance>> + Send;

    /// Explorer tag recorded on observations from this source.
    fn source_tag(&self, chain: Chain) -> String;
}

pub struct ChainProbe<C: ChainSource> {
    source: C,
    min_confirmations: u32,
}

impl<C: ChainSource> ChainProbe<C> {
    pub fn new(source: C, config: &EngineConfig) -> Self {
        Self {
            source,
            min_confirmations: config.deposit_min_confirmations,
        }
    }

    /// Balance of `address` in `currency`, normalized to the currency's
    /// decimal scale.
    pub async fn balance(&self, address: &str, currency: Currency) -> Result<ChainObservation> {
        let chain = currency.home_chain();
        if !chain.validate_address(address) {
            return Err(EngineError::validation(format!(
                "address {address:?} is not a valid {chain} address"
            )));
        }

        let raw = self
            .source
            .fetch(currency, address, self.min_confirmations)
            .await
            .map_err(|err| EngineError::upstream(format!("{chain} probe: {err}")))?;

        Ok(ChainObservation {
            address: address.to_string(),
            currency,
            confirmed: normalize(raw.confirmed_units, currency)?,
            unconfirmed: normalize(raw.unconfirmed_units, currency)?,
            source: self.source.source_tag(chain),
            observed_at_ms: crate::now_ms(),
        })
    }
}

/// Divide smallest units by the currency's scale. Explorer readings beyond
/// `Decimal`'s 96-bit mantissa are corrupt, not balances.
fn normalize(units: u128, currency: Currency) -> Result<Decimal> {
    let signed = i128::try_from(units)
        .map_err(|_| EngineError::upstream(format!("balance {units} exceeds decimal range")))?;
    Decimal::try_from_i128_with_scale(signed, currency.decimals())
        .map_err(|err| EngineError::upstream(format!("balance {units} out of range: {err}")))
}

/// HTTP probe strategies: Solana native RPC for CRT/SOL, public explorers
/// for DOGE and TRX.
pub struct HttpChainSource {
    client: reqwest::Client,
    solana_rpc_url: String,
    doge_explorer_url: String,
    tron_explorer_url: String,
    timeout: Duration,
}

impl HttpChainSource {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            solana_rpc_url: config.solana_rpc_url.clone(),
            doge_explorer_url: config.doge_explorer_url.trim_end_matches('/').to_string(),
            tron_explorer_url: config.tron_explorer_url.trim_end_matches('/').to_string(),
            timeout: config.chain_probe_timeout,
        }
    }

    async fn fetch_solana(&self, address: &str) -> anyhow::Result<RawBalance> {
        use anyhow::Context;

        #[derive(Deserialize)]
        struct RpcResponse {
            result: RpcResult,
        }
        #[derive(Deserialize)]
        struct RpcResult {
            value: u64,
        }

        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getBalance",
            "params": [address, {"commitment": "finalized"}],
        });
        let response: RpcResponse = self
            .client
            .post(&self.solana_rpc_url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .context("solana rpc request")?
            .error_for_status()
            .context("solana rpc status")?
            .json()
            .await
            .context("solana rpc response")?;
        Ok(RawBalance {
            confirmed_units: response.result.value as u128,
            unconfirmed_units: 0,
        })
    }

    async fn fetch_doge(&self, address: &str, min_confirmations: u32) -> anyhow::Result<RawBalance> {
        use anyhow::Context;

        #[derive(Deserialize)]
        struct DogeResponse {
            confirmed_balance: u128,
            unconfirmed_balance: u128,
        }

        let url = format!(
            "{}/address/balance/{address}?confirmations={min_confirmations}",
            self.doge_explorer_url
        );
        let response: DogeResponse = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .context("doge explorer request")?
            .error_for_status()
            .context("doge explorer status")?
            .json()
            .await
            .context("doge explorer response")?;
        Ok(RawBalance {
            confirmed_units: response.confirmed_balance,
            unconfirmed_units: response.unconfirmed_balance,
        })
    }

    async fn fetch_tron(&self, currency: Currency, address: &str) -> anyhow::Result<RawBalance> {
        use anyhow::Context;

        #[derive(Deserialize)]
        struct TronAccount {
            #[serde(default)]
            balance: u128,
            #[serde(default)]
            trc20: Vec<std::collections::HashMap<String, String>>,
        }
        #[derive(Deserialize)]
        struct TronResponse {
            data: Vec<TronAccount>,
        }

        let url = format!("{}/v1/accounts/{address}", self.tron_explorer_url);
        let response: TronResponse = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .context("tron explorer request")?
            .error_for_status()
            .context("tron explorer status")?
            .json()
            .await
            .context("tron explorer response")?;
        let account = response
            .data
            .into_iter()
            .next()
            .context("tron account not found")?;

        let confirmed_units = match currency {
            Currency::Trx => account.balance,
            // USDC rides Tron as a TRC-20 token; the explorer keys token
            // balances by contract address.
            Currency::Usdc => account
                .trc20
                .iter()
                .flat_map(|entry| entry.values())
                .next()
                .map(|value| value.parse::<u128>())
                .transpose()
                .context("tron trc20 balance parse")?
                .unwrap_or(0),
            other => anyhow::bail!("currency {other} is not on tron"),
        };
        Ok(RawBalance {
            confirmed_units,
            unconfirmed_units: 0,
        })
    }
}

impl ChainSource for HttpChainSource {
    async fn fetch(
        &self,
        currency: Currency,
        address: &str,
        min_confirmations: u32,
    ) -> anyhow::Result<RawBalance> {
        match currency.home_chain() {
            Chain::Solana => self.fetch_solana(address).await,
            Chain::Dogecoin => self.fetch_doge(address, min_confirmations).await,
            Chain::Tron => self.fetch_tron(currency, address).await,
        }
    }

    fn source_tag(&self, chain: Chain) -> String {
        match chain {
            Chain::Solana => self.solana_rpc_url.clone(),
            Chain::Dogecoin => self.doge_explorer_url.clone(),
            Chain::Tron => self.tron_explorer_url.clone(),
        }
    }
}
