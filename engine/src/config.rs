//! Engine configuration.
//!
//! Everything an operator can tune lives here; credentials are read from the
//! environment by the binary and never appear on the command line.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::time::Duration;
use tigerbank_types::Chain;

/// Which buckets a bet stake may draw from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BetSourcePolicy {
    /// Stakes come from `deposit` only.
    DepositOnly,
    /// Drain `deposit` first, then `winnings`.
    DepositThenWinnings,
}

impl std::str::FromStr for BetSourcePolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "deposit_only" => Ok(BetSourcePolicy::DepositOnly),
            "deposit_then_winnings" => Ok(BetSourcePolicy::DepositThenWinnings),
            other => anyhow::bail!("unknown bet source policy: {other}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Oracle cache freshness per USD spot price.
    pub rate_ttl: Duration,
    /// How many TTLs of staleness are acceptable before `RateUnavailable`.
    pub rate_stale_grace_multiplier: u32,
    /// Chain confirmations required before a deposit observation credits.
    pub deposit_min_confirmations: u32,
    /// Minimum gap between deposit credits for one (user, currency).
    pub deposit_credit_cooldown: Duration,
    pub bet_source_policy: BetSourcePolicy,
    /// The fraction of each conversion output booked to the system
    /// liquidity ledger (house-funded). Zero disables.
    pub conversion_liquidity_fraction: Decimal,
    /// Transport-error retry count for payout submission.
    pub payout_submit_retries: u32,

    pub rate_feed_base_url: String,
    pub rate_feed_api_key: String,
    pub rate_feed_timeout: Duration,

    pub solana_rpc_url: String,
    pub doge_explorer_url: String,
    pub tron_explorer_url: String,
    pub chain_probe_timeout: Duration,

    pub payout_processor_base_url: String,
    pub payout_processor_api_key: String,
    pub ipn_secret: String,
    pub payout_submit_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_ttl: Duration::from_secs(60),
            rate_stale_grace_multiplier: 10,
            deposit_min_confirmations: 1,
            deposit_credit_cooldown: Duration::from_secs(60),
            bet_source_policy: BetSourcePolicy::DepositOnly,
            conversion_liquidity_fraction: Decimal::new(1, 1),
            payout_submit_retries: 3,
            rate_feed_base_url: "https://api.rates.example/v1".to_string(),
            rate_feed_api_key: String::new(),
            rate_feed_timeout: Duration::from_secs(5),
            solana_rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            doge_explorer_url: "https://dogechain.info/api/v1".to_string(),
            tron_explorer_url: "https://api.trongrid.io".to_string(),
            chain_probe_timeout: Duration::from_secs(10),
            payout_processor_base_url: "https://api.nowpayments.io/v1".to_string(),
            payout_processor_api_key: String::new(),
            ipn_secret: String::new(),
            payout_submit_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Hard cutoff after which stale prices are no longer served.
    pub fn rate_stale_cutoff(&self) -> Duration {
        self.rate_ttl * self.rate_stale_grace_multiplier
    }

    /// Minimum confirmations for a chain; currently uniform across chains.
    pub fn min_confirmations(&self, _chain: Chain) -> u32 {
        self.deposit_min_confirmations
    }

    pub fn validate(&self) -> Result<()> {
        if self.conversion_liquidity_fraction < Decimal::ZERO
            || self.conversion_liquidity_fraction >= Decimal::ONE
        {
            anyhow::bail!(
                "conversion_liquidity_fraction must be in [0, 1): {}",
                self.conversion_liquidity_fraction
            );
        }
        if self.rate_stale_grace_multiplier == 0 {
            anyhow::bail!("rate_stale_grace_multiplier must be > 0");
        }
        url::Url::parse(&self.payout_processor_base_url)
            .context("invalid payout_processor_base_url")?;
        url::Url::parse(&self.rate_feed_base_url).context("invalid rate_feed_base_url")?;
        Ok(())
    }
}

/// Read a required credential from the environment.
pub fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().expect("valid");
    }

    #[test]
    fn liquidity_fraction_bounds_enforced() {
        let mut config = EngineConfig::default();
        config.conversion_liquidity_fraction = dec!(1);
        assert!(config.validate().is_err());
        config.conversion_liquidity_fraction = dec!(-0.1);
        assert!(config.validate().is_err());
        config.conversion_liquidity_fraction = Decimal::ZERO;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bet_source_policy_parses() {
        assert_eq!(
            "deposit_only".parse::<BetSourcePolicy>().unwrap(),
            BetSourcePolicy::DepositOnly
        );
        assert_eq!(
            "deposit_then_winnings".parse::<BetSourcePolicy>().unwrap(),
            BetSourcePolicy::DepositThenWinnings
        );
        assert!("winnings_first".parse::<BetSourcePolicy>().is_err());
    }

    #[test]
    fn stale_cutoff_is_ttl_times_grace() {
        let config = EngineConfig::default();
        assert_eq!(config.rate_stale_cutoff(), Duration::from_secs(600));
    }
}
