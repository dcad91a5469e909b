use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tigerbank_engine::config::{require_env, BetSourcePolicy, EngineConfig};
use tigerbank_engine::oracle::HttpPriceFeed;
use tigerbank_engine::payout::HttpPayoutProcessor;
use tigerbank_engine::probe::HttpChainSource;
use tigerbank_engine::store::LedgerStore;
use tigerbank_engine::Engine;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tigerbankd", about = "Custodial wallet and settlement engine")]
struct Args {
    /// Path to the SQLite ledger database.
    #[arg(long, default_value = "tigerbank.db")]
    ledger_path: PathBuf,

    /// Seconds between deposit sweep passes.
    #[arg(long, default_value_t = 30)]
    sweep_interval_secs: u64,

    /// Oracle price TTL in seconds.
    #[arg(long, default_value_t = 60)]
    rate_ttl_secs: u64,

    /// How many TTLs of staleness to tolerate before failing quotes.
    #[arg(long, default_value_t = 10)]
    rate_stale_grace_multiplier: u32,

    /// Chain confirmations required before a deposit credits.
    #[arg(long, default_value_t = 1)]
    deposit_min_confirmations: u32,

    /// Minimum seconds between deposit credits for one (user, currency).
    #[arg(long, default_value_t = 60)]
    deposit_credit_cooldown_secs: u64,

    /// Which buckets bet stakes may draw from.
    #[arg(long, default_value = "deposit_only")]
    bet_source_policy: BetSourcePolicy,

    /// Fraction of each conversion output booked to the liquidity pool.
    #[arg(long, default_value = "0.1")]
    conversion_liquidity_fraction: rust_decimal::Decimal,

    /// Transport-error retry count for payout submission.
    #[arg(long, default_value_t = 3)]
    payout_submit_retries: u32,

    /// Rate feed endpoint.
    #[arg(long, default_value = "https://api.rates.example/v1")]
    rate_feed_url: String,

    /// Solana JSON-RPC endpoint (CRT and SOL balances).
    #[arg(long, default_value = "https://api.mainnet-beta.solana.com")]
    solana_rpc_url: String,

    /// Dogecoin explorer endpoint.
    #[arg(long, default_value = "https://dogechain.info/api/v1")]
    doge_explorer_url: String,

    /// Tron explorer endpoint (TRX and USDC balances).
    #[arg(long, default_value = "https://api.trongrid.io")]
    tron_explorer_url: String,

    /// Payout processor endpoint.
    #[arg(long, default_value = "https://api.nowpayments.io/v1")]
    payout_processor_url: String,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let config = EngineConfig {
        rate_ttl: Duration::from_secs(args.rate_ttl_secs),
        rate_stale_grace_multiplier: args.rate_stale_grace_multiplier,
        deposit_min_confirmations: args.deposit_min_confirmations,
        deposit_credit_cooldown: Duration::from_secs(args.deposit_credit_cooldown_secs),
        bet_source_policy: args.bet_source_policy,
        conversion_liquidity_fraction: args.conversion_liquidity_fraction,
        payout_submit_retries: args.payout_submit_retries,
        rate_feed_base_url: args.rate_feed_url.clone(),
        rate_feed_api_key: require_env("TIGERBANK_RATE_FEED_API_KEY")?,
        solana_rpc_url: args.solana_rpc_url.clone(),
        doge_explorer_url: args.doge_explorer_url.clone(),
        tron_explorer_url: args.tron_explorer_url.clone(),
        payout_processor_base_url: args.payout_processor_url.clone(),
        payout_processor_api_key: require_env("TIGERBANK_PAYOUT_API_KEY")?,
        ipn_secret: require_env("TIGERBANK_IPN_SECRET")?,
        ..EngineConfig::default()
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = build_config(&args)?;
    let store = Arc::new(LedgerStore::open(&args.ledger_path).context("open ledger store")?);
    info!(path = %args.ledger_path.display(), "ledger store open");

    let engine = Engine::new(
        Arc::clone(&store),
        HttpPriceFeed::new(&config),
        HttpChainSource::new(&config),
        HttpPayoutProcessor::new(&config),
        &config,
    );

    let reconciled = engine
        .recover_payouts()
        .await
        .map_err(|err| anyhow::anyhow!("payout recovery: {err}"))?;
    info!(reconciled, "payout recovery complete");

    let mut interval = tokio::time::interval(Duration::from_secs(args.sweep_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.run_deposit_sweep().await {
            Ok(credits) if credits > 0 => info!(credits, "deposit sweep pass"),
            Ok(_) => {}
            Err(err) => error!(error = %err, "deposit sweep failed"),
        }
    }
}
