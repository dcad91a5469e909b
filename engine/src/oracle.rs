//! Rate oracle: cached USD spot prices and symmetric conversion quotes.
//!
//! Prices refresh lazily with a TTL. Concurrent readers that miss the cache
//! coalesce onto one in-flight refresh per symbol. On refresh failure,
//! prices within the stale grace window are served flagged `stale`; beyond
//! the cutoff the quote fails.

use crate::config::EngineConfig;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tigerbank_types::{Currency, EngineError, RateQuote, Result};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Source of USD spot prices, one per supported symbol.
pub trait PriceFeed: Send + Sync {
    fn usd_price(
        &self,
        currency: Currency,
    ) -> impl Future<Output = anyhow::Result<Decimal>> + Send;

    fn source_tag(&self) -> &str;
}

#[derive(Clone, Copy)]
struct PriceCell {
    price: Decimal,
    fetched_at: Instant,
    fetched_at_ms: u64,
}

pub struct RateOracle<F: PriceFeed> {
    feed: F,
    ttl: Duration,
    stale_cutoff: Duration,
    cache: Mutex<HashMap<Currency, PriceCell>>,
    /// One refresh lock per symbol; waiters on a miss queue here instead of
    /// issuing duplicate upstream requests.
    refresh: Mutex<HashMap<Currency, Arc<Mutex<()>>>>,
}

impl<F: PriceFeed> RateOracle<F> {
    pub fn new(feed: F, config: &EngineConfig) -> Self {
        Self {
            feed,
            ttl: config.rate_ttl,
            stale_cutoff: config.rate_stale_cutoff(),
            cache: Mutex::new(HashMap::new()),
            refresh: Mutex::new(HashMap::new()),
        }
    }

    /// Conversion rate from `from` to `to`: `USD(from) / USD(to)`.
    ///
    /// Self-rates are exactly 1. The quote is stale when either underlying
    /// price was served past TTL.
    pub async fn quote(&self, from: Currency, to: Currency) -> Result<RateQuote> {
        if from == to {
            return Ok(RateQuote {
                base: from,
                quote: to,
                rate: Decimal::ONE,
                observed_at_ms: crate::now_ms(),
                stale: false,
                source: "self".to_string(),
            });
        }

        let (from_price, from_stale, from_at) = self.usd(from).await?;
        let (to_price, to_stale, to_at) = self.usd(to).await?;
        if to_price <= Decimal::ZERO || from_price <= Decimal::ZERO {
            return Err(EngineError::RateUnavailable { from, to });
        }
        let rate = from_price / to_price;
        Ok(RateQuote {
            base: from,
            quote: to,
            rate,
            observed_at_ms: from_at.min(to_at),
            stale: from_stale || to_stale,
            source: self.feed.source_tag().to_string(),
        })
    }

    /// USD price for one symbol: (price, stale, observed_at_ms).
    async fn usd(&self, currency: Currency) -> Result<(Decimal, bool, u64)> {
        // Stable-pegged currencies are hard-pinned.
        if currency.is_stable() {
            return Ok((Decimal::ONE, false, crate::now_ms()));
        }

        if let Some(cell) = self.fresh_cell(currency).await {
            return Ok((cell.price, false, cell.fetched_at_ms));
        }

        // Single-flight: whoever holds the refresh lock fetches; the rest
        // re-check the cache once the lock frees.
        let lock = {
            let mut refresh = self.refresh.lock().await;
            refresh
                .entry(currency)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(cell) = self.fresh_cell(currency).await {
            return Ok((cell.price, false, cell.fetched_at_ms));
        }

        match self.feed.usd_price(currency).await {
            Ok(price) if price > Decimal::ZERO => {
                let cell = PriceCell {
                    price,
                    fetched_at: Instant::now(),
                    fetched_at_ms: crate::now_ms(),
                };
                self.cache.lock().await.insert(currency, cell);
                debug!(currency = %currency, price = %price, "price refreshed");
                Ok((price, false, cell.fetched_at_ms))
            }
            Ok(price) => {
                warn!(currency = %currency, price = %price, "feed returned non-positive price");
                self.stale_fallback(currency).await
            }
            Err(err) => {
                warn!(currency = %currency, error = %err, "price refresh failed");
                self.stale_fallback(currency).await
            }
        }
    }

    async fn fresh_cell(&self, currency: Currency) -> Option<PriceCell> {
        let cache = self.cache.lock().await;
        cache
            .get(&currency)
            .filter(|cell| cell.fetched_at.elapsed() <= self.ttl)
            .copied()
    }

    /// Serve a stale price if within the grace cutoff; otherwise fail.
    async fn stale_fallback(&self, currency: Currency) -> Result<(Decimal, bool, u64)> {
        let cache = self.cache.lock().await;
        match cache.get(&currency) {
            Some(cell) if cell.fetched_at.elapsed() <= self.stale_cutoff => {
                Ok((cell.price, true, cell.fetched_at_ms))
            }
            _ => Err(EngineError::RateUnavailable {
                from: currency,
                to: currency,
            }),
        }
    }
}

/// HTTP price feed: JSON API exposing `price_usd` per symbol, authenticated
/// by API key header.
pub struct HttpPriceFeed {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct PriceResponse {
    price_usd: Decimal,
}

impl HttpPriceFeed {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.rate_feed_base_url.trim_end_matches('/').to_string(),
            api_key: config.rate_feed_api_key.clone(),
            timeout: config.rate_feed_timeout,
        }
    }
}

impl PriceFeed for HttpPriceFeed {
    async fn usd_price(&self, currency: Currency) -> anyhow::Result<Decimal> {
        use anyhow::Context;

        let url = format!("{}/price/{}", self.base_url, currency.symbol());
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .with_context(|| format!("fetch price for {currency}"))?;
        if !response.status().is_success() {
            anyhow::bail!("price feed returned HTTP {}", response.status());
        }
        let parsed: PriceResponse = response
            .json()
            .await
            .with_context(|| format!("parse price response for {currency}"))?;
        Ok(parsed.price_usd)
    }

    fn source_tag(&self) -> &str {
        &self.base_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticFeed {
        prices: HashMap<Currency, Decimal>,
        calls: AtomicU32,
        fail: std::sync::atomic::AtomicBool,
    }

    impl StaticFeed {
        fn new(prices: &[(Currency, Decimal)]) -> Self {
            Self {
                prices: prices.iter().copied().collect(),
                calls: AtomicU32::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    impl PriceFeed for &StaticFeed {
        async fn usd_price(&self, currency: Currency) -> anyhow::Result<Decimal> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("feed down");
            }
            self.prices
                .get(&currency)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no price for {currency}"))
        }

        fn source_tag(&self) -> &str {
            "static"
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[tokio::test]
    async fn quote_divides_usd_prices() {
        let feed = StaticFeed::new(&[
            (Currency::Crt, dec!(0.15)),
            (Currency::Doge, dec!(0.24)),
        ]);
        let oracle = RateOracle::new(&feed, &config());

        // CRT -> USDC uses the hard peg on the stable side.
        let quote = oracle.quote(Currency::Crt, Currency::Usdc).await.expect("quote");
        assert_eq!(quote.rate, dec!(0.15));
        assert!(!quote.stale);

        let quote = oracle.quote(Currency::Crt, Currency::Doge).await.expect("quote");
        assert_eq!(quote.rate, dec!(0.15) / dec!(0.24));
    }

    #[tokio::test]
    async fn self_rate_is_exactly_one() {
        let feed = StaticFeed::new(&[]);
        let oracle = RateOracle::new(&feed, &config());
        let quote = oracle.quote(Currency::Trx, Currency::Trx).await.expect("quote");
        assert_eq!(quote.rate, Decimal::ONE);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        let feed = StaticFeed::new(&[(Currency::Sol, dec!(150))]);
        let oracle = RateOracle::new(&feed, &config());
        oracle.quote(Currency::Sol, Currency::Usdc).await.expect("first");
        oracle.quote(Currency::Sol, Currency::Usdc).await.expect("second");
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_grace_serves_flagged_then_cutoff_fails() {
        let feed = StaticFeed::new(&[(Currency::Doge, dec!(0.24))]);
        let mut config = config();
        config.rate_ttl = Duration::from_millis(1);
        config.rate_stale_grace_multiplier = 1_000_000;
        let oracle = RateOracle::new(&feed, &config);

        oracle.quote(Currency::Doge, Currency::Usdc).await.expect("prime");
        feed.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The cached price is past TTL, the refresh fails, and the failure
        // path falls back to the stale value within grace.
        let quote = oracle
            .quote(Currency::Doge, Currency::Usdc)
            .await
            .expect("stale quote");
        assert!(quote.stale);
        assert_eq!(quote.rate, dec!(0.24));
    }

    #[tokio::test]
    async fn beyond_cutoff_fails_rate_unavailable() {
        let feed = StaticFeed::new(&[]);
        let oracle = RateOracle::new(&feed, &config());
        feed.fail.store(true, Ordering::SeqCst);
        let err = oracle
            .quote(Currency::Doge, Currency::Usdc)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateUnavailable { .. }));
    }

    #[tokio::test]
    async fn unknown_symbol_fails() {
        let feed = StaticFeed::new(&[]);
        let oracle = RateOracle::new(&feed, &config());
        let err = oracle
            .quote(Currency::Crt, Currency::Doge)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RateUnavailable { .. }));
    }
}
