//! # Price Oracle
//!
//! USD prices for payment tokens, keyed by the oracle's token identifier (a CoinGecko
//! id such as `"weth"`). [`PriceBook`] is the cache shared by every chain pipeline:
//! per-key overwrite, short TTL, stale values served when the oracle fails.

use crate::error::SourceError;
use crate::metrics::SyncMetrics;
use crate::models::PriceCacheEntry;
use crate::settings::PriceOracleSettings;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use ethers::types::U256;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type PriceResult = Result<Option<f64>, SourceError>;

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn current_usd_price(&self, token_key: &str) -> PriceResult;

    async fn historical_usd_price(&self, token_key: &str, date: NaiveDate) -> PriceResult;
}

// CoinGecko simple/price devuelve { "<id>": { "usd": price } }
type CoinGeckoPriceResponse = HashMap<String, CoinGeckoTokenPrice>;

#[derive(Debug, Deserialize)]
struct CoinGeckoTokenPrice {
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoHistoryResponse {
    market_data: Option<CoinGeckoMarketData>,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoMarketData {
    current_price: HashMap<String, f64>,
}

/// Prices outside this band are treated as bad data.
fn is_sane_price(price: f64) -> bool {
    price.is_finite() && price > 0.0 && price <= 10_000_000.0
}

/// CoinGecko REST client.
pub struct CoinGeckoOracle {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl CoinGeckoOracle {
    pub fn new(settings: &PriceOracleSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            client,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-pro-api-key", key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(SourceError::RateLimited);
        }
        if status.as_u16() == 404 {
            return Err(SourceError::Malformed(format!("unknown resource: {}", url)));
        }
        if !status.is_success() {
            return Err(SourceError::Transport(format!("HTTP error: {}", status)));
        }
        Ok(response)
    }
}

#[async_trait]
impl PriceOracle for CoinGeckoOracle {
    async fn current_usd_price(&self, token_key: &str) -> PriceResult {
        let url = format!("{}/simple/price?ids={}&vs_currencies=usd", self.base_url, token_key);
        let data: CoinGeckoPriceResponse = self.get(&url).await?.json().await?;
        let price = data.get(token_key).and_then(|p| p.usd);
        match price {
            Some(p) if is_sane_price(p) => Ok(Some(p)),
            Some(p) => {
                warn!("CoinGecko: Invalid price for {}: ${:.4}", token_key, p);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn historical_usd_price(&self, token_key: &str, date: NaiveDate) -> PriceResult {
        let url = format!(
            "{}/coins/{}/history?date={}&localization=false",
            self.base_url,
            token_key,
            date.format("%d-%m-%Y")
        );
        let data: CoinGeckoHistoryResponse = self.get(&url).await?.json().await?;
        Ok(data
            .market_data
            .and_then(|m| m.current_price.get("usd").copied())
            .filter(|p| is_sane_price(*p)))
    }
}

/// Convert a raw token amount to USD.
pub fn usd_value(amount: U256, decimals: u8, usd_price: f64) -> f64 {
    let units = ethers::utils::format_units(amount, decimals as u32)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    units * usd_price
}

/// TTL'd price cache shared by all chains.
pub struct PriceBook {
    oracle: Arc<dyn PriceOracle>,
    current: DashMap<String, PriceCacheEntry>,
    historical: DashMap<(String, NaiveDate), f64>,
    ttl: Duration,
    metrics: Arc<SyncMetrics>,
}

impl PriceBook {
    pub fn new(oracle: Arc<dyn PriceOracle>, ttl: Duration, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            oracle,
            current: DashMap::new(),
            historical: DashMap::new(),
            ttl,
            metrics,
        }
    }

    pub fn get(&self, token_key: &str) -> Option<PriceCacheEntry> {
        self.current.get(token_key).map(|e| *e.value())
    }

    /// Historical price already known for `date`, without asking the oracle.
    pub fn cached_historical(&self, token_key: &str, date: NaiveDate) -> Option<f64> {
        self.historical.get(&(token_key.to_string(), date)).map(|p| *p)
    }

    fn is_fresh(&self, entry: &PriceCacheEntry) -> bool {
        Utc::now()
            .signed_duration_since(entry.updated_at)
            .to_std()
            .map(|age| age <= self.ttl)
            .unwrap_or(true)
    }

    /// Cached price if fresh, otherwise a refresh; falls back to the stale value.
    pub async fn usd_price(&self, token_key: &str) -> Option<f64> {
        if let Some(entry) = self.get(token_key) {
            if self.is_fresh(&entry) {
                return Some(entry.usd);
            }
        }
        self.refresh(token_key).await
    }

    /// Fetch the current price and overwrite the entry. Returns the stale value on failure.
    pub async fn refresh(&self, token_key: &str) -> Option<f64> {
        self.metrics.record_fetch("price");
        match self.oracle.current_usd_price(token_key).await {
            Ok(Some(usd)) => {
                self.current
                    .insert(token_key.to_string(), PriceCacheEntry { usd, updated_at: Utc::now() });
                debug!("price {} = ${:.4}", token_key, usd);
                Some(usd)
            }
            Ok(None) => {
                self.metrics.record_not_found("price");
                self.get(token_key).map(|e| e.usd)
            }
            Err(e) => {
                warn!("price refresh for {} failed: {}", token_key, e);
                self.metrics.record_source_error("price", &e);
                self.get(token_key).map(|e| e.usd)
            }
        }
    }

    /// Price on `date`. Successful lookups are cached forever.
    pub async fn historical_usd_price(&self, token_key: &str, date: NaiveDate) -> Option<f64> {
        if let Some(p) = self.cached_historical(token_key, date) {
            return Some(p);
        }
        self.metrics.record_fetch("historical_price");
        match self.oracle.historical_usd_price(token_key, date).await {
            Ok(Some(usd)) => {
                self.historical.insert((token_key.to_string(), date), usd);
                Some(usd)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("historical price for {} on {} failed: {}", token_key, date, e);
                self.metrics.record_source_error("historical_price", &e);
                None
            }
        }
    }
}
