use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

/// Source of the base-currency / reference-currency exchange rate
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn usd_per_base(&self) -> AppResult<Decimal>;
}

/// Response from the Coinbase exchange-rates endpoint
#[derive(Debug, Deserialize)]
struct ExchangeRatesResponse {
    data: ExchangeRatesData,
}

#[derive(Debug, Deserialize)]
struct ExchangeRatesData {
    currency: String,
    rates: HashMap<String, String>,
}

/// Coinbase exchange-rate client (BCH → USD)
pub struct CoinbaseRateFeed {
    client: Client,
    url: String,
}

impl CoinbaseRateFeed {
    pub fn new(url: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn parse_usd_rate(body: ExchangeRatesResponse) -> AppResult<Decimal> {
        let usd = body.data.rates.get("USD").ok_or_else(|| {
            AppError::TransientNetwork(format!(
                "No USD rate in exchange-rates response for {}",
                body.data.currency
            ))
        })?;

        let rate = Decimal::from_str(usd).map_err(|e| {
            AppError::TransientNetwork(format!("Unparseable USD rate {}: {}", usd, e))
        })?;

        if rate <= Decimal::ZERO {
            return Err(AppError::TransientNetwork(format!(
                "Non-positive USD rate: {}",
                rate
            )));
        }

        Ok(rate)
    }
}

#[async_trait]
impl RateSource for CoinbaseRateFeed {
    async fn usd_per_base(&self) -> AppResult<Decimal> {
        let response = self.client.get(&self.url).send().await?.error_for_status()?;
        let body: ExchangeRatesResponse = response.json().await?;

        let rate = Self::parse_usd_rate(body)?;
        debug!("💱 Fetched exchange rate: {} USD per BCH", rate);
        Ok(rate)
    }
}

/// Latest known exchange rate, shared between the refresh timer and settlements
#[derive(Debug, Clone)]
pub struct RateCell {
    inner: Arc<RwLock<(Decimal, DateTime<Utc>)>>,
}

impl RateCell {
    pub fn new(initial: Decimal) -> Self {
        Self {
            inner: Arc::new(RwLock::new((initial, Utc::now()))),
        }
    }

    pub fn get(&self) -> Decimal {
        self.inner.read().0
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.inner.read().1
    }

    /// True when the rate has not been refreshed within `max_age`
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.updated_at());
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }

    pub fn set(&self, rate: Decimal) {
        let mut guard = self.inner.write();
        *guard = (rate, Utc::now());
    }

    /// Pull a fresh rate from `source` and store it
    pub async fn refresh(&self, source: &dyn RateSource) -> AppResult<Decimal> {
        let rate = source.usd_per_base().await?;
        self.set(rate);
        info!("✓ Updated BCH price: ${}", rate);
        Ok(rate)
    }
}
