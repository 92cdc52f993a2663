use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::settlement::retry::RetryPolicy;

const ENV_PREFIX: &str = "LIQUIDITY";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }

    fn default_indexer_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "http://127.0.0.1:9130",
            Network::Testnet => "http://127.0.0.1:19130",
        }
    }

    fn default_wallet_rpc_url(&self) -> &'static str {
        match self {
            Network::Mainnet => "http://127.0.0.1:8332",
            Network::Testnet => "http://127.0.0.1:18332",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            other => Err(AppError::Config(format!("Unknown network: {}", other))),
        }
    }
}

/// Raw values as they come out of the environment, before validation
#[derive(Debug, Deserialize)]
struct RawSettings {
    pool_address: String,
    token_id: String,
    base_qty_original: String,
    tokens_qty_original: String,
    network: String,
    poll_interval_secs: u64,
    propagation_delay_secs: u64,
    consolidate_interval_secs: u64,
    price_refresh_interval_secs: u64,
    status_interval_secs: u64,
    persist_interval_secs: u64,
    call_timeout_secs: u64,
    retry_max_attempts: u32,
    retry_initial_delay_ms: u64,
    retry_max_delay_ms: u64,
    retry_backoff_multiplier: f64,
    retry_jitter_factor: f64,
    refund_fee: String,
    dust_threshold: String,
    token_decimals: u32,
    state_file: String,
    indexer_url: Option<String>,
    wallet_rpc_url: Option<String>,
    rate_feed_url: String,
}

/// Process-wide settings. Read once at startup, immutable afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pool_address: String,
    pub token_id: String,
    /// Bonding-curve anchor: base currency held at first run
    pub initial_base_balance: Decimal,
    /// Bonding-curve anchor: tokens held at first run
    pub initial_token_balance: Decimal,
    pub network: Network,
    pub poll_interval: Duration,
    pub propagation_delay: Duration,
    pub consolidation_interval: Duration,
    pub price_refresh_interval: Duration,
    pub status_interval: Duration,
    pub persist_interval: Duration,
    /// Upper bound for every indexer/ledger call
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    /// Network fee withheld from refunds of rejected buys
    pub refund_fee: Decimal,
    /// Base payments below this are treated as dust
    pub dust_threshold: Decimal,
    pub token_decimals: u32,
    pub state_file: PathBuf,
    pub indexer_url: String,
    pub wallet_rpc_url: String,
    pub rate_feed_url: String,
}

impl Settings {
    /// Read settings from `LIQUIDITY_*` environment variables over built-in defaults
    pub fn from_env() -> AppResult<Self> {
        let source = Self::builder_with_defaults()?
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()?;

        Self::from_config(&source)
    }

    pub fn builder_with_defaults(
    ) -> AppResult<config::ConfigBuilder<config::builder::DefaultState>> {
        let retry = RetryPolicy::default();

        Ok(config::Config::builder()
            .set_default("network", "mainnet")?
            .set_default("poll_interval_secs", 120)?
            .set_default("propagation_delay_secs", 300)?
            .set_default("consolidate_interval_secs", 6000)?
            .set_default("price_refresh_interval_secs", 300)?
            .set_default("status_interval_secs", 3600)?
            .set_default("persist_interval_secs", 600)?
            .set_default("call_timeout_secs", 30)?
            .set_default("retry_max_attempts", retry.max_attempts)?
            .set_default("retry_initial_delay_ms", retry.initial_delay.as_millis() as u64)?
            .set_default("retry_max_delay_ms", retry.max_delay.as_millis() as u64)?
            .set_default("retry_backoff_multiplier", retry.backoff_multiplier)?
            .set_default("retry_jitter_factor", retry.jitter_factor)?
            .set_default("refund_fee", "0.00001")?
            .set_default("dust_threshold", "0.00001")?
            .set_default("token_decimals", 8)?
            .set_default("state_file", "state.json")?
            .set_default(
                "rate_feed_url",
                "https://api.coinbase.com/v2/exchange-rates?currency=BCH",
            )?)
    }

    /// Validate a built configuration source into `Settings`
    pub fn from_config(source: &config::Config) -> AppResult<Self> {
        let raw: RawSettings = source.clone().try_deserialize()?;

        let network = Network::from_str(&raw.network)?;

        let settings = Settings {
            pool_address: raw.pool_address.trim().to_string(),
            token_id: raw.token_id.trim().to_string(),
            initial_base_balance: parse_decimal("base_qty_original", &raw.base_qty_original)?,
            initial_token_balance: parse_decimal(
                "tokens_qty_original",
                &raw.tokens_qty_original,
            )?,
            network,
            poll_interval: Duration::from_secs(raw.poll_interval_secs),
            propagation_delay: Duration::from_secs(raw.propagation_delay_secs),
            consolidation_interval: Duration::from_secs(raw.consolidate_interval_secs),
            price_refresh_interval: Duration::from_secs(raw.price_refresh_interval_secs),
            status_interval: Duration::from_secs(raw.status_interval_secs),
            persist_interval: Duration::from_secs(raw.persist_interval_secs),
            call_timeout: Duration::from_secs(raw.call_timeout_secs),
            retry: RetryPolicy {
                max_attempts: raw.retry_max_attempts,
                initial_delay: Duration::from_millis(raw.retry_initial_delay_ms),
                max_delay: Duration::from_millis(raw.retry_max_delay_ms),
                backoff_multiplier: raw.retry_backoff_multiplier,
                jitter_factor: raw.retry_jitter_factor,
            },
            refund_fee: parse_decimal("refund_fee", &raw.refund_fee)?,
            dust_threshold: parse_decimal("dust_threshold", &raw.dust_threshold)?,
            token_decimals: raw.token_decimals,
            state_file: PathBuf::from(raw.state_file),
            indexer_url: raw
                .indexer_url
                .unwrap_or_else(|| network.default_indexer_url().to_string()),
            wallet_rpc_url: raw
                .wallet_rpc_url
                .unwrap_or_else(|| network.default_wallet_rpc_url().to_string()),
            rate_feed_url: raw.rate_feed_url,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.pool_address.is_empty() {
            return Err(AppError::Config("pool address must be set".to_string()));
        }
        if self.token_id.is_empty() {
            return Err(AppError::Config("token id must be set".to_string()));
        }
        if self.initial_base_balance <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "initial base balance must be positive, got {}",
                self.initial_base_balance
            )));
        }
        if self.initial_token_balance <= Decimal::ZERO {
            return Err(AppError::Config(format!(
                "initial token balance must be positive, got {}",
                self.initial_token_balance
            )));
        }
        if self.refund_fee < Decimal::ZERO || self.dust_threshold < Decimal::ZERO {
            return Err(AppError::Config(
                "refund fee and dust threshold must not be negative".to_string(),
            ));
        }

        let intervals = [
            ("poll interval", self.poll_interval),
            ("consolidation interval", self.consolidation_interval),
            ("price refresh interval", self.price_refresh_interval),
            ("status interval", self.status_interval),
            ("persist interval", self.persist_interval),
            ("call timeout", self.call_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(AppError::Config(format!("{} must be non-zero", name)));
            }
        }

        self.retry.validate()
    }
}

fn parse_decimal(key: &str, value: &str) -> AppResult<Decimal> {
    Decimal::from_str(value.trim())
        .map_err(|e| AppError::Config(format!("{} is not a decimal ({}): {}", key, value, e)))
}
