use rust_decimal::Decimal;
use thiserror::Error;

/// Top-level error type for the liquidity app
#[derive(Error, Debug)]
pub enum AppError {
    /// Indexer/ledger timeouts and connection failures. Retried with backoff.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Persisted state is missing or corrupt. Recovered by falling back to configured reserves.
    #[error("State unavailable: {0}")]
    StateUnavailable(String),

    /// Retry budget exhausted for a single transaction
    #[error("Settlement failed for {txid} after {attempts} attempts: {reason}")]
    SettlementFailed {
        txid: String,
        attempts: u32,
        reason: String,
    },

    /// The pool cannot honor the requested swap. `refund` is the transaction
    /// that returned the customer's payment, if one was sent.
    #[error("Insufficient reserves: {asset} required {required}, available {available}")]
    InsufficientReserves {
        asset: String,
        required: Decimal,
        available: Decimal,
        refund: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    /// The wallet refused the request before broadcasting anything
    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// A ledger write whose outcome is unknown. It may have been broadcast, so it is never retried.
    #[error("Ledger outcome unknown: {0}")]
    LedgerAmbiguous(String),

    /// A payout may have been broadcast without acknowledgement. Recorded as pending, never re-sent.
    #[error("Payout for {txid} unconfirmed, recorded as pending: {reason}")]
    PayoutUnconfirmed { txid: String, reason: String },

    /// Spendable outputs are missing, usually unconfirmed change from the previous settlement
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors worth another attempt after a backoff delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientNetwork(_)
                | AppError::LedgerUnavailable(_)
                | AppError::InsufficientFunds(_)
        )
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::TransientNetwork(format!("HTTP request error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::StateUnavailable(format!("Malformed JSON: {}", error))
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        AppError::StateUnavailable(format!("I/O error: {}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<rust_decimal::Error> for AppError {
    fn from(error: rust_decimal::Error) -> Self {
        AppError::Config(format!("Decimal conversion error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
