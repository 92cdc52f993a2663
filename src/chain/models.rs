use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pool address state as reported by the indexer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressHistory {
    /// Confirmed plus unconfirmed base-currency balance
    pub balance: Decimal,
    /// Every transaction touching the address, in indexer order
    pub transaction_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Base,
    Token,
    Unknown,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferKind::Base => "base",
            TransferKind::Token => "token",
            TransferKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// What a transaction delivered to the pool address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDetail {
    pub kind: TransferKind,
    /// Quantity received by the pool: base currency for `Base`, tokens for `Token`
    #[serde(default)]
    pub amount: Decimal,
    /// Sender address, where the counter-transfer goes
    #[serde(default)]
    pub counterparty: Option<String>,
    /// Token identifier for `Token` transfers
    #[serde(default)]
    pub token_id: Option<String>,
}

impl TransferDetail {
    pub fn base(amount: Decimal, counterparty: &str) -> Self {
        Self {
            kind: TransferKind::Base,
            amount,
            counterparty: Some(counterparty.to_string()),
            token_id: None,
        }
    }

    pub fn token(token_id: &str, amount: Decimal, counterparty: &str) -> Self {
        Self {
            kind: TransferKind::Token,
            amount,
            counterparty: Some(counterparty.to_string()),
            token_id: Some(token_id.to_string()),
        }
    }

    pub fn unknown() -> Self {
        Self {
            kind: TransferKind::Unknown,
            amount: Decimal::ZERO,
            counterparty: None,
            token_id: None,
        }
    }
}
