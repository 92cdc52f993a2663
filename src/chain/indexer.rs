use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::chain::{AddressHistory, ChainIndexer, TransferDetail};
use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
struct TokenBalanceResponse {
    balance: Decimal,
}

/// REST client for a token-aware block indexer
///
/// Endpoints:
/// - `GET {base}/address/{address}` → `{"balance": "1.5", "transaction_ids": [...]}`
/// - `GET {base}/tx/{txid}` → `{"kind": "base"|"token"|"unknown", "amount": "...", "counterparty": "...", "token_id": "..."}`
/// - `GET {base}/address/{address}/tokens/{token_id}` → `{"balance": "..."}`
pub struct HttpIndexer {
    client: Client,
    base_url: String,
}

impl HttpIndexer {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("🔍 Indexer request: {}", url);

        let response = self.client.get(&url).send().await?;

        // A transaction the indexer has not caught up with yet shows up as 404
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AppError::TransientNetwork(format!(
                "Indexer has no record yet for {}",
                path
            )));
        }

        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl ChainIndexer for HttpIndexer {
    async fn address_history(&self, address: &str) -> AppResult<AddressHistory> {
        self.get_json(&format!("/address/{}", address)).await
    }

    async fn transaction_detail(&self, txid: &str) -> AppResult<TransferDetail> {
        self.get_json(&format!("/tx/{}", txid)).await
    }

    async fn token_balance(&self, address: &str, token_id: &str) -> AppResult<Decimal> {
        let body: TokenBalanceResponse = self
            .get_json(&format!("/address/{}/tokens/{}", address, token_id))
            .await?;
        Ok(body.balance)
    }
}
