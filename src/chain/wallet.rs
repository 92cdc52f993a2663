use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chain::LedgerClient;
use crate::error::{AppError, AppResult};

/// Wallet error code for missing spendable outputs
const RPC_INSUFFICIENT_FUNDS: i64 = -6;
/// Wallet is starting up or rescanning
const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcError>,
}

/// JSON-RPC 2.0 client for the signing wallet service that custodies the pool keys
pub struct WalletRpcClient {
    client: Client,
    url: String,
}

impl WalletRpcClient {
    pub fn new(url: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> AppResult<T> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        debug!("📡 Wallet RPC call: {}", method);

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::transport_error(method, e))?;

        // the wallet has the request from here on, so failures are ambiguous
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| AppError::LedgerAmbiguous(format!("{} bad response: {}", method, e)))?;

        Self::into_result(method, body)
    }

    /// Only a failed connect proves the request never reached the wallet
    fn transport_error(method: &str, error: reqwest::Error) -> AppError {
        if error.is_connect() {
            AppError::LedgerUnavailable(format!("{} connect error: {}", method, error))
        } else {
            AppError::LedgerAmbiguous(format!("{} transport error: {}", method, error))
        }
    }

    fn into_result<T: DeserializeOwned>(method: &str, body: RpcResponse) -> AppResult<T> {
        if let Some(error) = body.error {
            return Err(match error.code {
                RPC_INSUFFICIENT_FUNDS => AppError::InsufficientFunds(error.message),
                RPC_IN_WARMUP => AppError::LedgerUnavailable(error.message),
                code => AppError::Internal(format!(
                    "{} rejected by wallet ({}): {}",
                    method, code, error.message
                )),
            });
        }

        serde_json::from_value(body.result)
            .map_err(|e| AppError::LedgerAmbiguous(format!("{} unexpected result: {}", method, e)))
    }
}

#[async_trait]
impl LedgerClient for WalletRpcClient {
    async fn balance(&self, address: &str) -> AppResult<Decimal> {
        self.call("getbalance", json!([address])).await
    }

    async fn send_base(&self, to_address: &str, amount: Decimal) -> AppResult<String> {
        let txid: String = self
            .call("sendbase", json!([to_address, amount.to_string()]))
            .await?;
        info!("✓ Sent {} BCH to {} (tx: {})", amount, to_address, txid);
        Ok(txid)
    }

    async fn send_token(
        &self,
        to_address: &str,
        token_id: &str,
        quantity: Decimal,
    ) -> AppResult<String> {
        let txid: String = self
            .call("sendtoken", json!([to_address, token_id, quantity.to_string()]))
            .await?;
        info!("✓ Sent {} tokens to {} (tx: {})", quantity, to_address, txid);
        Ok(txid)
    }

    async fn consolidate_spendable_units(&self) -> AppResult<()> {
        let _: Value = self.call("consolidate", json!([])).await?;
        Ok(())
    }
}
