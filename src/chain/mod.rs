pub mod indexer;
pub mod models;
pub mod wallet;

pub use indexer::HttpIndexer;
pub use models::{AddressHistory, TransferDetail, TransferKind};
pub use wallet::WalletRpcClient;

use crate::error::AppResult;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Block indexer - read-only view of the pool address
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    /// Current balance plus the full transaction-ID history of `address`
    async fn address_history(&self, address: &str) -> AppResult<AddressHistory>;

    /// Resolve what a transaction delivered to the pool
    async fn transaction_detail(&self, txid: &str) -> AppResult<TransferDetail>;

    /// Balance of `token_id` held by `address`
    async fn token_balance(&self, address: &str, token_id: &str) -> AppResult<Decimal>;
}

/// Ledger client - signs and broadcasts on behalf of the pool
///
/// All methods fail with `LedgerUnavailable` or `InsufficientFunds`.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn balance(&self, address: &str) -> AppResult<Decimal>;

    /// Returns the transaction ID of the payment
    async fn send_base(&self, to_address: &str, amount: Decimal) -> AppResult<String>;

    /// Returns the transaction ID of the token transfer
    async fn send_token(
        &self,
        to_address: &str,
        token_id: &str,
        quantity: Decimal,
    ) -> AppResult<String>;

    /// Merge small spendable outputs into fewer, larger ones
    async fn consolidate_spendable_units(&self) -> AppResult<()>;
}
