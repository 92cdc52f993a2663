// Settlement Processor - turns one detected transaction into a counter-transfer
//
// Flow per transaction:
// 1. Skip if already seen
// 2. Snapshot reserves (price is locked here for the whole settlement)
// 3. Resolve the transfer with the indexer and classify it
// 4. Check reserves, send the counter-transfer (or a refund)
// 5. Apply the balance change, mark seen, persist
//
// A send whose outcome is unknown is parked as a pending payout and never sent again.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::chain::{ChainIndexer, LedgerClient, TransferDetail, TransferKind};
use crate::config::Settings;
use crate::detector::DetectedEvent;
use crate::error::{AppError, AppResult};
use crate::pricing::{BondingCurve, RateCell};
use crate::settlement::retry::{bounded, RetryPolicy};
use crate::state::{PayoutAsset, PendingPayout, SharedReserves, StateStoreAdapter};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub pool_address: String,
    pub token_id: String,
    pub refund_fee: Decimal,
    pub dust_threshold: Decimal,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ProcessorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            pool_address: settings.pool_address.clone(),
            token_id: settings.token_id.clone(),
            refund_fee: settings.refund_fee,
            dust_threshold: settings.dust_threshold,
            call_timeout: settings.call_timeout,
            retry: settings.retry.clone(),
        }
    }
}

/// What the pool sent out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    /// Pool sent tokens (a buy)
    Token,
    /// Pool sent base currency (a sell)
    Base,
    /// Nothing economic happened
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementResult {
    pub kind: SettlementKind,
    pub base_balance: Decimal,
    pub token_balance: Decimal,
    /// None for self-generated or no-op settlements, which need no propagation wait
    pub settlement_transaction_id: Option<String>,
}

/// Economic reading of a transfer into the pool
#[derive(Debug, Clone, PartialEq)]
enum Swap {
    Buy { base_in: Decimal, sender: String },
    Sell { tokens_in: Decimal, sender: String },
    Ignore(&'static str),
}

pub struct SettlementProcessor {
    config: ProcessorConfig,
    indexer: Arc<dyn ChainIndexer>,
    ledger: Arc<dyn LedgerClient>,
    curve: BondingCurve,
    reserves: SharedReserves,
    store: StateStoreAdapter,
    rates: RateCell,
}

impl SettlementProcessor {
    pub fn new(
        config: ProcessorConfig,
        indexer: Arc<dyn ChainIndexer>,
        ledger: Arc<dyn LedgerClient>,
        curve: BondingCurve,
        reserves: SharedReserves,
        store: StateStoreAdapter,
        rates: RateCell,
    ) -> Self {
        Self {
            config,
            indexer,
            ledger,
            curve,
            reserves,
            store,
            rates,
        }
    }

    /// Settle one event against the reserves as they stand right now.
    ///
    /// Must only run inside a settlement queue task.
    pub async fn process(&self, event: &DetectedEvent) -> AppResult<SettlementResult> {
        let (base_balance, token_balance) = self.reserves.balances();
        self.settle(event, base_balance, token_balance).await
    }

    /// Settle one event priced at the given pre-transaction snapshot
    #[instrument(skip(self, event), fields(txid = %event.transaction_id))]
    pub async fn settle(
        &self,
        event: &DetectedEvent,
        base_balance: Decimal,
        token_balance: Decimal,
    ) -> AppResult<SettlementResult> {
        let txid = event.transaction_id.as_str();

        if self.reserves.has_seen(txid) {
            info!("⏭️ {} already settled, skipping", txid);
            return Ok(self.result(SettlementKind::None, None));
        }

        let detail = self
            .call("transaction detail", || self.indexer.transaction_detail(txid))
            .await
            .map_err(|e| self.failed(txid, e))?;

        match self.classify(&detail) {
            Swap::Buy { base_in, sender } => {
                self.settle_buy(txid, base_in, &sender, base_balance, token_balance)
                    .await
            }
            Swap::Sell { tokens_in, sender } => {
                self.settle_sell(txid, tokens_in, &sender, base_balance).await
            }
            Swap::Ignore(reason) => {
                info!("⏭️ {} is not a swap ({}), marking seen", txid, reason);
                self.reserves.update(|state| state.mark_seen(txid));
                self.persist();
                Ok(self.result(SettlementKind::None, None))
            }
        }
    }

    /// The customer paid base currency and is owed tokens
    async fn settle_buy(
        &self,
        txid: &str,
        base_in: Decimal,
        sender: &str,
        base_balance: Decimal,
        token_balance: Decimal,
    ) -> AppResult<SettlementResult> {
        let tokens_out = self.curve.tokens_for_base(base_in, base_balance);

        info!(
            "🔄 Buy {}: {} BCH in, {} tokens owed (pool: {} BCH, {} tokens)",
            txid, base_in, tokens_out, base_balance, token_balance
        );

        if tokens_out > token_balance {
            return Err(self.reject_buy(txid, base_in, sender, tokens_out, token_balance).await);
        }

        if tokens_out <= Decimal::ZERO {
            warn!("⏭️ {} pays out zero tokens, marking seen", txid);
            self.reserves.update(|state| state.mark_seen(txid));
            self.persist();
            return Ok(self.result(SettlementKind::None, None));
        }

        let settlement_txid = match self
            .write("send tokens", || {
                self.ledger
                    .send_token(sender, &self.config.token_id, tokens_out)
            })
            .await
        {
            Ok(settlement_txid) => settlement_txid,
            Err(e) => return Err(self.write_failed(txid, sender, PayoutAsset::Token, tokens_out, e)),
        };

        let usd_per_base = self.rates.get();
        self.reserves.update(|state| {
            state.base_balance += base_in;
            state.token_balance -= tokens_out;
            state.usd_per_base = usd_per_base;
            state.mark_seen(txid);
            state.mark_seen(&settlement_txid);
        });
        self.persist();

        info!("✓ Buy {} settled by {}", txid, settlement_txid);
        Ok(self.result(SettlementKind::Token, Some(settlement_txid)))
    }

    /// The customer sent tokens and is owed base currency
    async fn settle_sell(
        &self,
        txid: &str,
        tokens_in: Decimal,
        sender: &str,
        base_balance: Decimal,
    ) -> AppResult<SettlementResult> {
        let base_out = self.curve.base_for_tokens(tokens_in, base_balance);

        info!(
            "🔄 Sell {}: {} tokens in, {} BCH owed (pool: {} BCH)",
            txid, tokens_in, base_out, base_balance
        );

        if base_out > base_balance {
            return Err(self.reject_sell(txid, tokens_in, sender, base_out, base_balance).await);
        }

        if base_out <= Decimal::ZERO {
            warn!("⏭️ {} pays out zero BCH, marking seen", txid);
            self.reserves.update(|state| state.mark_seen(txid));
            self.persist();
            return Ok(self.result(SettlementKind::None, None));
        }

        let settlement_txid = match self
            .write("send base", || self.ledger.send_base(sender, base_out))
            .await
        {
            Ok(settlement_txid) => settlement_txid,
            Err(e) => return Err(self.write_failed(txid, sender, PayoutAsset::Base, base_out, e)),
        };

        let usd_per_base = self.rates.get();
        self.reserves.update(|state| {
            state.base_balance -= base_out;
            state.token_balance += tokens_in;
            state.usd_per_base = usd_per_base;
            state.mark_seen(txid);
            state.mark_seen(&settlement_txid);
        });
        self.persist();

        info!("✓ Sell {} settled by {}", txid, settlement_txid);
        Ok(self.result(SettlementKind::Base, Some(settlement_txid)))
    }

    /// Not enough tokens: refund the base payment minus the network fee
    async fn reject_buy(
        &self,
        txid: &str,
        base_in: Decimal,
        sender: &str,
        required: Decimal,
        available: Decimal,
    ) -> AppError {
        let refund_amount = base_in - self.config.refund_fee;

        let refund = if refund_amount > Decimal::ZERO {
            match self
                .write("refund base", || self.ledger.send_base(sender, refund_amount))
                .await
            {
                Ok(refund_txid) => Some(refund_txid),
                Err(e) => {
                    return self.write_failed(txid, sender, PayoutAsset::Base, refund_amount, e)
                }
            }
        } else {
            warn!(
                "{} payment of {} BCH does not cover the refund fee, nothing refunded",
                txid, base_in
            );
            None
        };

        self.reserves.update(|state| {
            state.mark_seen(txid);
            if let Some(refund_txid) = &refund {
                state.mark_seen(refund_txid);
            }
        });
        self.persist();

        warn!(
            "⚠️ Buy {} rejected: {} tokens owed, {} available, refunded {} BCH",
            txid,
            required,
            available,
            refund_amount.max(Decimal::ZERO)
        );

        AppError::InsufficientReserves {
            asset: "token".to_string(),
            required,
            available,
            refund,
        }
    }

    /// Not enough base currency: return the tokens, send no base
    async fn reject_sell(
        &self,
        txid: &str,
        tokens_in: Decimal,
        sender: &str,
        required: Decimal,
        available: Decimal,
    ) -> AppError {
        let refund = match self
            .write("return tokens", || {
                self.ledger
                    .send_token(sender, &self.config.token_id, tokens_in)
            })
            .await
        {
            Ok(refund_txid) => refund_txid,
            Err(e) => return self.write_failed(txid, sender, PayoutAsset::Token, tokens_in, e),
        };

        self.reserves.update(|state| {
            state.mark_seen(txid);
            state.mark_seen(&refund);
        });
        self.persist();

        warn!(
            "⚠️ Sell {} rejected: {} BCH owed, {} available, returned {} tokens",
            txid, required, available, tokens_in
        );

        AppError::InsufficientReserves {
            asset: "base".to_string(),
            required,
            available,
            refund: Some(refund),
        }
    }

    fn classify(&self, detail: &TransferDetail) -> Swap {
        let sender = match &detail.counterparty {
            Some(sender) if sender == &self.config.pool_address => {
                return Swap::Ignore("self-generated")
            }
            Some(sender) if !sender.is_empty() => sender.clone(),
            _ => return Swap::Ignore("no sender"),
        };

        match detail.kind {
            TransferKind::Token => {
                if detail.token_id.as_deref() != Some(self.config.token_id.as_str()) {
                    Swap::Ignore("unrelated token")
                } else if detail.amount <= Decimal::ZERO {
                    Swap::Ignore("empty token transfer")
                } else {
                    Swap::Sell {
                        tokens_in: detail.amount,
                        sender,
                    }
                }
            }
            TransferKind::Base => {
                if detail.amount < self.config.dust_threshold || detail.amount <= Decimal::ZERO {
                    Swap::Ignore("dust")
                } else {
                    Swap::Buy {
                        base_in: detail.amount,
                        sender,
                    }
                }
            }
            TransferKind::Unknown => Swap::Ignore("unknown transfer"),
        }
    }

    async fn call<T, F, Fut>(&self, operation_name: &str, operation: F) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let timeout = self.config.call_timeout;
        let operation = &operation;
        self.config
            .retry
            .run(operation_name, move || {
                bounded(timeout, operation_name, operation())
            })
            .await
    }

    /// Ledger writes retry only on refusals that happen before any broadcast.
    /// A timeout or a lost acknowledgement comes back as `LedgerAmbiguous`.
    async fn write<F, Fut>(&self, operation_name: &str, operation: F) -> AppResult<String>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<String>>,
    {
        let timeout = self.config.call_timeout;
        let operation = &operation;
        self.config
            .retry
            .run(operation_name, move || async move {
                match tokio::time::timeout(timeout, operation()).await {
                    Ok(Err(AppError::TransientNetwork(reason))) => {
                        Err(AppError::LedgerAmbiguous(reason))
                    }
                    Ok(result) => result,
                    Err(_) => Err(AppError::LedgerAmbiguous(format!(
                        "{} timed out after {:?}",
                        operation_name, timeout
                    ))),
                }
            })
            .await
    }

    fn write_failed(
        &self,
        txid: &str,
        to: &str,
        asset: PayoutAsset,
        amount: Decimal,
        error: AppError,
    ) -> AppError {
        let reason = match error {
            AppError::LedgerAmbiguous(reason) => reason,
            other => return self.failed(txid, other),
        };

        let payout = PendingPayout {
            to: to.to_string(),
            asset,
            amount,
            reason: reason.clone(),
            recorded_at: Utc::now(),
        };
        self.reserves
            .update(|state| state.record_pending_payout(txid, payout));
        self.persist();

        error!(
            "❌ Payout of {} {:?} to {} for {} may have been broadcast ({}); recorded as pending and will not be re-sent",
            amount, asset, to, txid, reason
        );

        AppError::PayoutUnconfirmed {
            txid: txid.to_string(),
            reason,
        }
    }

    fn failed(&self, txid: &str, error: AppError) -> AppError {
        let attempts = if error.is_retryable() {
            self.config.retry.max_attempts
        } else {
            1
        };

        error!("❌ Settlement of {} failed: {}", txid, error);

        AppError::SettlementFailed {
            txid: txid.to_string(),
            attempts,
            reason: error.to_string(),
        }
    }

    fn persist(&self) {
        let snapshot = self.reserves.snapshot();
        if let Err(e) = self.store.save(&snapshot) {
            // in-memory state stays authoritative until the next periodic save
            error!("Failed to persist state after settlement: {}", e);
        }
    }

    fn result(&self, kind: SettlementKind, settlement_txid: Option<String>) -> SettlementResult {
        let (base_balance, token_balance) = self.reserves.balances();
        SettlementResult {
            kind,
            base_balance,
            token_balance,
            settlement_transaction_id: settlement_txid,
        }
    }
}

/// The counter-transfer or refund a settlement put on the ledger, if any.
/// An unconfirmed payout names the inbound transaction instead.
pub fn ledger_write(outcome: &AppResult<SettlementResult>) -> Option<&str> {
    match outcome {
        Ok(result) => result.settlement_transaction_id.as_deref(),
        Err(AppError::InsufficientReserves { refund, .. }) => refund.as_deref(),
        Err(AppError::PayoutUnconfirmed { txid, .. }) => Some(txid.as_str()),
        Err(_) => None,
    }
}
