// Reserve state - the single persisted record of pool balances

pub mod file_store;

pub use file_store::JsonFileStore;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutAsset {
    Base,
    Token,
}

/// A payout that may have been broadcast but was never acknowledged.
/// Needs operator reconciliation against the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayout {
    pub to: String,
    pub asset: PayoutAsset,
    pub amount: Decimal,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveState {
    pub base_balance: Decimal,
    pub token_balance: Decimal,
    pub usd_per_base: Decimal,
    /// Curve anchor, fixed at first run
    pub initial_base_balance: Decimal,
    /// Curve anchor, fixed at first run
    pub initial_token_balance: Decimal,
    #[serde(default)]
    pub seen_transaction_ids: BTreeSet<String>,
    /// Inbound txid → payout with an unknown outcome
    #[serde(default)]
    pub pending_payouts: BTreeMap<String, PendingPayout>,
    pub updated_at: DateTime<Utc>,
}

impl ReserveState {
    /// Fresh state anchored at the configured initial reserves
    pub fn from_settings(settings: &Settings, usd_per_base: Decimal) -> Self {
        Self {
            base_balance: settings.initial_base_balance,
            token_balance: settings.initial_token_balance,
            usd_per_base,
            initial_base_balance: settings.initial_base_balance,
            initial_token_balance: settings.initial_token_balance,
            seen_transaction_ids: BTreeSet::new(),
            pending_payouts: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn has_seen(&self, txid: &str) -> bool {
        self.seen_transaction_ids.contains(txid)
    }

    /// Returns false if the ID was already recorded
    pub fn mark_seen(&mut self, txid: &str) -> bool {
        self.seen_transaction_ids.insert(txid.to_string())
    }

    /// Park `txid` so it is never paid out again
    pub fn record_pending_payout(&mut self, txid: &str, payout: PendingPayout) {
        self.mark_seen(txid);
        self.pending_payouts.insert(txid.to_string(), payout);
    }

    /// A record that violates these is treated as corrupt
    pub fn validate(&self) -> AppResult<()> {
        if self.base_balance < Decimal::ZERO || self.token_balance < Decimal::ZERO {
            return Err(AppError::StateUnavailable(format!(
                "negative reserves in state (base {}, token {})",
                self.base_balance, self.token_balance
            )));
        }
        if self.initial_base_balance <= Decimal::ZERO || self.initial_token_balance <= Decimal::ZERO
        {
            return Err(AppError::StateUnavailable(format!(
                "non-positive curve anchor in state (base {}, token {})",
                self.initial_base_balance, self.initial_token_balance
            )));
        }
        Ok(())
    }
}

/// Backing record storage
pub trait StateStore: Send + Sync {
    /// Fails with `StateUnavailable` when the record is missing or unreadable
    fn read_state(&self) -> AppResult<ReserveState>;

    fn write_state(&self, state: &ReserveState) -> AppResult<()>;
}

/// Loads and persists reserve state through a `StateStore`
#[derive(Clone)]
pub struct StateStoreAdapter {
    store: Arc<dyn StateStore>,
}

impl StateStoreAdapter {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> AppResult<ReserveState> {
        let state = self.store.read_state()?;
        state.validate()?;
        Ok(state)
    }

    /// Load persisted state, or start from the configured reserves.
    ///
    /// The boolean is true when the state was freshly initialized.
    pub fn load_or_initialize(
        &self,
        settings: &Settings,
        usd_per_base: Decimal,
    ) -> (ReserveState, bool) {
        match self.load() {
            Ok(state) => {
                if state.initial_base_balance != settings.initial_base_balance
                    || state.initial_token_balance != settings.initial_token_balance
                {
                    warn!(
                        "⚠️  Configured curve anchor ({} BCH / {} tokens) differs from persisted anchor ({} BCH / {} tokens); keeping persisted anchor",
                        settings.initial_base_balance,
                        settings.initial_token_balance,
                        state.initial_base_balance,
                        state.initial_token_balance
                    );
                }
                info!(
                    "✓ Loaded state: {} BCH, {} tokens, {} seen transactions",
                    state.base_balance,
                    state.token_balance,
                    state.seen_transaction_ids.len()
                );
                (state, false)
            }
            Err(e) => {
                warn!("⚠️  Could not read state ({}), starting from configured reserves", e);
                (ReserveState::from_settings(settings, usd_per_base), true)
            }
        }
    }

    pub fn save(&self, state: &ReserveState) -> AppResult<()> {
        state.validate()?;
        self.store.write_state(state)
    }
}

/// In-memory reserve state shared between the loop and settlement tasks.
///
/// The lock is never held across an await point. Only settlement tasks running
/// on the queue mutate balances; everyone else reads snapshots.
#[derive(Debug, Clone)]
pub struct SharedReserves {
    inner: Arc<RwLock<ReserveState>>,
}

impl SharedReserves {
    pub fn new(state: ReserveState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn snapshot(&self) -> ReserveState {
        self.inner.read().clone()
    }

    /// (base, token) balances read atomically
    pub fn balances(&self) -> (Decimal, Decimal) {
        let state = self.inner.read();
        (state.base_balance, state.token_balance)
    }

    pub fn has_seen(&self, txid: &str) -> bool {
        self.inner.read().has_seen(txid)
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ReserveState) -> R) -> R {
        let mut state = self.inner.write();
        let result = f(&mut state);
        state.updated_at = Utc::now();
        result
    }
}
