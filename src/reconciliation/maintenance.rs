// Maintenance timers - each runs on its own cadence beside the reconciliation loop

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::chain::LedgerClient;
use crate::error::AppResult;
use crate::pricing::{BondingCurve, RateCell, RateSource};
use crate::settlement::retry::bounded;
use crate::settlement::SettlementQueue;
use crate::state::{ReserveState, StateStoreAdapter};

/// Persisted balances priced at the live exchange rate
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub base_balance: Decimal,
    pub token_balance: Decimal,
    pub usd_per_base: Decimal,
    pub rate_updated_at: DateTime<Utc>,
    pub rate_stale: bool,
    pub effective_token_balance: Decimal,
    pub spot_price: Decimal,
    pub pending_payouts: usize,
}

impl StatusReport {
    pub fn new(
        state: &ReserveState,
        curve: &BondingCurve,
        rates: &RateCell,
        stale_after: Duration,
    ) -> Self {
        let usd_per_base = rates.get();
        Self {
            base_balance: state.base_balance,
            token_balance: state.token_balance,
            usd_per_base,
            rate_updated_at: rates.updated_at(),
            rate_stale: rates.is_stale(stale_after),
            effective_token_balance: curve.effective_token_balance(state.base_balance),
            spot_price: curve.spot_price(state.base_balance, usd_per_base),
            pending_payouts: state.pending_payouts.len(),
        }
    }
}

/// First tick one period from now; startup already did the initial work
fn ticker(every: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

pub fn spawn_rate_refresh(
    rates: RateCell,
    source: Arc<dyn RateSource>,
    every: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(every);
        loop {
            ticker.tick().await;
            if let Err(e) = bounded(timeout, "exchange rate", rates.refresh(source.as_ref())).await {
                warn!("💱 Exchange rate refresh failed, keeping {}: {}", rates.get(), e);
            }
        }
    })
}

/// Merge small outputs. Runs as a queue task so it never overlaps a settlement.
pub async fn consolidate(
    queue: &SettlementQueue,
    ledger: Arc<dyn LedgerClient>,
    timeout: Duration,
) -> AppResult<()> {
    let handle = queue.enqueue(async move {
        bounded(
            timeout,
            "consolidate spendable units",
            ledger.consolidate_spendable_units(),
        )
        .await
    })?;

    handle.wait().await?
}

pub fn spawn_consolidation(
    queue: Arc<SettlementQueue>,
    ledger: Arc<dyn LedgerClient>,
    every: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(every);
        loop {
            ticker.tick().await;
            info!("🔄 Consolidating spendable outputs");
            match consolidate(&queue, ledger.clone(), timeout).await {
                Ok(()) => info!("✓ Consolidation complete"),
                Err(e) => error!("❌ Consolidation failed: {}", e),
            }
        }
    })
}

/// Balances as persisted, not as held in memory
pub fn status(
    store: &StateStoreAdapter,
    curve: &BondingCurve,
    rates: &RateCell,
    stale_after: Duration,
) -> AppResult<StatusReport> {
    let state = store.load()?;
    Ok(StatusReport::new(&state, curve, rates, stale_after))
}

fn log_status(report: &StatusReport) {
    info!(
        "📊 Pool status: {} BCH, {} tokens (effective {}), ${} per BCH, token spot price ${}",
        report.base_balance,
        report.token_balance,
        report.effective_token_balance,
        report.usd_per_base,
        report.spot_price
    );
    if report.rate_stale {
        warn!(
            "💱 Exchange rate last refreshed at {}, spot price may be stale",
            report.rate_updated_at
        );
    }
    if report.pending_payouts > 0 {
        warn!(
            "⚠️  {} payouts with unknown outcome need reconciliation",
            report.pending_payouts
        );
    }
}

pub fn spawn_status(
    store: StateStoreAdapter,
    curve: BondingCurve,
    rates: RateCell,
    every: Duration,
    stale_after: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(every);
        loop {
            ticker.tick().await;
            match status(&store, &curve, &rates, stale_after) {
                Ok(report) => log_status(&report),
                Err(e) => warn!("📊 Pool status unavailable: {}", e),
            }
        }
    })
}
