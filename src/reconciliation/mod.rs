// Reconciliation Loop - the single scheduler task
//
// Cycle:
//   Idle → Detecting → NoNewEvents → Idle
//                    → HasNewEvents → Settling → AwaitingPropagation → ... → Idle
//
// The poll timer does not tick while a cycle is settling. Detection for the
// next cycle only starts once every settlement (and its propagation wait) has
// finished.

pub mod maintenance;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::chain::{AddressHistory, ChainIndexer};
use crate::config::Settings;
use crate::detector::{DetectedEvent, TransactionDetector};
use crate::error::{AppError, AppResult};
use crate::settlement::retry::bounded;
use crate::settlement::{
    ledger_write, SettlementProcessor, SettlementQueue, SettlementResult,
};
use crate::state::{SharedReserves, StateStoreAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Detecting,
    NoNewEvents,
    HasNewEvents,
    Settling,
    AwaitingPropagation,
}

/// Outcome counts for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub detected: usize,
    pub settled: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub struct ReconciliationLoop {
    detector: TransactionDetector,
    indexer: Arc<dyn ChainIndexer>,
    processor: Arc<SettlementProcessor>,
    queue: Arc<SettlementQueue>,
    reserves: SharedReserves,
    store: StateStoreAdapter,
    phase: Arc<watch::Sender<LoopPhase>>,
    pool_address: String,
    token_id: String,
    poll_interval: Duration,
    propagation_delay: Duration,
    persist_interval: Duration,
    call_timeout: Duration,
}

impl ReconciliationLoop {
    pub fn new(
        settings: &Settings,
        indexer: Arc<dyn ChainIndexer>,
        processor: Arc<SettlementProcessor>,
        queue: Arc<SettlementQueue>,
        reserves: SharedReserves,
        store: StateStoreAdapter,
    ) -> Self {
        let (phase, _) = watch::channel(LoopPhase::Idle);

        Self {
            detector: TransactionDetector::new(
                indexer.clone(),
                &settings.pool_address,
                settings.call_timeout,
            ),
            indexer,
            processor,
            queue,
            reserves,
            store,
            phase: Arc::new(phase),
            pool_address: settings.pool_address.clone(),
            token_id: settings.token_id.clone(),
            poll_interval: settings.poll_interval,
            propagation_delay: settings.propagation_delay,
            persist_interval: settings.persist_interval,
            call_timeout: settings.call_timeout,
        }
    }

    pub fn phases(&self) -> watch::Receiver<LoopPhase> {
        self.phase.subscribe()
    }

    /// First run without persisted state: take balances from the indexer and
    /// treat every transaction already on the pool address as settled.
    pub async fn adopt_existing_history(&self) -> AppResult<usize> {
        let history = bounded(
            self.call_timeout,
            "address history",
            self.indexer.address_history(&self.pool_address),
        )
        .await?;
        let token_balance = bounded(
            self.call_timeout,
            "token balance",
            self.indexer.token_balance(&self.pool_address, &self.token_id),
        )
        .await?;

        let adopted = self.reserves.update(|state| {
            state.base_balance = history.balance;
            state.token_balance = token_balance;
            history
                .transaction_ids
                .iter()
                .filter(|txid| state.mark_seen(txid))
                .count()
        });

        self.store.save(&self.reserves.snapshot())?;

        info!(
            "✓ Adopted {} existing transactions as settled ({} BCH, {} tokens)",
            adopted, history.balance, token_balance
        );
        Ok(adopted)
    }

    /// Run timers until the task is dropped
    pub async fn run(self) {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut persist = interval_at(
            Instant::now() + self.persist_interval,
            self.persist_interval,
        );
        persist.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "🔄 Reconciliation loop started (poll every {:?}, propagation delay {:?})",
            self.poll_interval, self.propagation_delay
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("❌ Reconciliation cycle failed: {}", e);
                    }
                    poll.reset();
                }
                _ = persist.tick() => self.persist(),
            }
        }
    }

    /// One detect-and-settle pass. Always ends in `Idle`.
    pub async fn run_cycle(&self) -> AppResult<CycleReport> {
        let outcome = self.cycle().await;
        self.phase.send_replace(LoopPhase::Idle);
        outcome
    }

    async fn cycle(&self) -> AppResult<CycleReport> {
        self.phase.send_replace(LoopPhase::Detecting);

        let known = self.reserves.snapshot().seen_transaction_ids;
        let detection = self.detector.detect(&known).await?;

        if detection.events.is_empty() {
            self.phase.send_replace(LoopPhase::NoNewEvents);
            self.resync(&detection.history).await;
            return Ok(CycleReport::default());
        }

        self.phase.send_replace(LoopPhase::HasNewEvents);
        info!("📥 {} new transactions detected", detection.events.len());

        let mut report = CycleReport {
            detected: detection.events.len(),
            ..CycleReport::default()
        };

        let mut handles = Vec::with_capacity(detection.events.len());
        for event in detection.events {
            handles.push((
                event.transaction_id.clone(),
                self.queue.enqueue(self.settlement_task(event))?,
            ));
        }
        debug!("Settlement queue depth: {}", self.queue.depth());

        for (txid, handle) in handles {
            match handle.wait().await {
                Ok(Ok(_)) => report.settled += 1,
                Ok(Err(AppError::InsufficientReserves { .. })) => report.rejected += 1,
                Ok(Err(_)) => report.failed += 1,
                Err(e) => {
                    error!("❌ Settlement task for {} did not complete: {}", txid, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "✓ Cycle complete: {} settled, {} rejected, {} failed",
            report.settled, report.rejected, report.failed
        );
        Ok(report)
    }

    /// Process one event, then hold the queue while the counter-transfer propagates
    fn settlement_task(
        &self,
        event: DetectedEvent,
    ) -> impl std::future::Future<Output = AppResult<SettlementResult>> + Send + 'static {
        let processor = self.processor.clone();
        let phase = self.phase.clone();
        let delay = self.propagation_delay;

        async move {
            phase.send_replace(LoopPhase::Settling);
            let outcome = processor.process(&event).await;

            if let Some(txid) = ledger_write(&outcome) {
                phase.send_replace(LoopPhase::AwaitingPropagation);
                info!("⏳ Waiting {:?} for {} to propagate", delay, txid);
                tokio::time::sleep(delay).await;
            }

            outcome
        }
    }

    /// Nothing new on-chain: adopt the indexer's balances in memory only
    async fn resync(&self, history: &AddressHistory) {
        let token_balance = match bounded(
            self.call_timeout,
            "token balance",
            self.indexer.token_balance(&self.pool_address, &self.token_id),
        )
        .await
        {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Token balance unavailable, resyncing base only: {}", e);
                None
            }
        };

        let (base, token) = self.reserves.update(|state| {
            state.base_balance = history.balance;
            if let Some(balance) = token_balance {
                state.token_balance = balance;
            }
            (state.base_balance, state.token_balance)
        });

        debug!("🔍 No new transactions, resynced to {} BCH, {} tokens", base, token);
    }

    fn persist(&self) {
        match self.store.save(&self.reserves.snapshot()) {
            Ok(()) => debug!("💾 Periodic state save complete"),
            Err(e) => error!("Periodic state save failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TransferDetail;
    use crate::state::{ReserveState, StateStore};
    use crate::testing::{settings, Harness, LedgerCall, MemoryStore, TOKEN};
    use rust_decimal_macros::dec;

    fn reconciler(h: &Harness) -> ReconciliationLoop {
        ReconciliationLoop::new(
            &h.settings,
            h.indexer.clone(),
            h.processor.clone(),
            Arc::new(SettlementQueue::start()),
            h.reserves.clone(),
            h.store_adapter.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_new_events_resyncs_without_saving() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.indexer.set_balance(dec!(100.5));
        h.indexer.set_token_balance(dec!(995000));
        h.reserves.update(|state| state.mark_seen("old"));
        h.indexer.push_history(&["old"]);

        let reconciler = reconciler(&h);
        let report = reconciler.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(h.reserves.balances(), (dec!(100.5), dec!(995000)));
        assert_eq!(h.store.saves(), 0);
        assert_eq!(*reconciler.phases().borrow(), LoopPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_settle_sequentially_with_propagation_delay() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.ledger.observe(h.reserves.clone());
        h.indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));
        h.indexer
            .receive("buy-2", TransferDetail::base(dec!(1), "bitcoincash:qbob"));

        let reconciler = reconciler(&h);
        let started = Instant::now();
        let report = reconciler.run_cycle().await.unwrap();

        assert_eq!(report.settled, 2);
        assert!(started.elapsed() >= h.settings.propagation_delay * 2);

        // the second buy is priced after the first has been applied
        assert_eq!(
            h.ledger.observed(),
            vec![(dec!(100), dec!(1000000)), (dec!(101), dec!(990000))]
        );
        let second = match &h.ledger.calls()[1] {
            LedgerCall::Token { quantity, .. } => *quantity,
            other => panic!("expected token payout, got {:?}", other),
        };
        assert!(second < dec!(10000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_op_settlement_skips_propagation_delay() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.indexer.receive("mystery", TransferDetail::unknown());

        let reconciler = reconciler(&h);
        let started = Instant::now();
        let report = reconciler.run_cycle().await.unwrap();

        assert_eq!(report.settled, 1);
        assert!(started.elapsed() < h.settings.propagation_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failed_event_does_not_stop_the_batch() {
        let h = Harness::new(dec!(100), dec!(1000000));
        // never indexed: detail lookups keep failing
        h.indexer.push_history(&["ghost"]);
        h.indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));
        h.indexer.receive(
            "sell-big",
            TransferDetail::token(TOKEN, dec!(5000000), "simpleledger:qwhale"),
        );

        let report = reconciler(&h).run_cycle().await.unwrap();

        assert_eq!(
            report,
            CycleReport {
                detected: 3,
                settled: 1,
                rejected: 1,
                failed: 1,
            }
        );
        assert!(!h.reserves.has_seen("ghost"));
        assert!(h.reserves.has_seen("buy-1"));
        assert!(h.reserves.has_seen("sell-big"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_transfers_are_not_redetected() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.ledger.echo_to(h.indexer.clone());
        h.indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));

        let reconciler = reconciler(&h);
        reconciler.run_cycle().await.unwrap();
        let second = reconciler.run_cycle().await.unwrap();

        assert_eq!(second.detected, 0);
        assert_eq!(h.ledger.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_settlement_is_retried_once_after_restart() {
        let store = Arc::new(MemoryStore::default());
        let initial = ReserveState::from_settings(&settings(), dec!(250));
        store.put(initial.clone());

        // first process: the wallet is down for the whole retry budget
        let first = Harness::with_state(settings(), initial, store.clone());
        first
            .indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));
        first.ledger.fail_next_sends(10);
        let report = reconciler(&first).run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);

        // restart from whatever was persisted
        let persisted = store.read_state().unwrap();
        assert!(!persisted.has_seen("buy-1"));
        let second = Harness::with_state(settings(), persisted, store.clone());
        second.ledger.echo_to(second.indexer.clone());
        second
            .indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));

        let reconciler = reconciler(&second);
        assert_eq!(reconciler.run_cycle().await.unwrap().settled, 1);
        assert_eq!(reconciler.run_cycle().await.unwrap().detected, 0);

        assert_eq!(
            second.ledger.calls(),
            vec![LedgerCall::token("bitcoincash:qalice", dec!(10000))]
        );
        assert!(store.read_state().unwrap().has_seen("buy-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_payout_is_not_sent_again_next_cycle() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.ledger.delay_acks(Duration::from_secs(60));
        h.indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));

        let reconciler = reconciler(&h);
        assert_eq!(reconciler.run_cycle().await.unwrap().failed, 1);
        assert_eq!(reconciler.run_cycle().await.unwrap().detected, 0);

        assert_eq!(h.ledger.calls().len(), 1);
        assert!(h.store.read_state().unwrap().pending_payouts.contains_key("buy-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_holds_poll_timer_while_settling() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.indexer
            .receive("buy-1", TransferDetail::base(dec!(1), "bitcoincash:qalice"));

        let reconciler = reconciler(&h);
        let phases = reconciler.phases();
        let task = tokio::spawn(reconciler.run());

        // first poll fires at once; the settlement then waits 300s to propagate
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(h.indexer.history_calls(), 1);
        assert_eq!(*phases.borrow(), LoopPhase::AwaitingPropagation);

        // the poll timer restarts when the cycle ends at 300s, so no catch-up ticks
        tokio::time::sleep(Duration::from_secs(210)).await;
        assert_eq!(h.indexer.history_calls(), 1);
        assert_eq!(*phases.borrow(), LoopPhase::Idle);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.indexer.history_calls(), 2);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_saves_on_persist_cadence() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.indexer.set_balance(dec!(100.25));

        let task = tokio::spawn(reconciler(&h).run());

        // idle cycles resync in memory only
        tokio::time::sleep(Duration::from_secs(590)).await;
        assert!(h.indexer.history_calls() >= 4);
        assert_eq!(h.store.saves(), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.store.saves(), 1);
        assert_eq!(h.store.read_state().unwrap().base_balance, dec!(100.25));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.store.saves(), 2);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_failure_returns_to_idle() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.indexer.fail_next_history(1);

        let reconciler = reconciler(&h);
        let result = reconciler.run_cycle().await;

        assert!(matches!(result, Err(AppError::TransientNetwork(_))));
        assert_eq!(*reconciler.phases().borrow(), LoopPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_state_adopts_existing_history() {
        let h = Harness::new(dec!(100), dec!(1000000));
        h.indexer.push_history(&["a", "b", "a"]);
        h.indexer.set_balance(dec!(104));
        h.indexer.set_token_balance(dec!(960000));

        let reconciler = reconciler(&h);
        assert_eq!(reconciler.adopt_existing_history().await.unwrap(), 2);

        assert_eq!(h.reserves.balances(), (dec!(104), dec!(960000)));
        assert!(h.store.read_state().unwrap().has_seen("b"));
        assert_eq!(reconciler.run_cycle().await.unwrap().detected, 0);
        assert!(h.ledger.calls().is_empty());
    }
}
