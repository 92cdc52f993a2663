// In-memory collaborators for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{AddressHistory, ChainIndexer, LedgerClient, TransferDetail};
use crate::config::{Network, Settings};
use crate::error::{AppError, AppResult};
use crate::pricing::{BondingCurve, RateCell};
use crate::settlement::{ProcessorConfig, RetryPolicy, SettlementProcessor};
use crate::state::{ReserveState, SharedReserves, StateStore, StateStoreAdapter};

pub const POOL: &str = "bitcoincash:qpool";
pub const TOKEN: &str = "38e97c5d7d3585a2cbf3f9580c82ca33985f9cb0845d4dcce220cb709f9538b0";

/// Anchored at 100 BCH / 1M tokens, with timers short enough for paused-clock tests
pub fn settings() -> Settings {
    Settings {
        pool_address: POOL.to_string(),
        token_id: TOKEN.to_string(),
        initial_base_balance: dec!(100),
        initial_token_balance: dec!(1000000),
        network: Network::Testnet,
        poll_interval: Duration::from_secs(120),
        propagation_delay: Duration::from_secs(300),
        consolidation_interval: Duration::from_secs(6000),
        price_refresh_interval: Duration::from_secs(300),
        status_interval: Duration::from_secs(3600),
        persist_interval: Duration::from_secs(600),
        call_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        refund_fee: dec!(0.00001),
        dust_threshold: dec!(0.00001),
        token_decimals: 8,
        state_file: PathBuf::from("state.json"),
        indexer_url: "http://indexer.test".to_string(),
        wallet_rpc_url: "http://wallet.test".to_string(),
        rate_feed_url: "http://rates.test".to_string(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<ReserveState>>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn put(&self, state: ReserveState) {
        *self.state.lock() = Some(state);
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock()
    }
}

impl StateStore for MemoryStore {
    fn read_state(&self) -> AppResult<ReserveState> {
        self.state
            .lock()
            .clone()
            .ok_or_else(|| AppError::StateUnavailable("no state stored".to_string()))
    }

    fn write_state(&self, state: &ReserveState) -> AppResult<()> {
        *self.state.lock() = Some(state.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[derive(Default)]
struct IndexerState {
    balance: Decimal,
    history: Vec<String>,
    details: HashMap<String, TransferDetail>,
    token_balance: Decimal,
    history_failures: u32,
    detail_failures: u32,
    history_calls: u32,
}

/// Scriptable indexer. Failures are transient network errors.
#[derive(Default)]
pub struct FakeIndexer {
    state: Mutex<IndexerState>,
}

impl FakeIndexer {
    pub fn new(balance: Decimal) -> Self {
        let indexer = Self::default();
        indexer.state.lock().balance = balance;
        indexer
    }

    pub fn push_history(&self, txids: &[&str]) {
        let mut state = self.state.lock();
        state.history.extend(txids.iter().map(|t| t.to_string()));
    }

    /// Register a transfer and append it to the address history
    pub fn receive(&self, txid: &str, detail: TransferDetail) {
        let mut state = self.state.lock();
        state.history.push(txid.to_string());
        state.details.insert(txid.to_string(), detail);
    }

    pub fn set_detail(&self, txid: &str, detail: TransferDetail) {
        self.state.lock().details.insert(txid.to_string(), detail);
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state.lock().balance = balance;
    }

    pub fn set_token_balance(&self, balance: Decimal) {
        self.state.lock().token_balance = balance;
    }

    pub fn fail_next_history(&self, count: u32) {
        self.state.lock().history_failures = count;
    }

    pub fn history_calls(&self) -> u32 {
        self.state.lock().history_calls
    }

    pub fn fail_next_details(&self, count: u32) {
        self.state.lock().detail_failures = count;
    }
}

#[async_trait]
impl ChainIndexer for FakeIndexer {
    async fn address_history(&self, _address: &str) -> AppResult<AddressHistory> {
        let mut state = self.state.lock();
        state.history_calls += 1;
        if state.history_failures > 0 {
            state.history_failures -= 1;
            return Err(AppError::TransientNetwork("indexer unreachable".to_string()));
        }
        Ok(AddressHistory {
            balance: state.balance,
            transaction_ids: state.history.clone(),
        })
    }

    async fn transaction_detail(&self, txid: &str) -> AppResult<TransferDetail> {
        let mut state = self.state.lock();
        if state.detail_failures > 0 {
            state.detail_failures -= 1;
            return Err(AppError::TransientNetwork("indexer unreachable".to_string()));
        }
        state
            .details
            .get(txid)
            .cloned()
            .ok_or_else(|| AppError::TransientNetwork(format!("{} not indexed yet", txid)))
    }

    async fn token_balance(&self, _address: &str, _token_id: &str) -> AppResult<Decimal> {
        Ok(self.state.lock().token_balance)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerCall {
    Base { to: String, amount: Decimal },
    Token { to: String, token_id: String, quantity: Decimal },
}

impl LedgerCall {
    pub fn base(to: &str, amount: Decimal) -> Self {
        LedgerCall::Base {
            to: to.to_string(),
            amount,
        }
    }

    pub fn token(to: &str, quantity: Decimal) -> Self {
        LedgerCall::Token {
            to: to.to_string(),
            token_id: TOKEN.to_string(),
            quantity,
        }
    }
}

#[derive(Default)]
struct LedgerState {
    calls: Vec<LedgerCall>,
    observed: Vec<(Decimal, Decimal)>,
    send_failures: u32,
    lost_acks: u32,
    ack_delay: Option<Duration>,
    consolidations: u32,
    next_txid: u32,
}

/// Records every write. Optionally echoes sends into an indexer's history
/// and captures the reserves visible at the moment of each send.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
    echo: Mutex<Option<Arc<FakeIndexer>>>,
    observe: Mutex<Option<SharedReserves>>,
}

impl FakeLedger {
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state.lock().calls.clone()
    }

    pub fn base_sent(&self) -> Decimal {
        self.state
            .lock()
            .calls
            .iter()
            .map(|call| match call {
                LedgerCall::Base { amount, .. } => *amount,
                LedgerCall::Token { .. } => Decimal::ZERO,
            })
            .sum()
    }

    /// (base, token) reserves at the time of each send, in call order
    pub fn observed(&self) -> Vec<(Decimal, Decimal)> {
        self.state.lock().observed.clone()
    }

    pub fn consolidations(&self) -> u32 {
        self.state.lock().consolidations
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().send_failures = count;
    }

    /// Sends are broadcast, but the reply takes `delay`
    pub fn delay_acks(&self, delay: Duration) {
        self.state.lock().ack_delay = Some(delay);
    }

    /// Sends are broadcast, but the reply never arrives
    pub fn lose_next_acks(&self, count: u32) {
        self.state.lock().lost_acks = count;
    }

    pub fn echo_to(&self, indexer: Arc<FakeIndexer>) {
        *self.echo.lock() = Some(indexer);
    }

    pub fn observe(&self, reserves: SharedReserves) {
        *self.observe.lock() = Some(reserves);
    }

    fn record(&self, call: LedgerCall) -> AppResult<String> {
        let observed = self.observe.lock().as_ref().map(|r| r.balances());

        let txid = {
            let mut state = self.state.lock();
            if state.send_failures > 0 {
                state.send_failures -= 1;
                return Err(AppError::LedgerUnavailable("wallet offline".to_string()));
            }
            state.next_txid += 1;
            state.calls.push(call);
            if let Some(balances) = observed {
                state.observed.push(balances);
            }
            format!("settle-{}", state.next_txid)
        };

        if let Some(indexer) = self.echo.lock().as_ref() {
            indexer.receive(&txid, TransferDetail::base(Decimal::ZERO, POOL));
        }
        Ok(txid)
    }

    async fn send(&self, call: LedgerCall) -> AppResult<String> {
        let txid = self.record(call)?;

        let (delay, lost) = {
            let mut state = self.state.lock();
            let lost = state.lost_acks > 0;
            if lost {
                state.lost_acks -= 1;
            }
            (state.ack_delay, lost)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lost {
            return Err(AppError::LedgerAmbiguous(format!(
                "acknowledgement for {} lost",
                txid
            )));
        }
        Ok(txid)
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn balance(&self, _address: &str) -> AppResult<Decimal> {
        Ok(Decimal::ZERO)
    }

    async fn send_base(&self, to_address: &str, amount: Decimal) -> AppResult<String> {
        self.send(LedgerCall::base(to_address, amount)).await
    }

    async fn send_token(
        &self,
        to_address: &str,
        token_id: &str,
        quantity: Decimal,
    ) -> AppResult<String> {
        self.send(LedgerCall::Token {
            to: to_address.to_string(),
            token_id: token_id.to_string(),
            quantity,
        })
        .await
    }

    async fn consolidate_spendable_units(&self) -> AppResult<()> {
        self.state.lock().consolidations += 1;
        Ok(())
    }
}

/// A processor wired to fakes, starting at the given reserves
pub struct Harness {
    pub settings: Settings,
    pub indexer: Arc<FakeIndexer>,
    pub ledger: Arc<FakeLedger>,
    pub store: Arc<MemoryStore>,
    pub store_adapter: StateStoreAdapter,
    pub reserves: SharedReserves,
    pub rates: RateCell,
    pub curve: BondingCurve,
    pub processor: Arc<SettlementProcessor>,
}

impl Harness {
    pub fn new(base_balance: Decimal, token_balance: Decimal) -> Self {
        let settings = settings();
        let mut state = ReserveState::from_settings(&settings, dec!(250));
        state.base_balance = base_balance;
        state.token_balance = token_balance;
        Self::with_state(settings, state, Arc::new(MemoryStore::default()))
    }

    pub fn with_state(settings: Settings, state: ReserveState, store: Arc<MemoryStore>) -> Self {
        let indexer = Arc::new(FakeIndexer::new(state.base_balance));
        let ledger = Arc::new(FakeLedger::default());
        let store_adapter = StateStoreAdapter::new(store.clone());
        let rates = RateCell::new(state.usd_per_base);
        let curve = BondingCurve::new(state.initial_base_balance, state.initial_token_balance)
            .map(|c| c.with_token_decimals(settings.token_decimals))
            .unwrap();
        let reserves = SharedReserves::new(state);

        let processor = Arc::new(SettlementProcessor::new(
            ProcessorConfig::from_settings(&settings),
            indexer.clone(),
            ledger.clone(),
            curve,
            reserves.clone(),
            store_adapter.clone(),
            rates.clone(),
        ));

        Self {
            settings,
            indexer,
            ledger,
            store,
            store_adapter,
            reserves,
            rates,
            curve,
            processor,
        }
    }
}
