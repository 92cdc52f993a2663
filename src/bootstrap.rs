use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{ChainIndexer, HttpIndexer, LedgerClient, WalletRpcClient};
use crate::config::Settings;
use crate::error::AppResult;
use crate::pricing::{BondingCurve, CoinbaseRateFeed, RateCell, RateSource};
use crate::settlement::retry::bounded;
use crate::settlement::{ProcessorConfig, SettlementProcessor, SettlementQueue};
use crate::state::{JsonFileStore, SharedReserves, StateStore, StateStoreAdapter};

/// Everything the binary wires together
pub struct App {
    pub settings: Settings,
    pub indexer: Arc<dyn ChainIndexer>,
    pub ledger: Arc<dyn LedgerClient>,
    pub rate_source: Arc<dyn RateSource>,
    pub rates: RateCell,
    pub curve: BondingCurve,
    pub reserves: SharedReserves,
    pub store: StateStoreAdapter,
    pub queue: Arc<SettlementQueue>,
    pub processor: Arc<SettlementProcessor>,
    /// No usable persisted state was found
    pub fresh_state: bool,
}

pub async fn initialize_app(settings: Settings) -> AppResult<App> {
    info!("Initializing application components ...");

    let indexer = Arc::new(HttpIndexer::new(&settings.indexer_url, settings.call_timeout)?);
    info!("✅ Indexer client initialized: {}", settings.indexer_url);

    let ledger = Arc::new(WalletRpcClient::new(
        &settings.wallet_rpc_url,
        settings.call_timeout,
    )?);
    info!("✅ Wallet RPC client initialized: {}", settings.wallet_rpc_url);

    let rate_source = Arc::new(CoinbaseRateFeed::new(
        &settings.rate_feed_url,
        settings.call_timeout,
    )?);

    let store = Arc::new(JsonFileStore::new(settings.state_file.clone()));
    info!("✅ State file: {}", store.path().display());

    assemble(settings, indexer, ledger, rate_source, store).await
}

/// Load state and build the settlement pipeline over the given collaborators
pub async fn assemble(
    settings: Settings,
    indexer: Arc<dyn ChainIndexer>,
    ledger: Arc<dyn LedgerClient>,
    rate_source: Arc<dyn RateSource>,
    store: Arc<dyn StateStore>,
) -> AppResult<App> {
    let fetched = settings
        .retry
        .run("exchange rate", || {
            bounded(settings.call_timeout, "exchange rate", rate_source.usd_per_base())
        })
        .await;

    let store = StateStoreAdapter::new(store);
    let (mut state, fresh_state) = store.load_or_initialize(
        &settings,
        fetched.as_ref().ok().copied().unwrap_or(Decimal::ZERO),
    );

    match fetched {
        Ok(rate) => state.usd_per_base = rate,
        // a fresh pool has no last-known rate to fall back on
        Err(e) if fresh_state => return Err(e),
        Err(e) => warn!(
            "⚠️  Exchange rate unavailable ({}), using last persisted rate ${}",
            e, state.usd_per_base
        ),
    }

    let curve = BondingCurve::new(state.initial_base_balance, state.initial_token_balance)?
        .with_token_decimals(settings.token_decimals);
    let rates = RateCell::new(state.usd_per_base);

    let market_cap = state.usd_per_base * state.base_balance;
    info!("💰 Market cap of BCH controlled by the pool: ${}", market_cap);
    info!(
        "💱 Token spot price: ${} ({} BCH held, {} tokens held)",
        curve.spot_price(state.base_balance, state.usd_per_base),
        state.base_balance,
        state.token_balance
    );

    let reserves = SharedReserves::new(state);
    let queue = Arc::new(SettlementQueue::start());

    let processor = Arc::new(SettlementProcessor::new(
        ProcessorConfig::from_settings(&settings),
        indexer.clone(),
        ledger.clone(),
        curve,
        reserves.clone(),
        store.clone(),
        rates.clone(),
    ));

    info!("✅ Settlement pipeline ready");

    Ok(App {
        settings,
        indexer,
        ledger,
        rate_source,
        rates,
        curve,
        reserves,
        store,
        queue,
        processor,
        fresh_state,
    })
}
