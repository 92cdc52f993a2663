use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use token_liquidity::bootstrap;
use token_liquidity::config::Settings;
use token_liquidity::reconciliation::maintenance;
use token_liquidity::reconciliation::ReconciliationLoop;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,token_liquidity=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting token liquidity pool");

    let settings = Settings::from_env().context("invalid configuration")?;
    info!(
        "Pool {} on {} for token {}",
        settings.pool_address, settings.network, settings.token_id
    );

    let app = bootstrap::initialize_app(settings).await?;

    let reconciler = ReconciliationLoop::new(
        &app.settings,
        app.indexer.clone(),
        app.processor.clone(),
        app.queue.clone(),
        app.reserves.clone(),
        app.store.clone(),
    );

    if app.fresh_state {
        reconciler
            .adopt_existing_history()
            .await
            .context("could not read existing pool history")?;
    }

    let timeout = app.settings.call_timeout;
    let _rate_refresh = maintenance::spawn_rate_refresh(
        app.rates.clone(),
        app.rate_source.clone(),
        app.settings.price_refresh_interval,
        timeout,
    );
    let _consolidation = maintenance::spawn_consolidation(
        app.queue.clone(),
        app.ledger.clone(),
        app.settings.consolidation_interval,
        timeout,
    );
    let _status = maintenance::spawn_status(
        app.store.clone(),
        app.curve,
        app.rates.clone(),
        app.settings.status_interval,
        app.settings.price_refresh_interval * 2,
    );
    info!("⏰ Maintenance timers started");

    tokio::select! {
        _ = reconciler.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("🛑 Shutdown requested, exiting");
        }
    }

    Ok(())
}
