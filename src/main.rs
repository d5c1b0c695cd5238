use anyhow::Context;
use spotmatch::balance_store::BalanceStore;
use spotmatch::config::AppConfig;
use spotmatch::engine::{EngineConfig, EngineService, ServiceConfig};
use spotmatch::funding::FundingService;
use spotmatch::logging;
use spotmatch::persistence;
use spotmatch::publisher::EventPublisher;
use spotmatch::store::{OrderStore, TradeStore};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = std::env::var("SPM_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = AppConfig::load(&env)?;
    let _log_guard = logging::init_logging(&config);
    tracing::info!(env = %env, "spotmatch starting");

    let registry = Arc::new(config.build_registry()?);
    let balances = Arc::new(BalanceStore::new(config.engine.fee_account));
    let orders = Arc::new(OrderStore::new());
    let trades = Arc::new(TradeStore::new());
    let publisher = Arc::new(EventPublisher::new(
        config.publisher.subscriber_queue_capacity,
        Duration::from_secs(config.publisher.heartbeat_interval_secs),
    ));
    tokio::spawn(publisher.clone().run_heartbeat());

    // With a database configured, every order/trade/balance change the
    // engine makes is mirrored into the relational schema
    let mirror = match &config.postgres_url {
        Some(url) => {
            let db = persistence::Database::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            persistence::schema::init_schema(db.pool())
                .await
                .context("Failed to initialise relational schema")?;
            Some(Arc::new(persistence::Mirror::new(
                db.pool().clone(),
                registry.clone(),
                balances.clone(),
            )))
        }
        None => None,
    };

    let service_cfg = ServiceConfig {
        queue_capacity: config.engine.queue_capacity,
        submit_timeout: Duration::from_millis(config.engine.submit_timeout_ms),
        shutdown_grace: Duration::from_millis(config.engine.shutdown_grace_ms),
        engine: EngineConfig {
            market_slippage_permille: config.engine.market_slippage_permille,
            depth_levels: config.engine.depth_levels,
        },
    };
    let service = EngineService::start(
        registry,
        balances.clone(),
        orders,
        trades,
        publisher,
        mirror.clone(),
        service_cfg,
    );
    let _funding = FundingService::new(balances, mirror);
    let fatal = service.fatal_flag();

    tracing::info!("engine running, waiting for shutdown signal");
    shutdown_signal().await;

    tracing::info!("shutdown signal received, draining symbol workers");
    service.shutdown().await;

    if fatal.load(Ordering::SeqCst) {
        tracing::error!("exiting after fatal invariant violation");
        std::process::exit(1);
    }
    tracing::info!("spotmatch stopped");
    Ok(())
}

/// Resolve on SIGTERM or ctrl-c; either triggers a graceful drain.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
