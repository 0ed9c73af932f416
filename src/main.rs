//! Daemon entry point: wire the long-lived collaborators, register the
//! scheduler jobs and run until SIGTERM/Ctrl-C.
//!
//! The core is library-shaped; everything here is composition. The
//! exchange behind the orchestrator is the paper-trading implementation;
//! a live REST client plugs into the same `ExchangeClient` seam.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::sync::Mutex;

use hybrid_grid_bot::config::Config;
use hybrid_grid_bot::exchange::PaperExchange;
use hybrid_grid_bot::notify::Notifier;
use hybrid_grid_bot::orchestrator::mode_manager::{RegimeSnapshot, REGIME_STATE_KEY};
use hybrid_grid_bot::orchestrator::{HybridOrchestrator, OrchestratorDeps};
use hybrid_grid_bot::risk::{
    AllocationConstraints, CvarPositionSizer, PositionSizer, ReserveConstraints, StopLossExecutor,
    StopLossRegistry,
};
use hybrid_grid_bot::scheduler::{Scheduler, Trigger};
use hybrid_grid_bot::state::{decode_record, FileStore, KeyValueStore};
use hybrid_grid_bot::telemetry::{LogCategory, Telemetry};
use hybrid_grid_bot::util::{system_clock, ShutdownFlag};

#[derive(Parser, Debug)]
#[clap(name = "hybrid-grid-bot")]
#[clap(about = "Regime-adaptive grid trading daemon", long_about = None)]
struct Args {
    /// Configuration file (TOML). Defaults + env when omitted.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Cohort name (own state files, parallel orchestrator slots).
    #[clap(long)]
    cohort: Option<String>,

    /// Enable debug logging.
    #[clap(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();
    if args.debug {
        std::env::set_var("RUST_LOG", "debug");
    }
    hybrid_grid_bot::init_logging();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if args.cohort.is_some() {
        config.bot.cohort = args.cohort.clone();
    }

    info!(
        "🤖 {} v{} starting ({} mode)",
        hybrid_grid_bot::NAME,
        hybrid_grid_bot::VERSION,
        if config.bot.testnet { "testnet" } else { "mainnet" }
    );

    // ── Long-lived collaborators, constructed once and injected ─────
    let clock = system_clock();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&config.storage.state_dir));
    let telemetry = Arc::new(Telemetry::new(&config.storage.log_dir));
    let notifier = Arc::new(Notifier::new(
        config.telegram.token.clone(),
        config.telegram.chat_id.clone(),
    ));

    let exchange = Arc::new(PaperExchange::new(
        clock.clone(),
        config.trading.total_investment,
        &config.trading.quote_asset,
    ));

    let stops = Arc::new(
        StopLossRegistry::new(clock.clone(), Some(store.clone()))
            .with_max_daily_drawdown(config.risk.max_daily_drawdown_pct),
    );
    stops.load_active().await?;

    let stop_executor = Arc::new(StopLossExecutor::new(exchange.clone(), notifier.clone()));
    let sizer: Arc<dyn PositionSizer> = Arc::new(CvarPositionSizer::new(
        config.risk.cvar_risk_budget,
        config.risk.cvar_tail_loss,
    ));
    let constraints: Arc<dyn AllocationConstraints> =
        Arc::new(ReserveConstraints::new(config.risk.cash_reserve_pct));

    let orchestrator = HybridOrchestrator::new(
        config.clone(),
        OrchestratorDeps {
            client: exchange.clone(),
            stops: stops.clone(),
            stop_executor,
            store: store.clone(),
            notifier: notifier.clone(),
            telemetry: telemetry.clone(),
            clock: clock.clone(),
            sizer: Some(sizer),
            constraints: Some(constraints),
            scanner: None,
        },
    );
    let orchestrator = Arc::new(Mutex::new(orchestrator));
    orchestrator
        .lock()
        .await
        .load_state()
        .await
        .context("orchestrator state load failed")?;

    notifier
        .send(
            &format!(
                "🚀 Trading bot started\nMode: {}\nSymbols: {}",
                orchestrator.lock().await.current_mode(),
                config.trading.symbols.len()
            ),
            false,
        )
        .await;

    // ── Scheduler jobs ──────────────────────────────────────────────
    let shutdown = ShutdownFlag::new();
    let mut scheduler = Scheduler::new(clock.clone(), shutdown.clone());

    {
        let orchestrator = orchestrator.clone();
        scheduler.register("orchestrator_tick", Trigger::EveryMinutes(1), move || {
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator.lock().await.tick_guarded().await;
            }
        });
    }

    {
        let orchestrator = orchestrator.clone();
        let store = store.clone();
        scheduler.register("mode_evaluation", Trigger::EveryMinutes(60), move || {
            let orchestrator = orchestrator.clone();
            let store = store.clone();
            async move {
                let snapshot = match store.get(REGIME_STATE_KEY).await {
                    Ok(Some(bytes)) => match decode_record::<RegimeSnapshot>(&bytes) {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            warn!("Unreadable regime snapshot: {e}");
                            return;
                        }
                    },
                    Ok(None) => return,
                    Err(e) => {
                        warn!("Regime snapshot read failed: {e}");
                        return;
                    }
                };
                orchestrator
                    .lock()
                    .await
                    .evaluate_and_switch(
                        Some(snapshot.regime),
                        snapshot.probability,
                        snapshot.duration_days,
                    )
                    .await;
            }
        });
    }

    {
        let orchestrator = orchestrator.clone();
        scheduler.register("hybrid_rebalance", Trigger::EveryMinutes(360), move || {
            let orchestrator = orchestrator.clone();
            async move {
                let adjustments = orchestrator.lock().await.rebalance().await;
                if !adjustments.is_empty() {
                    info!("Rebalance proposed {} adjustments", adjustments.len());
                }
            }
        });
    }

    {
        let stops = stops.clone();
        let exchange = exchange.clone();
        let quote_asset = config.trading.quote_asset.clone();
        scheduler.register(
            "reset_daily_drawdown",
            Trigger::DailyAt { hour: 0, minute: 0 },
            move || {
                let stops = stops.clone();
                let exchange = exchange.clone();
                let quote_asset = quote_asset.clone();
                async move {
                    use hybrid_grid_bot::exchange::ExchangeClient;
                    if let Ok(value) = exchange.get_account_balance(&quote_asset).await {
                        stops.reset_daily(value);
                        info!("Daily drawdown baseline reset: {value:.2}");
                    }
                }
            },
        );
    }

    {
        let orchestrator = orchestrator.clone();
        let telemetry = telemetry.clone();
        let exchange = exchange.clone();
        scheduler.register(
            "portfolio_snapshot",
            Trigger::DailyAt { hour: 20, minute: 0 },
            move || {
                let orchestrator = orchestrator.clone();
                let telemetry = telemetry.clone();
                let exchange = exchange.clone();
                async move {
                    use hybrid_grid_bot::exchange::ExchangeClient;
                    let orchestrator = orchestrator.lock().await;
                    let mut symbols = Vec::new();
                    for s in orchestrator.symbols() {
                        let ticker = exchange.get_24h_ticker(&s.symbol).await.ok();
                        symbols.push(serde_json::json!({
                            "symbol": s.symbol,
                            "mode": s.mode.to_string(),
                            "allocation_usd": s.allocation_usd,
                            "hold_quantity": s.hold_quantity,
                            "last_price": ticker.as_ref().map(|t| t.last_price),
                            "change_24h_pct": ticker.map(|t| t.price_change_percent),
                        }));
                    }
                    telemetry.log(
                        LogCategory::Performance,
                        serde_json::json!({
                            "mode": orchestrator.current_mode().to_string(),
                            "symbols": symbols,
                        }),
                    );
                }
            },
        );
    }

    {
        let store = store.clone();
        let clock = clock.clone();
        scheduler.register("heartbeat", Trigger::EveryMinutes(1), move || {
            let store = store.clone();
            let clock = clock.clone();
            async move {
                let stamp = clock.now_utc().to_rfc3339();
                if let Err(e) = store.put("heartbeat", stamp.into_bytes()).await {
                    warn!("Heartbeat write failed: {e}");
                }
            }
        });
    }

    // ── Shutdown handling ───────────────────────────────────────────
    spawn_signal_handler(shutdown.clone());

    scheduler.run().await;

    // One final save after the loop exits.
    let mut orchestrator = orchestrator.lock().await;
    orchestrator.stop();
    orchestrator.save_state().await;
    notifier.send("🛑 Trading bot stopped", false).await;
    info!("Shutdown complete");
    Ok(())
}

fn spawn_signal_handler(shutdown: ShutdownFlag) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler");
            tokio::select! {
                _ = ctrl_c => info!("Ctrl-C received, shutting down..."),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Ctrl-C received, shutting down...");
        }
        shutdown.trigger();
    });
}
