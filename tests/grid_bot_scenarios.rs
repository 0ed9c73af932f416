//! End-to-end scenarios against the paper exchange: fills, partial
//! fills, downtime recovery, circuit breaker, mode transitions and
//! stop-loss execution.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::TempDir;

use hybrid_grid_bot::bots::{
    GridBot, GridBotConfig, GridBotDeps, LoadOutcome, ReconciliationService, TickOutcome,
};
use hybrid_grid_bot::config::{Config, SymbolAllocation};
use hybrid_grid_bot::exchange::{
    ExchangeClient, ExchangeError, OrderSide, PaperExchange, SymbolInfo,
};
use hybrid_grid_bot::notify::Notifier;
use hybrid_grid_bot::orchestrator::{
    HybridOrchestrator, OrchestratorDeps, Regime, TradingMode,
};
use hybrid_grid_bot::risk::{StopLossExecutor, StopLossRegistry, StopParams, StopType};
use hybrid_grid_bot::state::{FileStore, KeyValueStore};
use hybrid_grid_bot::telemetry::Telemetry;
use hybrid_grid_bot::util::{system_clock, Clock, ManualClock, SharedClock};

fn btc_info() -> SymbolInfo {
    SymbolInfo {
        symbol: "BTCUSDT".into(),
        base_asset: "BTC".into(),
        quote_asset: "USDT".into(),
        min_qty: dec!(0.00001),
        step_size: dec!(0.00001),
        min_notional: dec!(10),
        tick_size: dec!(0.01),
    }
}

struct Harness {
    exchange: Arc<PaperExchange>,
    stops: Arc<StopLossRegistry>,
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    notifier: Arc<Notifier>,
    telemetry: Arc<Telemetry>,
    _state_dir: TempDir,
    _log_dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_clock(system_clock())
    }

    fn with_clock(clock: SharedClock) -> Self {
        let exchange = Arc::new(PaperExchange::new(clock.clone(), dec!(10000), "USDT"));
        exchange.register_symbol(btc_info());
        exchange.set_price("BTCUSDT", dec!(50000));
        // Grid accounts hold some base inventory so SELL follow-ups clear.
        exchange.deposit("BTC", dec!(0.05));

        let state_dir = TempDir::new().unwrap();
        let log_dir = TempDir::new().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(state_dir.path()));
        let stops = Arc::new(StopLossRegistry::new(clock.clone(), Some(store.clone())));
        let notifier = Arc::new(Notifier::disabled());
        let telemetry = Arc::new(Telemetry::new(log_dir.path()));

        Self {
            exchange,
            stops,
            store,
            clock,
            notifier,
            telemetry,
            _state_dir: state_dir,
            _log_dir: log_dir,
        }
    }

    fn deps(&self) -> GridBotDeps {
        GridBotDeps {
            client: self.exchange.clone(),
            stops: self.stops.clone(),
            stop_executor: Arc::new(StopLossExecutor::new(
                self.exchange.clone(),
                self.notifier.clone(),
            )),
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            telemetry: self.telemetry.clone(),
            clock: self.clock.clone(),
            sizer: None,
            constraints: None,
        }
    }

    /// Grid over 48000..52000 with levels every 1000.
    fn bot_config(&self) -> GridBotConfig {
        GridBotConfig {
            symbol: "BTCUSDT".into(),
            investment: dec!(400),
            num_grids: 4,
            grid_range_percent: dec!(4),
            testnet: true,
            stop_loss_pct: Some(dec!(5)),
            circuit_breaker_pct: Some(dec!(10)),
            skip_portfolio_drawdown: true,
            state_key: None,
        }
    }

    async fn bring_up_bot(&self) -> GridBot {
        let mut bot = GridBot::new(self.bot_config(), self.deps());
        ReconciliationService::bring_up(&mut bot).await.unwrap();
        bot
    }

    fn find_order_at(&self, bot: &GridBot, price: Decimal) -> String {
        bot.active_orders()
            .iter()
            .find(|(_, o)| o.price == price)
            .map(|(id, _)| id.clone())
            .expect("order at price")
    }
}

#[tokio::test]
async fn happy_path_single_fill_places_follow_up_sell() {
    let h = Harness::new();
    let mut bot = h.bring_up_bot().await;

    // BUY ladder below 50000: 48000 and 49000.
    assert_eq!(bot.active_orders().len(), 2);
    let buy_49000 = h.find_order_at(&bot, dec!(49000));
    let qty_49000 = bot.active_orders()[&buy_49000].quantity;

    // The exchange fills the 49000 BUY; price eases to 49500.
    h.exchange.force_fill(&buy_49000);
    h.exchange.set_price("BTCUSDT", dec!(49500));

    assert_eq!(bot.tick().await.unwrap(), TickOutcome::Continue);

    // The filled BUY is swapped for a SELL one level up at equal quantity.
    assert!(!bot.active_orders().contains_key(&buy_49000));
    let sell = bot
        .active_orders()
        .values()
        .find(|o| o.side == OrderSide::Sell)
        .expect("follow-up sell");
    assert_eq!(sell.price, dec!(50000));
    assert_eq!(sell.quantity, qty_49000);

    // A trailing stop protects the bought inventory.
    let stops = h.stops.active_stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].entry_price, dec!(49000));
    assert_eq!(stops[0].stop_type, StopType::Trailing);

    // Trade journaled as a BUY at 49000.
    let trade_log =
        std::fs::read_to_string(h.telemetry.dir().join("trade.log")).unwrap();
    assert!(trade_log.contains("\"action\":\"BUY\""));
    assert!(trade_log.contains("49000"));
}

#[tokio::test]
async fn partial_fill_then_cancel_creates_stop_but_no_follow_up() {
    let h = Harness::new();
    let mut bot = h.bring_up_bot().await;

    let buy_48000 = h.find_order_at(&bot, dec!(48000));
    let full_qty = bot.active_orders()[&buy_48000].quantity;
    let partial_qty = full_qty / dec!(2);

    // Exchange cancels the order after a partial fill.
    h.exchange.force_cancel(&buy_48000, partial_qty);
    h.exchange.set_price("BTCUSDT", dec!(49800));

    assert_eq!(bot.tick().await.unwrap(), TickOutcome::Continue);

    // Order removed, no SELL placed for the partial.
    assert!(!bot.active_orders().contains_key(&buy_48000));
    assert!(bot
        .active_orders()
        .values()
        .all(|o| o.side == OrderSide::Buy));

    // Stop quantity is the filled portion after the taker fee.
    let stops = h.stops.active_stops();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].quantity, partial_qty * dec!(0.999));

    let trade_log =
        std::fs::read_to_string(h.telemetry.dir().join("trade.log")).unwrap();
    assert!(trade_log.contains("partial fill"));
}

#[tokio::test]
async fn downtime_fill_is_recovered_on_boot() {
    let h = Harness::new();

    // First process: grid up, then the process "dies".
    let bot = h.bring_up_bot().await;
    let buy_49000 = h.find_order_at(&bot, dec!(49000));
    drop(bot);

    // The order fills while no process is running.
    h.exchange.force_fill(&buy_49000);

    // Second process: boot reconciliation discovers the fill, protects it
    // and places the queued follow-up.
    let mut restored = GridBot::new(h.bot_config(), h.deps());
    let outcome = ReconciliationService::bring_up(&mut restored).await.unwrap();
    assert_eq!(outcome, LoadOutcome::Restored);

    let sells: Vec<_> = restored
        .active_orders()
        .values()
        .filter(|o| o.side == OrderSide::Sell)
        .collect();
    assert_eq!(sells.len(), 1);
    assert_eq!(sells[0].price, dec!(50000));

    // The surviving 48000 BUY is still tracked.
    assert!(restored
        .active_orders()
        .values()
        .any(|o| o.side == OrderSide::Buy && o.price == dec!(48000)));

    // Stop created for the downtime BUY.
    assert_eq!(h.stops.active_stops().len(), 1);
}

#[tokio::test]
async fn changed_config_discards_state_and_cancels_orphans() {
    let h = Harness::new();
    let bot = h.bring_up_bot().await;
    assert_eq!(bot.active_orders().len(), 2);
    drop(bot);

    // Same symbol, different investment: persisted state is stale.
    let mut config = h.bot_config();
    config.investment = dec!(300);
    let mut bot = GridBot::new(config, h.deps());
    let outcome = ReconciliationService::bring_up(&mut bot).await.unwrap();
    assert_eq!(outcome, LoadOutcome::Fresh);

    // The stale orders were cancelled before the new ladder went out, so
    // everything open belongs to the new bot.
    let open = h.exchange.get_open_orders("BTCUSDT").await.unwrap();
    assert_eq!(open.len(), bot.active_orders().len());
    for order in open {
        assert!(bot.active_orders().contains_key(&order.order_id));
    }
}

#[tokio::test]
async fn flash_crash_trips_circuit_breaker() {
    let h = Harness::new();
    let mut bot = h.bring_up_bot().await;
    assert!(bot.is_running());

    // -11% in one observation.
    h.exchange.set_price("BTCUSDT", dec!(44500));
    assert_eq!(bot.tick().await.unwrap(), TickOutcome::Stop);
    assert!(!bot.is_running());

    // Final state save happened.
    let saved = h.store.get("bot_state_BTCUSDT.json").await.unwrap();
    assert!(saved.is_some());
}

#[tokio::test]
async fn unavailable_price_stops_after_three_ticks() {
    let h = Harness::new();
    let mut bot = h.bring_up_bot().await;

    h.exchange.clear_price("BTCUSDT");
    assert_eq!(bot.tick().await.unwrap(), TickOutcome::Continue);
    assert_eq!(bot.tick().await.unwrap(), TickOutcome::Continue);
    assert_eq!(bot.tick().await.unwrap(), TickOutcome::Stop);
    assert!(!bot.is_running());
}

#[tokio::test]
async fn failed_follow_up_retries_after_backoff() {
    use chrono::TimeZone;
    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let h = Harness::with_clock(clock.clone());
    let mut bot = h.bring_up_bot().await;

    let buy_49000 = h.find_order_at(&bot, dec!(49000));
    h.exchange.force_fill(&buy_49000);
    h.exchange.set_price("BTCUSDT", dec!(49500));
    // The follow-up SELL placement bounces off the venue.
    h.exchange
        .inject_limit_order_error(ExchangeError::Transient("matching engine busy".into()));

    bot.tick().await.unwrap();

    // The record stays, flagged for retry with the first backoff step.
    let record = &bot.active_orders()[&buy_49000];
    let failed = record.failed_followup.as_ref().expect("failed follow-up");
    assert_eq!(failed.retry_count, 1);
    assert_eq!(
        failed.next_retry_at,
        clock.now_utc() + chrono::Duration::minutes(2)
    );

    // Next tick is before the backoff elapses: nothing happens.
    bot.tick().await.unwrap();
    assert!(bot.active_orders()[&buy_49000].failed_followup.is_some());

    // Past the backoff the retry goes through and the record is swapped.
    clock.advance(chrono::Duration::minutes(3));
    bot.tick().await.unwrap();
    assert!(!bot.active_orders().contains_key(&buy_49000));
    assert!(bot
        .active_orders()
        .values()
        .any(|o| o.side == OrderSide::Sell && o.price == dec!(50000)));
}

#[tokio::test]
async fn halted_portfolio_blocks_follow_ups() {
    let h = Harness::new();
    let mut bot = h.bring_up_bot().await;
    let orders_before = bot.active_orders().len();

    // Trip the daily drawdown guard: baseline, then -11%.
    h.stops.check_portfolio_drawdown(dec!(10000));
    let (halted, _) = h.stops.check_portfolio_drawdown(dec!(8900));
    assert!(halted);

    // A fill arrives, but the follow-up is vetoed by the risk gate.
    let buy_49000 = h.find_order_at(&bot, dec!(49000));
    h.exchange.force_fill(&buy_49000);
    h.exchange.set_price("BTCUSDT", dec!(49500));
    bot.tick().await.unwrap();

    assert!(!bot.active_orders().contains_key(&buy_49000));
    assert!(bot
        .active_orders()
        .values()
        .all(|o| o.side == OrderSide::Buy));
    assert_eq!(bot.active_orders().len(), orders_before - 1);
}

fn orchestrator_config() -> Config {
    let mut config = Config::from_env().unwrap();
    config.trading.total_investment = dec!(10000);
    config.trading.num_grids = 4;
    config.trading.grid_range_percent = dec!(4);
    config.trading.symbols = vec![SymbolAllocation {
        symbol: "BTCUSDT".into(),
        allocation_usd: dec!(400),
    }];
    config
}

#[tokio::test]
async fn grid_to_cash_transition_cancels_orders_without_selling() {
    let h = Harness::new();
    let mut orchestrator = HybridOrchestrator::new(
        orchestrator_config(),
        OrchestratorDeps {
            client: h.exchange.clone(),
            stops: h.stops.clone(),
            stop_executor: Arc::new(StopLossExecutor::new(
                h.exchange.clone(),
                h.notifier.clone(),
            )),
            store: h.store.clone(),
            notifier: h.notifier.clone(),
            telemetry: h.telemetry.clone(),
            clock: h.clock.clone(),
            sizer: None,
            constraints: None,
            scanner: None,
        },
    );

    // First GRID tick: bot created, ladder placed.
    assert_eq!(orchestrator.tick().await.unwrap(), TickOutcome::Continue);
    let open = h.exchange.get_open_orders("BTCUSDT").await.unwrap();
    assert_eq!(open.len(), 2);

    // High-confidence BEAR: emergency switch to CASH.
    let switched = orchestrator
        .evaluate_and_switch(Some(Regime::Bear), 0.90, 0)
        .await;
    assert!(switched);
    assert_eq!(orchestrator.current_mode(), TradingMode::Cash);

    // Open orders cancelled, bot handle released, and with no hold
    // position there is nothing to market-sell and no exit clock.
    let open = h.exchange.get_open_orders("BTCUSDT").await.unwrap();
    assert!(open.is_empty());
    let state = orchestrator.symbol_state("BTCUSDT").unwrap();
    assert!(state.grid_bot.is_none());
    assert!(state.cash_exit_started.is_none());
    assert_eq!(state.hold_quantity, Decimal::ZERO);
    assert_eq!(state.mode, TradingMode::Cash);
}

#[tokio::test]
async fn grid_to_hold_converts_inventory_to_hold_position() {
    let h = Harness::new();
    let mut orchestrator = HybridOrchestrator::new(
        orchestrator_config(),
        OrchestratorDeps {
            client: h.exchange.clone(),
            stops: h.stops.clone(),
            stop_executor: Arc::new(StopLossExecutor::new(
                h.exchange.clone(),
                h.notifier.clone(),
            )),
            store: h.store.clone(),
            notifier: h.notifier.clone(),
            telemetry: h.telemetry.clone(),
            clock: h.clock.clone(),
            sizer: None,
            constraints: None,
            scanner: None,
        },
    );

    // Ladder out, then a BUY fills so the book carries a SELL (inventory).
    orchestrator.tick().await.unwrap();
    let buy_49000 = h
        .exchange
        .get_open_orders("BTCUSDT")
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.price == dec!(49000))
        .unwrap();
    h.exchange.force_fill(&buy_49000.order_id);
    h.exchange.set_price("BTCUSDT", dec!(49500));
    orchestrator.tick().await.unwrap();

    let stops_before = h.stops.active_stops().len();
    let switched = orchestrator
        .evaluate_and_switch(Some(Regime::Bull), 0.9, 5)
        .await;
    assert!(switched);
    assert_eq!(orchestrator.current_mode(), TradingMode::Hold);

    // Grid orders gone; the sell-side inventory became a hold position
    // behind a fresh trailing stop.
    assert!(h.exchange.get_open_orders("BTCUSDT").await.unwrap().is_empty());
    let state = orchestrator.symbol_state("BTCUSDT").unwrap();
    assert_eq!(state.mode, TradingMode::Hold);
    assert!(state.grid_bot.is_none());
    assert!(state.hold_quantity > Decimal::ZERO);
    assert!(state.hold_stop_id.is_some());
    assert_eq!(h.stops.active_stops().len(), stops_before + 1);

    // Already holding: the next HOLD tick buys nothing more.
    orchestrator.tick().await.unwrap();
    assert!(h.exchange.get_open_orders("BTCUSDT").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_trigger_survives_one_failed_sell() {
    let h = Harness::new();
    let executor = StopLossExecutor::new(h.exchange.clone(), h.notifier.clone());

    let stop = h
        .stops
        .create_stop(StopParams {
            symbol: "BTCUSDT".into(),
            entry_price: dec!(50000),
            quantity: dec!(0.01),
            stop_type: StopType::Trailing,
            stop_percentage: dec!(5),
            trailing_distance: None,
        })
        .await;

    // Rally to 52000 drags the stop to 49400; 49300 fires it.
    let mut prices = HashMap::from([("BTCUSDT".to_string(), dec!(52000))]);
    assert!(h.stops.update(&prices, None).await.is_empty());
    prices.insert("BTCUSDT".to_string(), dec!(49300));
    h.exchange.set_price("BTCUSDT", dec!(49300));
    let triggered = h.stops.update(&prices, None).await;
    assert_eq!(triggered.len(), 1);
    assert!(h.stops.get(&stop.id).unwrap().is_trigger_pending());

    // First sell attempt bounces; the executor re-queries the balance and
    // the second attempt clears.
    h.exchange
        .inject_market_sell_error(ExchangeError::InsufficientBalance("locked".into()));
    let order = executor.execute_sell("BTCUSDT", dec!(0.01)).await.unwrap();
    assert!(order.executed_qty > Decimal::ZERO);

    let closed = h.stops.confirm_trigger(&stop.id).await.unwrap();
    assert!(!closed.is_active);
    assert_eq!(closed.result_pnl_pct.unwrap(), dec!(-1.4));
}
