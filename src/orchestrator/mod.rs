//! Hybrid orchestrator: multiplexes grid bots over one exchange account
//! and routes every symbol through the active trading mode:
//!
//! - HOLD (BULL): buy and hold behind a wide trailing stop
//! - GRID (SIDEWAYS): delegate to the per-symbol `GridBot`
//! - CASH (BEAR): exit positions, preserve capital
//!
//! Mode decisions come from the `ModeManager`; the orchestrator sequences
//! the per-symbol transitions, resolves fired stops within the same tick,
//! and rebalances allocations on drift.

pub mod mode_manager;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bots::{GridBot, GridBotConfig, GridBotDeps, ReconciliationService, TickOutcome};
use crate::config::Config;
use crate::exchange::{OrderSide, SharedExchange};
use crate::notify::SharedNotifier;
use crate::risk::{
    AllocationConstraints, PositionSizer, StopLossExecutor, StopLossRegistry, StopParams, StopType,
};
use crate::state::{decode_record, encode_record, KeyValueStore};
use crate::telemetry::{LogCategory, Telemetry};
use crate::util::SharedClock;

pub use mode_manager::{
    ModeManager, ModeState, Regime, TradingMode, TransitionEvent, EMERGENCY_BEAR_PROBABILITY,
    FLAP_LOCK_DAYS, MAX_TRANSITIONS_48H,
};

/// Consecutive orchestrator tick errors before graceful shutdown.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Allocation drift that justifies a rebalance.
pub const REBALANCE_DRIFT_PCT: Decimal = dec!(5);
/// Minimum hours between rebalances.
pub const REBALANCE_INTERVAL_HOURS: i64 = 6;
/// Trailing distance applied when CASH mode winds a position down.
const CASH_EXIT_STOP_PCT: Decimal = dec!(3);

/// Per-symbol tracking state. The grid bot handle lives here; its
/// lifetime ends when the symbol leaves the map.
pub struct SymbolState {
    pub symbol: String,
    pub mode: TradingMode,
    pub grid_bot: Option<GridBot>,
    pub hold_entry_price: Decimal,
    pub hold_quantity: Decimal,
    pub hold_stop_id: Option<String>,
    pub allocation_usd: Decimal,
    pub cash_exit_started: Option<DateTime<Utc>>,
}

impl SymbolState {
    fn new(symbol: String, mode: TradingMode) -> Self {
        Self {
            symbol,
            mode,
            grid_bot: None,
            hold_entry_price: Decimal::ZERO,
            hold_quantity: Decimal::ZERO,
            hold_stop_id: None,
            allocation_usd: Decimal::ZERO,
            cash_exit_started: None,
        }
    }

    fn has_inventory(&self) -> bool {
        self.hold_quantity > Decimal::ZERO
            || self
                .grid_bot
                .as_ref()
                .is_some_and(|bot| !bot.active_orders().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSymbolState {
    symbol: String,
    mode: TradingMode,
    hold_entry_price: Decimal,
    hold_quantity: Decimal,
    hold_stop_id: Option<String>,
    allocation_usd: Decimal,
    cash_exit_started: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrchestratorStateRecord {
    timestamp: DateTime<Utc>,
    current_mode: TradingMode,
    mode_since: DateTime<Utc>,
    symbols: HashMap<String, PersistedSymbolState>,
    last_rebalance: Option<DateTime<Utc>>,
}

/// Rebalance proposal for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adjustment {
    pub action: AdjustmentAction,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdjustmentAction {
    Increase,
    Decrease,
}

/// Candidate produced by the external opportunity scanner.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub allocation_usd: Decimal,
}

/// External collaborator: scans the market for tradeable symbols and
/// proposes capital allocations.
#[async_trait]
pub trait OpportunityScanner: Send + Sync {
    async fn scan(
        &self,
        total_capital: Decimal,
        regime: Option<Regime>,
    ) -> Result<Vec<Opportunity>>;
}

pub struct HybridOrchestrator {
    config: Config,
    client: SharedExchange,
    stops: Arc<StopLossRegistry>,
    stop_executor: Arc<StopLossExecutor>,
    store: Arc<dyn KeyValueStore>,
    notifier: SharedNotifier,
    telemetry: Arc<Telemetry>,
    clock: SharedClock,
    sizer: Option<Arc<dyn PositionSizer>>,
    constraints: Option<Arc<dyn AllocationConstraints>>,
    scanner: Option<Arc<dyn OpportunityScanner>>,

    mode_manager: ModeManager,
    symbols: HashMap<String, SymbolState>,
    running: bool,
    consecutive_errors: u32,
    last_rebalance: Option<DateTime<Utc>>,
}

pub struct OrchestratorDeps {
    pub client: SharedExchange,
    pub stops: Arc<StopLossRegistry>,
    pub stop_executor: Arc<StopLossExecutor>,
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: SharedNotifier,
    pub telemetry: Arc<Telemetry>,
    pub clock: SharedClock,
    pub sizer: Option<Arc<dyn PositionSizer>>,
    pub constraints: Option<Arc<dyn AllocationConstraints>>,
    pub scanner: Option<Arc<dyn OpportunityScanner>>,
}

impl HybridOrchestrator {
    pub fn new(config: Config, deps: OrchestratorDeps) -> Self {
        let mode_manager = ModeManager::new(config.hybrid.clone(), deps.clock.clone());
        let mut orchestrator = Self {
            config,
            client: deps.client,
            stops: deps.stops,
            stop_executor: deps.stop_executor,
            store: deps.store,
            notifier: deps.notifier,
            telemetry: deps.telemetry,
            clock: deps.clock,
            sizer: deps.sizer,
            constraints: deps.constraints,
            scanner: deps.scanner,
            mode_manager,
            symbols: HashMap::new(),
            running: true,
            consecutive_errors: 0,
            last_rebalance: None,
        };
        for allocation in orchestrator.config.trading.symbols.clone() {
            orchestrator.add_symbol(&allocation.symbol, allocation.allocation_usd);
        }
        orchestrator
    }

    fn state_key(&self) -> String {
        match &self.config.bot.cohort {
            Some(cohort) => format!("hybrid_state_{cohort}.json"),
            None => "hybrid_state.json".to_string(),
        }
    }

    pub fn mode_manager(&self) -> &ModeManager {
        &self.mode_manager
    }

    pub fn current_mode(&self) -> TradingMode {
        self.mode_manager.current_mode()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn symbol_state(&self, symbol: &str) -> Option<&SymbolState> {
        self.symbols.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &SymbolState> {
        self.symbols.values()
    }

    /// Register a symbol with its capital allocation (idempotent; an
    /// existing row just gets its allocation updated).
    pub fn add_symbol(&mut self, symbol: &str, allocation_usd: Decimal) {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.allocation_usd = allocation_usd;
            return;
        }
        let mut state = SymbolState::new(symbol.to_string(), self.mode_manager.current_mode());
        state.allocation_usd = allocation_usd;
        self.symbols.insert(symbol.to_string(), state);
        info!("Orchestrator: added {symbol} with {allocation_usd:.2}");
    }

    /// Remove a symbol, cancelling its open orders and stop first.
    pub async fn remove_symbol(&mut self, symbol: &str) {
        let Some(mut state) = self.symbols.remove(symbol) else {
            return;
        };
        self.cancel_grid_orders(&mut state).await;
        if let Some(stop_id) = state.hold_stop_id.take() {
            self.stops.cancel_stop(&stop_id).await;
        }
        info!("Orchestrator: removed {symbol}");
    }

    /// One orchestrator cycle: per-symbol mode execution, then one stop
    /// update across every symbol, then persist.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if !self.running {
            return Ok(TickOutcome::Stop);
        }

        let symbols: Vec<String> = self.symbols.keys().cloned().collect();
        let mut failed = 0usize;
        for symbol in &symbols {
            let Some(mode) = self.symbols.get(symbol).map(|s| s.mode) else {
                continue;
            };
            let result = match mode {
                TradingMode::Hold => self.execute_hold(symbol).await,
                TradingMode::Grid => self.execute_grid(symbol).await,
                TradingMode::Cash => self.execute_cash(symbol).await,
            };
            if let Err(e) = result {
                failed += 1;
                error!("Orchestrator: error on {symbol}: {e:#}");
                self.telemetry.log(
                    LogCategory::Error,
                    json!({"symbol": symbol, "error": format!("{e:#}")}),
                );
            }
        }
        // One sick symbol is logged and skipped; every symbol failing at
        // once is systemic and feeds the consecutive-error ceiling.
        if !symbols.is_empty() && failed == symbols.len() {
            anyhow::bail!("all {failed} symbol executions failed");
        }

        self.update_stop_losses().await;
        self.save_state().await;
        self.consecutive_errors = 0;
        Ok(TickOutcome::Continue)
    }

    /// Error-counting wrapper; too many consecutive failures shut the
    /// orchestrator down gracefully (urgent notification + final save).
    pub async fn tick_guarded(&mut self) -> TickOutcome {
        match self.tick().await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.consecutive_errors += 1;
                error!(
                    "Orchestrator: tick error ({}/{MAX_CONSECUTIVE_ERRORS}): {e:#}",
                    self.consecutive_errors
                );
                if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!("Orchestrator: too many errors, stopping");
                    self.notifier
                        .send("Hybrid orchestrator: emergency stop - too many errors", true)
                        .await;
                    self.running = false;
                    self.save_state().await;
                    return TickOutcome::Stop;
                }
                TickOutcome::Continue
            }
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    // ── Mode evaluation & transitions ───────────────────────────────

    /// Evaluate the latest regime snapshot and switch mode if warranted.
    /// Returns true when a switch happened.
    pub async fn evaluate_and_switch(
        &mut self,
        regime: Option<Regime>,
        probability: f64,
        duration_days: u32,
    ) -> bool {
        self.mode_manager.update_regime_info(regime, probability);

        let (target, reason) = self.mode_manager.evaluate(regime, probability, duration_days);
        let current = self.mode_manager.current_mode();
        self.telemetry.log(
            LogCategory::Decision,
            json!({
                "regime": regime.map(|r| r.to_string()),
                "probability": probability,
                "duration_days": duration_days,
                "current_mode": current.to_string(),
                "recommended": target.to_string(),
                "reason": reason,
            }),
        );
        if target == current {
            return false;
        }

        if self.mode_manager.request_switch(target, &reason) {
            self.transition_mode(current, target, &reason).await;
            return true;
        }
        false
    }

    /// Apply a mode transition to every symbol before the next tick.
    async fn transition_mode(&mut self, from: TradingMode, to: TradingMode, reason: &str) {
        info!("Orchestrator: {from} -> {to} ({reason})");
        self.notifier
            .send(
                &format!("Mode switch: {from} -> {to}\nReason: {reason}"),
                true,
            )
            .await;

        let symbols: Vec<String> = self.symbols.keys().cloned().collect();
        for symbol in symbols {
            if let Err(e) = self.transition_symbol(&symbol, from, to).await {
                error!("Orchestrator: transition failed for {symbol}: {e:#}");
            }
            if let Some(state) = self.symbols.get_mut(&symbol) {
                state.mode = to;
            }
        }
    }

    async fn transition_symbol(
        &mut self,
        symbol: &str,
        from: TradingMode,
        to: TradingMode,
    ) -> Result<()> {
        match (from, to) {
            (TradingMode::Grid, TradingMode::Hold) => self.transition_grid_to_hold(symbol).await,
            (TradingMode::Grid, TradingMode::Cash) => self.transition_grid_to_cash(symbol).await,
            (TradingMode::Hold, TradingMode::Grid) => self.transition_hold_to_grid(symbol).await,
            (TradingMode::Hold, TradingMode::Cash) => self.transition_hold_to_cash(symbol).await,
            (TradingMode::Cash, TradingMode::Grid) => self.transition_cash_to_grid(symbol),
            (TradingMode::Cash, TradingMode::Hold) => self.transition_cash_to_hold(symbol),
            _ => Ok(()),
        }
    }

    /// GRID → HOLD: cancel open grid orders; convert any bought inventory
    /// into a hold position behind a fresh trailing stop.
    async fn transition_grid_to_hold(&mut self, symbol: &str) -> Result<()> {
        let Some(mut state) = self.symbols.remove(symbol) else {
            return Ok(());
        };

        // Inventory estimate: the SELL side of the order set represents
        // bought base waiting to be sold. This is a heuristic until trade
        // pairs are fully modelled. Taken before the cancel clears the set.
        let sell_value: Decimal = state
            .grid_bot
            .as_ref()
            .map(|bot| {
                bot.active_orders()
                    .values()
                    .filter(|o| o.side == OrderSide::Sell)
                    .map(|o| o.price * o.quantity)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO);

        self.cancel_grid_orders(&mut state).await;

        if sell_value > Decimal::ZERO {
            if let Some(price) = self.client.get_current_price(symbol).await {
                if price > Decimal::ZERO {
                    state.hold_entry_price = price;
                    state.hold_quantity = sell_value / price;
                    let stop = self
                        .stops
                        .create_stop(StopParams {
                            symbol: symbol.to_string(),
                            entry_price: price,
                            quantity: state.hold_quantity,
                            stop_type: StopType::Trailing,
                            stop_percentage: self.config.hybrid.hold_trailing_stop_pct,
                            trailing_distance: None,
                        })
                        .await;
                    state.hold_stop_id = Some(stop.id);
                }
            }
        }

        state.grid_bot = None;
        self.symbols.insert(symbol.to_string(), state);
        Ok(())
    }

    /// GRID → CASH: cancel grid orders; the exit itself starts on the
    /// first CASH tick (a bare grid with no inventory sells nothing).
    async fn transition_grid_to_cash(&mut self, symbol: &str) -> Result<()> {
        let Some(mut state) = self.symbols.remove(symbol) else {
            return Ok(());
        };
        self.cancel_grid_orders(&mut state).await;
        state.grid_bot = None;
        state.cash_exit_started = None;
        self.symbols.insert(symbol.to_string(), state);
        Ok(())
    }

    /// HOLD → GRID: drop the hold stop and position bookkeeping; the grid
    /// bot is created lazily on the next GRID tick.
    async fn transition_hold_to_grid(&mut self, symbol: &str) -> Result<()> {
        let Some(state) = self.symbols.get_mut(symbol) else {
            return Ok(());
        };
        let stop_id = state.hold_stop_id.take();
        state.hold_entry_price = Decimal::ZERO;
        state.hold_quantity = Decimal::ZERO;
        state.grid_bot = None;
        if let Some(stop_id) = stop_id {
            self.stops.cancel_stop(&stop_id).await;
        }
        Ok(())
    }

    /// HOLD → CASH: tighten the stop and start the exit clock.
    async fn transition_hold_to_cash(&mut self, symbol: &str) -> Result<()> {
        let has_position = self
            .symbols
            .get(symbol)
            .is_some_and(|s| s.hold_quantity > Decimal::ZERO);
        if has_position {
            self.tighten_trailing_stop(symbol).await;
            if let Some(state) = self.symbols.get_mut(symbol) {
                state.cash_exit_started = Some(self.clock.now_utc());
            }
        }
        Ok(())
    }

    /// CASH → GRID: reset exit bookkeeping for a fresh grid start.
    fn transition_cash_to_grid(&mut self, symbol: &str) -> Result<()> {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.cash_exit_started = None;
            state.hold_quantity = Decimal::ZERO;
            state.hold_entry_price = Decimal::ZERO;
            state.grid_bot = None;
        }
        Ok(())
    }

    /// CASH → HOLD: reset for a fresh buy.
    fn transition_cash_to_hold(&mut self, symbol: &str) -> Result<()> {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.cash_exit_started = None;
            state.hold_quantity = Decimal::ZERO;
            state.hold_entry_price = Decimal::ZERO;
        }
        Ok(())
    }

    // ── Per-mode execution ──────────────────────────────────────────

    /// HOLD: enter once with a market buy of the allocated capital, then
    /// let the trailing stop manage the exit.
    async fn execute_hold(&mut self, symbol: &str) -> Result<()> {
        let (allocation, already_holding) = match self.symbols.get(symbol) {
            Some(state) => (state.allocation_usd, state.hold_quantity > Decimal::ZERO),
            None => return Ok(()),
        };
        if already_holding || allocation <= Decimal::ZERO {
            return Ok(());
        }

        // The portfolio halt vetoes entries the same as any other order.
        if self.stops.is_portfolio_stopped() {
            warn!("HOLD entry for {symbol} blocked: portfolio halted");
            return Ok(());
        }

        let Some(price) = self.client.get_current_price(symbol).await else {
            return Ok(());
        };
        if price <= Decimal::ZERO {
            return Ok(());
        }

        let order = match self.client.place_market_buy(symbol, allocation).await {
            Ok(order) => order,
            Err(e) => {
                error!("HOLD buy failed for {symbol}: {e}");
                return Ok(());
            }
        };

        let executed_qty = order.executed_qty;
        if executed_qty <= Decimal::ZERO {
            return Ok(());
        }
        let avg_price = order.avg_fill_price();

        let stop = self
            .stops
            .create_stop(StopParams {
                symbol: symbol.to_string(),
                entry_price: avg_price,
                quantity: executed_qty,
                stop_type: StopType::Trailing,
                stop_percentage: self.config.hybrid.hold_trailing_stop_pct,
                trailing_distance: None,
            })
            .await;

        if let Some(state) = self.symbols.get_mut(symbol) {
            state.hold_entry_price = avg_price;
            state.hold_quantity = executed_qty;
            state.hold_stop_id = Some(stop.id);
        }

        info!(
            "HOLD: bought {executed_qty} {symbol} @ {avg_price:.2} (trailing stop {}%)",
            self.config.hybrid.hold_trailing_stop_pct
        );
        self.notifier
            .send(
                &format!(
                    "HOLD buy: {symbol}\n\
                     Quantity: {executed_qty}\n\
                     Price: {avg_price:.2}\n\
                     Trailing stop: {}%",
                    self.config.hybrid.hold_trailing_stop_pct
                ),
                false,
            )
            .await;
        Ok(())
    }

    /// GRID: lazily construct the bot, then delegate one tick. A symbol
    /// whose allocation was zeroed (kept only until its inventory is
    /// flat) gets no bot.
    async fn execute_grid(&mut self, symbol: &str) -> Result<()> {
        let (needs_bot, allocation) = match self.symbols.get(symbol) {
            Some(state) => (state.grid_bot.is_none(), state.allocation_usd),
            None => return Ok(()),
        };
        if needs_bot && allocation <= Decimal::ZERO {
            return Ok(());
        }
        if needs_bot {
            let bot = self.create_grid_bot(symbol).await;
            match bot {
                Some(bot) => {
                    if let Some(state) = self.symbols.get_mut(symbol) {
                        state.grid_bot = Some(bot);
                    }
                }
                None => anyhow::bail!("grid bot bring-up failed for {symbol}"),
            }
        }

        if let Some(state) = self.symbols.get_mut(symbol) {
            if let Some(bot) = state.grid_bot.as_mut() {
                if bot.tick_guarded().await == TickOutcome::Stop {
                    warn!("GRID: bot for {symbol} stopped");
                }
            }
        }
        Ok(())
    }

    /// CASH: flatten. Grid orders are cancelled outright; a hold position
    /// first gets a tight stop, then a timeout market sell.
    async fn execute_cash(&mut self, symbol: &str) -> Result<()> {
        let has_bot = self
            .symbols
            .get(symbol)
            .is_some_and(|s| s.grid_bot.is_some());
        if has_bot {
            if let Some(mut state) = self.symbols.remove(symbol) {
                self.cancel_grid_orders(&mut state).await;
                state.grid_bot = None;
                self.symbols.insert(symbol.to_string(), state);
            }
        }

        let (hold_quantity, exit_started) = match self.symbols.get(symbol) {
            Some(state) => (state.hold_quantity, state.cash_exit_started),
            None => return Ok(()),
        };
        if hold_quantity <= Decimal::ZERO {
            return Ok(());
        }

        match exit_started {
            None => {
                self.tighten_trailing_stop(symbol).await;
                if let Some(state) = self.symbols.get_mut(symbol) {
                    state.cash_exit_started = Some(self.clock.now_utc());
                }
            }
            Some(started) => {
                let elapsed = self.clock.now_utc() - started;
                if elapsed >= Duration::hours(self.config.hybrid.cash_exit_timeout_hours) {
                    self.market_sell_position(symbol).await;
                }
            }
        }
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn create_grid_bot(&mut self, symbol: &str) -> Option<GridBot> {
        let allocation = self.symbols.get(symbol)?.allocation_usd;
        if allocation <= Decimal::ZERO {
            return None;
        }

        let bot_config = GridBotConfig {
            symbol: symbol.to_string(),
            investment: allocation,
            num_grids: self.config.trading.num_grids,
            grid_range_percent: self.config.trading.grid_range_percent,
            testnet: self.config.bot.testnet,
            stop_loss_pct: Some(self.config.risk.stop_loss_pct),
            circuit_breaker_pct: Some(self.config.risk.circuit_breaker_pct),
            // Many bots share one account; the orchestrator owns the
            // portfolio-level drawdown check.
            skip_portfolio_drawdown: true,
            state_key: None,
        };

        let mut bot = GridBot::new(
            bot_config,
            GridBotDeps {
                client: self.client.clone(),
                stops: self.stops.clone(),
                stop_executor: self.stop_executor.clone(),
                store: self.store.clone(),
                notifier: self.notifier.clone(),
                telemetry: self.telemetry.clone(),
                clock: self.clock.clone(),
                sizer: self.sizer.clone(),
                constraints: self.constraints.clone(),
            },
        );

        match ReconciliationService::bring_up(&mut bot).await {
            Ok(_) => {
                info!("GRID: initialized {symbol}");
                Some(bot)
            }
            Err(e) => {
                error!("GRID: init failed for {symbol}: {e:#}");
                None
            }
        }
    }

    async fn cancel_grid_orders(&self, state: &mut SymbolState) {
        let Some(bot) = state.grid_bot.as_mut() else {
            return;
        };
        let order_ids: Vec<String> = bot.active_orders().keys().cloned().collect();
        for order_id in &order_ids {
            if let Err(e) = self.client.cancel_order(&state.symbol, order_id).await {
                warn!("Cancel failed for {} on {}: {e}", order_id, state.symbol);
            }
        }
        bot.clear_active_orders();
        if !order_ids.is_empty() {
            info!("Cancelled {} grid orders on {}", order_ids.len(), state.symbol);
        }
    }

    /// Replace the hold stop with a tight trailing stop for the exit.
    async fn tighten_trailing_stop(&mut self, symbol: &str) {
        let (stop_id, hold_quantity, entry_price) = match self.symbols.get_mut(symbol) {
            Some(state) => (
                state.hold_stop_id.take(),
                state.hold_quantity,
                state.hold_entry_price,
            ),
            None => return,
        };
        if let Some(stop_id) = stop_id {
            self.stops.cancel_stop(&stop_id).await;
        }
        if hold_quantity <= Decimal::ZERO {
            return;
        }

        let price = match self.client.get_current_price(symbol).await {
            Some(price) if price > Decimal::ZERO => price,
            _ => entry_price,
        };
        let stop = self
            .stops
            .create_stop(StopParams {
                symbol: symbol.to_string(),
                entry_price: price,
                quantity: hold_quantity,
                stop_type: StopType::Trailing,
                stop_percentage: CASH_EXIT_STOP_PCT,
                trailing_distance: None,
            })
            .await;
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.hold_stop_id = Some(stop.id);
        }
        info!("CASH: tightened stop to {CASH_EXIT_STOP_PCT}% for {symbol}");
    }

    async fn market_sell_position(&mut self, symbol: &str) {
        let hold_quantity = match self.symbols.get(symbol) {
            Some(state) if state.hold_quantity > Decimal::ZERO => state.hold_quantity,
            _ => return,
        };

        match self.client.place_market_sell(symbol, hold_quantity).await {
            Ok(_) => {
                info!("CASH: sold {hold_quantity} {symbol}");
                self.notifier
                    .send(&format!("CASH sell: {symbol}\nQuantity: {hold_quantity}"), false)
                    .await;
            }
            Err(e) => {
                error!("CASH: sell failed for {symbol}: {e}");
            }
        }

        let stop_id = self
            .symbols
            .get_mut(symbol)
            .and_then(|state| state.hold_stop_id.take());
        if let Some(stop_id) = stop_id {
            self.stops.cancel_stop(&stop_id).await;
        }
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.hold_quantity = Decimal::ZERO;
            state.hold_entry_price = Decimal::ZERO;
            state.cash_exit_started = None;
        }
    }

    /// One registry update with every symbol's price; each trigger is
    /// resolved (confirm or reactivate) before the tick ends.
    async fn update_stop_losses(&mut self) {
        let mut prices: HashMap<String, Decimal> = HashMap::new();
        for symbol in self.symbols.keys() {
            if let Some(price) = self.client.get_current_price(symbol).await {
                if price > Decimal::ZERO {
                    prices.insert(symbol.clone(), price);
                }
            }
        }
        if prices.is_empty() {
            return;
        }

        let triggered = self.stops.update(&prices, None).await;
        for stop in triggered {
            warn!("Stop triggered: {} @ {:?}", stop.symbol, stop.triggered_price);
            self.notifier
                .send(
                    &format!(
                        "Stop-loss triggered: {}\nPrice: {:?}",
                        stop.symbol, stop.triggered_price
                    ),
                    true,
                )
                .await;

            match self
                .stop_executor
                .execute_sell(&stop.symbol, stop.quantity)
                .await
            {
                Ok(order) => {
                    self.stops.confirm_trigger(&stop.id).await;
                    info!("Stop sell executed: {} {}", order.executed_qty, stop.symbol);
                    if let Some(state) = self.symbols.get_mut(&stop.symbol) {
                        state.hold_quantity = Decimal::ZERO;
                        state.hold_entry_price = Decimal::ZERO;
                        state.hold_stop_id = None;
                    }
                }
                Err(e) => {
                    self.stops.reactivate(&stop.id).await;
                    error!("Stop sell failed, stop re-activated for {}: {e}", stop.symbol);
                }
            }
        }
    }

    // ── Rebalance & scan ────────────────────────────────────────────

    /// Check allocation drift and propose adjustments. Skips entirely
    /// inside the rebalance interval.
    pub async fn rebalance(&mut self) -> BTreeMap<String, Adjustment> {
        let now = self.clock.now_utc();
        if let Some(last) = self.last_rebalance {
            if now - last < Duration::hours(REBALANCE_INTERVAL_HOURS) {
                return BTreeMap::new();
            }
        }
        if self.symbols.is_empty() {
            return BTreeMap::new();
        }

        let mut current_values: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut targets: BTreeMap<String, Decimal> = BTreeMap::new();
        for (symbol, state) in &self.symbols {
            let Some(price) = self.client.get_current_price(symbol).await else {
                continue;
            };
            if price <= Decimal::ZERO {
                continue;
            }

            let value = if state.hold_quantity > Decimal::ZERO {
                state.hold_quantity * price
            } else if let Some(bot) = &state.grid_bot {
                if bot.active_orders().is_empty() {
                    state.allocation_usd
                } else {
                    bot.active_orders()
                        .values()
                        .map(|o| o.price * o.quantity)
                        .sum()
                }
            } else {
                state.allocation_usd
            };
            current_values.insert(symbol.clone(), value);
            targets.insert(symbol.clone(), state.allocation_usd);
        }

        let adjustments = compute_adjustments(
            &current_values,
            &targets,
            self.config.hybrid.min_position_usd,
        );
        self.last_rebalance = Some(now);

        if !adjustments.is_empty() {
            info!("Orchestrator: rebalance needed for {} symbols", adjustments.len());
            let lines: Vec<String> = adjustments
                .iter()
                .map(|(s, a)| format!("  {s}: {:?} {:.2}", a.action, a.amount))
                .collect();
            self.notifier
                .send(
                    &format!("Rebalance: {} adjustments\n{}", adjustments.len(), lines.join("\n")),
                    false,
                )
                .await;
        }
        adjustments
    }

    /// Refresh the symbol set from the opportunity scanner. Symbols that
    /// fall out of the allocation but still hold inventory stay with a
    /// zeroed allocation until flat.
    pub async fn scan_and_allocate(&mut self, regime: Option<Regime>) -> Result<usize> {
        let Some(scanner) = self.scanner.clone() else {
            return Ok(0);
        };

        let opportunities = scanner
            .scan(self.config.trading.total_investment, regime)
            .await?;
        if opportunities.is_empty() {
            info!("Orchestrator: no opportunities found");
            return Ok(0);
        }

        let opportunities: Vec<Opportunity> = opportunities
            .into_iter()
            .take(self.config.hybrid.max_symbols)
            .collect();

        for opp in &opportunities {
            self.add_symbol(&opp.symbol, opp.allocation_usd);
        }

        let allocated: std::collections::HashSet<&str> =
            opportunities.iter().map(|o| o.symbol.as_str()).collect();
        let stale: Vec<String> = self
            .symbols
            .keys()
            .filter(|s| !allocated.contains(s.as_str()))
            .cloned()
            .collect();
        for symbol in stale {
            let keep = self
                .symbols
                .get(&symbol)
                .is_some_and(SymbolState::has_inventory);
            if keep {
                if let Some(state) = self.symbols.get_mut(&symbol) {
                    state.allocation_usd = Decimal::ZERO;
                }
            } else {
                self.remove_symbol(&symbol).await;
            }
        }

        let total: Decimal = opportunities.iter().map(|o| o.allocation_usd).sum();
        info!(
            "Orchestrator: allocated {total:.2} across {} symbols",
            opportunities.len()
        );
        Ok(opportunities.len())
    }

    // ── State persistence ───────────────────────────────────────────

    pub async fn save_state(&self) {
        let record = OrchestratorStateRecord {
            timestamp: self.clock.now_utc(),
            current_mode: self.mode_manager.current_mode(),
            mode_since: self.mode_manager.state().mode_since,
            symbols: self
                .symbols
                .iter()
                .map(|(symbol, state)| {
                    (
                        symbol.clone(),
                        PersistedSymbolState {
                            symbol: state.symbol.clone(),
                            mode: state.mode,
                            hold_entry_price: state.hold_entry_price,
                            hold_quantity: state.hold_quantity,
                            hold_stop_id: state.hold_stop_id.clone(),
                            allocation_usd: state.allocation_usd,
                            cash_exit_started: state.cash_exit_started,
                        },
                    )
                })
                .collect(),
            last_rebalance: self.last_rebalance,
        };

        match encode_record(&record) {
            Ok(bytes) => {
                if let Err(e) = self.store.put(&self.state_key(), bytes).await {
                    error!("Orchestrator: save state error: {e}");
                }
            }
            Err(e) => error!("Orchestrator: state encode error: {e}"),
        }
    }

    /// Restore mode and per-symbol fields for configured symbols.
    pub async fn load_state(&mut self) -> Result<bool> {
        let Some(bytes) = self.store.get(&self.state_key()).await? else {
            return Ok(false);
        };
        let record: OrchestratorStateRecord = match decode_record(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!("Orchestrator: corrupt state, starting fresh: {e}");
                return Ok(false);
            }
        };

        self.mode_manager
            .restore(record.current_mode, record.mode_since);
        for (symbol, saved) in record.symbols {
            if let Some(state) = self.symbols.get_mut(&symbol) {
                state.mode = saved.mode;
                state.hold_entry_price = saved.hold_entry_price;
                state.hold_quantity = saved.hold_quantity;
                state.hold_stop_id = saved.hold_stop_id;
                state.cash_exit_started = saved.cash_exit_started;
            }
        }
        self.last_rebalance = record.last_rebalance;

        info!(
            "Orchestrator: state loaded ({} symbols, mode {})",
            self.symbols.len(),
            self.mode_manager.current_mode()
        );
        Ok(true)
    }
}

/// Pure drift computation: same inputs, same adjustments, stable order.
pub fn compute_adjustments(
    current_values: &BTreeMap<String, Decimal>,
    targets: &BTreeMap<String, Decimal>,
    min_position_usd: Decimal,
) -> BTreeMap<String, Adjustment> {
    let mut adjustments = BTreeMap::new();
    for (symbol, &target) in targets {
        if target <= Decimal::ZERO {
            continue;
        }
        let current = current_values.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let drift_pct = (current - target).abs() / target * dec!(100);
        if drift_pct <= REBALANCE_DRIFT_PCT {
            continue;
        }
        let diff = target - current;
        if diff > min_position_usd {
            adjustments.insert(
                symbol.clone(),
                Adjustment {
                    action: AdjustmentAction::Increase,
                    amount: diff,
                },
            );
        } else if diff < -min_position_usd {
            adjustments.insert(
                symbol.clone(),
                Adjustment {
                    action: AdjustmentAction::Decrease,
                    amount: diff.abs(),
                },
            );
        }
    }
    adjustments
}
