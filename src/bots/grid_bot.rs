//! Per-symbol grid trading bot.
//!
//! Owns one symbol's order lifecycle end to end: initial placement,
//! reconciliation against the exchange every tick, follow-up orders on
//! fills, retry of failed follow-ups with backoff, circuit breaker,
//! stop-loss maintenance and state persistence.
//!
//! The implementation is split by responsibility across sibling files:
//! order lifecycle in `orders.rs`, persistence/boot reconciliation in
//! `state.rs`, risk checks in `risk.rs`. One type, three impl blocks.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::exchange::{OrderSide, SharedExchange, SymbolInfo};
use crate::risk::{AllocationConstraints, PositionSizer, StopLossExecutor, StopLossRegistry};
use crate::state::KeyValueStore;
use crate::strategies::{FollowUpAction, GridStrategy};
use crate::telemetry::{LogCategory, Telemetry};
use crate::notify::SharedNotifier;
use crate::util::SharedClock;

/// Consecutive tick errors before the bot emergency-stops.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Consecutive unavailable-price ticks before emergency stop.
pub const MAX_PRICE_FAILURES: u32 = 3;

const INITIAL_BACKOFF_SECONDS: i64 = 30;
const MAX_BACKOFF_SECONDS: i64 = 300;

/// Balance headroom required over the configured investment.
const BALANCE_HEADROOM: Decimal = dec!(1.02);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// At least one persisted order survived validation.
    Restored,
    /// No usable state; caller places initial orders.
    Fresh,
}

/// Follow-up that could not be placed; retried with backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFollowUp {
    pub intended: FollowUpAction,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
}

/// One live exchange order tracked by the bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveOrder {
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_qty: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_followup: Option<FailedFollowUp>,
}

/// Fill discovered during downtime; its follow-up is queued until the
/// grid strategy exists.
#[derive(Debug, Clone)]
pub struct DowntimeFill {
    pub order_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridBotConfig {
    pub symbol: String,
    pub investment: Decimal,
    pub num_grids: u32,
    pub grid_range_percent: Decimal,
    pub testnet: bool,
    #[serde(default)]
    pub stop_loss_pct: Option<Decimal>,
    #[serde(default)]
    pub circuit_breaker_pct: Option<Decimal>,
    /// Cohort mode: the orchestrator owns the portfolio drawdown check.
    #[serde(default)]
    pub skip_portfolio_drawdown: bool,
    #[serde(default)]
    pub state_key: Option<String>,
}

impl GridBotConfig {
    pub fn state_key(&self) -> String {
        self.state_key
            .clone()
            .unwrap_or_else(|| format!("bot_state_{}.json", self.symbol))
    }

    pub fn stop_loss_pct(&self) -> Decimal {
        self.stop_loss_pct.unwrap_or(dec!(5))
    }

    pub fn circuit_breaker_pct(&self) -> Decimal {
        self.circuit_breaker_pct.unwrap_or(dec!(10))
    }
}

pub struct GridBot {
    pub(crate) config: GridBotConfig,
    pub(crate) client: SharedExchange,
    pub(crate) stops: Arc<StopLossRegistry>,
    pub(crate) stop_executor: Arc<StopLossExecutor>,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) notifier: SharedNotifier,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) clock: SharedClock,
    pub(crate) sizer: Option<Arc<dyn PositionSizer>>,
    pub(crate) constraints: Option<Arc<dyn AllocationConstraints>>,

    pub(crate) symbol_info: Option<SymbolInfo>,
    pub(crate) strategy: Option<GridStrategy>,
    pub(crate) active_orders: HashMap<String, ActiveOrder>,
    pub(crate) pending_followups: Vec<DowntimeFill>,

    pub(crate) running: bool,
    consecutive_errors: u32,
    error_backoff_until: Option<DateTime<Utc>>,
    pub(crate) last_known_price: Decimal,
    pub(crate) consecutive_price_failures: u32,
    last_drawdown_reset: Option<NaiveDate>,
}

pub struct GridBotDeps {
    pub client: SharedExchange,
    pub stops: Arc<StopLossRegistry>,
    pub stop_executor: Arc<StopLossExecutor>,
    pub store: Arc<dyn KeyValueStore>,
    pub notifier: SharedNotifier,
    pub telemetry: Arc<Telemetry>,
    pub clock: SharedClock,
    pub sizer: Option<Arc<dyn PositionSizer>>,
    pub constraints: Option<Arc<dyn AllocationConstraints>>,
}

impl GridBot {
    pub fn new(config: GridBotConfig, deps: GridBotDeps) -> Self {
        Self {
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
            symbol_info: None,
            strategy: None,
            active_orders: HashMap::new(),
            pending_followups: Vec::new(),
            running: false,
            consecutive_errors: 0,
            error_backoff_until: None,
            last_known_price: Decimal::ZERO,
            consecutive_price_failures: 0,
            last_drawdown_reset: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    pub fn config(&self) -> &GridBotConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn active_orders(&self) -> &HashMap<String, ActiveOrder> {
        &self.active_orders
    }

    /// Forget all tracked orders (caller has already cancelled them on
    /// the exchange).
    pub fn clear_active_orders(&mut self) {
        self.active_orders.clear();
    }

    /// Verify metadata and balance, build the grid, seed the circuit
    /// breaker. Any error aborts the bot before it trades.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("🤖 Initializing grid bot for {}", self.config.symbol);

        let info = self
            .client
            .get_symbol_info(&self.config.symbol)
            .await
            .with_context(|| format!("symbol {} not found", self.config.symbol))?;
        info!(
            "   Limits: min_qty {} | step {} | min_notional {} | tick {}",
            info.min_qty, info.step_size, info.min_notional, info.tick_size
        );

        let available = self
            .client
            .get_account_balance(&info.quote_asset)
            .await
            .context("balance query failed")?;
        let required = self.config.investment * BALANCE_HEADROOM;
        if available < required {
            self.notifier
                .send(
                    &format!(
                        "❌ Bot could not start\n\
                         Symbol: {}\n\
                         Balance: {available:.2} {}\n\
                         Required: {required:.2} {}",
                        self.config.symbol, info.quote_asset, info.quote_asset
                    ),
                    true,
                )
                .await;
            anyhow::bail!(
                "insufficient balance: {available:.2} available, {required:.2} required"
            );
        }

        let current_price = self
            .client
            .get_current_price(&self.config.symbol)
            .await
            .context("price unavailable during initialization")?;

        let range = self.config.grid_range_percent / dec!(100);
        let lower = current_price * (Decimal::ONE - range);
        let upper = current_price * (Decimal::ONE + range);

        let strategy = GridStrategy::new(
            lower,
            upper,
            self.config.num_grids,
            self.config.investment,
            &info,
        );
        if !strategy.is_tradeable() {
            anyhow::bail!("fewer than 2 valid grid levels - investment too small");
        }
        if self.config.investment < info.min_notional {
            anyhow::bail!(
                "investment {} below the symbol minimum notional {}",
                self.config.investment,
                info.min_notional
            );
        }

        let level_count = strategy.levels().len();
        self.symbol_info = Some(info);
        self.strategy = Some(strategy);
        self.last_known_price = current_price;
        self.running = true;

        self.notifier
            .send(
                &format!(
                    "✅ Bot initialized\n\
                     Symbol: {}\n\
                     Investment: {}\n\
                     Grid range: {lower:.2} - {upper:.2}\n\
                     Grid levels: {level_count}",
                    self.config.symbol, self.config.investment
                ),
                false,
            )
            .await;

        Ok(())
    }

    /// One reconciliation cycle. The internal ordering is an invariant:
    /// reconcile orders → circuit breaker → update stops → persist.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if !self.running {
            return Ok(TickOutcome::Stop);
        }

        self.check_orders().await?;

        match self.client.get_current_price(&self.config.symbol).await {
            Some(price) => {
                self.consecutive_price_failures = 0;

                if self.check_circuit_breaker(price).await {
                    return Ok(TickOutcome::Stop);
                }

                self.check_stop_losses(price).await;

                info!(
                    "{}: {price:.2} | orders: {}",
                    self.config.symbol,
                    self.active_orders.len()
                );
            }
            None => {
                self.consecutive_price_failures += 1;
                warn!(
                    "Price unavailable for {} ({} consecutive)",
                    self.config.symbol, self.consecutive_price_failures
                );
                if self.consecutive_price_failures >= MAX_PRICE_FAILURES {
                    self.emergency_stop("Price unavailable for 3 consecutive ticks")
                        .await;
                    return Ok(TickOutcome::Stop);
                }
            }
        }

        if !self.config.skip_portfolio_drawdown {
            if let Some(outcome) = self.check_portfolio_drawdown().await {
                return Ok(outcome);
            }
        }

        self.save_state().await;
        Ok(TickOutcome::Continue)
    }

    /// Error-counting wrapper around `tick`. Five consecutive failures
    /// emergency-stop the bot; earlier failures back off exponentially
    /// (base 30 s, cap 300 s) by skipping ticks until the delay passes.
    pub async fn tick_guarded(&mut self) -> TickOutcome {
        if !self.running {
            return TickOutcome::Stop;
        }
        if let Some(until) = self.error_backoff_until {
            if self.clock.now_utc() < until {
                return TickOutcome::Continue;
            }
            self.error_backoff_until = None;
        }

        match self.tick().await {
            Ok(outcome) => {
                self.consecutive_errors = 0;
                outcome
            }
            Err(e) => {
                self.consecutive_errors += 1;
                error!(
                    "Tick error on {} ({}/{MAX_CONSECUTIVE_ERRORS}): {e:#}",
                    self.config.symbol, self.consecutive_errors
                );
                self.telemetry.log(
                    LogCategory::Error,
                    json!({
                        "symbol": self.config.symbol,
                        "consecutive": self.consecutive_errors,
                        "error": format!("{e:#}"),
                    }),
                );

                if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    self.emergency_stop(&format!("Too many consecutive errors: {e}"))
                        .await;
                    return TickOutcome::Stop;
                }

                let backoff = (INITIAL_BACKOFF_SECONDS
                    * 2_i64.pow(self.consecutive_errors.saturating_sub(1)))
                .min(MAX_BACKOFF_SECONDS);
                self.error_backoff_until =
                    Some(self.clock.now_utc() + chrono::Duration::seconds(backoff));
                info!("Backing off {} for {backoff}s", self.config.symbol);
                TickOutcome::Continue
            }
        }
    }

    /// Halt the bot, notify urgently, and persist one final time.
    pub(crate) async fn emergency_stop(&mut self, reason: &str) {
        error!("EMERGENCY STOP {}: {reason}", self.config.symbol);
        self.telemetry.log(
            LogCategory::System,
            json!({"symbol": self.config.symbol, "emergency_stop": reason}),
        );
        self.notifier
            .send(
                &format!("🛑 BOT EMERGENCY STOP\n\nSymbol: {}\nReason: {reason}", self.config.symbol),
                true,
            )
            .await;
        self.running = false;
        self.save_state().await;
    }

    /// Cooperative stop; observed by the driving loop.
    pub fn stop(&mut self) {
        self.running = false;
    }

    async fn check_portfolio_drawdown(&mut self) -> Option<TickOutcome> {
        let quote_asset = self.symbol_info.as_ref()?.quote_asset.clone();
        let portfolio_value = match self.client.get_account_balance(&quote_asset).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Portfolio value query failed: {e}");
                return None;
            }
        };

        let today = self.clock.now_utc().date_naive();
        if self.last_drawdown_reset != Some(today) && portfolio_value > Decimal::ZERO {
            self.stops.reset_daily(portfolio_value);
            self.last_drawdown_reset = Some(today);
            info!("Daily drawdown reset: baseline {portfolio_value:.2}");
        }

        let (should_stop, reason) = self.stops.check_portfolio_drawdown(portfolio_value);
        if should_stop {
            self.emergency_stop(&reason).await;
            return Some(TickOutcome::Stop);
        }
        None
    }
}
