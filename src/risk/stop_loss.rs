//! Stop-loss registry: lifecycle of protective sell triggers.
//!
//! Four stop types:
//! 1. Fixed: constant percentage below entry
//! 2. Trailing: follows the high-water mark at a configured distance
//! 3. ATR: distance = multiplier × ATR supplied by the caller
//! 4. Break-even: moves to entry once profit exceeds a threshold
//!
//! Lifecycle: a stop whose price is crossed goes TRIGGER_PENDING and is
//! returned from `update`. It stays pending (never re-triggered, never
//! deactivated by `update`) until the caller resolves it: `confirm_trigger`
//! after a successful market sell, `reactivate` after a failed one.
//!
//! The registry also carries the portfolio-wide daily drawdown guard whose
//! sticky halt flag is consulted by the pre-trade risk gate.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{decode_record, encode_record, KeyValueStore};
use crate::util::SharedClock;

const HUNDRED: Decimal = dec!(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    Fixed,
    Trailing,
    Atr,
    BreakEven,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossOrder {
    pub id: String,
    pub symbol: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_type: StopType,
    /// Percent distance for FIXED, profit threshold for BREAK_EVEN.
    pub stop_percentage: Decimal,
    /// Percent distance for TRAILING.
    pub trailing_distance: Decimal,
    pub atr_multiplier: Decimal,
    pub current_stop_price: Decimal,
    pub highest_price: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_price: Option<Decimal>,
    pub result_pnl_pct: Option<Decimal>,
}

impl StopLossOrder {
    fn initial_stop(&self) -> Decimal {
        let distance = match self.stop_type {
            StopType::Trailing => self.trailing_distance,
            _ => self.stop_percentage,
        };
        self.entry_price * (Decimal::ONE - distance / HUNDRED)
    }

    /// True between trigger and its confirm/reactivate resolution.
    pub fn is_trigger_pending(&self) -> bool {
        self.is_active && self.triggered_at.is_some()
    }

    /// Refresh the stop for a new price observation. Returns true when the
    /// stop fires (exactly once; a pending trigger is never re-fired).
    fn update(&mut self, price: Decimal, atr: Option<Decimal>, now: DateTime<Utc>) -> bool {
        if !self.is_active || self.triggered_at.is_some() {
            return false;
        }

        match self.stop_type {
            StopType::Trailing => {
                if price > self.highest_price {
                    self.highest_price = price;
                    let new_stop = price * (Decimal::ONE - self.trailing_distance / HUNDRED);
                    self.current_stop_price = self.current_stop_price.max(new_stop);
                }
            }
            StopType::Atr => {
                if let Some(atr) = atr {
                    let new_stop = price - atr * self.atr_multiplier;
                    self.current_stop_price = self.current_stop_price.max(new_stop);
                }
                if price > self.highest_price {
                    self.highest_price = price;
                }
            }
            StopType::BreakEven => {
                let pnl_pct = (price - self.entry_price) / self.entry_price * HUNDRED;
                if pnl_pct >= self.stop_percentage {
                    self.current_stop_price = self.current_stop_price.max(self.entry_price);
                }
                if price > self.highest_price {
                    self.highest_price = price;
                }
            }
            StopType::Fixed => {
                if price > self.highest_price {
                    self.highest_price = price;
                }
            }
        }

        if price <= self.current_stop_price {
            self.triggered_price = Some(price);
            self.triggered_at = Some(now);
            return true;
        }
        false
    }

    /// Resolve a pending trigger after a successful market sell.
    fn confirm_trigger(&mut self) {
        self.is_active = false;
        if let Some(triggered) = self.triggered_price {
            self.result_pnl_pct =
                Some((triggered - self.entry_price) / self.entry_price * HUNDRED);
        }
    }

    /// Resolve a pending trigger after a failed market sell: back to ACTIVE.
    fn reactivate(&mut self) {
        self.is_active = true;
        self.triggered_price = None;
        self.triggered_at = None;
    }
}

/// Parameters for creating a stop.
#[derive(Debug, Clone)]
pub struct StopParams {
    pub symbol: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_type: StopType,
    pub stop_percentage: Decimal,
    pub trailing_distance: Option<Decimal>,
}

#[derive(Debug, Default)]
struct DrawdownState {
    daily_start_value: Decimal,
    portfolio_stopped: bool,
}

/// Thread-safe registry; every public method is atomic with respect to the
/// others. Mutations mirror to the key-value store under `stop_loss/<id>`
/// after the lock is released; no lock is held across I/O.
pub struct StopLossRegistry {
    stops: Mutex<HashMap<String, StopLossOrder>>,
    drawdown: Mutex<DrawdownState>,
    max_daily_drawdown_pct: Decimal,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: SharedClock,
}

impl StopLossRegistry {
    pub fn new(clock: SharedClock, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            stops: Mutex::new(HashMap::new()),
            drawdown: Mutex::new(DrawdownState::default()),
            max_daily_drawdown_pct: dec!(10),
            store,
            clock,
        }
    }

    pub fn with_max_daily_drawdown(mut self, pct: Decimal) -> Self {
        self.max_daily_drawdown_pct = pct;
        self
    }

    /// Load all persisted active stops. Called once on boot.
    pub async fn load_active(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut loaded = 0;
        for key in store.list("stop_loss").await? {
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            match decode_record::<StopLossOrder>(&bytes) {
                Ok(stop) if stop.is_active => {
                    self.stops.lock().insert(stop.id.clone(), stop);
                    loaded += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable stop record {key}: {e}"),
            }
        }
        if loaded > 0 {
            info!("🛑 Stop-loss registry: {loaded} active stops restored");
        }
        Ok(loaded)
    }

    async fn persist(&self, stop: &StopLossOrder) {
        let Some(store) = &self.store else { return };
        let key = format!("stop_loss/{}.json", stop.id);
        match encode_record(stop) {
            Ok(bytes) => {
                if let Err(e) = store.put(&key, bytes).await {
                    warn!("Stop-loss persist failed for {}: {e}", stop.id);
                }
            }
            Err(e) => warn!("Stop-loss encode failed for {}: {e}", stop.id),
        }
    }

    /// Create a stop. For TRAILING the trailing distance defaults to
    /// `stop_percentage` when not given explicitly.
    pub async fn create_stop(&self, params: StopParams) -> StopLossOrder {
        let trailing = params.trailing_distance.unwrap_or(params.stop_percentage);
        let mut stop = StopLossOrder {
            id: Uuid::new_v4().to_string(),
            symbol: params.symbol,
            entry_price: params.entry_price,
            quantity: params.quantity,
            stop_type: params.stop_type,
            stop_percentage: params.stop_percentage,
            trailing_distance: trailing,
            atr_multiplier: dec!(2),
            current_stop_price: Decimal::ZERO,
            highest_price: params.entry_price,
            is_active: true,
            created_at: self.clock.now_utc(),
            triggered_at: None,
            triggered_price: None,
            result_pnl_pct: None,
        };
        stop.current_stop_price = stop.initial_stop();

        info!(
            "🛑 Stop created: {} {:?} @ {} (stop {})",
            stop.symbol, stop.stop_type, stop.entry_price, stop.current_stop_price
        );

        self.stops.lock().insert(stop.id.clone(), stop.clone());
        self.persist(&stop).await;
        stop
    }

    /// Update every active stop with current prices (and optional ATR
    /// values). Returns the stops that fired this round, now pending.
    pub async fn update(
        &self,
        prices: &HashMap<String, Decimal>,
        atrs: Option<&HashMap<String, Decimal>>,
    ) -> Vec<StopLossOrder> {
        let now = self.clock.now_utc();
        let mut triggered = Vec::new();
        let mut dirty = Vec::new();
        {
            let mut stops = self.stops.lock();
            for stop in stops.values_mut() {
                let Some(&price) = prices.get(&stop.symbol) else {
                    continue;
                };
                let atr = atrs.and_then(|m| m.get(&stop.symbol).copied());
                let before = (stop.current_stop_price, stop.highest_price);
                if stop.update(price, atr, now) {
                    triggered.push(stop.clone());
                    dirty.push(stop.clone());
                } else if (stop.current_stop_price, stop.highest_price) != before {
                    dirty.push(stop.clone());
                }
            }
        }
        for stop in &dirty {
            self.persist(stop).await;
        }
        triggered
    }

    /// Confirm a pending trigger after the market sell succeeded.
    pub async fn confirm_trigger(&self, id: &str) -> Option<StopLossOrder> {
        let stop = {
            let mut stops = self.stops.lock();
            let stop = stops.get_mut(id)?;
            stop.confirm_trigger();
            stop.clone()
        };
        self.persist(&stop).await;
        Some(stop)
    }

    /// Return a pending trigger to ACTIVE after the market sell failed.
    pub async fn reactivate(&self, id: &str) -> Option<StopLossOrder> {
        let stop = {
            let mut stops = self.stops.lock();
            let stop = stops.get_mut(id)?;
            stop.reactivate();
            stop.clone()
        };
        self.persist(&stop).await;
        Some(stop)
    }

    /// Unconditional deactivation (position exited by other means).
    pub async fn cancel_stop(&self, id: &str) -> bool {
        let stop = {
            let mut stops = self.stops.lock();
            match stops.get_mut(id) {
                Some(stop) => {
                    stop.is_active = false;
                    stop.clone()
                }
                None => return false,
            }
        };
        self.persist(&stop).await;
        true
    }

    pub fn get(&self, id: &str) -> Option<StopLossOrder> {
        self.stops.lock().get(id).cloned()
    }

    pub fn active_stops(&self) -> Vec<StopLossOrder> {
        self.stops
            .lock()
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect()
    }

    // ── Portfolio drawdown guard ─────────────────────────────────────

    /// Daily portfolio guard. The first observation of the day becomes the
    /// baseline; a drawdown beyond the limit sets the sticky halt flag.
    pub fn check_portfolio_drawdown(&self, current_value: Decimal) -> (bool, String) {
        let mut dd = self.drawdown.lock();
        if dd.daily_start_value == Decimal::ZERO {
            dd.daily_start_value = current_value;
            return (false, String::new());
        }

        let drawdown = (current_value - dd.daily_start_value) / dd.daily_start_value * HUNDRED;
        if drawdown <= -self.max_daily_drawdown_pct {
            dd.portfolio_stopped = true;
            return (
                true,
                format!(
                    "Portfolio drawdown {drawdown:.1}% breached the {}% daily limit",
                    self.max_daily_drawdown_pct
                ),
            );
        }
        (false, String::new())
    }

    /// New UTC day: fresh baseline, halt flag cleared.
    pub fn reset_daily(&self, start_value: Decimal) {
        let mut dd = self.drawdown.lock();
        dd.daily_start_value = start_value;
        dd.portfolio_stopped = false;
    }

    pub fn is_portfolio_stopped(&self) -> bool {
        self.drawdown.lock().portfolio_stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn clock() -> SharedClock {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn registry() -> StopLossRegistry {
        StopLossRegistry::new(clock(), None)
    }

    fn trailing(symbol: &str, entry: Decimal, pct: Decimal) -> StopParams {
        StopParams {
            symbol: symbol.into(),
            entry_price: entry,
            quantity: dec!(0.001),
            stop_type: StopType::Trailing,
            stop_percentage: pct,
            trailing_distance: None,
        }
    }

    fn prices(symbol: &str, price: Decimal) -> HashMap<String, Decimal> {
        HashMap::from([(symbol.to_string(), price)])
    }

    #[tokio::test]
    async fn trailing_stop_ratchets_up() {
        let reg = registry();
        let stop = reg
            .create_stop(trailing("BTCUSDT", dec!(50000), dec!(5)))
            .await;
        assert_eq!(stop.current_stop_price, dec!(47500.00));

        reg.update(&prices("BTCUSDT", dec!(52000)), None).await;
        let stop = reg.get(&stop.id).unwrap();
        assert_eq!(stop.current_stop_price, dec!(49400.00));
        assert_eq!(stop.highest_price, dec!(52000));

        // Price dip does not lower the stop
        reg.update(&prices("BTCUSDT", dec!(50000)), None).await;
        let stop = reg.get(&stop.id).unwrap();
        assert_eq!(stop.current_stop_price, dec!(49400.00));
        assert_eq!(stop.highest_price, dec!(52000));
    }

    #[tokio::test]
    async fn trigger_is_pending_until_confirmed() {
        let reg = registry();
        let stop = reg
            .create_stop(trailing("BTCUSDT", dec!(50000), dec!(5)))
            .await;

        reg.update(&prices("BTCUSDT", dec!(52000)), None).await;
        let triggered = reg.update(&prices("BTCUSDT", dec!(49300)), None).await;
        assert_eq!(triggered.len(), 1);

        let pending = reg.get(&stop.id).unwrap();
        assert!(pending.is_trigger_pending());
        assert!(pending.is_active);

        // Not re-triggered while pending
        let again = reg.update(&prices("BTCUSDT", dec!(49000)), None).await;
        assert!(again.is_empty());

        let closed = reg.confirm_trigger(&stop.id).await.unwrap();
        assert!(!closed.is_active);
        // Entry 50000, triggered at 49300 → -1.4%
        assert_eq!(closed.result_pnl_pct.unwrap(), dec!(-1.4));
    }

    #[tokio::test]
    async fn reactivate_clears_trigger_fields() {
        let reg = registry();
        let stop = reg
            .create_stop(trailing("BTCUSDT", dec!(50000), dec!(5)))
            .await;
        reg.update(&prices("BTCUSDT", dec!(47000)), None).await;
        assert!(reg.get(&stop.id).unwrap().is_trigger_pending());

        reg.reactivate(&stop.id).await;
        let stop = reg.get(&stop.id).unwrap();
        assert!(stop.is_active);
        assert!(stop.triggered_at.is_none());
        assert!(stop.triggered_price.is_none());
    }

    #[tokio::test]
    async fn break_even_moves_stop_to_entry() {
        let reg = registry();
        let stop = reg
            .create_stop(StopParams {
                symbol: "ETHUSDT".into(),
                entry_price: dec!(3000),
                quantity: dec!(0.1),
                stop_type: StopType::BreakEven,
                stop_percentage: dec!(5),
                trailing_distance: None,
            })
            .await;

        // +6% profit crosses the 5% threshold
        reg.update(&prices("ETHUSDT", dec!(3180)), None).await;
        let stop = reg.get(&stop.id).unwrap();
        assert_eq!(stop.current_stop_price, dec!(3000));
    }

    #[tokio::test]
    async fn atr_stop_uses_supplied_atr() {
        let reg = registry();
        let stop = reg
            .create_stop(StopParams {
                symbol: "BTCUSDT".into(),
                entry_price: dec!(50000),
                quantity: dec!(0.001),
                stop_type: StopType::Atr,
                stop_percentage: dec!(5),
                trailing_distance: None,
            })
            .await;

        let atrs = HashMap::from([("BTCUSDT".to_string(), dec!(500))]);
        reg.update(&prices("BTCUSDT", dec!(51000)), Some(&atrs)).await;
        let stop = reg.get(&stop.id).unwrap();
        // 51000 - 2 × 500
        assert_eq!(stop.current_stop_price, dec!(50000));
    }

    #[tokio::test]
    async fn portfolio_drawdown_halts_and_resets() {
        let reg = registry();
        let (halt, _) = reg.check_portfolio_drawdown(dec!(10000));
        assert!(!halt);

        let (halt, reason) = reg.check_portfolio_drawdown(dec!(8900));
        assert!(halt);
        assert!(reg.is_portfolio_stopped());
        assert!(reason.contains("drawdown"));

        reg.reset_daily(dec!(8900));
        assert!(!reg.is_portfolio_stopped());
    }

    #[tokio::test]
    async fn small_drawdown_does_not_halt() {
        let reg = registry();
        reg.check_portfolio_drawdown(dec!(10000));
        let (halt, _) = reg.check_portfolio_drawdown(dec!(9500));
        assert!(!halt);
        assert!(!reg.is_portfolio_stopped());
    }
}
