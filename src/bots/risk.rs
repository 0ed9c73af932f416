//! GridBot risk checks: pre-trade gate, circuit breaker, stop handling.

use std::collections::HashMap;

use log::{error, info, warn};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::bots::grid_bot::GridBot;
use crate::exchange::{OrderSide, TAKER_FEE_RATE};
use crate::risk::{StopParams, StopType};

/// Outcome of the pre-trade risk gate. A veto is a decision, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Block(String),
}

impl GridBot {
    /// Three checks in order, first failure vetoes: portfolio halt (all
    /// sides), position-size cap (BUY), allocation envelope (BUY). Sizer
    /// or constraint failures log and allow (graceful degradation).
    pub(crate) async fn validate_order_risk(
        &self,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> GateDecision {
        let order_value = quantity * price;

        // 1. Portfolio-wide halt blocks everything.
        if self.stops.is_portfolio_stopped() {
            return GateDecision::Block(
                "Portfolio drawdown limit reached - all trading halted".into(),
            );
        }

        if side != OrderSide::Buy {
            return GateDecision::Allow;
        }

        let quote_asset = match &self.symbol_info {
            Some(info) => info.quote_asset.clone(),
            None => return GateDecision::Allow,
        };

        // 2. Position-size cap.
        if let Some(sizer) = &self.sizer {
            match self.client.get_account_balance(&quote_asset).await {
                Ok(portfolio_value) if portfolio_value > Decimal::ZERO => {
                    match sizer.max_position(&self.config.symbol, portfolio_value, 0.5) {
                        Ok(max_position) if order_value > max_position => {
                            return GateDecision::Block(format!(
                                "Order {order_value:.2} exceeds max position {max_position:.2}"
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Position sizer failed (allowing order): {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Balance query failed in risk gate (allowing order): {e}"),
            }
        }

        // 3. Allocation envelope (cash reserve floor).
        if let Some(constraints) = &self.constraints {
            match self.client.get_account_balance(&quote_asset).await {
                Ok(portfolio_value) if portfolio_value > Decimal::ZERO => {
                    let current_invested: Decimal = self
                        .active_orders
                        .values()
                        .filter(|o| o.side == OrderSide::Buy)
                        .map(|o| o.quantity * o.price)
                        .sum();
                    match constraints
                        .available_capital(portfolio_value + current_invested, current_invested)
                    {
                        Ok(available) if order_value > available => {
                            return GateDecision::Block(format!(
                                "Order {order_value:.2} exceeds available capital \
                                 {available:.2} (cash reserve enforced)"
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Allocation check failed (allowing order): {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Balance query failed in risk gate (allowing order): {e}"),
            }
        }

        GateDecision::Allow
    }

    /// Flash-crash guard: a drop of `circuit_breaker_pct` or more against
    /// the last accepted observation emergency-stops the bot. Zero or
    /// negative observations neither trigger nor move the reference.
    pub(crate) async fn check_circuit_breaker(&mut self, current_price: Decimal) -> bool {
        if self.last_known_price <= Decimal::ZERO {
            self.last_known_price = current_price;
            return false;
        }
        if current_price <= Decimal::ZERO {
            return false;
        }

        let drop_pct =
            (self.last_known_price - current_price) / self.last_known_price * dec!(100);
        if drop_pct >= self.config.circuit_breaker_pct() {
            let reason = format!(
                "Circuit breaker: {} dropped {drop_pct:.1}% ({} → {current_price})",
                self.config.symbol, self.last_known_price
            );
            self.emergency_stop(&reason).await;
            return true;
        }

        self.last_known_price = current_price;
        false
    }

    /// Trailing stop for freshly bought inventory.
    pub(crate) async fn create_stop_for_fill(&self, entry_price: Decimal, quantity: Decimal) {
        let stop = self
            .stops
            .create_stop(StopParams {
                symbol: self.config.symbol.clone(),
                entry_price,
                quantity,
                stop_type: StopType::Trailing,
                stop_percentage: self.config.stop_loss_pct(),
                trailing_distance: None,
            })
            .await;
        info!(
            "Stop-loss created: {} (trailing {}%)",
            stop.current_stop_price,
            self.config.stop_loss_pct()
        );
    }

    /// Update this symbol's stops and resolve every trigger in the same
    /// tick: market sell via the shared executor, then confirm or
    /// reactivate.
    pub(crate) async fn check_stop_losses(&mut self, current_price: Decimal) {
        let prices = HashMap::from([(self.config.symbol.clone(), current_price)]);
        let triggered = self.stops.update(&prices, None).await;

        for stop in triggered {
            warn!("STOP-LOSS TRIGGERED: {} @ {current_price}", stop.symbol);
            self.notifier
                .send(
                    &format!(
                        "STOP-LOSS TRIGGERED\n\
                         Symbol: {}\n\
                         Price: {current_price:.2}\n\
                         Quantity: {}",
                        stop.symbol, stop.quantity
                    ),
                    false,
                )
                .await;

            match self
                .stop_executor
                .execute_sell(&stop.symbol, stop.quantity)
                .await
            {
                Ok(order) => {
                    self.stops.confirm_trigger(&stop.id).await;
                    info!("Stop-loss sell confirmed: {} {}", order.executed_qty, stop.symbol);
                    self.journal_trade(
                        OrderSide::Sell,
                        current_price,
                        order.executed_qty,
                        "Stop-loss sell",
                    );
                }
                Err(e) => {
                    self.stops.reactivate(&stop.id).await;
                    error!("Stop-loss sell FAILED, stop re-activated for {}: {e}", stop.symbol);
                }
            }
        }
    }
}

// Fee-adjusted inventory helper shared by fill paths.
pub(crate) fn fee_adjusted_quantity(quantity: Decimal) -> Decimal {
    quantity * (Decimal::ONE - TAKER_FEE_RATE)
}
