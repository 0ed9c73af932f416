//! GridBot order lifecycle: initial placement, fill reconciliation,
//! partial fills and failed-follow-up retries.

use anyhow::Result;
use chrono::Duration;
use log::{error, info, warn};
use rust_decimal::Decimal;

use crate::bots::grid_bot::{ActiveOrder, FailedFollowUp, GridBot};
use crate::bots::risk::{fee_adjusted_quantity, GateDecision};
use crate::exchange::{OrderRecord, OrderSide, OrderStatus, TAKER_FEE_RATE};
use crate::strategies::FollowUpAction;
use crate::telemetry::TradeRecord;

/// Attempts before a failed follow-up is abandoned.
pub const MAX_FOLLOWUP_RETRIES: u32 = 5;
/// Backoff schedule between retries, minutes.
pub const FOLLOWUP_BACKOFF_MINUTES: [i64; 5] = [2, 5, 15, 30, 60];

impl GridBot {
    /// Place the initial BUY ladder below the current price. Orders below
    /// the symbol limits are skipped with a log line; risk-gate vetoes are
    /// decisions, not errors.
    pub async fn place_initial_orders(&mut self) -> Result<()> {
        let Some(current_price) = self.client.get_current_price(&self.config.symbol).await
        else {
            error!("Cannot place initial orders: price unavailable");
            return Ok(());
        };
        if current_price <= Decimal::ZERO {
            error!("Cannot place initial orders: invalid price {current_price}");
            return Ok(());
        }

        let info = self.symbol_info.clone().expect("initialized");
        let orders = self
            .strategy
            .as_ref()
            .expect("initialized")
            .initial_orders(current_price);

        let mut placed = 0usize;
        let mut failed = 0usize;

        info!("Placing {} buy orders", orders.buys.len());
        for order in &orders.buys {
            let notional = order.quantity * order.price;
            if notional < info.min_notional {
                warn!(
                    "Order too small (notional {notional:.2}): {} x {}",
                    order.price, order.quantity
                );
                continue;
            }
            if order.quantity < info.min_qty {
                warn!("Quantity too small ({} < {})", order.quantity, info.min_qty);
                continue;
            }

            match self
                .validate_order_risk(OrderSide::Buy, order.quantity, order.price)
                .await
            {
                GateDecision::Allow => {}
                GateDecision::Block(reason) => {
                    warn!("Order blocked by risk check: {reason}");
                    failed += 1;
                    continue;
                }
            }

            match self
                .client
                .place_limit_buy(&self.config.symbol, order.quantity, order.price)
                .await
            {
                Ok(placed_order) => {
                    self.track_order(&placed_order, OrderSide::Buy, order.price, order.quantity);
                    info!("Buy order placed: {} x {}", order.price, order.quantity);
                    placed += 1;
                }
                Err(e) => {
                    warn!("Order placement failed: {e}");
                    failed += 1;
                }
            }
        }

        info!("Orders placed: {placed} ok, {failed} failed");
        if placed > 0 {
            self.notifier
                .send(&format!("📊 {placed} grid orders placed for {}", self.config.symbol), false)
                .await;
        }
        Ok(())
    }

    /// Reconcile the in-memory order set against the exchange and react to
    /// fills. Errors propagate to the tick error counter.
    pub(crate) async fn check_orders(&mut self) -> Result<()> {
        let open_orders = self
            .client
            .get_open_orders(&self.config.symbol)
            .await
            .map_err(anyhow::Error::from)?;
        let open_ids: std::collections::HashSet<String> =
            open_orders.iter().map(|o| o.order_id.clone()).collect();

        let tracked: Vec<String> = self.active_orders.keys().cloned().collect();
        for order_id in tracked {
            let Some(order_info) = self.active_orders.get(&order_id).cloned() else {
                continue;
            };

            // Failed follow-ups have their own retry schedule.
            if order_info.failed_followup.is_some() {
                self.retry_failed_followup(&order_id, &order_info).await;
                continue;
            }

            if open_ids.contains(&order_id) {
                continue;
            }

            let status = match self
                .client
                .get_order_status(&self.config.symbol, &order_id)
                .await
            {
                Ok(Some(status)) => status,
                Ok(None) => {
                    warn!("Could not fetch status for order {order_id}");
                    continue;
                }
                Err(e) => {
                    warn!("Status query failed for order {order_id}: {e}");
                    continue;
                }
            };

            match status.status {
                OrderStatus::PartiallyFilled => {
                    info!(
                        "Order {order_id} partially filled ({}/{}) - keep tracking",
                        status.executed_qty, order_info.quantity
                    );
                    if let Some(entry) = self.active_orders.get_mut(&order_id) {
                        entry.executed_qty = Some(status.executed_qty);
                    }
                }
                OrderStatus::Canceled if status.executed_qty > Decimal::ZERO => {
                    info!(
                        "Order {order_id} canceled with partial fill: {} of {}",
                        status.executed_qty, order_info.quantity
                    );
                    self.process_partial_fill(&order_id, &order_info, &status).await;
                }
                OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::PendingCancel => {
                    info!("Order {order_id} status {:?} - removing", status.status);
                    self.active_orders.remove(&order_id);
                }
                OrderStatus::Filled => {
                    self.handle_fill(&order_id, &order_info, &status).await;
                }
                OrderStatus::New => {
                    // Inconsistent snapshot (not in open orders yet NEW);
                    // keep and recheck next tick.
                    warn!("Order {order_id} reported NEW but not open - keeping");
                }
            }
        }

        Ok(())
    }

    /// A tracked order fully filled: journal it, protect BUY inventory
    /// with a stop, then place the grid follow-up one level away.
    async fn handle_fill(&mut self, order_id: &str, order_info: &ActiveOrder, status: &OrderRecord) {
        let filled_price = if status.price > Decimal::ZERO {
            status.price
        } else {
            order_info.price
        };
        let filled_qty = if status.executed_qty > Decimal::ZERO {
            status.executed_qty
        } else {
            order_info.quantity
        };

        info!(
            "Order filled: {} @ {filled_price} x {filled_qty}",
            order_info.side
        );
        let emoji = match order_info.side {
            OrderSide::Buy => "🟢",
            OrderSide::Sell => "🔴",
        };
        self.notifier
            .send(
                &format!(
                    "{emoji} Order filled\n\
                     Symbol: {}\n\
                     Side: {}\n\
                     Price: {filled_price:.2}\n\
                     Quantity: {filled_qty}",
                    self.config.symbol, order_info.side
                ),
                false,
            )
            .await;

        self.journal_trade(order_info.side, filled_price, filled_qty, "Grid order filled");

        if order_info.side == OrderSide::Buy {
            self.create_stop_for_fill(filled_price, fee_adjusted_quantity(filled_qty))
                .await;
        }

        let action = match order_info.side {
            OrderSide::Buy => self
                .strategy
                .as_mut()
                .expect("initialized")
                .on_buy_filled(filled_price),
            OrderSide::Sell => self
                .strategy
                .as_mut()
                .expect("initialized")
                .on_sell_filled(filled_price),
        };

        if action == FollowUpAction::None {
            info!(
                "No follow-up for {} @ {filled_price}",
                order_info.side
            );
            self.active_orders.remove(order_id);
            return;
        }

        match self.place_follow_up(&action).await {
            FollowUpPlacement::Placed => {
                self.active_orders.remove(order_id);
            }
            FollowUpPlacement::Vetoed(reason) => {
                warn!("Follow-up blocked by risk check: {reason}");
                self.notifier
                    .send(
                        &format!(
                            "Follow-up blocked\nSymbol: {}\nReason: {reason}",
                            self.config.symbol
                        ),
                        false,
                    )
                    .await;
                self.active_orders.remove(order_id);
            }
            FollowUpPlacement::Failed(error) => {
                let next_retry = self.clock.now_utc()
                    + Duration::minutes(FOLLOWUP_BACKOFF_MINUTES[0]);
                warn!(
                    "Follow-up failed (attempt 1/{MAX_FOLLOWUP_RETRIES}), next retry at {}: {error}",
                    next_retry.format("%H:%M")
                );
                if let Some(entry) = self.active_orders.get_mut(order_id) {
                    entry.failed_followup = Some(FailedFollowUp {
                        intended: action,
                        retry_count: 1,
                        next_retry_at: next_retry,
                    });
                }
            }
        }
    }

    /// Canceled-with-partial-fill: journal the filled portion, create a
    /// stop for BUY fills, remove the record. Deliberately no follow-up.
    async fn process_partial_fill(
        &mut self,
        order_id: &str,
        order_info: &ActiveOrder,
        status: &OrderRecord,
    ) {
        let filled_qty = status.executed_qty;
        if filled_qty <= Decimal::ZERO {
            self.active_orders.remove(order_id);
            return;
        }
        let filled_price = if status.price > Decimal::ZERO {
            status.price
        } else {
            order_info.price
        };

        let fee = filled_price * filled_qty * TAKER_FEE_RATE;
        info!(
            "Partial fill processed: {} @ {filled_price:.2} x {filled_qty} (fee {fee:.4})",
            order_info.side
        );
        self.notifier
            .send(
                &format!(
                    "⚠️ Partial fill\n\
                     Symbol: {}\n\
                     Side: {}\n\
                     Price: {filled_price:.2}\n\
                     Quantity: {filled_qty} / {}\n\
                     Status: canceled after partial fill",
                    self.config.symbol, order_info.side, order_info.quantity
                ),
                false,
            )
            .await;

        self.journal_trade(
            order_info.side,
            filled_price,
            filled_qty,
            "Canceled after partial fill",
        );

        if order_info.side == OrderSide::Buy {
            self.create_stop_for_fill(filled_price, fee_adjusted_quantity(filled_qty))
                .await;
        }

        self.active_orders.remove(order_id);
    }

    /// Retry a previously failed follow-up once its backoff has elapsed.
    async fn retry_failed_followup(&mut self, order_id: &str, order_info: &ActiveOrder) {
        let Some(failed) = &order_info.failed_followup else {
            return;
        };

        if failed.retry_count >= MAX_FOLLOWUP_RETRIES {
            error!(
                "Follow-up for order {order_id} abandoned after {} attempts",
                failed.retry_count
            );
            self.notifier
                .send(
                    &format!(
                        "🚨 CRITICAL: follow-up abandoned\n\
                         Symbol: {}\n\
                         Order: {order_id}\n\
                         Side: {}\n\
                         Price: {}\n\
                         Attempts: {}/{MAX_FOLLOWUP_RETRIES}\n\
                         Manual reconciliation required",
                        self.config.symbol, order_info.side, order_info.price, failed.retry_count
                    ),
                    true,
                )
                .await;
            self.active_orders.remove(order_id);
            return;
        }

        if self.clock.now_utc() < failed.next_retry_at {
            return;
        }

        if failed.intended == FollowUpAction::None {
            self.active_orders.remove(order_id);
            return;
        }

        info!(
            "Retrying follow-up for order {order_id} (attempt {}/{MAX_FOLLOWUP_RETRIES})",
            failed.retry_count + 1
        );

        let action = failed.intended.clone();
        let retry_count = failed.retry_count;
        match self.place_follow_up(&action).await {
            FollowUpPlacement::Placed => {
                self.active_orders.remove(order_id);
                info!("Follow-up retry succeeded for order {order_id}");
            }
            outcome => {
                if let FollowUpPlacement::Vetoed(reason) = &outcome {
                    warn!("Follow-up retry blocked by risk check: {reason}");
                }
                let backoff_idx =
                    (retry_count as usize).min(FOLLOWUP_BACKOFF_MINUTES.len() - 1);
                let next_retry = self.clock.now_utc()
                    + Duration::minutes(FOLLOWUP_BACKOFF_MINUTES[backoff_idx]);
                if let Some(entry) = self.active_orders.get_mut(order_id) {
                    if let Some(failed) = entry.failed_followup.as_mut() {
                        failed.retry_count += 1;
                        failed.next_retry_at = next_retry;
                    }
                }
                warn!(
                    "Follow-up retry failed, next attempt at {}",
                    next_retry.format("%H:%M")
                );
            }
        }
    }

    /// Gate and place one follow-up order.
    pub(crate) async fn place_follow_up(&mut self, action: &FollowUpAction) -> FollowUpPlacement {
        let (side, price, quantity) = match action {
            FollowUpAction::PlaceSell { price, quantity } => (OrderSide::Sell, *price, *quantity),
            FollowUpAction::PlaceBuy { price, quantity } => (OrderSide::Buy, *price, *quantity),
            FollowUpAction::None => return FollowUpPlacement::Placed,
        };

        match self.validate_order_risk(side, quantity, price).await {
            GateDecision::Allow => {}
            GateDecision::Block(reason) => return FollowUpPlacement::Vetoed(reason),
        }

        let result = match side {
            OrderSide::Sell => {
                self.client
                    .place_limit_sell(&self.config.symbol, quantity, price)
                    .await
            }
            OrderSide::Buy => {
                self.client
                    .place_limit_buy(&self.config.symbol, quantity, price)
                    .await
            }
        };

        match result {
            Ok(order) => {
                self.track_order(&order, side, price, quantity);
                info!("{side} order placed: {price} x {quantity}");
                FollowUpPlacement::Placed
            }
            Err(e) => {
                error!("{side} order failed: {e}");
                FollowUpPlacement::Failed(e.to_string())
            }
        }
    }

    pub(crate) fn track_order(
        &mut self,
        order: &OrderRecord,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
    ) {
        self.active_orders.insert(
            order.order_id.clone(),
            ActiveOrder {
                side,
                price,
                quantity,
                created_at: self.clock.now_utc(),
                executed_qty: None,
                failed_followup: None,
            },
        );
    }

    pub(crate) fn journal_trade(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        reason: &str,
    ) {
        let value = price * quantity;
        self.telemetry.trade(&TradeRecord {
            timestamp: self.clock.now_utc(),
            action: side.to_string(),
            symbol: self.config.symbol.clone(),
            price,
            quantity,
            value_usd: value,
            fee_usd: value * TAKER_FEE_RATE,
            reasoning: format!("{reason} at {price}"),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FollowUpPlacement {
    Placed,
    Vetoed(String),
    Failed(String),
}
