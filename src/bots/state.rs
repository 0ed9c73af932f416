//! GridBot persistence and boot-time reconciliation.
//!
//! State is a versioned JSON record written atomically after every tick.
//! On boot the persisted order set is replayed against the exchange to
//! discover fills that happened while the process was down; their
//! follow-ups are queued and drained once the grid strategy exists.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bots::grid_bot::{ActiveOrder, DowntimeFill, FailedFollowUp, GridBot, LoadOutcome};
use crate::bots::orders::FOLLOWUP_BACKOFF_MINUTES;
use crate::bots::risk::fee_adjusted_quantity;
use crate::exchange::{OrderSide, OrderStatus};
use crate::state::{decode_record, encode_record};
use crate::strategies::FollowUpAction;

/// Configuration snapshot stored alongside the order set; a mismatch on
/// load invalidates the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub symbol: String,
    pub investment: Decimal,
    pub num_grids: u32,
    pub grid_range_percent: Decimal,
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotStateRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub active_orders: HashMap<String, ActiveOrder>,
    pub config: ConfigSnapshot,
}

impl GridBot {
    fn config_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            symbol: self.config.symbol.clone(),
            investment: self.config.investment,
            num_grids: self.config.num_grids,
            grid_range_percent: self.config.grid_range_percent,
            testnet: self.config.testnet,
        }
    }

    /// Atomic state write. Failures are logged, never propagated: a
    /// failed save must not take down a healthy trading loop.
    pub async fn save_state(&self) {
        let record = BotStateRecord {
            timestamp: self.clock.now_utc(),
            symbol: self.config.symbol.clone(),
            active_orders: self.active_orders.clone(),
            config: self.config_snapshot(),
        };

        let bytes = match encode_record(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("State encode failed for {}: {e}", self.config.symbol);
                return;
            }
        };
        if let Err(e) = self.store.put(&self.config.state_key(), bytes).await {
            error!("State save failed for {}: {e}", self.config.symbol);
        }
    }

    /// Replay persisted state against the exchange.
    ///
    /// Rejected outright (fresh start + orphan cleanup) when the persisted
    /// config no longer matches. Every surviving order is re-validated
    /// against its live status; downtime fills are journaled, stop-
    /// protected and queued for follow-up placement.
    pub async fn load_state(&mut self) -> Result<LoadOutcome> {
        let Some(bytes) = self.store.get(&self.config.state_key()).await? else {
            return Ok(LoadOutcome::Fresh);
        };

        let record: BotStateRecord = match decode_record(&bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    "Corrupt state for {} - starting fresh: {e}",
                    self.config.symbol
                );
                return Ok(LoadOutcome::Fresh);
            }
        };

        if record.config.symbol != self.config.symbol
            || record.config.investment != self.config.investment
        {
            warn!(
                "Config changed for {} (was {} / {}) - discarding state",
                self.config.symbol, record.config.symbol, record.config.investment
            );
            self.cancel_orphaned_orders(&record.config.symbol).await;
            return Ok(LoadOutcome::Fresh);
        }

        let loaded_count = record.active_orders.len();
        let mut validated: HashMap<String, ActiveOrder> = HashMap::new();

        for (order_id, mut order_info) in record.active_orders {
            // A pending failed-followup survives the restart as-is; its
            // retry schedule resumes on the next tick.
            if order_info.failed_followup.is_some() {
                validated.insert(order_id, order_info);
                continue;
            }

            let status = match self
                .client
                .get_order_status(&self.config.symbol, &order_id)
                .await
            {
                Ok(Some(status)) => status,
                Ok(None) => {
                    warn!("Order {order_id} not found on exchange - dropping");
                    continue;
                }
                Err(e) => {
                    warn!("Could not validate order {order_id}: {e}");
                    continue;
                }
            };

            let executed_qty = status.executed_qty;
            match status.status {
                OrderStatus::New => {
                    info!("Order {order_id} validated: still open");
                    validated.insert(order_id, order_info);
                }
                OrderStatus::Filled => {
                    let filled_price = if status.price > Decimal::ZERO {
                        status.price
                    } else {
                        order_info.price
                    };
                    let filled_qty = if executed_qty > Decimal::ZERO {
                        executed_qty
                    } else {
                        order_info.quantity
                    };

                    info!(
                        "Order {order_id} filled during downtime: {} @ {filled_price} x {filled_qty}",
                        order_info.side
                    );
                    self.journal_trade(
                        order_info.side,
                        filled_price,
                        filled_qty,
                        "Downtime fill",
                    );
                    if order_info.side == OrderSide::Buy {
                        self.create_stop_for_fill(filled_price, filled_qty).await;
                    }
                    self.pending_followups.push(DowntimeFill {
                        order_id,
                        side: order_info.side,
                        price: filled_price,
                        quantity: filled_qty,
                    });
                    self.notifier
                        .send(
                            &format!(
                                "🔄 Downtime fill detected\n\
                                 Symbol: {}\n\
                                 Side: {}\n\
                                 Price: {filled_price:.2}\n\
                                 Quantity: {filled_qty}",
                                self.config.symbol, order_info.side
                            ),
                            false,
                        )
                        .await;
                }
                OrderStatus::Canceled if executed_qty > Decimal::ZERO => {
                    let filled_price = if status.price > Decimal::ZERO {
                        status.price
                    } else {
                        order_info.price
                    };
                    info!(
                        "Order {order_id} canceled with partial fill during downtime: {} of {}",
                        executed_qty, order_info.quantity
                    );
                    self.journal_trade(
                        order_info.side,
                        filled_price,
                        executed_qty,
                        "Downtime partial fill",
                    );
                    if order_info.side == OrderSide::Buy {
                        self.create_stop_for_fill(
                            filled_price,
                            fee_adjusted_quantity(executed_qty),
                        )
                        .await;
                    }
                    // No follow-up for partial fills.
                }
                OrderStatus::PartiallyFilled => {
                    info!("Order {order_id} partially filled ({executed_qty})");
                    order_info.executed_qty = Some(executed_qty);
                    validated.insert(order_id, order_info);
                }
                other => {
                    info!("Order {order_id} status {other:?} - dropping");
                }
            }
        }

        info!(
            "State loaded for {}: {}/{loaded_count} orders validated",
            self.config.symbol,
            validated.len()
        );

        self.active_orders = validated;
        if self.active_orders.is_empty() {
            Ok(LoadOutcome::Fresh)
        } else {
            Ok(LoadOutcome::Restored)
        }
    }

    /// Drain follow-ups queued from downtime fills. Requires the strategy,
    /// so this runs after `initialize`. Placement failures become regular
    /// failed-followup records with backoff.
    pub async fn process_pending_followups(&mut self) {
        if self.pending_followups.is_empty() || self.strategy.is_none() {
            return;
        }

        let fills: Vec<DowntimeFill> = std::mem::take(&mut self.pending_followups);
        info!("Processing {} downtime fills", fills.len());

        for fill in fills {
            let action = match fill.side {
                OrderSide::Buy => self
                    .strategy
                    .as_mut()
                    .expect("checked above")
                    .on_buy_filled(fill.price),
                OrderSide::Sell => self
                    .strategy
                    .as_mut()
                    .expect("checked above")
                    .on_sell_filled(fill.price),
            };

            if action == FollowUpAction::None {
                info!(
                    "No follow-up for downtime fill {} @ {}",
                    fill.side, fill.price
                );
                continue;
            }

            use crate::bots::orders::FollowUpPlacement;
            match self.place_follow_up(&action).await {
                FollowUpPlacement::Placed => {
                    info!("Downtime follow-up placed for fill @ {}", fill.price);
                }
                FollowUpPlacement::Vetoed(reason) => {
                    warn!("Downtime follow-up blocked by risk check: {reason}");
                }
                FollowUpPlacement::Failed(error) => {
                    error!("Downtime follow-up failed, queueing retry: {error}");
                    let next_retry = self.clock.now_utc()
                        + chrono::Duration::minutes(FOLLOWUP_BACKOFF_MINUTES[0]);
                    self.active_orders.insert(
                        fill.order_id.clone(),
                        ActiveOrder {
                            side: fill.side,
                            price: fill.price,
                            quantity: fill.quantity,
                            created_at: self.clock.now_utc(),
                            executed_qty: None,
                            failed_followup: Some(FailedFollowUp {
                                intended: action,
                                retry_count: 1,
                                next_retry_at: next_retry,
                            }),
                        },
                    );
                }
            }
        }
    }

    /// Cancel whatever the exchange still has open for a symbol whose
    /// persisted config no longer matches. Prevents orphaned orders.
    async fn cancel_orphaned_orders(&self, symbol: &str) {
        let open = match self.client.get_open_orders(symbol).await {
            Ok(open) => open,
            Err(e) => {
                warn!("Could not list orphaned orders for {symbol}: {e}");
                return;
            }
        };
        for order in open {
            match self.client.cancel_order(symbol, &order.order_id).await {
                Ok(_) => info!("Cancelled orphaned order {} on {symbol}", order.order_id),
                Err(e) => warn!(
                    "Failed to cancel orphaned order {} on {symbol}: {e}",
                    order.order_id
                ),
            }
        }
    }
}
