//! Exchange capability: price, metadata, orders, balances.
//!
//! One trait covers the live REST client and the paper-trading simulator;
//! everything above this layer is implementation-agnostic. Concurrency is
//! the implementation's problem (signed-request serialization etc.); the
//! trait is shared freely via `Arc<dyn ExchangeClient>`.

pub mod paper;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use paper::PaperExchange;

/// Spot taker fee applied to every fill (0.1%).
pub const TAKER_FEE_RATE: Decimal = rust_decimal_macros::dec!(0.001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

/// Exchange-reported order status, Binance naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    PendingCancel,
}

impl OrderStatus {
    /// True for statuses that will never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }
}

/// Full order record as returned by status queries and placements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub orig_qty: Decimal,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl OrderRecord {
    /// Average fill price, `cumulative_quote_qty / executed_qty`.
    ///
    /// Falls back to the limit price when nothing executed (market orders
    /// always report executed quantity).
    pub fn avg_fill_price(&self) -> Decimal {
        if self.executed_qty > Decimal::ZERO && self.cumulative_quote_qty > Decimal::ZERO {
            self.cumulative_quote_qty / self.executed_qty
        } else {
            self.price
        }
    }
}

/// 24-hour rolling ticker for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: Decimal,
    pub price_change_percent: Decimal,
    pub high_price: Decimal,
    pub low_price: Decimal,
    pub volume: Decimal,
}

/// Per-pair trading limits. Every placed order satisfies all four.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub min_qty: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
    pub tick_size: Decimal,
}

impl SymbolInfo {
    /// Floor a quantity to the symbol's step size.
    pub fn floor_to_step(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.step_size).floor() * self.step_size
    }

    /// Round a price to the nearest tick.
    pub fn round_to_tick(&self, price: Decimal) -> Decimal {
        if self.tick_size <= Decimal::ZERO {
            return price;
        }
        (price / self.tick_size).round() * self.tick_size
    }
}

/// Failure kinds surfaced by the exchange boundary.
///
/// Transient and rate-limit errors are retried inside the client; what
/// reaches the caller is already post-retry, so callers treat any error as
/// a placement failure and apply their own policy (failed-followup queue,
/// stop reactivation, notification).
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("exchange rejected request: {0}")]
    Client(String),
    #[error("transient exchange failure: {0}")]
    Transient(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

pub type SharedExchange = Arc<dyn ExchangeClient>;

/// The 13-method exchange surface shared by live and paper trading.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Latest traded price; `None` means unavailable (caller counts failures).
    async fn get_current_price(&self, symbol: &str) -> Option<Decimal>;

    /// Free (unreserved) balance for an asset.
    async fn get_account_balance(&self, asset: &str) -> ExchangeResult<Decimal>;

    /// Trading limits for a pair. Implementations cache this.
    async fn get_symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo>;

    async fn place_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderRecord>;

    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderRecord>;

    /// Market buy spending `quote_quantity` of the quote asset.
    async fn place_market_buy(
        &self,
        symbol: &str,
        quote_quantity: Decimal,
    ) -> ExchangeResult<OrderRecord>;

    /// Market sell of `base_quantity` of the base asset.
    async fn place_market_sell(
        &self,
        symbol: &str,
        base_quantity: Decimal,
    ) -> ExchangeResult<OrderRecord>;

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderRecord>>;

    /// Most recent orders for a symbol regardless of status, newest first.
    async fn get_all_orders(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<OrderRecord>>;

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderRecord>>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderRecord>;

    async fn get_24h_ticker(&self, symbol: &str) -> ExchangeResult<Ticker24h>;

    /// Human-readable snapshot of the client's rate-limit bookkeeping.
    async fn get_rate_limit_status(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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

    #[test]
    fn floor_to_step_never_rounds_up() {
        let info = btc_info();
        assert_eq!(info.floor_to_step(dec!(0.000123456)), dec!(0.00012));
        assert_eq!(info.floor_to_step(dec!(0.00010)), dec!(0.00010));
    }

    #[test]
    fn round_to_tick() {
        let info = btc_info();
        assert_eq!(info.round_to_tick(dec!(50000.004)), dec!(50000.00));
        assert_eq!(info.round_to_tick(dec!(50000.006)), dec!(50000.01));
    }

    #[test]
    fn avg_fill_price_from_cumulative_quote() {
        let order = OrderRecord {
            order_id: "1".into(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            orig_qty: dec!(0.002),
            executed_qty: dec!(0.002),
            cumulative_quote_qty: dec!(100),
            price: Decimal::ZERO,
            status: OrderStatus::Filled,
            time: Utc::now(),
            update_time: Utc::now(),
        };
        assert_eq!(order.avg_fill_price(), dec!(50000));
    }
}
