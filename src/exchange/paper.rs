//! Paper trading exchange: local order matching behind the full
//! `ExchangeClient` surface.
//!
//! Orders are matched against injected prices: BUY fills when the price
//! trades at or below the limit, SELL at or above. A 0.1% taker fee is
//! charged in the received asset. Balances distinguish free and reserved
//! so open limit orders lock funds like the real venue does.
//!
//! The same type doubles as the test harness for everything above the
//! exchange boundary: tests inject prices, force fills/cancels and queue
//! error injections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::exchange::{
    ExchangeClient, ExchangeError, ExchangeResult, OrderRecord, OrderSide, OrderStatus, OrderType,
    SymbolInfo, Ticker24h, TAKER_FEE_RATE,
};
use crate::util::SharedClock;

pub struct PaperExchange {
    clock: SharedClock,
    next_order_id: AtomicU64,
    orders: DashMap<String, OrderRecord>,
    balances: DashMap<String, Decimal>,
    reserved: DashMap<String, Decimal>,
    prices: DashMap<String, Decimal>,
    // (open, high, low) since the session started; feeds the 24h ticker.
    price_stats: DashMap<String, (Decimal, Decimal, Decimal)>,
    symbols: DashMap<String, SymbolInfo>,
    // Error injection queues (tests only, empty in normal operation).
    market_sell_errors: Mutex<VecDeque<ExchangeError>>,
    limit_order_errors: Mutex<VecDeque<ExchangeError>>,
}

impl PaperExchange {
    pub fn new(clock: SharedClock, initial_quote: Decimal, quote_asset: &str) -> Self {
        let balances = DashMap::new();
        balances.insert(quote_asset.to_string(), initial_quote);
        Self {
            clock,
            next_order_id: AtomicU64::new(1),
            orders: DashMap::new(),
            balances,
            reserved: DashMap::new(),
            prices: DashMap::new(),
            price_stats: DashMap::new(),
            symbols: DashMap::new(),
            market_sell_errors: Mutex::new(VecDeque::new()),
            limit_order_errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Register trading limits for a symbol (the live client fetches these
    /// from exchangeInfo; here they are injected).
    pub fn register_symbol(&self, info: SymbolInfo) {
        self.symbols.insert(info.symbol.clone(), info);
    }

    /// Publish a price and match pending limit orders against it.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), price);
        self.price_stats
            .entry(symbol.to_string())
            .and_modify(|(_, high, low)| {
                *high = (*high).max(price);
                *low = (*low).min(price);
            })
            .or_insert((price, price, price));
        self.match_pending(symbol, price);
    }

    /// Withdraw a symbol's price (simulates feed outage).
    pub fn clear_price(&self, symbol: &str) {
        self.prices.remove(symbol);
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        *self.balances.entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    pub fn free_balance(&self, asset: &str) -> Decimal {
        let total = self.balances.get(asset).map(|b| *b).unwrap_or(Decimal::ZERO);
        let reserved = self.reserved.get(asset).map(|r| *r).unwrap_or(Decimal::ZERO);
        (total - reserved).max(Decimal::ZERO)
    }

    /// Queue an error for the next market-sell call (test hook).
    pub fn inject_market_sell_error(&self, error: ExchangeError) {
        self.market_sell_errors.lock().push_back(error);
    }

    /// Queue an error for the next limit placement (test hook).
    pub fn inject_limit_order_error(&self, error: ExchangeError) {
        self.limit_order_errors.lock().push_back(error);
    }

    /// Force an exchange-side cancel, optionally after a partial fill
    /// (test hook: simulates what the venue did during downtime).
    pub fn force_cancel(&self, order_id: &str, executed_qty: Decimal) {
        let Some(mut order) = self.orders.get_mut(order_id) else {
            return;
        };
        let fill_qty = executed_qty.min(order.orig_qty);
        if fill_qty > Decimal::ZERO {
            let price = order.price;
            let (side, symbol) = (order.side, order.symbol.clone());
            self.settle_fill(&symbol, side, fill_qty, price);
            order.executed_qty = fill_qty;
            order.cumulative_quote_qty = fill_qty * price;
        }
        self.release_remainder(&order);
        order.status = OrderStatus::Canceled;
        order.update_time = self.clock.now_utc();
    }

    /// Force a full fill at the order's limit price (test hook).
    pub fn force_fill(&self, order_id: &str) {
        let Some(order) = self.orders.get(order_id).map(|o| o.clone()) else {
            return;
        };
        self.fill_order(&order.order_id, order.price);
    }

    fn alloc_order_id(&self) -> String {
        self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    fn info(&self, symbol: &str) -> ExchangeResult<SymbolInfo> {
        self.symbols
            .get(symbol)
            .map(|i| i.clone())
            .ok_or_else(|| ExchangeError::Client(format!("unknown symbol {symbol}")))
    }

    fn reserve(&self, asset: &str, amount: Decimal) -> ExchangeResult<()> {
        if self.free_balance(asset) < amount {
            return Err(ExchangeError::InsufficientBalance(format!(
                "{asset}: free {} < required {amount}",
                self.free_balance(asset)
            )));
        }
        *self.reserved.entry(asset.to_string()).or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    fn unreserve(&self, asset: &str, amount: Decimal) {
        let mut entry = self.reserved.entry(asset.to_string()).or_insert(Decimal::ZERO);
        *entry = (*entry - amount).max(Decimal::ZERO);
    }

    fn adjust_balance(&self, asset: &str, delta: Decimal) {
        let mut entry = self.balances.entry(asset.to_string()).or_insert(Decimal::ZERO);
        *entry += delta;
    }

    /// Move funds for a fill of `quantity` at `price`, fee in the received
    /// asset. The reservation made at placement time is consumed here.
    fn settle_fill(&self, symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) {
        let Ok(info) = self.info(symbol) else { return };
        let notional = quantity * price;
        match side {
            OrderSide::Buy => {
                self.unreserve(&info.quote_asset, notional);
                self.adjust_balance(&info.quote_asset, -notional);
                self.adjust_balance(&info.base_asset, quantity * (Decimal::ONE - TAKER_FEE_RATE));
            }
            OrderSide::Sell => {
                self.unreserve(&info.base_asset, quantity);
                self.adjust_balance(&info.base_asset, -quantity);
                self.adjust_balance(&info.quote_asset, notional * (Decimal::ONE - TAKER_FEE_RATE));
            }
        }
    }

    /// Release the reservation backing the unfilled remainder of an order.
    fn release_remainder(&self, order: &OrderRecord) {
        let Ok(info) = self.info(&order.symbol) else { return };
        let remaining = order.orig_qty - order.executed_qty;
        if remaining <= Decimal::ZERO {
            return;
        }
        match order.side {
            OrderSide::Buy => self.unreserve(&info.quote_asset, remaining * order.price),
            OrderSide::Sell => self.unreserve(&info.base_asset, remaining),
        }
    }

    fn fill_order(&self, order_id: &str, fill_price: Decimal) {
        let Some(mut order) = self.orders.get_mut(order_id) else {
            return;
        };
        if order.status != OrderStatus::New && order.status != OrderStatus::PartiallyFilled {
            return;
        }
        let remaining = order.orig_qty - order.executed_qty;
        let (side, symbol) = (order.side, order.symbol.clone());
        self.settle_fill(&symbol, side, remaining, fill_price);
        order.executed_qty = order.orig_qty;
        order.cumulative_quote_qty += remaining * fill_price;
        order.status = OrderStatus::Filled;
        order.update_time = self.clock.now_utc();
        debug!(
            "Paper fill: {} {} {} @ {}",
            symbol, side, order.orig_qty, fill_price
        );
    }

    fn match_pending(&self, symbol: &str, price: Decimal) {
        let candidates: Vec<(String, OrderSide, Decimal)> = self
            .orders
            .iter()
            .filter(|o| {
                o.symbol == symbol
                    && matches!(o.status, OrderStatus::New | OrderStatus::PartiallyFilled)
            })
            .map(|o| (o.order_id.clone(), o.side, o.price))
            .collect();

        for (order_id, side, limit) in candidates {
            let crosses = match side {
                OrderSide::Buy => price <= limit,
                OrderSide::Sell => price >= limit,
            };
            if crosses {
                self.fill_order(&order_id, limit);
            }
        }
    }

    fn place_limit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderRecord> {
        if let Some(err) = self.limit_order_errors.lock().pop_front() {
            return Err(err);
        }
        let info = self.info(symbol)?;
        if quantity < info.min_qty || quantity * price < info.min_notional {
            return Err(ExchangeError::Client(format!(
                "order below limits: qty {quantity} @ {price}"
            )));
        }
        match side {
            OrderSide::Buy => self.reserve(&info.quote_asset, quantity * price)?,
            OrderSide::Sell => self.reserve(&info.base_asset, quantity)?,
        }

        let now = self.now();
        let order = OrderRecord {
            order_id: self.alloc_order_id(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            orig_qty: quantity,
            executed_qty: Decimal::ZERO,
            cumulative_quote_qty: Decimal::ZERO,
            price,
            status: OrderStatus::New,
            time: now,
            update_time: now,
        };
        self.orders.insert(order.order_id.clone(), order.clone());

        // An aggressive limit crosses immediately.
        if let Some(current) = self.prices.get(symbol).map(|p| *p) {
            self.match_pending(symbol, current);
        }
        Ok(self
            .orders
            .get(&order.order_id)
            .map(|o| o.clone())
            .unwrap_or(order))
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_current_price(&self, symbol: &str) -> Option<Decimal> {
        let price = self.prices.get(symbol).map(|p| *p)?;
        self.match_pending(symbol, price);
        Some(price)
    }

    async fn get_account_balance(&self, asset: &str) -> ExchangeResult<Decimal> {
        Ok(self.free_balance(asset))
    }

    async fn get_symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo> {
        self.info(symbol)
    }

    async fn place_limit_buy(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderRecord> {
        self.place_limit(symbol, OrderSide::Buy, quantity, price)
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<OrderRecord> {
        self.place_limit(symbol, OrderSide::Sell, quantity, price)
    }

    async fn place_market_buy(
        &self,
        symbol: &str,
        quote_quantity: Decimal,
    ) -> ExchangeResult<OrderRecord> {
        let info = self.info(symbol)?;
        let price = self
            .prices
            .get(symbol)
            .map(|p| *p)
            .ok_or_else(|| ExchangeError::Transient(format!("no price for {symbol}")))?;
        if self.free_balance(&info.quote_asset) < quote_quantity {
            return Err(ExchangeError::InsufficientBalance(format!(
                "{}: free {} < required {quote_quantity}",
                info.quote_asset,
                self.free_balance(&info.quote_asset)
            )));
        }

        let quantity = info.floor_to_step(quote_quantity / price);
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::Client("market buy below step size".into()));
        }
        let spent = quantity * price;
        self.adjust_balance(&info.quote_asset, -spent);
        self.adjust_balance(&info.base_asset, quantity * (Decimal::ONE - TAKER_FEE_RATE));

        let now = self.now();
        let order = OrderRecord {
            order_id: self.alloc_order_id(),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            orig_qty: quantity,
            executed_qty: quantity,
            cumulative_quote_qty: spent,
            price,
            status: OrderStatus::Filled,
            time: now,
            update_time: now,
        };
        self.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn place_market_sell(
        &self,
        symbol: &str,
        base_quantity: Decimal,
    ) -> ExchangeResult<OrderRecord> {
        if let Some(err) = self.market_sell_errors.lock().pop_front() {
            return Err(err);
        }
        let info = self.info(symbol)?;
        let price = self
            .prices
            .get(symbol)
            .map(|p| *p)
            .ok_or_else(|| ExchangeError::Transient(format!("no price for {symbol}")))?;
        if self.free_balance(&info.base_asset) < base_quantity {
            return Err(ExchangeError::InsufficientBalance(format!(
                "{}: free {} < required {base_quantity}",
                info.base_asset,
                self.free_balance(&info.base_asset)
            )));
        }

        let proceeds = base_quantity * price;
        self.adjust_balance(&info.base_asset, -base_quantity);
        self.adjust_balance(&info.quote_asset, proceeds * (Decimal::ONE - TAKER_FEE_RATE));

        let now = self.now();
        let order = OrderRecord {
            order_id: self.alloc_order_id(),
            symbol: symbol.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            orig_qty: base_quantity,
            executed_qty: base_quantity,
            cumulative_quote_qty: proceeds,
            price,
            status: OrderStatus::Filled,
            time: now,
            update_time: now,
        };
        self.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn get_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderRecord>> {
        Ok(self
            .orders
            .iter()
            .filter(|o| {
                o.symbol == symbol
                    && matches!(o.status, OrderStatus::New | OrderStatus::PartiallyFilled)
            })
            .map(|o| o.clone())
            .collect())
    }

    async fn get_all_orders(&self, symbol: &str, limit: usize) -> ExchangeResult<Vec<OrderRecord>> {
        let mut orders: Vec<OrderRecord> = self
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.clone())
            .collect();
        orders.sort_by(|a, b| b.time.cmp(&a.time));
        orders.truncate(limit);
        Ok(orders)
    }

    async fn get_order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<Option<OrderRecord>> {
        Ok(self
            .orders
            .get(order_id)
            .filter(|o| o.symbol == symbol)
            .map(|o| o.clone()))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<OrderRecord> {
        let Some(mut order) = self.orders.get_mut(order_id) else {
            return Err(ExchangeError::Client(format!("unknown order {order_id}")));
        };
        if order.symbol != symbol {
            return Err(ExchangeError::Client(format!(
                "order {order_id} does not belong to {symbol}"
            )));
        }
        if matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled) {
            self.release_remainder(&order);
            order.status = OrderStatus::Canceled;
            order.update_time = self.clock.now_utc();
        }
        Ok(order.clone())
    }

    async fn get_24h_ticker(&self, symbol: &str) -> ExchangeResult<Ticker24h> {
        let last_price = self
            .prices
            .get(symbol)
            .map(|p| *p)
            .ok_or_else(|| ExchangeError::Transient(format!("no price for {symbol}")))?;
        let (open, high, low) = self
            .price_stats
            .get(symbol)
            .map(|s| *s)
            .unwrap_or((last_price, last_price, last_price));
        let change_pct = if open > Decimal::ZERO {
            (last_price - open) / open * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
        let volume: Decimal = self
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.executed_qty)
            .sum();
        Ok(Ticker24h {
            symbol: symbol.to_string(),
            last_price,
            price_change_percent: change_pct,
            high_price: high,
            low_price: low,
            volume,
        })
    }

    async fn get_rate_limit_status(&self) -> String {
        "paper trading: no request weight limits".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::system_clock;
    use pretty_assertions::assert_eq;
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

    fn exchange() -> PaperExchange {
        let ex = PaperExchange::new(system_clock(), dec!(10000), "USDT");
        ex.register_symbol(btc_info());
        ex.set_price("BTCUSDT", dec!(50000));
        ex
    }

    #[tokio::test]
    async fn limit_buy_reserves_and_fills_on_cross() {
        let ex = exchange();
        let order = ex
            .place_limit_buy("BTCUSDT", dec!(0.001), dec!(49000))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(ex.free_balance("USDT"), dec!(10000) - dec!(49));

        ex.set_price("BTCUSDT", dec!(48900));
        let status = ex
            .get_order_status("BTCUSDT", &order.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, OrderStatus::Filled);
        // 0.1% taker fee comes out of the received BTC
        assert_eq!(ex.free_balance("BTC"), dec!(0.001) * dec!(0.999));
    }

    #[tokio::test]
    async fn cancel_releases_reservation() {
        let ex = exchange();
        let order = ex
            .place_limit_buy("BTCUSDT", dec!(0.001), dec!(48000))
            .await
            .unwrap();
        assert!(ex.free_balance("USDT") < dec!(10000));

        ex.cancel_order("BTCUSDT", &order.order_id).await.unwrap();
        assert_eq!(ex.free_balance("USDT"), dec!(10000));
    }

    #[tokio::test]
    async fn market_sell_requires_balance() {
        let ex = exchange();
        let result = ex.place_market_sell("BTCUSDT", dec!(1)).await;
        assert!(matches!(result, Err(ExchangeError::InsufficientBalance(_))));
    }

    #[tokio::test]
    async fn forced_cancel_with_partial_fill() {
        let ex = exchange();
        let order = ex
            .place_limit_buy("BTCUSDT", dec!(0.001), dec!(48000))
            .await
            .unwrap();
        ex.force_cancel(&order.order_id, dec!(0.0005));

        let status = ex
            .get_order_status("BTCUSDT", &order.order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.status, OrderStatus::Canceled);
        assert_eq!(status.executed_qty, dec!(0.0005));
        // Remainder reservation released
        assert_eq!(ex.free_balance("USDT"), dec!(10000) - dec!(0.0005) * dec!(48000));
    }

    #[tokio::test]
    async fn market_buy_reports_cumulative_quote() {
        let ex = exchange();
        let order = ex.place_market_buy("BTCUSDT", dec!(100)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price(), dec!(50000));
    }
}
