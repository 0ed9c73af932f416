//! Grid strategy: pure price-level math, no I/O.
//!
//! Given a band, a grid count and an investment, builds `grid_count + 1`
//! uniformly spaced levels, dropping any level that would violate the
//! symbol's minimum quantity or minimum notional after flooring to the
//! step size. Fill callbacks return the follow-up order one level away.

use log::{error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::SymbolInfo;

/// One precomputed price/quantity pair in the grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled: bool,
}

/// Follow-up decision after a fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FollowUpAction {
    PlaceSell { price: Decimal, quantity: Decimal },
    PlaceBuy { price: Decimal, quantity: Decimal },
    None,
}

/// Candidate order emitted by `initial_orders`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridOrder {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct InitialOrders {
    pub buys: Vec<GridOrder>,
    pub sells: Vec<GridOrder>,
}

#[derive(Debug)]
pub struct GridStrategy {
    lower_price: Decimal,
    upper_price: Decimal,
    grid_count: u32,
    total_investment: Decimal,
    levels: Vec<GridLevel>,
    skipped_levels: u32,
    /// Absolute price-match tolerance, half a tick.
    tolerance: Decimal,
}

impl GridStrategy {
    pub fn new(
        lower_price: Decimal,
        upper_price: Decimal,
        grid_count: u32,
        total_investment: Decimal,
        info: &SymbolInfo,
    ) -> Self {
        let mut strategy = Self {
            lower_price,
            upper_price,
            grid_count,
            total_investment,
            levels: Vec::new(),
            skipped_levels: 0,
            tolerance: info.tick_size / Decimal::TWO,
        };
        strategy.calculate_levels(info);
        strategy
    }

    fn calculate_levels(&mut self, info: &SymbolInfo) {
        if self.grid_count == 0 || self.upper_price <= self.lower_price {
            error!(
                "Invalid grid band: {} - {} with {} grids",
                self.lower_price, self.upper_price, self.grid_count
            );
            return;
        }

        let grids = Decimal::from(self.grid_count);
        let spacing = (self.upper_price - self.lower_price) / grids;
        let investment_per_grid = self.total_investment / grids;

        for i in 0..=self.grid_count {
            let price = info.round_to_tick(self.lower_price + spacing * Decimal::from(i));
            let quantity = info.floor_to_step(investment_per_grid / price);

            if quantity < info.min_qty {
                warn!(
                    "Grid level {i} skipped: quantity {quantity} < min_qty {}",
                    info.min_qty
                );
                self.skipped_levels += 1;
                continue;
            }

            let notional = quantity * price;
            if notional < info.min_notional {
                warn!(
                    "Grid level {i} skipped: notional {notional:.2} < min_notional {}",
                    info.min_notional
                );
                self.skipped_levels += 1;
                continue;
            }

            self.levels.push(GridLevel {
                price,
                quantity,
                filled: false,
            });
        }

        if self.levels.len() < 2 {
            error!(
                "Only {} valid grid levels - investment too small or symbol limits too high",
                self.levels.len()
            );
        }

        info!(
            "📊 Grid built: {} valid levels, {} skipped ({} - {})",
            self.levels.len(),
            self.skipped_levels,
            self.lower_price,
            self.upper_price
        );
    }

    /// Valid levels, ordered bottom-up.
    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn skipped_levels(&self) -> u32 {
        self.skipped_levels
    }

    /// Fewer than two valid levels cannot trade.
    pub fn is_tradeable(&self) -> bool {
        self.levels.len() >= 2
    }

    /// BUY candidates below the current price, SELL candidates above.
    /// Pure; the caller owns placement and risk gating.
    pub fn initial_orders(&self, current_price: Decimal) -> InitialOrders {
        let mut orders = InitialOrders::default();
        for level in &self.levels {
            if level.price < current_price {
                orders.buys.push(GridOrder {
                    price: level.price,
                    quantity: level.quantity,
                });
            } else if level.price > current_price {
                orders.sells.push(GridOrder {
                    price: level.price,
                    quantity: level.quantity,
                });
            }
        }
        orders
    }

    fn level_index_at(&self, price: Decimal) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| (level.price - price).abs() <= self.tolerance)
    }

    /// A BUY filled at `price`: mark the level and sell one level higher
    /// with the filled level's quantity. Topmost level has no follow-up.
    pub fn on_buy_filled(&mut self, price: Decimal) -> FollowUpAction {
        let Some(i) = self.level_index_at(price) else {
            return FollowUpAction::None;
        };
        self.levels[i].filled = true;
        match self.levels.get(i + 1) {
            Some(next) => FollowUpAction::PlaceSell {
                price: next.price,
                quantity: self.levels[i].quantity,
            },
            None => FollowUpAction::None,
        }
    }

    /// A SELL filled at `price`: clear the level and buy one level lower
    /// with that level's quantity. Lowest level has no follow-up.
    pub fn on_sell_filled(&mut self, price: Decimal) -> FollowUpAction {
        let Some(i) = self.level_index_at(price) else {
            return FollowUpAction::None;
        };
        self.levels[i].filled = false;
        if i == 0 {
            return FollowUpAction::None;
        }
        let prev = &self.levels[i - 1];
        FollowUpAction::PlaceBuy {
            price: prev.price,
            quantity: prev.quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
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

    fn standard_grid() -> GridStrategy {
        // Levels at 48000, 49000, 50000, 51000, 52000
        GridStrategy::new(dec!(48000), dec!(52000), 4, dec!(400), &btc_info())
    }

    #[test]
    fn builds_count_plus_one_levels() {
        let grid = standard_grid();
        assert_eq!(grid.levels().len(), 5);
        assert_eq!(grid.levels()[0].price, dec!(48000));
        assert_eq!(grid.levels()[4].price, dec!(52000));
        assert!(grid.is_tradeable());
    }

    #[test]
    fn initial_orders_split_around_current_price() {
        let grid = standard_grid();
        let orders = grid.initial_orders(dec!(50000));
        assert_eq!(orders.buys.len(), 2);
        assert_eq!(orders.sells.len(), 2);
        assert_eq!(orders.buys[0].price, dec!(48000));
        assert_eq!(orders.sells[1].price, dec!(52000));
    }

    #[test]
    fn level_at_current_price_emits_no_order() {
        let grid = standard_grid();
        let orders = grid.initial_orders(dec!(50000));
        assert!(orders.buys.iter().all(|o| o.price != dec!(50000)));
        assert!(orders.sells.iter().all(|o| o.price != dec!(50000)));
    }

    #[test]
    fn buy_fill_places_sell_one_level_up() {
        let mut grid = standard_grid();
        let qty = grid.levels()[1].quantity;
        let action = grid.on_buy_filled(dec!(49000));
        assert_eq!(
            action,
            FollowUpAction::PlaceSell {
                price: dec!(50000),
                quantity: qty,
            }
        );
        assert!(grid.levels()[1].filled);
    }

    #[test]
    fn topmost_buy_fill_has_no_follow_up() {
        let mut grid = standard_grid();
        assert_eq!(grid.on_buy_filled(dec!(52000)), FollowUpAction::None);
    }

    #[test]
    fn sell_fill_places_buy_one_level_down() {
        let mut grid = standard_grid();
        let qty = grid.levels()[1].quantity;
        let action = grid.on_sell_filled(dec!(50000));
        assert_eq!(
            action,
            FollowUpAction::PlaceBuy {
                price: dec!(49000),
                quantity: qty,
            }
        );
    }

    #[test]
    fn lowest_sell_fill_is_a_no_op() {
        let mut grid = standard_grid();
        assert_eq!(grid.on_sell_filled(dec!(48000)), FollowUpAction::None);
    }

    #[test]
    fn price_matching_uses_half_tick_tolerance() {
        let mut grid = standard_grid();
        // Within half a tick of 49000
        let action = grid.on_buy_filled(dec!(49000.004));
        assert!(matches!(action, FollowUpAction::PlaceSell { .. }));
        // A full tick away matches nothing
        let action = grid.on_buy_filled(dec!(49000.02));
        assert_eq!(action, FollowUpAction::None);
    }

    #[test]
    fn tiny_investment_yields_untradeable_grid() {
        // 5 USDT over 4 grids is below min_notional everywhere
        let grid = GridStrategy::new(dec!(48000), dec!(52000), 4, dec!(5), &btc_info());
        assert!(!grid.is_tradeable());
        assert_eq!(grid.skipped_levels(), 5);
    }

    proptest! {
        // Every produced level satisfies all symbol limits and the
        // quantity is an exact multiple of the step size.
        #[test]
        fn levels_always_satisfy_symbol_limits(
            investment in 50u32..100_000,
            grids in 2u32..40,
            band_pct in 1u32..30,
        ) {
            let info = btc_info();
            let center = dec!(50000);
            let band = center * Decimal::from(band_pct) / dec!(100);
            let grid = GridStrategy::new(
                center - band,
                center + band,
                grids,
                Decimal::from(investment),
                &info,
            );
            for level in grid.levels() {
                prop_assert!(level.quantity >= info.min_qty);
                prop_assert!(level.quantity * level.price >= info.min_notional);
                prop_assert_eq!(
                    level.quantity % info.step_size,
                    Decimal::ZERO
                );
            }
        }
    }
}
