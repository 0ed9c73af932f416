//! Pluggable position sizing and allocation constraints.
//!
//! Both seams degrade gracefully: a sizer failure is logged and the order
//! is allowed (risk modules must never brick trading on their own bugs).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Caps how large a single position may grow.
pub trait PositionSizer: Send + Sync {
    /// Maximum position notional (quote units) for a new BUY.
    fn max_position(
        &self,
        symbol: &str,
        portfolio_value: Decimal,
        signal_confidence: f64,
    ) -> anyhow::Result<Decimal>;
}

/// Enforces a portfolio-level cash reserve floor.
pub trait AllocationConstraints: Send + Sync {
    /// Capital still deployable given what is already invested.
    fn available_capital(
        &self,
        total_capital: Decimal,
        current_invested: Decimal,
    ) -> anyhow::Result<Decimal>;
}

/// Default sizer: a CVaR-style budget. A fixed tail-risk fraction of the
/// portfolio, scaled by signal confidence and divided by the assumed
/// tail-loss depth.
pub struct CvarPositionSizer {
    /// Fraction of portfolio value risked per position (e.g. 0.02).
    risk_budget: Decimal,
    /// Assumed conditional tail loss of a position (e.g. 0.15 = -15%).
    tail_loss: Decimal,
}

impl CvarPositionSizer {
    pub fn new(risk_budget: Decimal, tail_loss: Decimal) -> Self {
        Self {
            risk_budget,
            tail_loss,
        }
    }
}

impl Default for CvarPositionSizer {
    fn default() -> Self {
        Self::new(dec!(0.02), dec!(0.15))
    }
}

impl PositionSizer for CvarPositionSizer {
    fn max_position(
        &self,
        _symbol: &str,
        portfolio_value: Decimal,
        signal_confidence: f64,
    ) -> anyhow::Result<Decimal> {
        if self.tail_loss <= Decimal::ZERO {
            anyhow::bail!("tail_loss must be positive");
        }
        let confidence = Decimal::try_from(signal_confidence.clamp(0.0, 1.0))?;
        // Half weight at zero confidence, full weight at one.
        let scale = dec!(0.5) + confidence / Decimal::TWO;
        Ok(portfolio_value * self.risk_budget * scale / self.tail_loss)
    }
}

/// Default constraints: keep `cash_reserve_pct` of total capital liquid.
pub struct ReserveConstraints {
    cash_reserve_pct: Decimal,
}

impl ReserveConstraints {
    pub fn new(cash_reserve_pct: Decimal) -> Self {
        Self { cash_reserve_pct }
    }
}

impl Default for ReserveConstraints {
    fn default() -> Self {
        Self::new(dec!(20))
    }
}

impl AllocationConstraints for ReserveConstraints {
    fn available_capital(
        &self,
        total_capital: Decimal,
        current_invested: Decimal,
    ) -> anyhow::Result<Decimal> {
        let deployable = total_capital * (Decimal::ONE - self.cash_reserve_pct / dec!(100));
        Ok((deployable - current_invested).max(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cvar_sizer_scales_with_confidence() {
        let sizer = CvarPositionSizer::default();
        let low = sizer.max_position("BTCUSDT", dec!(10000), 0.0).unwrap();
        let high = sizer.max_position("BTCUSDT", dec!(10000), 1.0).unwrap();
        assert!(high > low);
        // 10000 * 0.02 * 1.0 / 0.15
        assert_eq!(high.round_dp(2), dec!(1333.33));
    }

    #[test]
    fn reserve_constraints_keep_cash_floor() {
        let constraints = ReserveConstraints::new(dec!(20));
        let available = constraints
            .available_capital(dec!(10000), dec!(6000))
            .unwrap();
        assert_eq!(available, dec!(2000));
    }

    #[test]
    fn fully_invested_leaves_nothing() {
        let constraints = ReserveConstraints::new(dec!(20));
        let available = constraints
            .available_capital(dec!(10000), dec!(9000))
            .unwrap();
        assert_eq!(available, Decimal::ZERO);
    }
}
