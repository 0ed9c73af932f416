//! Shared stop-loss market-sell execution.
//!
//! Balance-aware: never sells more than the account holds, floors to the
//! symbol's step size, retries with backoff and re-queries the balance
//! after an insufficient-balance rejection. Final failure escalates to a
//! CRITICAL urgent notification; the user must sell manually.

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use rust_decimal::Decimal;
use tokio::time::{sleep, Duration};

use crate::exchange::{ExchangeError, OrderRecord, SharedExchange};
use crate::notify::SharedNotifier;

const MAX_RETRIES: usize = 3;
const RETRY_BACKOFF_SECS: [u64; 3] = [2, 5, 10];

pub struct StopLossExecutor {
    client: SharedExchange,
    notifier: SharedNotifier,
}

impl StopLossExecutor {
    pub fn new(client: SharedExchange, notifier: SharedNotifier) -> Self {
        Self { client, notifier }
    }

    /// Market-sell up to `intended_quantity` of the symbol's base asset.
    ///
    /// Steps: clamp to the free balance, floor to step size, abort on zero,
    /// then retry the sell up to three times with `[2, 5, 10]`s backoff.
    pub async fn execute_sell(
        &self,
        symbol: &str,
        intended_quantity: Decimal,
    ) -> Result<OrderRecord> {
        let info = self.client.get_symbol_info(symbol).await?;

        let mut sell_quantity = intended_quantity;
        match self.client.get_account_balance(&info.base_asset).await {
            Ok(balance) if balance > Decimal::ZERO => {
                sell_quantity = intended_quantity.min(balance);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Could not get {} balance, using intended qty: {e}", info.base_asset);
            }
        }
        sell_quantity = info.floor_to_step(sell_quantity);

        if sell_quantity <= Decimal::ZERO {
            let msg = format!("Stop-loss sell aborted: zero quantity for {symbol}");
            error!("{msg}");
            return Err(anyhow!(msg));
        }

        let mut last_error = String::new();
        for attempt in 0..MAX_RETRIES {
            match self.client.place_market_sell(symbol, sell_quantity).await {
                Ok(order) => {
                    info!(
                        "✅ Stop-loss sell executed: {sell_quantity} {symbol} (attempt {})",
                        attempt + 1
                    );
                    return Ok(order);
                }
                Err(e) => {
                    last_error = e.to_string();
                    error!(
                        "Stop-loss sell attempt {}/{MAX_RETRIES} failed for {symbol}: {last_error}",
                        attempt + 1
                    );

                    // The reserved amount may have changed under us; retry
                    // with the actual balance instead of the intended one.
                    if matches!(e, ExchangeError::InsufficientBalance(_))
                        && attempt < MAX_RETRIES - 1
                    {
                        match self.client.get_account_balance(&info.base_asset).await {
                            Ok(balance) if balance > Decimal::ZERO => {
                                sell_quantity = info.floor_to_step(balance);
                                info!(
                                    "Adjusted sell quantity to actual balance: {sell_quantity} {}",
                                    info.base_asset
                                );
                            }
                            Ok(_) => {}
                            Err(e) => warn!(
                                "Could not re-fetch {} balance: {e}",
                                info.base_asset
                            ),
                        }
                    }
                }
            }

            if attempt < MAX_RETRIES - 1 {
                sleep(Duration::from_secs(RETRY_BACKOFF_SECS[attempt])).await;
            }
        }

        let msg = format!(
            "CRITICAL: stop-loss sell FAILED after {MAX_RETRIES} attempts for {symbol} \
             ({sell_quantity}). Last error: {last_error}"
        );
        error!("{msg}");
        self.notifier
            .send(
                &format!(
                    "🚨 CRITICAL: Stop-loss sell FAILED\n\
                     Symbol: {symbol}\n\
                     Quantity: {sell_quantity}\n\
                     Error: {last_error}\n\
                     ACTION REQUIRED: manual sell needed!"
                ),
                true,
            )
            .await;
        Err(anyhow!(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperExchange, SymbolInfo};
    use crate::notify::Notifier;
    use crate::util::system_clock;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn setup() -> (Arc<PaperExchange>, StopLossExecutor) {
        let ex = Arc::new(PaperExchange::new(system_clock(), dec!(10000), "USDT"));
        ex.register_symbol(SymbolInfo {
            symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            min_qty: dec!(0.00001),
            step_size: dec!(0.00001),
            min_notional: dec!(10),
            tick_size: dec!(0.01),
        });
        ex.set_price("BTCUSDT", dec!(50000));
        let executor = StopLossExecutor::new(ex.clone(), Arc::new(Notifier::disabled()));
        (ex, executor)
    }

    #[tokio::test]
    async fn sells_at_most_the_free_balance() {
        let (ex, executor) = setup();
        ex.deposit("BTC", dec!(0.0005));

        let order = executor.execute_sell("BTCUSDT", dec!(0.001)).await.unwrap();
        assert_eq!(order.orig_qty, dec!(0.0005));
    }

    #[tokio::test]
    async fn sub_step_quantity_aborts_before_selling() {
        let (ex, executor) = setup();
        ex.deposit("BTC", dec!(0.000001));
        // Below the step size, flooring leaves nothing to sell.
        let result = executor.execute_sell("BTCUSDT", dec!(0.000001)).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_balance_requeries_and_retries() {
        let (ex, executor) = setup();
        ex.deposit("BTC", dec!(0.001));
        ex.inject_market_sell_error(ExchangeError::InsufficientBalance(
            "BTC: reserved elsewhere".into(),
        ));

        let order = executor.execute_sell("BTCUSDT", dec!(0.001)).await.unwrap();
        assert_eq!(order.executed_qty, dec!(0.001));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail() {
        let (ex, executor) = setup();
        ex.deposit("BTC", dec!(0.001));
        for _ in 0..3 {
            ex.inject_market_sell_error(ExchangeError::Transient("venue down".into()));
        }

        let result = executor.execute_sell("BTCUSDT", dec!(0.001)).await;
        assert!(result.is_err());
    }
}
