//! Configuration: TOML file plus environment overrides.
//!
//! Secrets (exchange keys, Telegram credentials) come from the
//! environment only; the TOML file carries strategy and risk parameters.
//! Absent credentials downgrade the relevant component to disabled
//! instead of aborting startup.

use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bot: BotSettings,
    #[serde(default)]
    pub trading: TradingSettings,
    #[serde(default)]
    pub hybrid: HybridSettings,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    pub name: String,
    /// Optional cohort suffix for orchestrator state files.
    pub cohort: Option<String>,
    pub testnet: bool,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            name: "hybrid-grid-bot".into(),
            cohort: None,
            testnet: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSettings {
    /// Total quote capital managed by the orchestrator.
    pub total_investment: Decimal,
    pub quote_asset: String,
    /// Symbols with their per-symbol capital allocation.
    pub symbols: Vec<SymbolAllocation>,
    pub num_grids: u32,
    pub grid_range_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolAllocation {
    pub symbol: String,
    pub allocation_usd: Decimal,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            total_investment: dec!(1000),
            quote_asset: "USDT".into(),
            symbols: Vec::new(),
            num_grids: 3,
            grid_range_percent: dec!(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSettings {
    pub enable_mode_switching: bool,
    pub initial_mode: String,
    pub min_regime_probability: f64,
    pub min_regime_duration_days: u32,
    pub mode_cooldown_hours: i64,
    pub hold_trailing_stop_pct: Decimal,
    pub cash_exit_timeout_hours: i64,
    pub max_symbols: usize,
    pub min_position_usd: Decimal,
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            enable_mode_switching: true,
            initial_mode: "GRID".into(),
            min_regime_probability: 0.70,
            min_regime_duration_days: 2,
            mode_cooldown_hours: 24,
            hold_trailing_stop_pct: dec!(7),
            cash_exit_timeout_hours: 2,
            max_symbols: 5,
            min_position_usd: dec!(25),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Per-tick price drop that emergency-stops a bot.
    pub circuit_breaker_pct: Decimal,
    /// Daily portfolio drawdown that halts all trading.
    pub max_daily_drawdown_pct: Decimal,
    /// Trailing stop distance for grid fills.
    pub stop_loss_pct: Decimal,
    /// Cash floor kept out of the market.
    pub cash_reserve_pct: Decimal,
    /// CVaR budget: tail-risk fraction per position.
    pub cvar_risk_budget: Decimal,
    /// CVaR assumed conditional tail loss.
    pub cvar_tail_loss: Decimal,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            circuit_breaker_pct: dec!(10),
            max_daily_drawdown_pct: dec!(10),
            stop_loss_pct: dec!(5),
            cash_reserve_pct: dec!(20),
            cvar_risk_budget: dec!(0.02),
            cvar_tail_loss: dec!(0.15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub state_dir: String,
    pub log_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_dir: "state".into(),
            log_dir: "logs".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSettings {
    pub token: Option<String>,
    pub chat_id: Option<String>,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        info!(
            "✅ Config loaded: {} symbols, {} {} total",
            config.trading.symbols.len(),
            config.trading.total_investment,
            config.trading.quote_asset
        );
        Ok(config)
    }

    /// Defaults plus environment, used when no config file is given.
    pub fn from_env() -> Result<Self> {
        let mut config = Config {
            bot: BotSettings::default(),
            trading: TradingSettings::default(),
            hybrid: HybridSettings::default(),
            risk: RiskSettings::default(),
            storage: StorageSettings::default(),
            telegram: TelegramSettings::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                self.telegram.token = Some(token);
            }
        }
        if let Ok(chat_id) = std::env::var("TELEGRAM_CHAT_ID") {
            if !chat_id.is_empty() {
                self.telegram.chat_id = Some(chat_id);
            }
        }
        if let Ok(testnet) = std::env::var("USE_TESTNET") {
            self.bot.testnet = testnet != "false" && testnet != "0";
        }
        if let Ok(dir) = std::env::var("STATE_DIR") {
            if !dir.is_empty() {
                self.storage.state_dir = dir;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.trading.total_investment <= Decimal::ZERO {
            anyhow::bail!("total_investment must be positive");
        }
        if self.trading.num_grids < 2 {
            anyhow::bail!("num_grids must be at least 2");
        }
        if self.trading.grid_range_percent <= Decimal::ZERO {
            anyhow::bail!("grid_range_percent must be positive");
        }
        if !(0.0..=1.0).contains(&self.hybrid.min_regime_probability) {
            anyhow::bail!("min_regime_probability must be within 0..=1");
        }
        let allocated: Decimal = self
            .trading
            .symbols
            .iter()
            .map(|s| s.allocation_usd)
            .sum();
        if allocated > self.trading.total_investment {
            anyhow::bail!(
                "symbol allocations ({allocated}) exceed total_investment ({})",
                self.trading.total_investment
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_validate() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.trading.num_grids, 3);
        assert_eq!(config.hybrid.hold_trailing_stop_pct, dec!(7));
        assert_eq!(config.risk.circuit_breaker_pct, dec!(10));
    }

    #[test]
    fn toml_roundtrip() {
        let toml_str = r#"
            [trading]
            total_investment = "2000"
            num_grids = 5
            grid_range_percent = "4"

            [[trading.symbols]]
            symbol = "BTCUSDT"
            allocation_usd = "1200"

            [[trading.symbols]]
            symbol = "ETHUSDT"
            allocation_usd = "800"

            [hybrid]
            min_regime_probability = 0.75
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.trading.symbols.len(), 2);
        assert_eq!(config.trading.symbols[0].allocation_usd, dec!(1200));
        assert_eq!(config.hybrid.min_regime_probability, 0.75);
        config.validate().unwrap();
    }

    #[test]
    fn over_allocation_is_rejected() {
        let mut config = Config::from_env().unwrap();
        config.trading.symbols.push(SymbolAllocation {
            symbol: "BTCUSDT".into(),
            allocation_usd: dec!(5000),
        });
        assert!(config.validate().is_err());
    }
}
