//! ═══════════════════════════════════════════════════════════════════════
//! HYBRID GRID TRADING BOT
//!
//! Regime-adaptive spot trading engine:
//! • Grid strategy with per-symbol order lifecycle and fill recovery
//! • Hybrid orchestrator routing symbols through HOLD / GRID / CASH
//! • Mode manager with hysteresis, cooldown and flap lock
//! • Layered risk controls (pre-trade gate, circuit breaker, stop-losses,
//!   portfolio drawdown halt)
//! • Crash-safe state persistence with exchange reconciliation on boot
//! • Cron-like scheduler with per-task mutual exclusion
//! ═══════════════════════════════════════════════════════════════════════

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod bots;
pub mod config;
pub mod exchange;
pub mod notify;
pub mod orchestrator;
pub mod risk;
pub mod scheduler;
pub mod state;
pub mod strategies;
pub mod telemetry;
pub mod util;

pub use bots::{GridBot, GridBotConfig, GridBotDeps, LoadOutcome, ReconciliationService, TickOutcome};
pub use config::Config;
pub use exchange::{
    ExchangeClient, ExchangeError, OrderRecord, OrderSide, OrderStatus, OrderType, PaperExchange,
    SymbolInfo, Ticker24h,
};
pub use orchestrator::{
    HybridOrchestrator, ModeManager, OrchestratorDeps, Regime, SymbolState, TradingMode,
};
pub use risk::{StopLossExecutor, StopLossOrder, StopLossRegistry, StopParams, StopType};
pub use scheduler::{Scheduler, Trigger};
pub use strategies::{FollowUpAction, GridStrategy};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialise `env_logger` with a sensible default filter.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .try_init();
}

pub mod prelude {
    pub use crate::bots::{GridBot, GridBotConfig, GridBotDeps, ReconciliationService};
    pub use crate::config::Config;
    pub use crate::exchange::{ExchangeClient, OrderSide, PaperExchange, SymbolInfo};
    pub use crate::orchestrator::{HybridOrchestrator, OrchestratorDeps, Regime, TradingMode};
    pub use crate::risk::{StopLossExecutor, StopLossRegistry, StopType};
    pub use crate::scheduler::{Scheduler, Trigger};
    pub use crate::strategies::GridStrategy;

    pub use anyhow::{Context, Result};
}
