//! Per-symbol trading bots.
//!
//! `GridBot` is one type; its responsibilities are grouped into impl
//! blocks across `orders`, `state` and `risk`.

pub mod grid_bot;
pub mod orders;
pub mod recovery;
pub mod risk;
pub mod state;

pub use grid_bot::{
    ActiveOrder, DowntimeFill, FailedFollowUp, GridBot, GridBotConfig, GridBotDeps, LoadOutcome,
    TickOutcome, MAX_CONSECUTIVE_ERRORS, MAX_PRICE_FAILURES,
};
pub use orders::{FOLLOWUP_BACKOFF_MINUTES, MAX_FOLLOWUP_RETRIES};
pub use recovery::ReconciliationService;
pub use risk::GateDecision;
pub use state::{BotStateRecord, ConfigSnapshot};
