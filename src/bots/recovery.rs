//! Boot-time bring-up sequencing for grid bots.
//!
//! Ordering matters: the grid strategy must exist before queued downtime
//! follow-ups can be computed, and initial orders are only placed when no
//! usable state was recovered.

use anyhow::Result;
use log::info;

use crate::bots::grid_bot::{GridBot, LoadOutcome};

pub struct ReconciliationService;

impl ReconciliationService {
    /// Take a bot from cold start to trading: initialize, replay persisted
    /// state against the exchange, place the initial ladder when fresh,
    /// then drain queued downtime follow-ups and persist.
    pub async fn bring_up(bot: &mut GridBot) -> Result<LoadOutcome> {
        bot.initialize().await?;

        let outcome = bot.load_state().await?;
        match outcome {
            LoadOutcome::Fresh => {
                info!("{}: no recoverable state, placing initial orders", bot.symbol());
                bot.place_initial_orders().await?;
            }
            LoadOutcome::Restored => {
                info!(
                    "{}: restored {} active orders",
                    bot.symbol(),
                    bot.active_orders().len()
                );
            }
        }

        bot.process_pending_followups().await;
        bot.save_state().await;
        Ok(outcome)
    }
}
