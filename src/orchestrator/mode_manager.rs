//! Trading mode selection with hysteresis.
//!
//! Regime → mode: BULL → HOLD, SIDEWAYS → GRID, BEAR → CASH. A switch
//! only happens when the regime is confident enough, has lasted long
//! enough and the cooldown since the last transition has elapsed. A
//! high-probability BEAR bypasses hysteresis (capital protection). Too
//! many transitions inside 48 h engage a safety lock to GRID that
//! releases after seven days.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::HybridSettings;
use crate::util::SharedClock;

/// BEAR at or above this probability skips the hysteresis gates.
pub const EMERGENCY_BEAR_PROBABILITY: f64 = 0.85;

/// Transitions within 48 h before the safety lock engages.
pub const MAX_TRANSITIONS_48H: usize = 2;

/// How long the safety lock holds.
pub const FLAP_LOCK_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingMode {
    Hold,
    Grid,
    Cash,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradingMode::Hold => write!(f, "HOLD"),
            TradingMode::Grid => write!(f, "GRID"),
            TradingMode::Cash => write!(f, "CASH"),
        }
    }
}

impl std::str::FromStr for TradingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOLD" => Ok(TradingMode::Hold),
            "GRID" => Ok(TradingMode::Grid),
            "CASH" => Ok(TradingMode::Cash),
            other => anyhow::bail!("unknown trading mode {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Bull,
    Bear,
    Sideways,
    Transition,
}

impl Regime {
    fn target_mode(self) -> Option<TradingMode> {
        match self {
            Regime::Bull => Some(TradingMode::Hold),
            Regime::Sideways => Some(TradingMode::Grid),
            Regime::Bear => Some(TradingMode::Cash),
            // TRANSITION keeps the current mode
            Regime::Transition => None,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Bull => write!(f, "BULL"),
            Regime::Bear => write!(f, "BEAR"),
            Regime::Sideways => write!(f, "SIDEWAYS"),
            Regime::Transition => write!(f, "TRANSITION"),
        }
    }
}

/// Latest regime detection written into the key-value store by the
/// regime sidecar and read by the mode-evaluation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub regime: Regime,
    pub probability: f64,
    pub duration_days: u32,
    pub detected_at: DateTime<Utc>,
}

/// Store key the regime sidecar writes to.
pub const REGIME_STATE_KEY: &str = "regime.json";

/// Current mode with tracking metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeState {
    pub current_mode: TradingMode,
    pub previous_mode: Option<TradingMode>,
    pub mode_since: DateTime<Utc>,
    pub regime_at_switch: Option<Regime>,
    pub regime_probability: f64,
    pub transition_count_24h: usize,
    pub transition_count_48h: usize,
}

/// Append-only record of one mode transition, used for flap detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub from_mode: TradingMode,
    pub to_mode: TradingMode,
    pub timestamp: DateTime<Utc>,
    pub regime: Option<Regime>,
    pub regime_probability: f64,
    pub reason: String,
}

pub struct ModeManager {
    settings: HybridSettings,
    state: ModeState,
    history: Vec<TransitionEvent>,
    locked_until: Option<DateTime<Utc>>,
    clock: SharedClock,
}

impl ModeManager {
    pub fn new(settings: HybridSettings, clock: SharedClock) -> Self {
        let initial: TradingMode = settings
            .initial_mode
            .parse()
            .unwrap_or(TradingMode::Grid);
        let now = clock.now_utc();
        Self {
            settings,
            state: ModeState {
                current_mode: initial,
                previous_mode: None,
                mode_since: now,
                regime_at_switch: None,
                regime_probability: 0.0,
                transition_count_24h: 0,
                transition_count_48h: 0,
            },
            history: Vec::new(),
            locked_until: None,
            clock,
        }
    }

    pub fn state(&self) -> &ModeState {
        &self.state
    }

    pub fn current_mode(&self) -> TradingMode {
        self.state.current_mode
    }

    pub fn transition_history(&self) -> &[TransitionEvent] {
        &self.history
    }

    /// Restore persisted mode on boot.
    pub fn restore(&mut self, mode: TradingMode, mode_since: DateTime<Utc>) {
        self.state.current_mode = mode;
        self.state.mode_since = mode_since;
    }

    fn lock_active(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }

    /// Pure evaluation: which mode should we be in, and why. No mutation.
    pub fn evaluate(
        &self,
        regime: Option<Regime>,
        probability: f64,
        duration_days: u32,
    ) -> (TradingMode, String) {
        let now = self.clock.now_utc();

        if !self.settings.enable_mode_switching {
            return (self.state.current_mode, "Mode switching disabled".into());
        }

        if self.lock_active(now) {
            return (
                TradingMode::Grid,
                "Safety lock active (too many transitions)".into(),
            );
        }

        let Some(target) = regime.and_then(Regime::target_mode) else {
            return (
                self.state.current_mode,
                format!(
                    "Regime {} - keeping current mode",
                    regime.map(|r| r.to_string()).unwrap_or_else(|| "unknown".into())
                ),
            );
        };

        if target == self.state.current_mode {
            return (target, "Already in correct mode".into());
        }

        // Emergency BEAR skips hysteresis, not the lock.
        if regime == Some(Regime::Bear) && probability >= EMERGENCY_BEAR_PROBABILITY {
            return (
                TradingMode::Cash,
                format!("Emergency BEAR (probability {probability:.2})"),
            );
        }

        if probability < self.settings.min_regime_probability {
            return (
                self.state.current_mode,
                format!(
                    "Regime probability {probability:.2} below threshold {:.2}",
                    self.settings.min_regime_probability
                ),
            );
        }

        if duration_days < self.settings.min_regime_duration_days {
            return (
                self.state.current_mode,
                format!(
                    "Regime duration {duration_days}d below threshold {}d",
                    self.settings.min_regime_duration_days
                ),
            );
        }

        if self.in_cooldown(now) {
            return (self.state.current_mode, "Mode cooldown active".into());
        }

        (
            target,
            format!(
                "Regime {} (prob={probability:.2}, dur={duration_days}d)",
                regime.expect("target implies regime")
            ),
        )
    }

    /// Execute a switch if the safety checks pass. Returns true when the
    /// switch actually happened; state is untouched otherwise except for
    /// the flap lock engaging.
    pub fn request_switch(&mut self, new_mode: TradingMode, reason: &str) -> bool {
        if new_mode == self.state.current_mode {
            return false;
        }

        let now = self.clock.now_utc();
        // Expired lock is dropped lazily on the next mutation.
        if self.locked_until.is_some() && !self.lock_active(now) {
            info!("ModeManager: safety lock expired");
            self.locked_until = None;
        }
        if self.lock_active(now) {
            return false;
        }

        let recent = self.count_recent_transitions(Duration::hours(48), now);
        if recent >= MAX_TRANSITIONS_48H {
            self.locked_until = Some(now + Duration::days(FLAP_LOCK_DAYS));
            warn!("ModeManager: {recent} transitions in 48h - locking to GRID");
            if self.state.current_mode != TradingMode::Grid {
                self.execute_switch(TradingMode::Grid, "Safety lock: too many transitions");
            }
            return false;
        }

        self.execute_switch(new_mode, reason);
        true
    }

    /// Track the latest regime observation without switching.
    pub fn update_regime_info(&mut self, regime: Option<Regime>, probability: f64) {
        self.state.regime_at_switch = regime;
        self.state.regime_probability = probability;
    }

    fn execute_switch(&mut self, new_mode: TradingMode, reason: &str) {
        let now = self.clock.now_utc();
        let old_mode = self.state.current_mode;
        self.history.push(TransitionEvent {
            from_mode: old_mode,
            to_mode: new_mode,
            timestamp: now,
            regime: self.state.regime_at_switch,
            regime_probability: self.state.regime_probability,
            reason: reason.to_string(),
        });

        self.state = ModeState {
            current_mode: new_mode,
            previous_mode: Some(old_mode),
            mode_since: now,
            regime_at_switch: self.state.regime_at_switch,
            regime_probability: self.state.regime_probability,
            transition_count_24h: self.count_recent_transitions(Duration::hours(24), now),
            transition_count_48h: self.count_recent_transitions(Duration::hours(48), now),
        };

        info!("ModeManager: {old_mode} → {new_mode} ({reason})");
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.history.last() {
            Some(last) => {
                now < last.timestamp + Duration::hours(self.settings.mode_cooldown_hours)
            }
            None => false,
        }
    }

    fn count_recent_transitions(&self, window: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - window;
        self.history.iter().filter(|t| t.timestamp > cutoff).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn manager() -> (Arc<ManualClock>, ModeManager) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let manager = ModeManager::new(HybridSettings::default(), clock.clone());
        (clock, manager)
    }

    #[test]
    fn strong_sideways_after_duration_recommends_grid() {
        let (_clock, mut manager) = manager();
        manager.restore(TradingMode::Hold, Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let (mode, _) = manager.evaluate(Some(Regime::Sideways), 0.8, 3);
        assert_eq!(mode, TradingMode::Grid);
    }

    #[test]
    fn low_probability_keeps_current_mode() {
        let (_clock, manager) = manager();
        let (mode, reason) = manager.evaluate(Some(Regime::Bull), 0.6, 5);
        assert_eq!(mode, TradingMode::Grid);
        assert!(reason.contains("probability"));
    }

    #[test]
    fn short_duration_keeps_current_mode() {
        let (_clock, manager) = manager();
        let (mode, reason) = manager.evaluate(Some(Regime::Bull), 0.9, 1);
        assert_eq!(mode, TradingMode::Grid);
        assert!(reason.contains("duration"));
    }

    #[test]
    fn unknown_or_transition_regime_keeps_mode() {
        let (_clock, manager) = manager();
        assert_eq!(manager.evaluate(None, 0.9, 9).0, TradingMode::Grid);
        assert_eq!(
            manager.evaluate(Some(Regime::Transition), 0.9, 9).0,
            TradingMode::Grid
        );
    }

    #[test]
    fn emergency_bear_bypasses_hysteresis() {
        let (_clock, manager) = manager();
        // Probability below the normal gate, duration zero, still CASH.
        let (mode, reason) = manager.evaluate(Some(Regime::Bear), 0.90, 0);
        assert_eq!(mode, TradingMode::Cash);
        assert!(reason.contains("Emergency"));
    }

    #[test]
    fn cooldown_blocks_second_switch() {
        let (clock, mut manager) = manager();
        assert!(manager.request_switch(TradingMode::Hold, "test"));

        clock.advance(Duration::hours(1));
        let (mode, reason) = manager.evaluate(Some(Regime::Sideways), 0.9, 5);
        assert_eq!(mode, TradingMode::Hold);
        assert!(reason.contains("cooldown"));

        clock.advance(Duration::hours(24));
        let (mode, _) = manager.evaluate(Some(Regime::Sideways), 0.9, 5);
        assert_eq!(mode, TradingMode::Grid);
    }

    #[test]
    fn flap_lock_engages_and_expires() {
        let (clock, mut manager) = manager();
        assert!(manager.request_switch(TradingMode::Hold, "one"));
        clock.advance(Duration::hours(1));
        assert!(manager.request_switch(TradingMode::Cash, "two"));
        clock.advance(Duration::hours(1));

        // Third switch inside 48h engages the lock and forces GRID.
        assert!(!manager.request_switch(TradingMode::Hold, "three"));
        assert_eq!(manager.current_mode(), TradingMode::Grid);

        let (mode, reason) = manager.evaluate(Some(Regime::Bull), 0.99, 10);
        assert_eq!(mode, TradingMode::Grid);
        assert!(reason.contains("Safety lock"));

        // Even emergency BEAR respects the lock.
        let (mode, _) = manager.evaluate(Some(Regime::Bear), 0.95, 0);
        assert_eq!(mode, TradingMode::Grid);

        // Lock releases after seven days.
        clock.advance(Duration::days(FLAP_LOCK_DAYS) + Duration::hours(1));
        let (mode, _) = manager.evaluate(Some(Regime::Bull), 0.9, 5);
        assert_eq!(mode, TradingMode::Hold);
    }

    #[test]
    fn evaluate_is_pure() {
        let (_clock, manager) = manager();
        let before_mode = manager.current_mode();
        let _ = manager.evaluate(Some(Regime::Bull), 0.9, 5);
        let _ = manager.evaluate(Some(Regime::Bear), 0.95, 0);
        assert_eq!(manager.current_mode(), before_mode);
        assert!(manager.transition_history().is_empty());
    }

    #[test]
    fn successful_switch_records_event() {
        let (_clock, mut manager) = manager();
        manager.update_regime_info(Some(Regime::Bull), 0.8);
        assert!(manager.request_switch(TradingMode::Hold, "Regime BULL"));

        let history = manager.transition_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_mode, TradingMode::Grid);
        assert_eq!(history[0].to_mode, TradingMode::Hold);
        assert_eq!(history[0].regime, Some(Regime::Bull));
        assert_eq!(manager.state().previous_mode, Some(TradingMode::Grid));
    }
}
