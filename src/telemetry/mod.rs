//! Structured append-only telemetry.
//!
//! One JSONL file per category under the log directory, rotated by size
//! (10 MB keeping 5 backups). Categories mirror the operational questions
//! a running bot gets asked: what broke, what traded, what was decided,
//! how it performed, what the system/API layer did.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::error;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;

const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const BACKUP_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    Error,
    Trade,
    Decision,
    Performance,
    System,
    Api,
}

impl LogCategory {
    fn file_stem(self) -> &'static str {
        match self {
            LogCategory::Error => "error",
            LogCategory::Trade => "trade",
            LogCategory::Decision => "decision",
            LogCategory::Performance => "performance",
            LogCategory::System => "system",
            LogCategory::Api => "api",
        }
    }
}

/// Journal line for every executed trade (fills, partial fills, downtime
/// fills, stop-loss sells).
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub value_usd: Decimal,
    pub fee_usd: Decimal,
    pub reasoning: String,
}

pub struct Telemetry {
    dir: PathBuf,
    // One lock per category so a busy trade log doesn't stall system lines.
    locks: HashMap<LogCategory, Mutex<()>>,
}

impl Telemetry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).ok();
        let locks = [
            LogCategory::Error,
            LogCategory::Trade,
            LogCategory::Decision,
            LogCategory::Performance,
            LogCategory::System,
            LogCategory::Api,
        ]
        .into_iter()
        .map(|c| (c, Mutex::new(())))
        .collect();
        Self { dir, locks }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one structured event. A timestamp is stamped in; write
    /// failures are reported through `log` and otherwise swallowed.
    pub fn log(&self, category: LogCategory, event: serde_json::Value) {
        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "event": event,
        });
        if let Err(e) = self.append(category, &line.to_string()) {
            error!("Telemetry write failed ({}): {e}", category.file_stem());
        }
    }

    /// Journal a trade into the `trade` category.
    pub fn trade(&self, record: &TradeRecord) {
        match serde_json::to_value(record) {
            Ok(value) => self.log(LogCategory::Trade, value),
            Err(e) => error!("Trade record serialization failed: {e}"),
        }
    }

    fn path_for(&self, category: LogCategory) -> PathBuf {
        self.dir.join(format!("{}.log", category.file_stem()))
    }

    fn append(&self, category: LogCategory, line: &str) -> std::io::Result<()> {
        let _guard = self.locks.get(&category).map(|l| l.lock());
        let path = self.path_for(category);

        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() >= MAX_LOG_BYTES {
                self.rotate(category)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")
    }

    /// Shift `name.log` → `name.log.1` → ... → `name.log.5`, dropping the
    /// oldest.
    fn rotate(&self, category: LogCategory) -> std::io::Result<()> {
        let base = self.path_for(category);
        let backup = |n: u32| PathBuf::from(format!("{}.{n}", base.display()));

        let oldest = backup(BACKUP_COUNT);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..BACKUP_COUNT).rev() {
            let from = backup(n);
            if from.exists() {
                fs::rename(&from, backup(n + 1))?;
            }
        }
        if base.exists() {
            fs::rename(&base, backup(1))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn writes_jsonl_per_category() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::new(dir.path());

        telemetry.log(LogCategory::System, json!({"msg": "boot"}));
        telemetry.log(LogCategory::System, json!({"msg": "tick"}));
        telemetry.log(LogCategory::Error, json!({"msg": "oops"}));

        let system = fs::read_to_string(dir.path().join("system.log")).unwrap();
        assert_eq!(system.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(system.lines().next().unwrap()).unwrap();
        assert_eq!(first["event"]["msg"], "boot");

        let errors = fs::read_to_string(dir.path().join("error.log")).unwrap();
        assert_eq!(errors.lines().count(), 1);
    }

    #[test]
    fn trade_records_land_in_trade_log() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::new(dir.path());

        telemetry.trade(&TradeRecord {
            timestamp: Utc::now(),
            action: "BUY".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(49000),
            quantity: dec!(0.001),
            value_usd: dec!(49),
            fee_usd: dec!(0.049),
            reasoning: "Grid order filled at 49000".into(),
        });

        let trades = fs::read_to_string(dir.path().join("trade.log")).unwrap();
        assert!(trades.contains("BTCUSDT"));
        assert!(trades.contains("49000"));
    }

    #[test]
    fn rotation_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let telemetry = Telemetry::new(dir.path());
        let base = dir.path().join("system.log");

        // Force the size threshold with a pre-sized file
        fs::write(&base, vec![b'x'; (MAX_LOG_BYTES + 1) as usize]).unwrap();
        telemetry.log(LogCategory::System, json!({"msg": "after rotate"}));

        assert!(dir.path().join("system.log.1").exists());
        let current = fs::read_to_string(&base).unwrap();
        assert_eq!(current.lines().count(), 1);
    }
}
