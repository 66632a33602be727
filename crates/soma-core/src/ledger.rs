use crate::error::Result;
use crate::paths;
use crate::stage::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ran,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub stage: Stage,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Persisted history of stage outcomes for one main output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default = "default_version")]
    pub version: u32,
    pub history: Vec<HistoryEntry>,
    pub last_updated: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

const MAX_HISTORY: usize = 200;

impl Default for Ledger {
    fn default() -> Self {
        Self {
            version: 1,
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

impl Ledger {
    /// Load the ledger, or start an empty one if none has been written yet.
    pub fn load(main: &Path) -> Result<Self> {
        let path = paths::ledger_path(main);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let ledger: Ledger = serde_yaml::from_str(&data)?;
        Ok(ledger)
    }

    pub fn save(&self, main: &Path) -> Result<()> {
        let path = paths::ledger_path(main);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            self.history.drain(..self.history.len() - MAX_HISTORY);
        }
        self.last_updated = Utc::now();
    }

    /// Most recent entry for `stage`.
    pub fn last_for(&self, stage: Stage) -> Option<&HistoryEntry> {
        self.history.iter().rev().find(|e| e.stage == stage)
    }
}

impl HistoryEntry {
    pub fn new(stage: Stage, outcome: Outcome) -> Self {
        Self {
            stage,
            outcome,
            timestamp: Utc::now(),
            processed: 0,
            failed_inputs: Vec::new(),
            note: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ledger_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(dir.path()).unwrap();
        assert!(ledger.history.is_empty());

        let mut entry = HistoryEntry::new(Stage::HARMONIC_UNSYNCHED, Outcome::Ran);
        entry.processed = 3;
        entry.failed_inputs.push("HER_02.sdds".to_string());
        ledger.record(entry);
        ledger.record(HistoryEntry::new(Stage::OPTICS_UNSYNCHED, Outcome::Skipped));
        ledger.save(dir.path()).unwrap();

        let loaded = Ledger::load(dir.path()).unwrap();
        assert_eq!(loaded.history.len(), 2);
        let h = loaded.last_for(Stage::HARMONIC_UNSYNCHED).unwrap();
        assert_eq!(h.processed, 3);
        assert_eq!(h.failed_inputs, vec!["HER_02.sdds"]);
        assert!(loaded.last_for(Stage::CALIBRATE).is_none());
    }

    #[test]
    fn history_is_trimmed() {
        let mut ledger = Ledger::default();
        for _ in 0..(MAX_HISTORY + 25) {
            ledger.record(HistoryEntry::new(Stage::MODEL, Outcome::Ran));
        }
        assert_eq!(ledger.history.len(), MAX_HISTORY);
    }
}
