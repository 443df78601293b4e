//! Per-bot JSON snapshot persistence and the recalculation trigger file
//!
//! One document per bot at `{profiles_dir}/orders/{bot_key}.json`. Writes
//! are full-file replaces through a temp file + rename; failures are
//! logged and retried on the next persistence opportunity.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::chain::types::AssetPair;
use crate::errors::{EngineError, EngineResult};
use crate::grid::model::Grid;
use crate::grid::types::{GridSlot, PerSide};

/// Persisted state of one bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSnapshot {
    /// Flat list of slot records, ordered by slot id.
    pub orders: Vec<GridSlot>,
    pub boundary_idx: usize,
    pub gap: usize,
    pub grid_version: u64,
    pub bts_fees_owed: f64,
    /// Sides that were emergency-doubled by spread correction.
    #[serde(default)]
    pub doubled_sides: PerSide<bool>,
    /// Dedup cache: fill key -> last-seen ms.
    #[serde(default)]
    pub processed_fills: HashMap<String, u64>,
    /// Last-known asset metadata, for recovery validation.
    pub assets: AssetPair,
    pub last_updated: u64,
}

impl BotSnapshot {
    pub fn from_grid(
        grid: &Grid,
        bts_fees_owed: f64,
        doubled_sides: PerSide<bool>,
        processed_fills: HashMap<String, u64>,
        assets: AssetPair,
    ) -> Self {
        Self {
            orders: grid.slots().to_vec(),
            boundary_idx: grid.boundary_idx,
            gap: grid.gap,
            grid_version: grid.version,
            bts_fees_owed,
            doubled_sides,
            processed_fills,
            assets,
            last_updated: crate::pipeline::now_ms(),
        }
    }

    /// Rebuild the grid recorded in this snapshot.
    pub fn to_grid(&self) -> Grid {
        Grid::from_parts(
            self.orders.clone(),
            self.boundary_idx,
            self.gap,
            self.grid_version,
        )
    }
}

/// Storage for one bot's snapshot and trigger file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    profiles_dir: PathBuf,
    bot_key: String,
}

impl SnapshotStore {
    pub fn new(profiles_dir: impl Into<PathBuf>, bot_key: impl Into<String>) -> Self {
        Self {
            profiles_dir: profiles_dir.into(),
            bot_key: bot_key.into(),
        }
    }

    /// `{profiles_dir}/orders/{bot_key}.json`
    pub fn snapshot_path(&self) -> PathBuf {
        self.profiles_dir
            .join("orders")
            .join(format!("{}.json", self.bot_key))
    }

    /// `{profiles_dir}/recalculate.{bot_key}.trigger`
    pub fn trigger_path(&self) -> PathBuf {
        self.profiles_dir
            .join(format!("recalculate.{}.trigger", self.bot_key))
    }

    /// Load the persisted snapshot, if one exists and parses.
    pub fn load(&self) -> Option<BotSnapshot> {
        let path = self.snapshot_path();
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(&path)
            .map_err(EngineError::from)
            .and_then(|content| serde_json::from_str(&content).map_err(EngineError::from))
        {
            Ok(snapshot) => {
                info!("loaded snapshot from {:?}", path);
                Some(snapshot)
            }
            Err(e) => {
                warn!("failed to load snapshot {:?}: {}", path, e);
                None
            }
        }
    }

    /// Write the snapshot atomically (temp file + rename).
    pub fn save(&self, snapshot: &BotSnapshot) -> EngineResult<()> {
        let path = self.snapshot_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// Whether a recalculation has been requested.
    pub fn trigger_present(&self) -> bool {
        self.trigger_path().exists()
    }

    /// Consume the trigger file.
    pub fn remove_trigger(&self) -> EngineResult<()> {
        let path = self.trigger_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn bot_key(&self) -> &str {
        &self.bot_key
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{test_config, test_pair};

    fn temp_store(tag: &str) -> SnapshotStore {
        let dir = std::env::temp_dir().join(format!("dexgrid-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        SnapshotStore::new(dir, "testa-testb")
    }

    #[test]
    fn test_snapshot_round_trip() {
        let store = temp_store("roundtrip");
        let grid = Grid::create(&test_config()).unwrap();

        let mut processed = HashMap::new();
        processed.insert("1.7.1:5:a".to_string(), 123u64);

        let snapshot = BotSnapshot::from_grid(
            &grid,
            12.5,
            PerSide { buy: true, sell: false },
            processed,
            test_pair(),
        );
        store.save(&snapshot).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.grid_version, grid.version);
        assert_eq!(loaded.boundary_idx, grid.boundary_idx);
        assert_eq!(loaded.orders.len(), grid.len());
        assert!((loaded.bts_fees_owed - 12.5).abs() < 1e-12);
        assert!(loaded.doubled_sides.buy);
        assert_eq!(loaded.processed_fills.len(), 1);

        let rebuilt = loaded.to_grid();
        assert_eq!(rebuilt.len(), grid.len());
        assert_eq!(rebuilt.version, grid.version);

        let _ = std::fs::remove_dir_all(store.profiles_dir());
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let store = temp_store("missing");
        assert!(store.load().is_none());
    }

    #[test]
    fn test_trigger_lifecycle() {
        let store = temp_store("trigger");
        std::fs::create_dir_all(store.profiles_dir()).unwrap();
        assert!(!store.trigger_present());

        std::fs::write(store.trigger_path(), b"").unwrap();
        assert!(store.trigger_present());

        store.remove_trigger().unwrap();
        assert!(!store.trigger_present());

        let _ = std::fs::remove_dir_all(store.profiles_dir());
    }
}
