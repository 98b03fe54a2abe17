//! Board snapshot persistence.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::card::Card;
use crate::resources::tracker::ResourceUsage;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a session: every card and the tracker counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    /// Cards in id order.
    pub cards: Vec<Card>,
    pub usage: ResourceUsage,
}

/// Persistence boundary. `load_snapshot` returns `Ok(None)` on a cold start.
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, snapshot: &BoardSnapshot) -> Result<()>;
    fn load_snapshot(&self) -> Result<Option<BoardSnapshot>>;
}

/// Snapshot kept as pretty JSON in a single file, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn save_snapshot(&self, snapshot: &BoardSnapshot) -> Result<()> {
        debug!(path = %self.path.display(), cards = snapshot.cards.len(), "writing snapshot");
        let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    fn load_snapshot(&self) -> Result<Option<BoardSnapshot>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no snapshot, cold start");
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read snapshot {}", self.path.display()))?;
        let snapshot: BoardSnapshot = serde_json::from_str(&contents)
            .with_context(|| format!("parse snapshot {}", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            );
        }
        debug!(cards = snapshot.cards.len(), "snapshot loaded");
        Ok(Some(snapshot))
    }
}

/// In-process store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    latest: Mutex<Option<BoardSnapshot>>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<BoardSnapshot> {
        self.latest.lock().clone()
    }

    pub fn save_count(&self) -> u64 {
        *self.saves.lock()
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(&self, snapshot: &BoardSnapshot) -> Result<()> {
        *self.latest.lock() = Some(snapshot.clone());
        *self.saves.lock() += 1;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<BoardSnapshot>> {
        Ok(self.latest.lock().clone())
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("snapshot path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp snapshot {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace snapshot {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{CardId, CardStatus, Priority, TransitionRecord, WorkerId};
    use crate::core::types::{Violation, ViolationKind};
    use crate::resources::tracker::{Allocation, EmergencyState};
    use crate::test_support::epoch;

    fn populated_snapshot() -> BoardSnapshot {
        let now = epoch();
        let mut card = Card::new("persist me", Priority::High, now);
        card.status = CardStatus::Todo;
        card.history.push(TransitionRecord {
            from: CardStatus::Backlog,
            to: CardStatus::Todo,
            at: now,
            reason: "queued".to_string(),
        });
        card.dependencies.insert(CardId::new("card-prev"));
        card.metrics.error_count = 1;
        card.warnings.push("watch out".to_string());

        let mut running = Card::new("running", Priority::Low, now);
        running.status = CardStatus::Active;
        running.assigned_worker = Some(WorkerId::new("w-1"));
        running.started_at = Some(now);

        let mut usage = ResourceUsage::started_at(now);
        usage.allocations.insert(
            running.id.clone(),
            Allocation {
                allocated_at: now,
                in_flight_units: 42,
            },
        );
        usage.budget_consumed = 900;
        usage.handoff_in_flight = true;
        usage.handoff_cards.insert(running.id.clone());
        usage.emergency = Some(EmergencyState {
            reason: "drill".to_string(),
            since: now,
        });
        usage.violations.push_back(Violation {
            at: now,
            kind: ViolationKind::RateLimit,
            card_id: None,
            detail: "too many".to_string(),
        });

        BoardSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            cards: vec![card, running],
            usage,
        }
    }

    /// Every card and usage field survives a write → read cycle.
    #[test]
    fn json_store_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path().join("state/board.json"));
        let snapshot = populated_snapshot();
        store.save_snapshot(&snapshot).expect("save");
        let loaded = store.load_snapshot().expect("load").expect("snapshot");
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn missing_file_is_cold_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonFileStore::new(temp.path().join("absent.json"));
        assert!(store.load_snapshot().expect("load").is_none());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("board.json");
        fs::write(&path, "{ not json").expect("write");
        let err = JsonFileStore::new(&path).load_snapshot().expect_err("corrupt");
        assert!(format!("{err:#}").contains("parse snapshot"));
    }

    #[test]
    fn memory_store_counts_saves() {
        let store = MemoryStore::new();
        assert!(store.load_snapshot().expect("load").is_none());
        store.save_snapshot(&populated_snapshot()).expect("save");
        store.save_snapshot(&populated_snapshot()).expect("save");
        assert_eq!(store.save_count(), 2);
        assert!(store.latest().is_some());
    }
}
