//! Test-only helpers: fixed instants, scenario limits, card builders and
//! scripted collaborators.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;

use crate::board::{Board, Collaborators};
use crate::card::{Card, CardId, Priority, WorkerId};
use crate::clock::ManualClock;
use crate::io::compression::ContextCompressor;
use crate::io::config::BoardConfig;
use crate::io::snapshot::{BoardSnapshot, JsonFileStore, MemoryStore, SnapshotStore};
use crate::io::workers::{WorkerManager, WorkerRole};
use crate::resources::limits::ResourceLimits;
use crate::rules::RuleEngine;

/// Fixed start instant for deterministic tests.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0)
        .single()
        .expect("valid timestamp")
}

/// Hard active limit 3 with half a slot reserved, budget 20000 with 3000 reserved.
pub fn scenario_limits() -> ResourceLimits {
    ResourceLimits {
        max_active: 3,
        active_reserve: 0.5,
        max_budget_units: 20_000,
        budget_reserve: 3_000,
        ..ResourceLimits::default()
    }
}

pub fn scenario_config() -> BoardConfig {
    BoardConfig {
        limits: scenario_limits(),
        ..BoardConfig::default()
    }
}

/// Backlog card with a fixed id, created `secs` after [`epoch`].
pub fn card_at(id: &str, priority: Priority, secs: i64) -> Card {
    let mut card = Card::new(format!("{id} title"), priority, epoch() + Duration::seconds(secs));
    card.id = CardId::new(id);
    card
}

/// JSON snapshot store inside a fresh temporary directory.
///
/// Keep the `TempDir` alive for as long as the store is used.
pub fn temp_store() -> (tempfile::TempDir, JsonFileStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = JsonFileStore::new(dir.path().join("board.json"));
    (dir, store)
}

/// Worker manager that hands out sequential ids and records every call.
#[derive(Debug, Default)]
pub struct ScriptedWorkers {
    state: Mutex<WorkerLog>,
}

#[derive(Debug, Default)]
struct WorkerLog {
    next: u32,
    created: Vec<(WorkerRole, CardId, WorkerId)>,
    terminated: Vec<(WorkerId, String)>,
    fail_create: bool,
    fail_terminate: bool,
}

impl ScriptedWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn fail_terminate(&self, fail: bool) {
        self.state.lock().fail_terminate = fail;
    }

    pub fn created(&self) -> Vec<(WorkerRole, CardId, WorkerId)> {
        self.state.lock().created.clone()
    }

    pub fn terminated(&self) -> Vec<(WorkerId, String)> {
        self.state.lock().terminated.clone()
    }
}

impl WorkerManager for ScriptedWorkers {
    fn create_worker(&self, role: WorkerRole, card: &Card) -> Result<WorkerId> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(anyhow!("worker pool unavailable"));
        }
        state.next += 1;
        let worker = WorkerId::new(format!("worker-{}", state.next));
        state.created.push((role, card.id.clone(), worker.clone()));
        Ok(worker)
    }

    fn terminate_worker(&self, worker: &WorkerId, reason: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_terminate {
            return Err(anyhow!("worker {worker} did not answer"));
        }
        state.terminated.push((worker.clone(), reason.to_string()));
        Ok(())
    }
}

/// Compressor that always fails.
#[derive(Debug, Default)]
pub struct FailingCompressor;

impl ContextCompressor for FailingCompressor {
    fn compress(&self, card: &Card, _max_chars: usize) -> Result<String> {
        Err(anyhow!("compression service down for {}", card.id))
    }
}

/// Compressor that ignores the ceiling.
#[derive(Debug, Default)]
pub struct OversizedCompressor;

impl ContextCompressor for OversizedCompressor {
    fn compress(&self, _card: &Card, max_chars: usize) -> Result<String> {
        Ok("x".repeat(max_chars + 1))
    }
}

/// Store whose saves always fail.
#[derive(Debug, Default)]
pub struct FailingStore;

impl SnapshotStore for FailingStore {
    fn save_snapshot(&self, _snapshot: &BoardSnapshot) -> Result<()> {
        Err(anyhow!("disk full"))
    }

    fn load_snapshot(&self) -> Result<Option<BoardSnapshot>> {
        Ok(None)
    }
}

/// A board wired to a manual clock, scripted workers and an in-memory store.
pub struct TestBoard {
    pub board: Board,
    pub clock: Arc<ManualClock>,
    pub workers: Arc<ScriptedWorkers>,
    pub store: Arc<MemoryStore>,
}

impl TestBoard {
    pub fn new(config: BoardConfig) -> Self {
        Self::build(config, |collaborators| collaborators)
    }

    /// Board with [`scenario_limits`].
    pub fn scenario() -> Self {
        Self::new(scenario_config())
    }

    /// Like [`TestBoard::new`], letting the caller swap collaborators before opening.
    pub fn build(
        config: BoardConfig,
        customize: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        Self::open(config, customize, RuleEngine::with_default_rules())
    }

    /// Board running `rules` instead of the default rule set.
    pub fn with_rules(config: BoardConfig, rules: RuleEngine) -> Self {
        Self::open(config, |collaborators| collaborators, rules)
    }

    fn open(
        config: BoardConfig,
        customize: impl FnOnce(Collaborators) -> Collaborators,
        rules: RuleEngine,
    ) -> Self {
        crate::logging::try_init();
        let clock = Arc::new(ManualClock::new(epoch()));
        let workers = Arc::new(ScriptedWorkers::new());
        let store = Arc::new(MemoryStore::new());
        let collaborators = Collaborators::new(workers.clone(), store.clone())
            .with_clock(clock.clone());
        let board =
            Board::open_with_rules(config, customize(collaborators), rules).expect("open board");
        Self {
            board,
            clock,
            workers,
            store,
        }
    }

    /// Open a second board over the same store, clock and workers.
    pub fn reopen(&self, config: BoardConfig) -> Board {
        let collaborators = Collaborators::new(self.workers.clone(), self.store.clone())
            .with_clock(self.clock.clone());
        Board::open(config, collaborators).expect("reopen board")
    }
}
