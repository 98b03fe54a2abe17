use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::io::workers::WorkerRole;

/// Opaque card identifier, assigned at creation and never changed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CardId(String);

impl CardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(format!("card-{}", &raw[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CardId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity handed out by the worker lifecycle manager. Stored, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Backlog,
    Todo,
    Active,
    Integrate,
    Review,
    Blocked,
    Done,
    Failed,
}

impl CardStatus {
    pub const ALL: [CardStatus; 8] = [
        CardStatus::Backlog,
        CardStatus::Todo,
        CardStatus::Active,
        CardStatus::Integrate,
        CardStatus::Review,
        CardStatus::Blocked,
        CardStatus::Done,
        CardStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Backlog => "backlog",
            CardStatus::Todo => "todo",
            CardStatus::Active => "active",
            CardStatus::Integrate => "integrate",
            CardStatus::Review => "review",
            CardStatus::Blocked => "blocked",
            CardStatus::Done => "done",
            CardStatus::Failed => "failed",
        }
    }

    /// Statuses that hold an active slot in the resource tracker.
    pub fn consumes_resources(self) -> bool {
        matches!(self, CardStatus::Active | CardStatus::Integrate)
    }

    /// Statuses that stamp `completed_at` and are eligible for retention cleanup.
    pub fn is_finished(self) -> bool {
        matches!(self, CardStatus::Done | CardStatus::Failed)
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Ordering is significant: `Critical` sorts highest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Counters accumulated while a card runs. Only ever increase; a handoff
/// continuation starts from zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardMetrics {
    pub budget_units: u64,
    pub tool_calls: u64,
    pub error_count: u32,
    pub retry_count: u32,
    pub processing_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: CardStatus,
    pub to: CardStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub title: String,
    /// Opaque payload for the worker. Holds the compressed summary on continuations.
    pub context: String,
    pub status: CardStatus,
    pub priority: Priority,
    pub assigned_worker: Option<WorkerId>,
    pub role: Option<WorkerRole>,
    pub metrics: CardMetrics,
    pub history: Vec<TransitionRecord>,
    pub dependencies: BTreeSet<CardId>,
    pub estimated_units: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused: bool,
    pub warnings: Vec<String>,
    pub continued_by: Option<CardId>,
}

impl Card {
    pub fn new(title: impl Into<String>, priority: Priority, created_at: DateTime<Utc>) -> Self {
        Self {
            id: CardId::generate(),
            title: title.into(),
            context: String::new(),
            status: CardStatus::Backlog,
            priority,
            assigned_worker: None,
            role: None,
            metrics: CardMetrics::default(),
            history: Vec::new(),
            dependencies: BTreeSet::new(),
            estimated_units: 0,
            created_at,
            started_at: None,
            completed_at: None,
            paused: false,
            warnings: Vec::new(),
            continued_by: None,
        }
    }

    /// Wall-clock time since the card last entered `Active`, if it is running.
    pub fn processing_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.status.consumes_resources() {
            return None;
        }
        self.started_at.map(|started| now - started)
    }
}

/// Fields a caller supplies when creating a card.
#[derive(Clone, Debug, Default)]
pub struct NewCard {
    pub title: String,
    pub context: String,
    pub priority: Priority,
    pub estimated_units: u64,
    pub dependencies: Vec<CardId>,
    pub role: Option<WorkerRole>,
}

impl NewCard {
    pub fn new(title: impl Into<String>, priority: Priority) -> Self {
        Self {
            title: title.into(),
            priority,
            ..Self::default()
        }
    }

    pub fn with_estimate(mut self, units: u64) -> Self {
        self.estimated_units = units;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = Some(role);
        self
    }
}
