//! Shared deterministic types for board core logic.
//!
//! These types define stable contracts between the tracker, the lifecycle and
//! the board. They carry no behaviour beyond formatting and ordering.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::CardId;

/// Graduated resource-pressure classification. Ordering is significant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Green,
    Yellow,
    Orange,
    Red,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Green => "green",
            AlertLevel::Yellow => "yellow",
            AlertLevel::Orange => "orange",
            AlertLevel::Red => "red",
            AlertLevel::Critical => "critical",
        }
    }

    /// Orange and above warrant a pressure warning on newly started cards.
    pub fn is_elevated(self) -> bool {
        self >= AlertLevel::Orange
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resources tracked against limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ActiveSlots,
    Budget,
    CallRate,
    SessionTime,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::ActiveSlots => "active_slots",
            ResourceKind::Budget => "budget",
            ResourceKind::CallRate => "call_rate",
            ResourceKind::SessionTime => "session_time",
        }
    }
}

/// Usage of one resource as a fraction of its effective limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRatio {
    pub resource: ResourceKind,
    pub ratio: f64,
}

/// Result of an admission check.
///
/// `ok=false` means a hard limit would be exceeded. `ok=true` with warnings
/// means the request lands in the handoff buffer between the effective and
/// hard limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Availability {
    pub ok: bool,
    pub warnings: Vec<String>,
    pub reason: Option<String>,
}

impl Availability {
    pub fn in_buffer_zone(&self) -> bool {
        self.ok && !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffTrigger {
    pub should_handoff: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ActiveLimit,
    BudgetLimit,
    RateLimit,
    ProcessingTime,
    SessionTime,
    EmergencyMode,
}

/// A refused or overrun resource request, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub at: DateTime<Utc>,
    pub kind: ViolationKind,
    pub card_id: Option<CardId>,
    pub detail: String,
}

/// What one periodic sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Cards moved to Blocked because they ran too long.
    pub timed_out: Vec<CardId>,
    /// Cards moved to Failed because of the error ceiling.
    pub failed: Vec<CardId>,
    /// `(old, continuation)` if the sweep ran a graceful handoff.
    pub handoff: Option<(CardId, CardId)>,
    pub warnings: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty()
            && self.failed.is_empty()
            && self.handoff.is_none()
            && self.warnings.is_empty()
    }
}
