//! Worker lifecycle boundary.
//!
//! The [`WorkerManager`] trait decouples the board from whatever actually
//! runs work (agent sessions, processes, remote executors). The board only
//! stores and clears the returned [`WorkerId`]; tests use scripted managers.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::card::{Card, WorkerId};

/// What a worker is able to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Plan,
    WriteCode,
    RunTools,
    Review,
    Merge,
    Research,
}

/// Worker role requested for a card. Each role carries a fixed capability set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Planner,
    #[default]
    Implementer,
    Reviewer,
    Integrator,
    Researcher,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerRole::Planner => "planner",
            WorkerRole::Implementer => "implementer",
            WorkerRole::Reviewer => "reviewer",
            WorkerRole::Integrator => "integrator",
            WorkerRole::Researcher => "researcher",
        }
    }

    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            WorkerRole::Planner => &[Capability::Plan, Capability::Research],
            WorkerRole::Implementer => &[Capability::WriteCode, Capability::RunTools],
            WorkerRole::Reviewer => &[Capability::Review, Capability::RunTools],
            WorkerRole::Integrator => &[Capability::Merge, Capability::RunTools, Capability::Review],
            WorkerRole::Researcher => &[Capability::Research, Capability::RunTools],
        }
    }

    pub fn can(self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Abstraction over worker backends.
pub trait WorkerManager: Send + Sync {
    /// Spin up a worker for `card`. The returned id is opaque to the board.
    fn create_worker(&self, role: WorkerRole, card: &Card) -> Result<WorkerId>;

    /// Ask a worker to stop. Cooperative: in-flight work may finish its current unit.
    fn terminate_worker(&self, worker: &WorkerId, reason: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_expose_capabilities() {
        assert!(WorkerRole::Reviewer.can(Capability::Review));
        assert!(!WorkerRole::Reviewer.can(Capability::WriteCode));
        assert!(WorkerRole::Integrator.can(Capability::Merge));
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&WorkerRole::Integrator).expect("serialize");
        assert_eq!(json, "\"integrator\"");
    }
}
