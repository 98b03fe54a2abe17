//! Card lifecycle state machine.
//!
//! Validates every status change against the transition graph and keeps the
//! resource tracker in step with it: entering Active/Integrate takes a slot,
//! leaving that set releases it. A refused allocation leaves the card as it was.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::card::{Card, CardId, CardMetrics, CardStatus, TransitionRecord, WorkerId};
use crate::core::budget::elapsed;
use crate::core::transitions::{can_transition, path_to};
use crate::resources::tracker::ResourceTracker;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition {from} -> {to}")]
    Invalid { from: CardStatus, to: CardStatus },
    #[error("allocation refused for {card_id}: {reason}")]
    AllocationRefused { card_id: CardId, reason: String },
}

/// What a single applied transition did besides changing the status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub record: TransitionRecord,
    /// Worker detached because the card left Active/Integrate.
    pub released_worker: Option<WorkerId>,
    pub allocated: bool,
    pub released: bool,
}

/// Automatic transition the policy wants applied to a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoAction {
    Timeout,
    ErrorCeiling { errors: u32, max: u32 },
}

impl AutoAction {
    pub fn target(self) -> CardStatus {
        match self {
            AutoAction::Timeout => CardStatus::Blocked,
            AutoAction::ErrorCeiling { .. } => CardStatus::Failed,
        }
    }

    pub fn reason(self) -> String {
        match self {
            AutoAction::Timeout => "timeout".to_string(),
            AutoAction::ErrorCeiling { errors, max } => {
                format!("error ceiling: {errors} errors > {max}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CardLifecycle {
    max_error_count: u32,
    max_processing: Duration,
}

impl CardLifecycle {
    pub fn new(max_error_count: u32, max_processing: Duration) -> Self {
        Self {
            max_error_count,
            max_processing,
        }
    }

    pub fn max_error_count(&self) -> u32 {
        self.max_error_count
    }

    pub fn can_transition(&self, from: CardStatus, to: CardStatus) -> bool {
        can_transition(from, to)
    }

    /// Apply one edge of the graph to `card`.
    ///
    /// Invalid edges and refused allocations return an error and leave both
    /// the card and the tracker untouched.
    pub fn transition(
        &self,
        card: &mut Card,
        to: CardStatus,
        reason: &str,
        tracker: &ResourceTracker,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, TransitionError> {
        let from = card.status;
        if !can_transition(from, to) {
            debug!(card_id = %card.id, %from, %to, "transition rejected");
            return Err(TransitionError::Invalid { from, to });
        }

        let entering = !from.consumes_resources() && to.consumes_resources();
        let leaving = from.consumes_resources() && !to.consumes_resources();

        if entering && !tracker.allocate(&card.id) {
            let reason = tracker
                .violations()
                .into_iter()
                .rev()
                .find(|violation| violation.card_id.as_ref() == Some(&card.id))
                .map(|violation| violation.detail)
                .unwrap_or_else(|| "no slot available".to_string());
            return Err(TransitionError::AllocationRefused {
                card_id: card.id.clone(),
                reason,
            });
        }

        let mut released_worker = None;
        let mut released = false;
        if leaving {
            if let Some(started) = card.started_at {
                let ran = elapsed(started, now).as_millis();
                card.metrics.processing_ms = card
                    .metrics
                    .processing_ms
                    .saturating_add(u64::try_from(ran).unwrap_or(u64::MAX));
            }
            // Earlier runs were committed when they ended; only this run's units are new.
            let run_metrics = CardMetrics {
                budget_units: tracker.in_flight_units(&card.id),
                ..card.metrics.clone()
            };
            released = tracker.release(&card.id, &run_metrics);
            released_worker = card.assigned_worker.take();
        }

        if entering {
            card.started_at = Some(now);
        }
        if from == CardStatus::Failed {
            card.metrics.retry_count += 1;
            card.completed_at = None;
        }
        if from == CardStatus::Blocked || to == CardStatus::Active {
            card.paused = false;
        }
        if to.is_finished() {
            card.completed_at = Some(now);
        }

        let record = TransitionRecord {
            from,
            to,
            at: now,
            reason: reason.to_string(),
        };
        card.history.push(record.clone());
        card.status = to;
        info!(card_id = %card.id, %from, %to, reason, "card moved");

        Ok(TransitionOutcome {
            record,
            released_worker,
            allocated: entering,
            released,
        })
    }

    /// Walk the shortest legal path to `to`, recording every edge.
    ///
    /// On failure the card is restored to its state before the walk.
    pub fn walk_to(
        &self,
        card: &mut Card,
        to: CardStatus,
        reason: &str,
        tracker: &ResourceTracker,
        now: DateTime<Utc>,
    ) -> Result<Vec<TransitionOutcome>, TransitionError> {
        let from = card.status;
        let path = path_to(from, to).ok_or(TransitionError::Invalid { from, to })?;
        if path.is_empty() {
            return Err(TransitionError::Invalid { from, to });
        }

        let before = card.clone();
        let mut outcomes = Vec::with_capacity(path.len());
        for step in path {
            match self.transition(card, step, reason, tracker, now) {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    *card = before;
                    return Err(err);
                }
            }
        }
        Ok(outcomes)
    }

    /// Automatic transition due for `card`, if any. The error ceiling wins over a timeout.
    pub fn auto_action(&self, card: &Card, now: DateTime<Utc>) -> Option<AutoAction> {
        if card.metrics.error_count > self.max_error_count
            && can_transition(card.status, CardStatus::Failed)
        {
            return Some(AutoAction::ErrorCeiling {
                errors: card.metrics.error_count,
                max: self.max_error_count,
            });
        }
        let ran_for = card.processing_elapsed(now)?.to_std().ok()?;
        (ran_for > self.max_processing).then_some(AutoAction::Timeout)
    }
}
