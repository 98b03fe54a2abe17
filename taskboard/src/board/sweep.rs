//! Periodic sweep applying automatic transitions.

use tracing::{info, instrument, warn};

use super::Board;
use crate::card::CardStatus;
use crate::core::types::SweepReport;
use crate::error::{BoardError, BoardResult};
use crate::lifecycle::AutoAction;

impl Board {
    /// Apply due automatic transitions, then run at most one graceful handoff.
    ///
    /// Timeouts and error ceilings are detected by polling; running work is
    /// never interrupted, only detached from the board.
    #[instrument(skip_all)]
    pub fn run_sweep(&self) -> BoardResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut deferred = Vec::new();

        let handoff_candidate = {
            let mut cards = self.cards.lock();
            let now = self.clock.now();
            let mut changed = false;

            for id in cards.scheduled_ids() {
                let Some(card) = cards.get_mut(&id) else {
                    continue;
                };
                let Some(action) = self.lifecycle.auto_action(card, now) else {
                    continue;
                };
                let reason = action.reason();
                match self
                    .lifecycle
                    .transition(card, action.target(), &reason, &self.tracker, now)
                {
                    Ok(outcome) => {
                        changed = true;
                        let outcomes = [outcome];
                        self.retire_workers(card, &outcomes, &reason);
                        deferred.extend(self.fire_transitions(card, &outcomes).deferred);
                        match action {
                            AutoAction::Timeout => report.timed_out.push(id),
                            AutoAction::ErrorCeiling { .. } => report.failed.push(id),
                        }
                    }
                    Err(err) => {
                        warn!(card_id = %id, error = %err, "automatic transition failed");
                        report.warnings.push(format!("{id}: {err}"));
                    }
                }
            }
            if changed {
                self.persist(&cards)?;
            }

            let candidate = cards
                .by_status(CardStatus::Active)
                .into_iter()
                .map(|card| card.id.clone())
                .find(|id| self.tracker.check_handoff_trigger(id).should_handoff);
            candidate
        };

        if let Some(id) = handoff_candidate {
            match self.execute_graceful_handoff(&id) {
                Ok(outcome) => {
                    report.handoff = Some((outcome.old_card.id, outcome.new_card.id));
                }
                Err(BoardError::Rejected(rejection)) => {
                    report.warnings.push(format!("{id}: {rejection}"));
                }
                Err(fatal) => return Err(fatal),
            }
        }

        self.drain(deferred)?;
        info!(
            timed_out = report.timed_out.len(),
            failed = report.failed.len(),
            handoff = report.handoff.is_some(),
            "sweep finished"
        );
        Ok(report)
    }
}
