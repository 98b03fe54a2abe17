//! Graceful handoff: retire a running card in favour of a fresh continuation.
//!
//! The whole sequence runs under the card lock. Once the tracker reservation
//! is taken, every exit path hands it back through `complete_handoff`.

use tracing::{info, instrument, warn};

use super::{Board, CardStore, find_mut};
use crate::card::{Card, CardId, CardMetrics, CardStatus};
use crate::error::{BoardResult, Rejection};
use crate::lifecycle::TransitionOutcome;
use crate::rules::{BoardEvent, Deferred};

#[derive(Debug, Clone, PartialEq)]
pub struct HandoffOutcome {
    /// The retired card, now Done.
    pub old_card: Card,
    /// The continuation, Active with the old card's worker.
    pub new_card: Card,
    pub summary_chars: usize,
}

struct Continuation {
    card: Card,
    summary_chars: usize,
    old_outcomes: Vec<TransitionOutcome>,
    new_outcomes: Vec<TransitionOutcome>,
}

impl Board {
    #[instrument(skip_all, fields(card_id = %id))]
    pub fn execute_graceful_handoff(&self, id: &CardId) -> BoardResult<HandoffOutcome> {
        let (outcome, deferred) = {
            let mut cards = self.cards.lock();
            let result = self.handoff_in(&mut cards, id)?;
            self.persist(&cards)?;
            result
        };
        self.drain(deferred)?;
        Ok(outcome)
    }

    fn handoff_in(
        &self,
        cards: &mut CardStore,
        id: &CardId,
    ) -> BoardResult<(HandoffOutcome, Vec<Deferred>)> {
        let old = find_mut(cards, id)?;
        if !old.status.consumes_resources() {
            return Err(Rejection::HandoffUnavailable {
                reason: format!("card is {}, only running cards hand off", old.status),
            }
            .into());
        }

        if !self.tracker.prepare_handoff(id) {
            let reason = if self.tracker.handoff_in_flight() {
                "another handoff is in flight"
            } else if self.tracker.is_emergency() {
                "emergency mode is active"
            } else {
                "handoff reserve is exhausted"
            };
            return Err(Rejection::HandoffUnavailable {
                reason: reason.to_string(),
            }
            .into());
        }
        info!("handoff reserved");

        let before = old.clone();
        let continuation = match self.build_continuation(old) {
            Ok(continuation) => continuation,
            Err(err) => {
                *old = before;
                self.tracker.complete_handoff(id, None);
                warn!(error = %err, "handoff rolled back");
                return Err(err);
            }
        };
        let Continuation {
            card: mut new_card,
            summary_chars,
            old_outcomes,
            new_outcomes,
        } = continuation;
        self.tracker.complete_handoff(id, Some(&new_card.id));

        let mut deferred = self.fire_transitions(old, &old_outcomes).deferred;
        let old_card = old.clone();

        deferred.extend(self.fire_transitions(&mut new_card, &new_outcomes).deferred);
        let ctx = self.rule_context();
        deferred.extend(
            self.rules
                .fire(BoardEvent::HandoffCompleted, &mut new_card, &ctx)
                .deferred,
        );
        cards.insert(new_card.clone());

        info!(
            old = %old_card.id,
            new = %new_card.id,
            summary_chars,
            active = self.tracker.active_count(),
            "handoff finished"
        );
        Ok((
            HandoffOutcome {
                old_card,
                new_card,
                summary_chars,
            },
            deferred,
        ))
    }

    /// Steps after the reservation: summary, continuation, worker transfer, retirement.
    fn build_continuation(&self, old: &mut Card) -> BoardResult<Continuation> {
        let now = self.clock.now();
        let ceiling = self.config.handoff.summary_max_chars;

        let summary = self
            .compressor
            .compress(old, ceiling)
            .map_err(|err| Rejection::HandoffFailed {
                reason: format!("compression failed: {err:#}"),
            })?;
        let summary_chars = summary.chars().count();
        if summary_chars > ceiling {
            return Err(Rejection::HandoffFailed {
                reason: format!("summary has {summary_chars} chars, ceiling is {ceiling}"),
            }
            .into());
        }

        let mut card = Card::new(format!("{} (cont.)", old.title), old.priority, now);
        card.context = summary;
        card.role = old.role;
        card.estimated_units = old.estimated_units;
        card.dependencies.insert(old.id.clone());
        let new_outcomes = self
            .lifecycle
            .walk_to(
                &mut card,
                CardStatus::Active,
                &format!("handoff: continuation of {}", old.id),
                &self.tracker,
                now,
            )
            .map_err(|err| Rejection::HandoffFailed {
                reason: format!("continuation not admitted: {err}"),
            })?;

        card.assigned_worker = old.assigned_worker.take();
        let old_outcomes = match self.lifecycle.walk_to(
            old,
            CardStatus::Done,
            &format!("handoff: continued by {}", card.id),
            &self.tracker,
            now,
        ) {
            Ok(outcomes) => outcomes,
            Err(err) => {
                self.tracker.release(&card.id, &CardMetrics::default());
                return Err(Rejection::HandoffFailed {
                    reason: format!("retiring {} failed: {err}", old.id),
                }
                .into());
            }
        };
        old.continued_by = Some(card.id.clone());

        Ok(Continuation {
            card,
            summary_chars,
            old_outcomes,
            new_outcomes,
        })
    }
}
