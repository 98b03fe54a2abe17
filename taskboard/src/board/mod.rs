//! Board coordinator.
//!
//! The [`Board`] owns the card store, the resource tracker, the lifecycle
//! policy and the rule engine, and talks to the excluded collaborators
//! (workers, compression, persistence, delegation) through traits.
//!
//! Locking: the card store lock is always taken before the tracker's own
//! lock (every tracker call happens while the card lock is held or with no
//! lock at all). Rules run under the card lock; follow-up commands they
//! queue run after it is released.

mod handoff;
mod store;
mod sweep;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::card::{Card, CardId, CardMetrics, CardStatus, NewCard};
use crate::clock::{Clock, SystemClock};
use crate::core::budget::exceeded;
use crate::core::invariants::validate_card;
use crate::core::selector::next_ready;
use crate::core::types::HandoffTrigger;
use crate::error::{BoardError, BoardResult, Rejection};
use crate::io::compression::{ContextCompressor, TemplateCompressor};
use crate::io::config::BoardConfig;
use crate::io::delegation::{DelegationPolicy, FixedRolePolicy};
use crate::io::snapshot::{BoardSnapshot, SNAPSHOT_VERSION, SnapshotStore};
use crate::io::workers::WorkerManager;
use crate::lifecycle::{CardLifecycle, TransitionOutcome};
use crate::resources::tracker::{ResourceStatus, ResourceTracker};
use crate::rules::{BoardEvent, Deferred, RuleContext, RuleEngine, RuleReport};

pub use handoff::HandoffOutcome;
pub use store::CardStore;

/// External collaborators the board depends on.
pub struct Collaborators {
    pub workers: Arc<dyn WorkerManager>,
    pub store: Arc<dyn SnapshotStore>,
    pub compressor: Arc<dyn ContextCompressor>,
    pub delegation: Arc<dyn DelegationPolicy>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Workers and persistence are required; the rest fall back to the
    /// template compressor, a fixed implementer role and the system clock.
    pub fn new(workers: Arc<dyn WorkerManager>, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            workers,
            store,
            compressor: Arc::new(TemplateCompressor::new()),
            delegation: Arc::new(FixedRolePolicy::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn ContextCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_delegation(mut self, delegation: Arc<dyn DelegationPolicy>) -> Self {
        self.delegation = delegation;
        self
    }
}

/// Consumption reported by a running card.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub units: u64,
    pub tool_calls: u64,
    pub errors: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageOutcome {
    pub card: Card,
    pub accepted_calls: u64,
    /// Calls refused by the rate window. Not counted on the card.
    pub rejected_calls: u64,
    pub handoff: HandoffTrigger,
}

pub struct Board {
    config: BoardConfig,
    cards: Mutex<CardStore>,
    tracker: ResourceTracker,
    lifecycle: CardLifecycle,
    rules: RuleEngine,
    workers: Arc<dyn WorkerManager>,
    store: Arc<dyn SnapshotStore>,
    compressor: Arc<dyn ContextCompressor>,
    delegation: Arc<dyn DelegationPolicy>,
    clock: Arc<dyn Clock>,
}

impl Board {
    /// Open a board with the default rules, resuming from the last snapshot if there is one.
    pub fn open(config: BoardConfig, collaborators: Collaborators) -> Result<Self> {
        Self::open_with_rules(config, collaborators, RuleEngine::with_default_rules())
    }

    pub fn open_with_rules(
        config: BoardConfig,
        collaborators: Collaborators,
        rules: RuleEngine,
    ) -> Result<Self> {
        config.validate().context("invalid board config")?;
        let Collaborators {
            workers,
            store,
            compressor,
            delegation,
            clock,
        } = collaborators;

        let snapshot = store.load_snapshot().context("load board snapshot")?;
        let (cards, tracker) = match snapshot {
            Some(snapshot) => {
                info!(
                    cards = snapshot.cards.len(),
                    saved_at = %snapshot.saved_at,
                    "resuming board from snapshot"
                );
                for card in &snapshot.cards {
                    for problem in validate_card(card) {
                        warn!(problem = %problem, "snapshot card violates invariants");
                    }
                }
                (
                    CardStore::from_cards(snapshot.cards),
                    ResourceTracker::with_usage(config.limits.clone(), clock.clone(), snapshot.usage),
                )
            }
            None => {
                info!("no snapshot found, starting empty board");
                (
                    CardStore::default(),
                    ResourceTracker::new(config.limits.clone(), clock.clone()),
                )
            }
        };

        let lifecycle = CardLifecycle::new(
            config.lifecycle.max_error_count,
            config.limits.max_card_processing(),
        );
        Ok(Self {
            config,
            cards: Mutex::new(cards),
            tracker,
            lifecycle,
            rules,
            workers,
            store,
            compressor,
            delegation,
            clock,
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    #[instrument(skip_all, fields(title = %new.title))]
    pub fn create_card(&self, new: NewCard) -> BoardResult<Card> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            if let Some(missing) = new.dependencies.iter().find(|dep| !cards.contains(dep)) {
                return Err(Rejection::CardNotFound(missing.clone()).into());
            }
            let availability = self.tracker.check_availability(new.estimated_units);
            if !availability.ok {
                let reason = availability
                    .reason
                    .unwrap_or_else(|| "hard limit reached".to_string());
                info!(reason = %reason, "card creation denied");
                return Err(Rejection::AdmissionDenied { reason }.into());
            }
            let mut card = Card::new(new.title, new.priority, self.clock.now());
            card.warnings.extend(
                availability
                    .warnings
                    .into_iter()
                    .map(|warning| format!("created under pressure: {warning}")),
            );
            card.context = new.context;
            card.estimated_units = new.estimated_units;
            card.dependencies = new.dependencies.into_iter().collect();
            card.role = new.role;

            let report = self
                .rules
                .fire(BoardEvent::CardCreated, &mut card, &self.rule_context());
            info!(card_id = %card.id, priority = ?card.priority, "card created");
            cards.insert(card.clone());
            self.persist(&cards)?;
            (card, report.deferred)
        };
        self.finish(card, deferred)
    }

    /// Walk a Backlog/Todo card into Active and give it a worker.
    ///
    /// Ordinary starts are refused inside the handoff buffer zone.
    #[instrument(skip_all, fields(card_id = %id))]
    pub fn start_card(&self, id: &CardId) -> BoardResult<Card> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let result = self.start_in(&mut cards, id, "started")?;
            self.persist(&cards)?;
            result
        };
        self.finish(card, deferred)
    }

    /// Move a running card to Blocked and ask its worker to stop.
    #[instrument(skip_all, fields(card_id = %id))]
    pub fn pause_card(&self, id: &CardId) -> BoardResult<Card> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let card = find_mut(&mut cards, id)?;
            if !card.status.consumes_resources() {
                return Err(Rejection::InvalidTransition {
                    from: card.status,
                    to: CardStatus::Blocked,
                }
                .into());
            }
            let outcome = self.lifecycle.transition(
                card,
                CardStatus::Blocked,
                "paused",
                &self.tracker,
                self.clock.now(),
            )?;
            card.paused = true;
            let outcomes = [outcome];
            self.retire_workers(card, &outcomes, "paused");
            let report = self.fire_transitions(card, &outcomes);
            let card = card.clone();
            self.persist(&cards)?;
            (card, report.deferred)
        };
        self.finish(card, deferred)
    }

    /// Bring a Blocked card back to Active after a fresh admission check.
    #[instrument(skip_all, fields(card_id = %id))]
    pub fn resume_card(&self, id: &CardId) -> BoardResult<Card> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let card = find_mut(&mut cards, id)?;
            if card.status != CardStatus::Blocked {
                return Err(Rejection::InvalidTransition {
                    from: card.status,
                    to: CardStatus::Active,
                }
                .into());
            }
            let outcomes = self.enter_active(card, "resumed", false, false)?;
            let report = self.fire_transitions(card, &outcomes);
            let card = card.clone();
            self.persist(&cards)?;
            (card, report.deferred)
        };
        self.finish(card, deferred)
    }

    /// Apply one edge of the graph. `force` admits into the buffer zone and
    /// moves paused cards; it never bypasses the graph or a hard limit.
    #[instrument(skip_all, fields(card_id = %id, to = %target, force = force))]
    pub fn move_card(&self, id: &CardId, target: CardStatus, force: bool) -> BoardResult<Card> {
        let reason = if force { "moved (forced)" } else { "moved" };
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let result = self.move_in(&mut cards, id, target, reason, force)?;
            self.persist(&cards)?;
            result
        };
        self.finish(card, deferred)
    }

    /// Walk a running or reviewed card through Review to Done.
    #[instrument(skip_all, fields(card_id = %id))]
    pub fn complete_card(&self, id: &CardId) -> BoardResult<Card> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let card = find_mut(&mut cards, id)?;
            if !matches!(
                card.status,
                CardStatus::Active | CardStatus::Integrate | CardStatus::Review
            ) {
                return Err(Rejection::InvalidTransition {
                    from: card.status,
                    to: CardStatus::Done,
                }
                .into());
            }
            let outcomes = self.lifecycle.walk_to(
                card,
                CardStatus::Done,
                "completed",
                &self.tracker,
                self.clock.now(),
            )?;
            self.retire_workers(card, &outcomes, "completed");
            let report = self.fire_transitions(card, &outcomes);
            let card = card.clone();
            self.persist(&cards)?;
            (card, report.deferred)
        };
        self.finish(card, deferred)
    }

    #[instrument(skip_all, fields(card_id = %id))]
    pub fn fail_card(&self, id: &CardId, reason: &str) -> BoardResult<Card> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let card = find_mut(&mut cards, id)?;
            let outcome = self.lifecycle.transition(
                card,
                CardStatus::Failed,
                reason,
                &self.tracker,
                self.clock.now(),
            )?;
            let outcomes = [outcome];
            self.retire_workers(card, &outcomes, reason);
            let report = self.fire_transitions(card, &outcomes);
            let card = card.clone();
            self.persist(&cards)?;
            (card, report.deferred)
        };
        self.finish(card, deferred)
    }

    /// Record consumption by a running card.
    ///
    /// Budget that would cross the hard limit is refused as a whole. Tool
    /// calls pass through the rate window one by one; calls past the
    /// ceiling are reported back and not counted.
    #[instrument(skip_all, fields(card_id = %id, units = report.units))]
    pub fn record_usage(&self, id: &CardId, report: UsageReport) -> BoardResult<UsageOutcome> {
        let mut cards = self.cards.lock();
        let card = find_mut(&mut cards, id)?;
        if !card.status.consumes_resources() {
            return Err(Rejection::AllocationRefused {
                reason: format!("card is {}, usage needs a running card", card.status),
            }
            .into());
        }
        if report.units > 0 && !self.tracker.record_usage(&card.id, report.units) {
            return Err(Rejection::AllocationRefused {
                reason: format!(
                    "{} units would cross the hard budget of {}",
                    report.units, self.config.limits.max_budget_units
                ),
            }
            .into());
        }

        let mut accepted_calls = 0;
        while accepted_calls < report.tool_calls && self.tracker.track_rate_limited_call() {
            accepted_calls += 1;
        }
        let rejected_calls = report.tool_calls - accepted_calls;

        card.metrics.budget_units = card.metrics.budget_units.saturating_add(report.units);
        card.metrics.tool_calls = card.metrics.tool_calls.saturating_add(accepted_calls);
        card.metrics.error_count = card.metrics.error_count.saturating_add(report.errors);
        if rejected_calls > 0 {
            card.warnings
                .push(format!("{rejected_calls} tool calls rejected by the rate limit"));
        }
        let handoff = self.tracker.check_handoff_trigger(&card.id);
        debug!(
            budget = card.metrics.budget_units,
            errors = card.metrics.error_count,
            rejected_calls,
            handoff = handoff.should_handoff,
            "usage recorded"
        );
        let card = card.clone();
        self.persist(&cards)?;
        Ok(UsageOutcome {
            card,
            accepted_calls,
            rejected_calls,
            handoff,
        })
    }

    pub fn check_graceful_handoff(&self, id: &CardId) -> BoardResult<HandoffTrigger> {
        let cards = self.cards.lock();
        if !cards.contains(id) {
            return Err(Rejection::CardNotFound(id.clone()).into());
        }
        Ok(self.tracker.check_handoff_trigger(id))
    }

    pub fn get_card(&self, id: &CardId) -> Option<Card> {
        self.cards.lock().get(id).cloned()
    }

    /// Cards in `status`, in scheduling order.
    pub fn get_cards_by_status(&self, status: CardStatus) -> Vec<Card> {
        self.cards
            .lock()
            .by_status(status)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn get_resource_status(&self) -> ResourceStatus {
        self.tracker.status()
    }

    /// Next card a scheduler should start, if any.
    pub fn next_card(&self) -> Option<Card> {
        next_ready(self.cards.lock().values()).cloned()
    }

    /// Start the next card in scheduling order. `Ok(None)` when nothing waits.
    #[instrument(skip_all)]
    pub fn start_next(&self) -> BoardResult<Option<Card>> {
        let (card, deferred) = {
            let mut cards = self.cards.lock();
            let Some(id) = next_ready(cards.values()).map(|card| card.id.clone()) else {
                return Ok(None);
            };
            let result = self.start_in(&mut cards, &id, "started by scheduler")?;
            self.persist(&cards)?;
            result
        };
        self.finish(card, deferred).map(Some)
    }

    /// Drop finished cards completed more than `retention` ago.
    #[instrument(skip_all, fields(retention_secs = retention.as_secs()))]
    pub fn cleanup(&self, retention: Duration) -> BoardResult<Vec<CardId>> {
        let mut cards = self.cards.lock();
        let now = self.clock.now();
        let expired: Vec<CardId> = cards
            .values()
            .filter(|card| card.status.is_finished())
            .filter(|card| {
                card.completed_at
                    .is_some_and(|completed| exceeded(completed, now, retention))
            })
            .map(|card| card.id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }
        for id in &expired {
            cards.remove(id);
        }
        info!(removed = expired.len(), remaining = cards.len(), "finished cards cleaned up");
        self.persist(&cards)?;
        Ok(expired)
    }

    pub fn force_emergency_mode(&self, reason: &str) -> BoardResult<()> {
        let cards = self.cards.lock();
        self.tracker.force_emergency_mode(reason);
        self.persist(&cards)
    }

    pub fn reset_emergency_mode(&self) -> BoardResult<()> {
        let cards = self.cards.lock();
        self.tracker
            .reset_emergency_mode()
            .map_err(|reason| Rejection::AdmissionDenied { reason })?;
        self.persist(&cards)
    }

    /// Start a new budget period. See [`ResourceTracker::reset_usage`].
    pub fn reset_usage(&self) -> BoardResult<()> {
        let cards = self.cards.lock();
        self.tracker.reset_usage();
        self.persist(&cards)
    }

    fn start_in(
        &self,
        cards: &mut CardStore,
        id: &CardId,
        reason: &str,
    ) -> BoardResult<(Card, Vec<Deferred>)> {
        let card = find_mut(cards, id)?;
        if !matches!(card.status, CardStatus::Backlog | CardStatus::Todo) {
            return Err(Rejection::InvalidTransition {
                from: card.status,
                to: CardStatus::Active,
            }
            .into());
        }
        let outcomes = self.enter_active(card, reason, false, true)?;
        let report = self.fire_transitions(card, &outcomes);
        Ok((card.clone(), report.deferred))
    }

    fn move_in(
        &self,
        cards: &mut CardStore,
        id: &CardId,
        target: CardStatus,
        reason: &str,
        force: bool,
    ) -> BoardResult<(Card, Vec<Deferred>)> {
        let card = find_mut(cards, id)?;
        if card.paused && !force {
            return Err(Rejection::Paused(id.clone()).into());
        }
        if !self.lifecycle.can_transition(card.status, target) {
            return Err(Rejection::InvalidTransition {
                from: card.status,
                to: target,
            }
            .into());
        }
        let outcomes = if target.consumes_resources() && !card.status.consumes_resources() {
            self.enter_active(card, reason, force, false)?
        } else {
            vec![self.lifecycle.transition(
                card,
                target,
                reason,
                &self.tracker,
                self.clock.now(),
            )?]
        };
        self.retire_workers(card, &outcomes, reason);
        let report = self.fire_transitions(card, &outcomes);
        Ok((card.clone(), report.deferred))
    }

    /// Admission check, transition into Active and worker creation.
    ///
    /// Any failure leaves the card and its slot as they were.
    fn enter_active(
        &self,
        card: &mut Card,
        reason: &str,
        force: bool,
        walk: bool,
    ) -> BoardResult<Vec<TransitionOutcome>> {
        let availability = self.tracker.check_availability(card.estimated_units);
        if !availability.ok {
            let reason = availability
                .reason
                .unwrap_or_else(|| "hard limit reached".to_string());
            info!(card_id = %card.id, reason = %reason, "admission denied");
            return Err(Rejection::AdmissionDenied { reason }.into());
        }
        if availability.in_buffer_zone() && !force {
            let reason = format!("effective limit reached: {}", availability.warnings.join("; "));
            info!(card_id = %card.id, reason = %reason, "admission deferred");
            return Err(Rejection::AdmissionDenied { reason }.into());
        }

        let before = card.clone();
        let now = self.clock.now();
        let outcomes = if walk {
            self.lifecycle
                .walk_to(card, CardStatus::Active, reason, &self.tracker, now)?
        } else {
            vec![self
                .lifecycle
                .transition(card, CardStatus::Active, reason, &self.tracker, now)?]
        };

        let role = card
            .role
            .unwrap_or_else(|| self.delegation.choose_worker_role(card));
        match self.workers.create_worker(role, card) {
            Ok(worker) => {
                debug!(card_id = %card.id, worker = %worker, role = %role, "worker assigned");
                card.assigned_worker = Some(worker);
                card.role = Some(role);
            }
            Err(err) => {
                warn!(card_id = %card.id, error = %format!("{err:#}"), "worker creation failed");
                *card = before;
                self.tracker.release(&card.id, &CardMetrics::default());
                return Err(Rejection::Worker {
                    reason: format!("{err:#}"),
                }
                .into());
            }
        }

        if availability.in_buffer_zone() {
            card.warnings.extend(
                availability
                    .warnings
                    .iter()
                    .map(|warning| format!("forced admission: {warning}")),
            );
        }
        Ok(outcomes)
    }

    fn rule_context(&self) -> RuleContext<'_> {
        RuleContext {
            now: self.clock.now(),
            alert_level: self.tracker.compute_alert_level(),
            delegation: self.delegation.as_ref(),
        }
    }

    fn fire_transitions(&self, card: &mut Card, outcomes: &[TransitionOutcome]) -> RuleReport {
        let ctx = self.rule_context();
        let mut report = RuleReport::default();
        for outcome in outcomes {
            let event = BoardEvent::for_transition(outcome.record.to);
            report.merge(self.rules.fire(event, card, &ctx));
        }
        report
    }

    /// Ask workers detached by `outcomes` to stop. Failures become card warnings.
    fn retire_workers(&self, card: &mut Card, outcomes: &[TransitionOutcome], reason: &str) {
        for worker in outcomes
            .iter()
            .filter_map(|outcome| outcome.released_worker.as_ref())
        {
            if let Err(err) = self.workers.terminate_worker(worker, reason) {
                warn!(card_id = %card.id, worker = %worker, error = %format!("{err:#}"), "terminate failed");
                card.warnings
                    .push(format!("terminating worker {worker} failed: {err:#}"));
            }
        }
    }

    /// Run follow-up commands queued by rules, breadth first, up to the configured cap.
    fn drain(&self, deferred: Vec<Deferred>) -> BoardResult<()> {
        let cap = self.config.rules.max_deferred_actions;
        let mut queue: VecDeque<Deferred> = deferred.into();
        let mut executed = 0;

        while let Some(command) = queue.pop_front() {
            let mut cards = self.cards.lock();
            if executed == cap {
                warn!(dropped = queue.len() + 1, cap, "deferred actions dropped");
                for dropped in std::iter::once(command).chain(queue.drain(..)) {
                    if let Some(card) = cards.get_mut(dropped.card_id()) {
                        card.warnings
                            .push(format!("deferred '{dropped}' dropped: cap of {cap} reached"));
                    }
                }
                self.persist(&cards)?;
                break;
            }
            executed += 1;

            let already_there = cards.get(command.card_id()).is_some_and(|card| match &command {
                Deferred::Start { .. } => card.status.consumes_resources(),
                Deferred::Move { to, .. } => card.status == *to,
            });
            if already_there {
                debug!(command = %command, "deferred action already satisfied");
                continue;
            }

            let result = match &command {
                Deferred::Start { card_id } => {
                    self.start_in(&mut cards, card_id, "started by rule")
                }
                Deferred::Move {
                    card_id,
                    to,
                    reason,
                } => self.move_in(&mut cards, card_id, *to, reason, false),
            };
            match result {
                Ok((_, more)) => queue.extend(more),
                Err(BoardError::Rejected(rejection)) => {
                    info!(command = %command, reason = %rejection, "deferred action rejected");
                    if let Some(card) = cards.get_mut(command.card_id()) {
                        card.warnings
                            .push(format!("deferred '{command}' failed: {rejection}"));
                    }
                }
                Err(fatal) => return Err(fatal),
            }
            self.persist(&cards)?;
        }
        Ok(())
    }

    /// Drain follow-ups, then return the card as it stands afterwards.
    fn finish(&self, card: Card, deferred: Vec<Deferred>) -> BoardResult<Card> {
        self.drain(deferred)?;
        Ok(self.get_card(&card.id).unwrap_or(card))
    }

    fn persist(&self, cards: &CardStore) -> BoardResult<()> {
        let snapshot = BoardSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: self.clock.now(),
            cards: cards.to_vec(),
            usage: self.tracker.usage_snapshot(),
        };
        self.store.save_snapshot(&snapshot).map_err(|err| {
            tracing::error!(error = %format!("{err:#}"), "snapshot save failed");
            BoardError::persistence(&err)
        })
    }
}

fn find_mut<'a>(cards: &'a mut CardStore, id: &CardId) -> BoardResult<&'a mut Card> {
    cards
        .get_mut(id)
        .ok_or_else(|| Rejection::CardNotFound(id.clone()).into())
}
