//! Workflow rule engine.
//!
//! Rules are (event, condition, action) triples evaluated in registration
//! order after every transition. An action may only touch the card it is
//! given; anything that needs the board (starting or moving a card) is queued
//! as a [`Deferred`] command and run by the board once its locks are released.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::card::{Card, CardId, CardStatus, Priority};
use crate::core::types::AlertLevel;
use crate::io::delegation::DelegationPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardEvent {
    CardCreated,
    CardStarted,
    CardMoved,
    CardCompleted,
    CardFailed,
    CardBlocked,
    HandoffCompleted,
}

impl BoardEvent {
    /// Event fired after a transition into `to`.
    pub fn for_transition(to: CardStatus) -> Self {
        match to {
            CardStatus::Active => BoardEvent::CardStarted,
            CardStatus::Done => BoardEvent::CardCompleted,
            CardStatus::Failed => BoardEvent::CardFailed,
            CardStatus::Blocked => BoardEvent::CardBlocked,
            _ => BoardEvent::CardMoved,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BoardEvent::CardCreated => "card_created",
            BoardEvent::CardStarted => "card_started",
            BoardEvent::CardMoved => "card_moved",
            BoardEvent::CardCompleted => "card_completed",
            BoardEvent::CardFailed => "card_failed",
            BoardEvent::CardBlocked => "card_blocked",
            BoardEvent::HandoffCompleted => "handoff_completed",
        }
    }
}

impl fmt::Display for BoardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambient state a rule may look at.
pub struct RuleContext<'a> {
    pub now: DateTime<Utc>,
    pub alert_level: AlertLevel,
    pub delegation: &'a dyn DelegationPolicy,
}

/// Follow-up command queued by a rule action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    Start {
        card_id: CardId,
    },
    Move {
        card_id: CardId,
        to: CardStatus,
        reason: String,
    },
}

impl Deferred {
    pub fn card_id(&self) -> &CardId {
        match self {
            Deferred::Start { card_id } | Deferred::Move { card_id, .. } => card_id,
        }
    }
}

impl fmt::Display for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deferred::Start { card_id } => write!(f, "start {card_id}"),
            Deferred::Move { card_id, to, .. } => write!(f, "move {card_id} to {to}"),
        }
    }
}

type Condition = Box<dyn Fn(&Card, &RuleContext<'_>) -> bool + Send + Sync>;
type Action =
    Box<dyn Fn(&mut Card, &RuleContext<'_>, &mut Vec<Deferred>) -> Result<()> + Send + Sync>;

pub struct Rule {
    name: String,
    event: BoardEvent,
    condition: Condition,
    action: Action,
}

impl Rule {
    pub fn new<C, A>(name: impl Into<String>, event: BoardEvent, condition: C, action: A) -> Self
    where
        C: Fn(&Card, &RuleContext<'_>) -> bool + Send + Sync + 'static,
        A: Fn(&mut Card, &RuleContext<'_>, &mut Vec<Deferred>) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            event,
            condition: Box::new(condition),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event(&self) -> BoardEvent {
        self.event
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// What happened when an event was fired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleReport {
    /// Rules whose action ran to completion.
    pub applied: Vec<String>,
    /// Rules whose action failed; the error is also on the card as a warning.
    pub failed: Vec<String>,
    pub deferred: Vec<Deferred>,
}

impl RuleReport {
    pub fn merge(&mut self, other: RuleReport) {
        self.applied.extend(other.applied);
        self.failed.extend(other.failed);
        self.deferred.extend(other.deferred);
    }
}

#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_rules() -> Self {
        let mut engine = Self::new();
        for rule in default_rules() {
            engine.register(rule);
        }
        engine
    }

    pub fn register(&mut self, rule: Rule) {
        debug!(rule = rule.name(), event = %rule.event, "rule registered");
        self.rules.push(rule);
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Evaluate every rule registered for `event` against `card`.
    ///
    /// A failing action is recorded as a card warning and never stops the
    /// remaining rules.
    pub fn fire(&self, event: BoardEvent, card: &mut Card, ctx: &RuleContext<'_>) -> RuleReport {
        let mut report = RuleReport::default();
        for rule in self.rules.iter().filter(|rule| rule.event == event) {
            if !(rule.condition)(card, ctx) {
                continue;
            }
            let mut queued = Vec::new();
            match (rule.action)(card, ctx, &mut queued) {
                Ok(()) => {
                    debug!(rule = rule.name(), card_id = %card.id, %event, "rule applied");
                    report.applied.push(rule.name.clone());
                    report.deferred.extend(queued);
                }
                Err(err) => {
                    warn!(rule = rule.name(), card_id = %card.id, %event, error = %format!("{err:#}"), "rule failed");
                    card.warnings
                        .push(format!("rule '{}' failed: {err:#}", rule.name));
                    report.failed.push(rule.name.clone());
                }
            }
        }
        report
    }
}

/// Rules every board starts with.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "auto-assign-critical",
            BoardEvent::CardCreated,
            |card, _ctx| card.priority == Priority::Critical,
            |card, ctx, deferred| {
                let role = ctx.delegation.choose_worker_role(card);
                card.role = Some(role);
                deferred.push(Deferred::Start {
                    card_id: card.id.clone(),
                });
                Ok(())
            },
        ),
        Rule::new(
            "resource-pressure-warning",
            BoardEvent::CardStarted,
            |_card, ctx| ctx.alert_level.is_elevated(),
            |card, ctx, _deferred| {
                card.warnings.push(format!(
                    "started under resource pressure (alert level {})",
                    ctx.alert_level.as_str()
                ));
                Ok(())
            },
        ),
        Rule::new(
            "auto-advance-reviewed",
            BoardEvent::CardMoved,
            |card, _ctx| card.status == CardStatus::Review && card.metrics.error_count == 0,
            |card, _ctx, deferred| {
                deferred.push(Deferred::Move {
                    card_id: card.id.clone(),
                    to: CardStatus::Done,
                    reason: "review passed with zero errors".to_string(),
                });
                Ok(())
            },
        ),
    ]
}
