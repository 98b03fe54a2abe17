//! Semantic invariants over a card and its history.

use crate::card::{Card, CardStatus};
use crate::core::transitions::can_transition;

/// Check the invariants every stored card must satisfy:
/// - History is a walk of the legal graph starting at `Backlog`
/// - The last history entry matches the current status
/// - A worker is assigned only while the card holds a slot
/// - A running card has `started_at`
///
/// Returns a list of stable error messages (empty on success).
pub fn validate_card(card: &Card) -> Vec<String> {
    let mut errors = validate_history(card);

    if card.assigned_worker.is_some() && !card.status.consumes_resources() {
        errors.push(format!(
            "{}: worker assigned while {}",
            card.id, card.status
        ));
    }

    if card.status.consumes_resources() && card.started_at.is_none() {
        errors.push(format!("{}: {} without started_at", card.id, card.status));
    }

    errors
}

/// Check that the recorded history is a valid walk ending in the current status.
pub fn validate_history(card: &Card) -> Vec<String> {
    let mut errors = Vec::new();
    let mut current = CardStatus::Backlog;

    for (index, record) in card.history.iter().enumerate() {
        if record.from != current {
            errors.push(format!(
                "{}: history[{}] starts at {} but card was {}",
                card.id, index, record.from, current
            ));
        }
        if !can_transition(record.from, record.to) {
            errors.push(format!(
                "{}: history[{}] {} -> {} is not a legal transition",
                card.id, index, record.from, record.to
            ));
        }
        current = record.to;
    }

    if current != card.status {
        errors.push(format!(
            "{}: status {} does not match history end {}",
            card.id, card.status, current
        ));
    }

    errors
}
