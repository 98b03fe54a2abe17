//! Deterministic scheduling order for cards.

use std::cmp::Ordering;

use crate::card::{Card, CardStatus};

/// Scheduling order: higher priority first, then older cards, then id.
pub fn schedule_order(a: &Card, b: &Card) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// True if the card is waiting to be started (not paused, not running, not finished).
pub fn is_startable(card: &Card) -> bool {
    !card.paused && matches!(card.status, CardStatus::Backlog | CardStatus::Todo)
}

/// Pick the next card to start, or `None` if nothing is waiting.
pub fn next_ready<'a, I>(cards: I) -> Option<&'a Card>
where
    I: IntoIterator<Item = &'a Card>,
{
    cards
        .into_iter()
        .filter(|card| is_startable(card))
        .min_by(|a, b| schedule_order(a, b))
}

/// Sort cards in place by scheduling order.
pub fn sort_for_schedule(cards: &mut [&Card]) {
    cards.sort_by(|a, b| schedule_order(a, b));
}
