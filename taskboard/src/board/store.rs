//! In-memory card store guarded by the board's card lock.

use std::collections::BTreeMap;

use crate::card::{Card, CardId, CardStatus};
use crate::core::selector::sort_for_schedule;

#[derive(Debug, Default, Clone)]
pub struct CardStore {
    cards: BTreeMap<CardId, Card>,
}

impl CardStore {
    pub fn from_cards(cards: impl IntoIterator<Item = Card>) -> Self {
        Self {
            cards: cards.into_iter().map(|card| (card.id.clone(), card)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn contains(&self, id: &CardId) -> bool {
        self.cards.contains_key(id)
    }

    pub fn get(&self, id: &CardId) -> Option<&Card> {
        self.cards.get(id)
    }

    pub fn get_mut(&mut self, id: &CardId) -> Option<&mut Card> {
        self.cards.get_mut(id)
    }

    pub fn insert(&mut self, card: Card) {
        self.cards.insert(card.id.clone(), card);
    }

    pub fn remove(&mut self, id: &CardId) -> Option<Card> {
        self.cards.remove(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &Card> {
        self.cards.values()
    }

    /// Cards in `status`, in scheduling order.
    pub fn by_status(&self, status: CardStatus) -> Vec<&Card> {
        let mut cards: Vec<&Card> = self
            .cards
            .values()
            .filter(|card| card.status == status)
            .collect();
        sort_for_schedule(&mut cards);
        cards
    }

    /// Ids of all cards in scheduling order.
    pub fn scheduled_ids(&self) -> Vec<CardId> {
        let mut cards: Vec<&Card> = self.cards.values().collect();
        sort_for_schedule(&mut cards);
        cards.into_iter().map(|card| card.id.clone()).collect()
    }

    /// Clone of every card, in id order.
    pub fn to_vec(&self) -> Vec<Card> {
        self.cards.values().cloned().collect()
    }
}
