//! Delegation policy boundary: which worker role handles a card.

use crate::card::Card;
use crate::io::workers::WorkerRole;

pub trait DelegationPolicy: Send + Sync {
    fn choose_worker_role(&self, card: &Card) -> WorkerRole;
}

/// Always picks the same role. Used when no scoring policy is plugged in.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedRolePolicy(pub WorkerRole);

impl DelegationPolicy for FixedRolePolicy {
    fn choose_worker_role(&self, _card: &Card) -> WorkerRole {
        self.0
    }
}
