//! Typed failures returned by board operations.

use thiserror::Error;

use crate::card::{CardId, CardStatus};
use crate::lifecycle::TransitionError;

/// A request the board declined. The board is unchanged and the caller may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("card {0} not found")]
    CardNotFound(CardId),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: CardStatus, to: CardStatus },
    #[error("admission denied: {reason}")]
    AdmissionDenied { reason: String },
    #[error("allocation refused: {reason}")]
    AllocationRefused { reason: String },
    #[error("handoff unavailable: {reason}")]
    HandoffUnavailable { reason: String },
    #[error("handoff failed: {reason}")]
    HandoffFailed { reason: String },
    #[error("worker error: {reason}")]
    Worker { reason: String },
    #[error("card {0} is paused")]
    Paused(CardId),
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// Durable state could not be written or read. Not recoverable by retrying the operation.
    #[error("persistence failure: {message}")]
    Persistence { message: String },
}

impl BoardError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BoardError::Persistence { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            BoardError::Rejected(rejection) => Some(rejection),
            BoardError::Persistence { .. } => None,
        }
    }

    pub(crate) fn persistence(err: &anyhow::Error) -> Self {
        BoardError::Persistence {
            message: format!("{err:#}"),
        }
    }
}

impl From<TransitionError> for Rejection {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::Invalid { from, to } => Rejection::InvalidTransition { from, to },
            TransitionError::AllocationRefused { reason, .. } => {
                Rejection::AllocationRefused { reason }
            }
        }
    }
}

impl From<TransitionError> for BoardError {
    fn from(err: TransitionError) -> Self {
        BoardError::Rejected(err.into())
    }
}

pub type BoardResult<T> = Result<T, BoardError>;
