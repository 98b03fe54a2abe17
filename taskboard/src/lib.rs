//! Bounded-concurrency task board.
//!
//! Cards move through a fixed lifecycle while a resource tracker keeps the
//! number of running cards, the consumed budget and the call rate under hard
//! limits. A reserve below each hard limit lets a running card hand its work
//! to a fresh continuation without ever crossing a ceiling.
//!
//! - **[`core`]**: Pure, deterministic logic (transition graph, alert levels,
//!   scheduling order, invariants). No I/O.
//! - **[`io`]**: Collaborator boundaries (workers, compression, delegation,
//!   snapshots) and config files. Isolated behind traits for tests.
//!
//! [`resources`], [`lifecycle`] and [`rules`] build on `core`; [`board`]
//! coordinates them with the collaborators.

pub mod board;
pub mod card;
pub mod clock;
pub mod core;
pub mod error;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod resources;
pub mod rules;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use board::{Board, Collaborators, HandoffOutcome, UsageOutcome, UsageReport};
pub use card::{Card, CardId, CardStatus, NewCard, Priority, WorkerId};
pub use error::{BoardError, BoardResult, Rejection};
pub use io::config::BoardConfig;
