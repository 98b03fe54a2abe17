//! Deterministic, pure logic shared by the board.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod alert;
pub mod budget;
pub mod invariants;
pub mod selector;
pub mod transitions;
pub mod types;
