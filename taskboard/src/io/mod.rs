//! Collaborator boundaries and file-backed I/O.

pub mod compression;
pub mod config;
pub mod delegation;
pub mod snapshot;
pub mod workers;
