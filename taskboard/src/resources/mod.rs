//! Resource accounting: limits, the call-rate window and the tracker.

pub mod limits;
pub mod tracker;
pub mod window;
