//! Sliding window of rate-limited call timestamps.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::budget::elapsed;

/// Timestamps of accepted calls, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallWindow {
    calls: VecDeque<DateTime<Utc>>,
}

impl CallWindow {
    /// Drop entries that fell out of the window.
    pub fn evict(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(oldest) = self.calls.front() {
            if elapsed(*oldest, now) >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count calls inside the window without mutating it.
    pub fn count_within(&self, now: DateTime<Utc>, window: Duration) -> usize {
        self.calls
            .iter()
            .filter(|at| elapsed(**at, now) < window)
            .count()
    }

    /// Record a call if the window has room for it.
    ///
    /// A rejected call is not kept, so rejections do not extend the lockout.
    pub fn try_record(&mut self, now: DateTime<Utc>, window: Duration, ceiling: u32) -> bool {
        self.evict(now, window);
        self.calls.push_back(now);
        if self.calls.len() > ceiling as usize {
            self.calls.pop_back();
            return false;
        }
        true
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
