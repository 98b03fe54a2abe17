//! Hard limits, handoff reserves and the effective limits derived from them.

use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::alert::AlertThresholds;

/// Immutable resource configuration for one orchestration session.
///
/// Every hard limit has a matching reserve. `hard - reserve` is the effective
/// limit used for ordinary admission; the gap is held back so a graceful
/// handoff can always run without touching the hard ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Hard ceiling on cards in Active/Integrate.
    pub max_active: u32,
    /// Slots held back for handoff. May be fractional (e.g. 0.5 of a slot).
    pub active_reserve: f64,
    /// Hard ceiling on consumed compute units for the session.
    pub max_budget_units: u64,
    /// Units held back for handoff.
    pub budget_reserve: u64,
    /// Rate-limited calls allowed per window.
    pub max_calls_per_window: u32,
    pub rate_window_secs: u64,
    /// Longest a single card may run before it is considered timed out.
    pub max_card_processing_secs: u64,
    pub max_session_secs: u64,
    pub thresholds: AlertThresholds,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_active: 10,
            active_reserve: 1.0,
            max_budget_units: 200_000,
            budget_reserve: 30_000,
            max_calls_per_window: 50,
            rate_window_secs: 60,
            max_card_processing_secs: 600,
            max_session_secs: 8 * 60 * 60,
            thresholds: AlertThresholds::default(),
        }
    }
}

impl ResourceLimits {
    pub fn effective_active(&self) -> f64 {
        f64::from(self.max_active) - self.active_reserve
    }

    pub fn effective_budget(&self) -> f64 {
        self.max_budget_units.saturating_sub(self.budget_reserve) as f64
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn max_card_processing(&self) -> Duration {
        Duration::from_secs(self.max_card_processing_secs)
    }

    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(anyhow!("limits.max_active must be > 0"));
        }
        if !(self.active_reserve >= 0.0 && self.active_reserve < f64::from(self.max_active)) {
            return Err(anyhow!(
                "limits.active_reserve must be within [0, max_active)"
            ));
        }
        if self.max_budget_units == 0 {
            return Err(anyhow!("limits.max_budget_units must be > 0"));
        }
        if self.budget_reserve >= self.max_budget_units {
            return Err(anyhow!("limits.budget_reserve must be < max_budget_units"));
        }
        if self.max_calls_per_window == 0 {
            return Err(anyhow!("limits.max_calls_per_window must be > 0"));
        }
        if self.rate_window_secs == 0 {
            return Err(anyhow!("limits.rate_window_secs must be > 0"));
        }
        if self.max_card_processing_secs == 0 {
            return Err(anyhow!("limits.max_card_processing_secs must be > 0"));
        }
        if self.max_session_secs == 0 {
            return Err(anyhow!("limits.max_session_secs must be > 0"));
        }
        self.thresholds
            .validate()
            .map_err(|err| anyhow!("limits.thresholds: {err}"))
    }
}
