//! Alert-level classification from usage ratios.

use serde::{Deserialize, Serialize};

use crate::core::types::{AlertLevel, ResourceRatio};

/// Fractions of the effective limit at which each level begins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub yellow: f64,
    pub orange: f64,
    pub red: f64,
    pub critical: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            yellow: 0.60,
            orange: 0.75,
            red: 0.85,
            critical: 0.95,
        }
    }
}

impl AlertThresholds {
    pub fn validate(&self) -> Result<(), String> {
        let ordered = [self.yellow, self.orange, self.red, self.critical];
        if ordered.iter().any(|value| !(*value > 0.0 && *value <= 1.0)) {
            return Err("alert thresholds must be within (0, 1]".to_string());
        }
        if !ordered.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err("alert thresholds must be strictly increasing".to_string());
        }
        Ok(())
    }

    pub fn level_for(&self, ratio: f64) -> AlertLevel {
        if ratio >= self.critical {
            AlertLevel::Critical
        } else if ratio >= self.red {
            AlertLevel::Red
        } else if ratio >= self.orange {
            AlertLevel::Orange
        } else if ratio >= self.yellow {
            AlertLevel::Yellow
        } else {
            AlertLevel::Green
        }
    }
}

/// The highest ratio across all resources decides the level.
pub fn compute_alert_level(ratios: &[ResourceRatio], thresholds: &AlertThresholds) -> AlertLevel {
    let peak = ratios
        .iter()
        .map(|entry| entry.ratio)
        .fold(0.0_f64, f64::max);
    thresholds.level_for(peak)
}

/// The resource with the highest ratio, if any.
pub fn peak_resource(ratios: &[ResourceRatio]) -> Option<ResourceRatio> {
    ratios
        .iter()
        .copied()
        .max_by(|a, b| a.ratio.total_cmp(&b.ratio))
}
