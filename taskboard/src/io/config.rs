//! Board configuration stored as TOML (`board.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::resources::limits::ResourceLimits;

/// Board configuration (TOML).
///
/// Meant to be edited by humans. Missing sections and fields fall back to
/// the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BoardConfig {
    pub limits: ResourceLimits,
    pub lifecycle: LifecycleConfig,
    pub handoff: HandoffConfig,
    pub rules: RulesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// A card whose error count goes above this is failed automatically.
    pub max_error_count: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self { max_error_count: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HandoffConfig {
    /// Ceiling on the compressed summary handed to a continuation card.
    pub summary_max_chars: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RulesConfig {
    /// Follow-up commands queued by rules that one operation will drain.
    pub max_deferred_actions: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_deferred_actions: 32,
        }
    }
}

impl BoardConfig {
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.handoff.summary_max_chars == 0 {
            return Err(anyhow!("handoff.summary_max_chars must be > 0"));
        }
        if self.rules.max_deferred_actions == 0 {
            return Err(anyhow!("rules.max_deferred_actions must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `BoardConfig::default()`.
pub fn load_config(path: &Path) -> Result<BoardConfig> {
    if !path.exists() {
        let cfg = BoardConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: BoardConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &BoardConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
