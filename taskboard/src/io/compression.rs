//! Context compression for graceful handoff.
//!
//! A continuation card starts from a bounded summary of its predecessor. The
//! summary always keeps title, status, metrics, error count and the worker
//! role; free-form context is truncated first when the ceiling is tight.

use anyhow::{Result, anyhow};
use minijinja::{Environment, context};
use tracing::debug;

use crate::card::{Card, CardMetrics};

const SUMMARY_TEMPLATE: &str = include_str!("templates/handoff_summary.md");
const TRUNCATION_MARKER: &str = "\n[context truncated]";

pub trait ContextCompressor: Send + Sync {
    /// Summarise `card` in at most `max_chars` characters.
    fn compress(&self, card: &Card, max_chars: usize) -> Result<String>;
}

/// Renders the summary through a minijinja template.
pub struct TemplateCompressor {
    env: Environment<'static>,
}

impl TemplateCompressor {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("handoff_summary", SUMMARY_TEMPLATE)
            .expect("handoff summary template should be valid");
        Self { env }
    }

    fn render(&self, card: &Card, context_text: &str) -> Result<String> {
        let template = self.env.get_template("handoff_summary")?;
        let rendered = template.render(context! {
            title => card.title.as_str(),
            source_id => card.id.as_str(),
            status => card.status.as_str(),
            role => card.role.map(|role| role.as_str()),
            metrics => MetricsView::from(&card.metrics),
            warnings => card.warnings.iter().map(String::as_str).collect::<Vec<_>>(),
            context => (!context_text.trim().is_empty()).then(|| context_text.trim()),
        })?;
        Ok(rendered)
    }
}

impl Default for TemplateCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextCompressor for TemplateCompressor {
    fn compress(&self, card: &Card, max_chars: usize) -> Result<String> {
        let full = self.render(card, &card.context)?;
        let full_len = full.chars().count();
        if full_len <= max_chars {
            return Ok(full);
        }

        let context_len = card.context.trim().chars().count();
        let overflow = full_len - max_chars;
        let keep = context_len.saturating_sub(overflow + TRUNCATION_MARKER.chars().count());
        if keep > 0 {
            let mut truncated: String = card.context.trim().chars().take(keep).collect();
            truncated.push_str(TRUNCATION_MARKER);
            let rendered = self.render(card, &truncated)?;
            if rendered.chars().count() <= max_chars {
                debug!(card_id = %card.id, kept = keep, dropped = context_len - keep, "context truncated");
                return Ok(rendered);
            }
        }

        let bare = self.render(card, "")?;
        if bare.chars().count() <= max_chars {
            debug!(card_id = %card.id, "context dropped from summary");
            return Ok(bare);
        }
        Err(anyhow!(
            "summary of {} needs {} chars, ceiling is {}",
            card.id,
            bare.chars().count(),
            max_chars
        ))
    }
}

#[derive(serde::Serialize)]
struct MetricsView {
    budget_units: u64,
    tool_calls: u64,
    error_count: u32,
    retry_count: u32,
    processing_ms: u64,
}

impl From<&CardMetrics> for MetricsView {
    fn from(metrics: &CardMetrics) -> Self {
        Self {
            budget_units: metrics.budget_units,
            tool_calls: metrics.tool_calls,
            error_count: metrics.error_count,
            retry_count: metrics.retry_count,
            processing_ms: metrics.processing_ms,
        }
    }
}
