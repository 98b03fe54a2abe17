//! Resource tracker: active slots, consumable budget, call rate and the
//! graceful-handoff reservation.
//!
//! All state lives behind one mutex. Every operation takes the lock once,
//! does O(window) work at most and returns immediately; backpressure is a
//! `false`/`ok=false` result, never a blocked caller.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::card::{CardId, CardMetrics};
use crate::clock::Clock;
use crate::core::alert::{compute_alert_level, peak_resource};
use crate::core::budget::{elapsed, elapsed_ratio};
use crate::core::types::{
    AlertLevel, Availability, HandoffTrigger, ResourceKind, ResourceRatio, Violation,
    ViolationKind,
};
use crate::resources::limits::ResourceLimits;
use crate::resources::window::CallWindow;

const MAX_VIOLATIONS: usize = 100;

/// A slot held by a running card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocated_at: DateTime<Utc>,
    /// Units reported by the card since allocation, not yet committed.
    pub in_flight_units: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Mutable usage counters for one session. Persisted as part of the board snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub session_started_at: DateTime<Utc>,
    pub allocations: BTreeMap<CardId, Allocation>,
    pub budget_consumed: u64,
    pub calls: CallWindow,
    pub handoff_in_flight: bool,
    pub handoff_cards: BTreeSet<CardId>,
    pub emergency: Option<EmergencyState>,
    pub violations: VecDeque<Violation>,
}

impl ResourceUsage {
    pub fn started_at(now: DateTime<Utc>) -> Self {
        Self {
            session_started_at: now,
            ..Self::default()
        }
    }

    pub fn active_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn in_flight_units(&self) -> u64 {
        self.allocations
            .values()
            .map(|allocation| allocation.in_flight_units)
            .sum()
    }

    fn committed_and_in_flight(&self) -> u64 {
        self.budget_consumed.saturating_add(self.in_flight_units())
    }
}

/// Point-in-time view of the tracker for read-only consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatus {
    pub active_count: usize,
    pub max_active: u32,
    pub effective_active: f64,
    pub budget_consumed: u64,
    pub budget_in_flight: u64,
    pub max_budget_units: u64,
    pub effective_budget: f64,
    pub calls_in_window: usize,
    pub max_calls_per_window: u32,
    pub ratios: Vec<ResourceRatio>,
    pub alert_level: AlertLevel,
    pub emergency: Option<EmergencyState>,
    pub handoff_in_flight: bool,
    pub handoff_cards: Vec<CardId>,
    pub recent_violations: Vec<Violation>,
}

pub struct ResourceTracker {
    limits: ResourceLimits,
    clock: Arc<dyn Clock>,
    usage: Mutex<ResourceUsage>,
}

impl ResourceTracker {
    pub fn new(limits: ResourceLimits, clock: Arc<dyn Clock>) -> Self {
        let usage = ResourceUsage::started_at(clock.now());
        Self::with_usage(limits, clock, usage)
    }

    /// Rebuild a tracker from persisted usage.
    pub fn with_usage(limits: ResourceLimits, clock: Arc<dyn Clock>, usage: ResourceUsage) -> Self {
        Self {
            limits,
            clock,
            usage: Mutex::new(usage),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn active_count(&self) -> usize {
        self.usage.lock().active_count()
    }

    pub fn budget_consumed(&self) -> u64 {
        self.usage.lock().budget_consumed
    }

    pub fn is_allocated(&self, card_id: &CardId) -> bool {
        self.usage.lock().allocations.contains_key(card_id)
    }

    /// Units `card_id` reported since it took its slot (zero without a slot).
    pub fn in_flight_units(&self, card_id: &CardId) -> u64 {
        self.usage
            .lock()
            .allocations
            .get(card_id)
            .map_or(0, |allocation| allocation.in_flight_units)
    }

    pub fn handoff_in_flight(&self) -> bool {
        self.usage.lock().handoff_in_flight
    }

    pub fn is_emergency(&self) -> bool {
        self.usage.lock().emergency.is_some()
    }

    /// Project the usage of one more running card costing `estimated_units`.
    ///
    /// Side-effect free. Refuses only when a hard limit would be crossed (or
    /// emergency mode is on); crossing an effective limit yields warnings.
    pub fn check_availability(&self, estimated_units: u64) -> Availability {
        let usage = self.usage.lock();
        let now = self.clock.now();
        let mut availability = Availability {
            ok: true,
            ..Availability::default()
        };

        if let Some(emergency) = &usage.emergency {
            availability.ok = false;
            availability.reason = Some(format!("emergency mode: {}", emergency.reason));
            return availability;
        }

        let projected_active = usage.active_count() + 1;
        if projected_active > self.limits.max_active as usize {
            availability.ok = false;
            availability.reason = Some(format!(
                "active slots {}/{} would exceed hard limit",
                projected_active, self.limits.max_active
            ));
        } else if projected_active as f64 > self.limits.effective_active() {
            availability.warnings.push(format!(
                "active slots {}/{} enter the handoff buffer (effective limit {})",
                projected_active,
                self.limits.max_active,
                self.limits.effective_active()
            ));
        }

        let projected_budget = usage.committed_and_in_flight().saturating_add(estimated_units);
        if projected_budget > self.limits.max_budget_units {
            availability.ok = false;
            availability.reason.get_or_insert_with(|| {
                format!(
                    "budget {}/{} would exceed hard limit",
                    projected_budget, self.limits.max_budget_units
                )
            });
        } else if projected_budget as f64 > self.limits.effective_budget() {
            availability.warnings.push(format!(
                "budget {}/{} enters the handoff buffer (effective limit {})",
                projected_budget,
                self.limits.max_budget_units,
                self.limits.effective_budget()
            ));
        }

        let calls = usage.calls.count_within(now, self.limits.rate_window());
        if calls >= self.limits.max_calls_per_window as usize {
            availability.warnings.push(format!(
                "call rate at ceiling ({}/{} per {}s)",
                calls, self.limits.max_calls_per_window, self.limits.rate_window_secs
            ));
        }

        availability
    }

    /// Take a slot for `card_id`. Never exceeds the hard active limit.
    ///
    /// Re-allocating a card that already holds a slot succeeds without
    /// taking a second one.
    pub fn allocate(&self, card_id: &CardId) -> bool {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        self.refresh_emergency(&mut usage, now);

        if usage.allocations.contains_key(card_id) {
            debug!(card_id = %card_id, "already allocated");
            return true;
        }
        if let Some(emergency) = usage.emergency.clone() {
            self.record_violation(
                &mut usage,
                now,
                ViolationKind::EmergencyMode,
                Some(card_id),
                format!("allocation blocked: {}", emergency.reason),
            );
            return false;
        }
        if usage.active_count() + 1 > self.limits.max_active as usize {
            let detail = format!(
                "allocation refused: {}/{} slots in use",
                usage.active_count(),
                self.limits.max_active
            );
            self.record_violation(&mut usage, now, ViolationKind::ActiveLimit, Some(card_id), detail);
            return false;
        }
        if usage.committed_and_in_flight() >= self.limits.max_budget_units {
            let detail = format!(
                "allocation refused: budget {}/{} exhausted",
                usage.committed_and_in_flight(),
                self.limits.max_budget_units
            );
            self.record_violation(&mut usage, now, ViolationKind::BudgetLimit, Some(card_id), detail);
            return false;
        }

        usage.allocations.insert(
            card_id.clone(),
            Allocation {
                allocated_at: now,
                in_flight_units: 0,
            },
        );
        debug!(card_id = %card_id, active = usage.active_count(), "slot allocated");
        true
    }

    /// Add units consumed by a running card to its in-flight total.
    ///
    /// Refused (with a violation) if the card holds no slot or the hard
    /// budget would be crossed.
    pub fn record_usage(&self, card_id: &CardId, units: u64) -> bool {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        if !usage.allocations.contains_key(card_id) {
            warn!(card_id = %card_id, units, "usage reported for card without a slot");
            return false;
        }
        let projected = usage.committed_and_in_flight().saturating_add(units);
        if projected > self.limits.max_budget_units {
            let detail = format!(
                "usage of {} units refused: {}/{} budget",
                units, projected, self.limits.max_budget_units
            );
            self.record_violation(&mut usage, now, ViolationKind::BudgetLimit, Some(card_id), detail);
            return false;
        }
        if let Some(allocation) = usage.allocations.get_mut(card_id) {
            allocation.in_flight_units = allocation.in_flight_units.saturating_add(units);
        }
        self.refresh_emergency(&mut usage, now);
        true
    }

    /// Return the card's slot and commit its final budget usage.
    ///
    /// Idempotent: releasing a card that holds no slot is a no-op and returns `false`.
    pub fn release(&self, card_id: &CardId, final_metrics: &CardMetrics) -> bool {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        let Some(allocation) = usage.allocations.remove(card_id) else {
            debug!(card_id = %card_id, "release ignored: no slot held");
            return false;
        };

        let committed = usage.budget_consumed.saturating_add(final_metrics.budget_units);
        if committed > self.limits.max_budget_units {
            let detail = format!(
                "final usage overran budget: {}/{}",
                committed, self.limits.max_budget_units
            );
            self.record_violation(&mut usage, now, ViolationKind::BudgetLimit, Some(card_id), detail);
        }
        usage.budget_consumed = committed.min(self.limits.max_budget_units);

        let limit = self.limits.max_card_processing();
        let ran_for = elapsed(allocation.allocated_at, now);
        if ran_for > limit {
            let detail = format!(
                "processed for {}s, limit {}s",
                ran_for.as_secs(),
                limit.as_secs()
            );
            self.record_violation(&mut usage, now, ViolationKind::ProcessingTime, Some(card_id), detail);
        }

        self.refresh_emergency(&mut usage, now);
        debug!(
            card_id = %card_id,
            active = usage.active_count(),
            budget = usage.budget_consumed,
            "slot released"
        );
        true
    }

    /// Count one rate-limited call. Returns `false` if the window is full.
    pub fn track_rate_limited_call(&self) -> bool {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        let window = self.limits.rate_window();
        if usage.calls.try_record(now, window, self.limits.max_calls_per_window) {
            return true;
        }
        let detail = format!(
            "call rejected: {} calls per {}s",
            self.limits.max_calls_per_window, self.limits.rate_window_secs
        );
        self.record_violation(&mut usage, now, ViolationKind::RateLimit, None, detail);
        false
    }

    /// Usage of each resource as a fraction of its effective limit.
    pub fn resource_ratios(&self) -> Vec<ResourceRatio> {
        let usage = self.usage.lock();
        self.ratios(&usage, self.clock.now())
    }

    pub fn compute_alert_level(&self) -> AlertLevel {
        compute_alert_level(&self.resource_ratios(), &self.limits.thresholds)
    }

    /// Should `card_id` be handed off to relieve budget pressure?
    ///
    /// True when session budget usage reaches the red threshold of the
    /// effective budget and the card itself has consumed units since it
    /// started. A fresh continuation therefore never re-triggers at once.
    pub fn check_handoff_trigger(&self, card_id: &CardId) -> HandoffTrigger {
        let usage = self.usage.lock();
        let Some(allocation) = usage.allocations.get(card_id) else {
            return HandoffTrigger {
                should_handoff: false,
                reason: "card holds no slot".to_string(),
            };
        };
        let ratio = usage.committed_and_in_flight() as f64 / self.limits.effective_budget();
        let threshold = self.limits.thresholds.red;
        if ratio < threshold {
            return HandoffTrigger {
                should_handoff: false,
                reason: format!(
                    "budget at {:.1}% of effective limit (trigger {:.0}%)",
                    ratio * 100.0,
                    threshold * 100.0
                ),
            };
        }
        if allocation.in_flight_units == 0 {
            return HandoffTrigger {
                should_handoff: false,
                reason: "card has not consumed budget since start".to_string(),
            };
        }
        HandoffTrigger {
            should_handoff: true,
            reason: format!(
                "budget at {:.1}% of effective limit reached trigger {:.0}%",
                ratio * 100.0,
                threshold * 100.0
            ),
        }
    }

    /// Reserve the handoff buffer for `card_id`.
    ///
    /// Fails if another handoff is in flight, emergency mode is on, or the
    /// reserve cannot cover one more slot.
    pub fn prepare_handoff(&self, card_id: &CardId) -> bool {
        let mut usage = self.usage.lock();
        if usage.handoff_in_flight {
            info!(card_id = %card_id, in_flight = ?usage.handoff_cards, "handoff already in flight");
            return false;
        }
        if usage.emergency.is_some() {
            info!(card_id = %card_id, "handoff refused in emergency mode");
            return false;
        }
        if usage.active_count() + 1 > self.limits.max_active as usize {
            info!(card_id = %card_id, active = usage.active_count(), "handoff reserve exhausted");
            return false;
        }
        if usage.committed_and_in_flight() >= self.limits.max_budget_units {
            info!(card_id = %card_id, "handoff refused: budget exhausted");
            return false;
        }
        usage.handoff_in_flight = true;
        usage.handoff_cards.insert(card_id.clone());
        info!(card_id = %card_id, "handoff reserved");
        true
    }

    /// Drop the reservation for `old_card_id`. `new_card_id` is `None` when the handoff was aborted.
    pub fn complete_handoff(&self, old_card_id: &CardId, new_card_id: Option<&CardId>) {
        let mut usage = self.usage.lock();
        usage.handoff_cards.remove(old_card_id);
        if usage.handoff_cards.is_empty() {
            usage.handoff_in_flight = false;
        }
        match new_card_id {
            Some(new_id) => info!(old = %old_card_id, new = %new_id, "handoff completed"),
            None => warn!(old = %old_card_id, "handoff aborted, reservation returned"),
        }
    }

    pub fn force_emergency_mode(&self, reason: &str) {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        self.enter_emergency(&mut usage, now, reason.to_string());
    }

    /// Leave emergency mode once budget is below half the hard limit and no card runs.
    pub fn reset_emergency_mode(&self) -> Result<(), String> {
        let mut usage = self.usage.lock();
        if usage.emergency.is_none() {
            return Ok(());
        }
        if usage.committed_and_in_flight().saturating_mul(2) >= self.limits.max_budget_units {
            return Err(format!(
                "budget {}/{} is not below 50% of the hard limit",
                usage.committed_and_in_flight(),
                self.limits.max_budget_units
            ));
        }
        if usage.active_count() > 0 {
            return Err(format!("{} cards still hold slots", usage.active_count()));
        }
        usage.emergency = None;
        info!("emergency mode cleared");
        Ok(())
    }

    /// Start a new budget period: clears consumed budget, the call window and
    /// violations. Live allocations and any handoff reservation are kept.
    pub fn reset_usage(&self) {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        usage.session_started_at = now;
        usage.budget_consumed = 0;
        usage.calls.clear();
        usage.violations.clear();
        info!(active = usage.active_count(), "usage period reset");
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.usage.lock().violations.iter().cloned().collect()
    }

    pub fn status(&self) -> ResourceStatus {
        let mut usage = self.usage.lock();
        let now = self.clock.now();
        self.refresh_emergency(&mut usage, now);
        let ratios = self.ratios(&usage, now);
        ResourceStatus {
            active_count: usage.active_count(),
            max_active: self.limits.max_active,
            effective_active: self.limits.effective_active(),
            budget_consumed: usage.budget_consumed,
            budget_in_flight: usage.in_flight_units(),
            max_budget_units: self.limits.max_budget_units,
            effective_budget: self.limits.effective_budget(),
            calls_in_window: usage.calls.count_within(now, self.limits.rate_window()),
            max_calls_per_window: self.limits.max_calls_per_window,
            alert_level: compute_alert_level(&ratios, &self.limits.thresholds),
            ratios,
            emergency: usage.emergency.clone(),
            handoff_in_flight: usage.handoff_in_flight,
            handoff_cards: usage.handoff_cards.iter().cloned().collect(),
            recent_violations: usage.violations.iter().cloned().collect(),
        }
    }

    /// Copy of the raw counters, for persistence.
    pub fn usage_snapshot(&self) -> ResourceUsage {
        self.usage.lock().clone()
    }

    fn ratios(&self, usage: &ResourceUsage, now: DateTime<Utc>) -> Vec<ResourceRatio> {
        let effective_active = if self.limits.effective_active() > 0.0 {
            self.limits.effective_active()
        } else {
            f64::from(self.limits.max_active)
        };
        vec![
            ResourceRatio {
                resource: ResourceKind::ActiveSlots,
                ratio: usage.active_count() as f64 / effective_active,
            },
            ResourceRatio {
                resource: ResourceKind::Budget,
                ratio: usage.committed_and_in_flight() as f64 / self.limits.effective_budget(),
            },
            ResourceRatio {
                resource: ResourceKind::CallRate,
                ratio: usage.calls.count_within(now, self.limits.rate_window()) as f64
                    / f64::from(self.limits.max_calls_per_window),
            },
            ResourceRatio {
                resource: ResourceKind::SessionTime,
                ratio: elapsed_ratio(usage.session_started_at, now, self.limits.max_session()),
            },
        ]
    }

    /// Enter emergency mode when the hard budget is spent or the session ran out.
    fn refresh_emergency(&self, usage: &mut ResourceUsage, now: DateTime<Utc>) {
        if usage.emergency.is_some() {
            return;
        }
        if usage.budget_consumed >= self.limits.max_budget_units {
            let reason = format!(
                "budget exhausted ({}/{})",
                usage.budget_consumed, self.limits.max_budget_units
            );
            self.enter_emergency(usage, now, reason);
            return;
        }
        if elapsed(usage.session_started_at, now) > self.limits.max_session() {
            let detail = format!("session exceeded {}s", self.limits.max_session_secs);
            self.record_violation(usage, now, ViolationKind::SessionTime, None, detail.clone());
            self.enter_emergency(usage, now, detail);
        }
    }

    fn enter_emergency(&self, usage: &mut ResourceUsage, now: DateTime<Utc>, reason: String) {
        let ratios = self.ratios(usage, now);
        warn!(
            reason = %reason,
            peak = ?peak_resource(&ratios).map(|entry| entry.resource.as_str()),
            active = usage.active_count(),
            "entering emergency mode"
        );
        usage.emergency = Some(EmergencyState { reason, since: now });
    }

    fn record_violation(
        &self,
        usage: &mut ResourceUsage,
        now: DateTime<Utc>,
        kind: ViolationKind,
        card_id: Option<&CardId>,
        detail: String,
    ) {
        warn!(kind = ?kind, card_id = ?card_id.map(CardId::as_str), detail = %detail, "resource violation");
        usage.violations.push_back(Violation {
            at: now,
            kind,
            card_id: card_id.cloned(),
            detail,
        });
        while usage.violations.len() > MAX_VIOLATIONS {
            usage.violations.pop_front();
        }
    }
}
