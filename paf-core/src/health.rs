//! Health Tracker (spec §4.2): per-endpoint consecutive success/failure
//! counters, keyed by family + endpoint name. In-memory only — never
//! persisted, never written by anything but this module, and rebuilt from
//! scratch at startup (absent record ⇒ healthy, both counters zero).
//!
//! Grounded in the teacher's `traffic_management::manager::TrafficManager`
//! health bookkeeping (`report_success`/`report_failure`/`health_status` in
//! `traffic_management/manager.rs`), narrowed from the teacher's
//! open/half-open health-cooldown model to this spec's simpler
//! threshold-crossing flag, and keyed by `(Family, String)` instead of the
//! teacher's `(ServiceId, UpstreamId)`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::family::Family;

/// A single endpoint's live health bookkeeping.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthRecord {
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            is_healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_checked: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    records: DashMap<(Family, String), HealthRecord>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero consecutive-failures; increment consecutive-successes; flip to
    /// healthy once `success_threshold` consecutive successes are seen.
    pub fn mark_success(&self, family: Family, name: &str, success_threshold: u32) {
        let mut entry = self
            .records
            .entry((family, name.to_string()))
            .or_default();
        entry.consecutive_failures = 0;
        entry.consecutive_successes = entry.consecutive_successes.saturating_add(1);
        if entry.consecutive_successes >= success_threshold.max(1) {
            entry.is_healthy = true;
        }
        entry.last_checked = Some(Utc::now());
    }

    /// Zero consecutive-successes; increment consecutive-failures; flip to
    /// unhealthy once `failure_threshold` consecutive failures are seen.
    pub fn mark_failure(&self, family: Family, name: &str, failure_threshold: u32) {
        let mut entry = self
            .records
            .entry((family, name.to_string()))
            .or_default();
        entry.consecutive_successes = 0;
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        if entry.consecutive_failures >= failure_threshold.max(1) {
            entry.is_healthy = false;
        }
        entry.last_checked = Some(Utc::now());
    }

    /// Queried by the Selector's eligibility cascade and the Freeze Manager.
    /// Absent record ⇒ healthy ⇒ not exceeded.
    pub fn exceeded_failure_threshold(&self, family: Family, name: &str) -> bool {
        self.records
            .get(&(family, name.to_string()))
            .is_some_and(|r| !r.is_healthy)
    }

    /// Removes the record outright (used after profile deletion, so a
    /// recreated profile of the same name starts clean).
    pub fn reset(&self, family: Family, name: &str) {
        self.records.remove(&(family, name.to_string()));
    }

    /// A read-only copy for admin views; default record when absent.
    pub fn snapshot(&self, family: Family, name: &str) -> HealthRecord {
        self.records
            .get(&(family, name.to_string()))
            .map(|r| *r)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_healthy() {
        let t = HealthTracker::new();
        assert!(!t.exceeded_failure_threshold(Family::Anthropic, "x"));
        assert!(t.snapshot(Family::Anthropic, "x").is_healthy);
    }

    #[test]
    fn flips_unhealthy_at_threshold() {
        let t = HealthTracker::new();
        t.mark_failure(Family::Anthropic, "x", 3);
        t.mark_failure(Family::Anthropic, "x", 3);
        assert!(!t.exceeded_failure_threshold(Family::Anthropic, "x"));
        t.mark_failure(Family::Anthropic, "x", 3);
        assert!(t.exceeded_failure_threshold(Family::Anthropic, "x"));
    }

    #[test]
    fn success_resets_failure_streak_and_restores_health() {
        let t = HealthTracker::new();
        for _ in 0..3 {
            t.mark_failure(Family::Anthropic, "x", 3);
        }
        assert!(t.exceeded_failure_threshold(Family::Anthropic, "x"));

        t.mark_success(Family::Anthropic, "x", 2);
        assert!(t.exceeded_failure_threshold(Family::Anthropic, "x"));
        t.mark_success(Family::Anthropic, "x", 2);
        assert!(!t.exceeded_failure_threshold(Family::Anthropic, "x"));
    }

    #[test]
    fn reset_drops_the_record() {
        let t = HealthTracker::new();
        t.mark_failure(Family::Anthropic, "x", 1);
        assert!(t.exceeded_failure_threshold(Family::Anthropic, "x"));
        t.reset(Family::Anthropic, "x");
        assert!(!t.exceeded_failure_threshold(Family::Anthropic, "x"));
    }

    #[test]
    fn families_are_independent() {
        let t = HealthTracker::new();
        t.mark_failure(Family::Anthropic, "x", 1);
        assert!(t.exceeded_failure_threshold(Family::Anthropic, "x"));
        assert!(!t.exceeded_failure_threshold(Family::OpenAi, "x"));
    }
}
