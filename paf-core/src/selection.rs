//! Selector (spec §4.3): picks one endpoint from an eligibility-filtered
//! pool using weight-descending sticky selection or round-robin.
//!
//! The eligibility cascade is grounded in the teacher's layered circuit
//! breaker / health-cooldown fallback in `traffic_management::circuit` and
//! `traffic_management::manager::health_status`; the weighted strategy's
//! smooth-rotation bucket cursor is grounded in
//! `traffic_management::manager::TrafficManager::next_wrr_index` (the
//! teacher's per-service WRR cursor), generalized from "one weight slot per
//! upstream" to "one rotation cursor per distinct weight value" per this
//! spec's tie-break rule. The plain round-robin and final proportional
//! fallback are grounded in `traffic_management::algorithms::random::Random`
//! and `...::failover::Failover`.

use dashmap::DashMap;
use std::collections::HashMap;

use crate::config::{EndpointProfile, LoadBalancerSettings, Strategy};
use crate::family::Family;
use crate::health::HealthTracker;

#[derive(Debug, Default)]
struct FamilySelectorState {
    /// Most recent sticky (or round-robin) pick, used for stickiness and for
    /// the dashboard's `current-server-name`.
    current: Option<String>,
    round_robin_cursor: usize,
    /// One rotation cursor per distinct weight value (`f64::to_bits` as key,
    /// since exact weight equality is what buckets are grouped on).
    bucket_cursors: HashMap<u64, usize>,
}

#[derive(Debug, Default)]
pub struct Selector {
    state: DashMap<Family, FamilySelectorState>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Eligibility cascade (spec §4.3): enabled (already true — `pool` comes
    /// from `ConfigStore::eligible_pool`) → not frozen → under the failure
    /// threshold, falling back to the most permissive non-empty prior level.
    fn cascade<'a>(
        pool: &'a [EndpointProfile],
        health: &HealthTracker,
        family: Family,
        now_ms: i64,
    ) -> Vec<&'a EndpointProfile> {
        if pool.is_empty() {
            return Vec::new();
        }
        let level1: Vec<&EndpointProfile> = pool.iter().collect();

        let not_frozen: Vec<&EndpointProfile> = level1
            .iter()
            .copied()
            .filter(|p| !p.is_frozen_at(now_ms))
            .collect();
        let level2 = if not_frozen.is_empty() {
            level1
        } else {
            not_frozen
        };

        let under_threshold: Vec<&EndpointProfile> = level2
            .iter()
            .copied()
            .filter(|p| !health.exceeded_failure_threshold(family, &p.name))
            .collect();
        if under_threshold.is_empty() {
            level2
        } else {
            under_threshold
        }
    }

    /// Returns the endpoint to use for this request, or `None` if the pool
    /// is empty (spec: respond `503`, never crash).
    pub fn select(
        &self,
        family: Family,
        pool: &[EndpointProfile],
        health: &HealthTracker,
        settings: &LoadBalancerSettings,
        now_ms: i64,
    ) -> Option<EndpointProfile> {
        let eligible = Self::cascade(pool, health, family, now_ms);
        if eligible.is_empty() {
            let mut state = self.state.entry(family).or_default();
            state.current = None;
            return None;
        }

        let mut state = self.state.entry(family).or_default();
        match settings.strategy {
            Strategy::RoundRobin => {
                let idx = state.round_robin_cursor % eligible.len();
                state.round_robin_cursor = state.round_robin_cursor.wrapping_add(1);
                let chosen = eligible[idx];
                state.current = Some(chosen.name.clone());
                Some(chosen.clone())
            }
            Strategy::Weighted => {
                let (chosen, sticky) =
                    Self::weighted_pick(&eligible, state.current.as_deref(), health, family, &mut state.bucket_cursors);
                state.current = if sticky { Some(chosen.name.clone()) } else { None };
                Some(chosen.clone())
            }
        }
    }

    /// Sticky, weight-descending, alphabetically tie-broken, per-bucket
    /// rotated selection. Returns `(profile, became_sticky)`.
    fn weighted_pick<'a>(
        eligible: &[&'a EndpointProfile],
        sticky: Option<&str>,
        health: &HealthTracker,
        family: Family,
        bucket_cursors: &mut HashMap<u64, usize>,
    ) -> (&'a EndpointProfile, bool) {
        if let Some(name) = sticky
            && let Some(p) = eligible.iter().copied().find(|p| p.name == name)
            && !health.exceeded_failure_threshold(family, name)
        {
            return (p, true);
        }

        // Group by exact weight, descending; within a bucket, name ascending.
        let mut buckets: Vec<(f64, Vec<&EndpointProfile>)> = Vec::new();
        for p in eligible {
            match buckets.iter_mut().find(|(w, _)| *w == p.weight) {
                Some((_, members)) => members.push(p),
                None => buckets.push((p.weight, vec![p])),
            }
        }
        buckets.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (weight, mut members) in buckets {
            members.sort_by(|a, b| a.name.cmp(&b.name));
            let under: Vec<&EndpointProfile> = members
                .into_iter()
                .filter(|p| !health.exceeded_failure_threshold(family, &p.name))
                .collect();
            if under.is_empty() {
                continue;
            }
            let cursor = bucket_cursors.entry(weight.to_bits()).or_insert(0);
            let idx = *cursor % under.len();
            *cursor = cursor.wrapping_add(1);
            return (under[idx], true);
        }

        // Every bucket has every member above its failure threshold: proportional
        // random choice over the full eligible set, not marked sticky.
        (Self::proportional_random(eligible), false)
    }

    fn proportional_random<'a>(eligible: &[&'a EndpointProfile]) -> &'a EndpointProfile {
        let total: f64 = eligible.iter().map(|p| p.weight.max(0.0)).sum();
        if total <= 0.0 {
            let idx = rand::Rng::random_range(&mut rand::rng(), 0..eligible.len());
            return eligible[idx];
        }
        let mut r = rand::Rng::random::<f64>(&mut rand::rng()) * total;
        for p in eligible {
            r -= p.weight.max(0.0);
            if r <= 0.0 {
                return p;
            }
        }
        eligible[eligible.len() - 1]
    }

    /// The dashboard's `current-server-name`: empty once the current pick
    /// leaves the family or crosses the failure threshold, even without a
    /// new `select()` call in between.
    pub fn current_server_name(
        &self,
        family: Family,
        pool: &[EndpointProfile],
        health: &HealthTracker,
    ) -> String {
        let Some(state) = self.state.get(&family) else {
            return String::new();
        };
        let Some(name) = state.current.clone() else {
            return String::new();
        };
        let still_present = pool.iter().any(|p| p.name == name);
        if still_present && !health.exceeded_failure_threshold(family, &name) {
            name
        } else {
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile(name: &str, weight: f64) -> EndpointProfile {
        EndpointProfile {
            name: name.to_string(),
            base_url: "https://example.invalid".to_string(),
            auth_token: None,
            api_key: None,
            weight,
            enabled: true,
            freeze_until: None,
        }
    }

    #[test]
    fn weighted_stickiness_sticks_to_first_pick() {
        let selector = Selector::new();
        let health = HealthTracker::new();
        let settings = LoadBalancerSettings {
            strategy: Strategy::Weighted,
            ..Default::default()
        };
        let pool = vec![profile("a", 3.0), profile("b", 1.0)];

        let first = selector
            .select(Family::Anthropic, &pool, &health, &settings, 0)
            .unwrap();
        assert_eq!(first.name, "a");

        for _ in 0..9 {
            let pick = selector
                .select(Family::Anthropic, &pool, &health, &settings, 0)
                .unwrap();
            assert_eq!(pick.name, "a");
        }
    }

    #[test]
    fn weight_zero_never_picked_unless_only_option() {
        let selector = Selector::new();
        let health = HealthTracker::new();
        let settings = LoadBalancerSettings {
            strategy: Strategy::Weighted,
            ..Default::default()
        };
        let pool = vec![profile("zero", 0.0), profile("a", 1.0)];

        for _ in 0..20 {
            let pick = selector
                .select(Family::Anthropic, &pool, &health, &settings, 0)
                .unwrap();
            assert_eq!(pick.name, "a");
        }
    }

    #[test]
    fn round_robin_advances_through_pool() {
        let selector = Selector::new();
        let health = HealthTracker::new();
        let settings = LoadBalancerSettings {
            strategy: Strategy::RoundRobin,
            ..Default::default()
        };
        let pool = vec![profile("a", 1.0), profile("b", 1.0), profile("c", 1.0)];

        let picks: Vec<String> = (0..6)
            .map(|_| {
                selector
                    .select(Family::Anthropic, &pool, &health, &settings, 0)
                    .unwrap()
                    .name
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn empty_pool_returns_none_and_clears_current() {
        let selector = Selector::new();
        let health = HealthTracker::new();
        let settings = LoadBalancerSettings::default();
        assert!(
            selector
                .select(Family::Anthropic, &[], &health, &settings, 0)
                .is_none()
        );
        assert_eq!(
            selector.current_server_name(Family::Anthropic, &[], &health),
            ""
        );
    }

    #[test]
    fn current_server_name_clears_when_endpoint_crosses_threshold() {
        let selector = Selector::new();
        let health = HealthTracker::new();
        let settings = LoadBalancerSettings {
            strategy: Strategy::Weighted,
            ..Default::default()
        };
        let pool = vec![profile("a", 1.0)];
        selector
            .select(Family::Anthropic, &pool, &health, &settings, 0)
            .unwrap();
        assert_eq!(
            selector.current_server_name(Family::Anthropic, &pool, &health),
            "a"
        );

        for _ in 0..settings.health_check.failure_threshold {
            health.mark_failure(Family::Anthropic, "a", settings.health_check.failure_threshold);
        }
        assert_eq!(
            selector.current_server_name(Family::Anthropic, &pool, &health),
            ""
        );
    }
}
