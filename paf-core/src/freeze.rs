//! Freeze Manager (spec §4.4): translates transient upstream failures into
//! bounded quarantines persisted on the profile, and drives a periodic
//! re-probe loop that thaws recovered endpoints.
//!
//! Grounded in the teacher's `CircuitBreaker` open/half-open state machine
//! (`traffic_management/circuit.rs`) and its `circuit_transition` log event,
//! narrowed from a request-admission gate to this spec's persisted
//! `frozen-until` timestamp (the freeze state lives in the Config Store, not
//! in-memory, because the dashboard and `paf config check` must see it
//! too). The per-profile in-flight probe guard is grounded in the same
//! file's `half_open_in_flight` counter, generalized from "N in flight" to
//! "at most one in flight" via a `DashSet`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tracing::{info, warn};

use crate::config::{ConfigStore, Mode};
use crate::family::Family;
use crate::health::HealthTracker;

/// How the Forwarder's upstream attempt turned out, as reported to
/// [`FreezeManager::on_outcome`].
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// 2xx/3xx response.
    Success,
    /// Non-2xx/3xx response, carrying the status for logging.
    HttpStatus(u16),
    /// Connect/DNS/cancellation failure — no response at all.
    Transport,
}

pub struct FreezeManager {
    config: Arc<ConfigStore>,
    health: Arc<HealthTracker>,
    /// Profiles with a re-probe currently in flight, keyed by
    /// `(family, name)` — at most one outstanding probe per profile.
    in_flight: DashSet<(Family, String)>,
}

impl FreezeManager {
    pub fn new(config: Arc<ConfigStore>, health: Arc<HealthTracker>) -> Self {
        Self {
            config,
            health,
            in_flight: DashSet::new(),
        }
    }

    /// Called by the Forwarder once per completed upstream attempt (spec
    /// §4.5 steps 8–9, §4.4). Updates the Health Tracker and, if warranted,
    /// writes or clears `frozen-until` on the Config Store.
    pub fn on_outcome(&self, family: Family, name: &str, outcome: Outcome) {
        let snapshot = self.config.snapshot(family);
        let failure_threshold = snapshot.loadbalancer.health_check.failure_threshold;
        let success_threshold = snapshot.loadbalancer.health_check.success_threshold;

        match outcome {
            Outcome::Success => {
                self.health.mark_success(family, name, success_threshold);
                if let Some(profile) = snapshot.find(name)
                    && profile.freeze_until.is_some()
                {
                    self.thaw(family, name);
                }
            }
            Outcome::HttpStatus(status) => {
                self.health.mark_failure(family, name, failure_threshold);
                let exceeded = self.health.exceeded_failure_threshold(family, name);
                if exceeded && snapshot.mode == Mode::LoadBalance {
                    self.freeze_for(family, name, snapshot.loadbalancer.freeze_duration, status);
                }
            }
            Outcome::Transport => {
                // Transport errors signal a configuration/network fault, not a
                // transient upstream blip — freeze unconditionally, even in
                // manual mode, even before the failure threshold is reached.
                self.health.mark_failure(family, name, failure_threshold);
                self.freeze_unconditionally(family, name, snapshot.loadbalancer.freeze_duration);
            }
        }
    }

    fn freeze_for(&self, family: Family, name: &str, duration_ms: u64, status: u16) {
        let until = Utc::now().timestamp_millis().saturating_add(duration_ms.min(i64::MAX as u64) as i64);
        match self.config.extend_freeze(family, name, until) {
            Ok(()) => {
                warn!(
                    event = "freeze",
                    family = %family,
                    endpoint = name,
                    status,
                    frozen_until = until,
                    "endpoint froze after crossing the failure threshold"
                );
            }
            Err(err) => {
                // `persist` error kind (spec §7): logged and swallowed, the
                // in-memory health state already reflects the failure and a
                // later failure will retry the write.
                warn!(error = %err, family = %family, endpoint = name, "failed to persist freeze");
            }
        }
    }

    fn freeze_unconditionally(&self, family: Family, name: &str, duration_ms: u64) {
        let until = Utc::now().timestamp_millis().saturating_add(duration_ms.min(i64::MAX as u64) as i64);
        match self.config.extend_freeze(family, name, until) {
            Ok(()) => {
                warn!(
                    event = "freeze",
                    family = %family,
                    endpoint = name,
                    frozen_until = until,
                    reason = "transport_error",
                    "endpoint froze after a transport error"
                );
            }
            Err(err) => {
                warn!(error = %err, family = %family, endpoint = name, "failed to persist freeze");
            }
        }
    }

    fn thaw(&self, family: Family, name: &str) {
        match self.config.clear_freeze(family, name) {
            Ok(()) => {
                info!(event = "thaw", family = %family, endpoint = name, "endpoint thawed");
            }
            Err(err) => {
                warn!(error = %err, family = %family, endpoint = name, "failed to persist thaw");
            }
        }
    }

    /// True while a re-probe for this profile is outstanding.
    pub fn probe_in_flight(&self, family: Family, name: &str) -> bool {
        self.in_flight.contains(&(family, (*name).to_string()))
    }

    pub(crate) fn begin_probe(&self, family: Family, name: &str) -> bool {
        self.in_flight.insert((family, name.to_string()))
    }

    pub(crate) fn end_probe(&self, family: Family, name: &str) {
        self.in_flight.remove(&(family, name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointProfile, FamilyState};
    use pretty_assertions::assert_eq;

    fn profile(name: &str) -> EndpointProfile {
        EndpointProfile {
            name: name.to_string(),
            base_url: "https://example.invalid".to_string(),
            auth_token: None,
            api_key: None,
            weight: 1.0,
            enabled: true,
            freeze_until: None,
        }
    }

    fn store_with(mode: Mode) -> (tempfile::TempDir, Arc<ConfigStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::bootstrap(dir.path()).unwrap();
        store
            .mutate_family(Family::Anthropic, |state: &mut FamilyState| {
                state.mode = mode;
                state.configs.push(profile("a"));
                state.loadbalancer.health_check.failure_threshold = 2;
                state.loadbalancer.freeze_duration = 60_000;
            })
            .unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn success_thaws_a_frozen_endpoint() {
        let (_dir, config) = store_with(Mode::LoadBalance);
        let now = Utc::now().timestamp_millis();
        config
            .extend_freeze(Family::Anthropic, "a", now + 60_000)
            .unwrap();

        let health = Arc::new(HealthTracker::new());
        let manager = FreezeManager::new(Arc::clone(&config), health);
        manager.on_outcome(Family::Anthropic, "a", Outcome::Success);

        let state = config.snapshot(Family::Anthropic);
        assert_eq!(state.find("a").unwrap().freeze_until, None);
    }

    #[tokio::test]
    async fn http_status_freezes_only_past_threshold_and_only_in_load_balance_mode() {
        let (_dir, config) = store_with(Mode::Manual);
        let health = Arc::new(HealthTracker::new());
        let manager = FreezeManager::new(Arc::clone(&config), Arc::clone(&health));

        // Manual mode: even repeated failures past the threshold never freeze.
        manager.on_outcome(Family::Anthropic, "a", Outcome::HttpStatus(500));
        manager.on_outcome(Family::Anthropic, "a", Outcome::HttpStatus(500));
        assert_eq!(config.snapshot(Family::Anthropic).find("a").unwrap().freeze_until, None);

        config
            .mutate_family(Family::Anthropic, |state: &mut FamilyState| {
                state.mode = Mode::LoadBalance;
            })
            .unwrap();
        health.reset(Family::Anthropic, "a");

        // Load-balance mode: first failure doesn't cross the threshold (2) yet.
        manager.on_outcome(Family::Anthropic, "a", Outcome::HttpStatus(500));
        assert_eq!(config.snapshot(Family::Anthropic).find("a").unwrap().freeze_until, None);

        // Second failure crosses it.
        manager.on_outcome(Family::Anthropic, "a", Outcome::HttpStatus(500));
        assert!(config.snapshot(Family::Anthropic).find("a").unwrap().freeze_until.is_some());
    }

    #[tokio::test]
    async fn transport_error_freezes_unconditionally_even_in_manual_mode_before_threshold() {
        let (_dir, config) = store_with(Mode::Manual);
        let health = Arc::new(HealthTracker::new());
        let manager = FreezeManager::new(Arc::clone(&config), health);

        manager.on_outcome(Family::Anthropic, "a", Outcome::Transport);
        assert!(config.snapshot(Family::Anthropic).find("a").unwrap().freeze_until.is_some());
    }

    #[test]
    fn extend_freeze_only_moves_deadline_later() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::bootstrap(dir.path()).unwrap();
        config
            .mutate_family(Family::Anthropic, |state: &mut FamilyState| {
                state.configs.push(profile("a"));
            })
            .unwrap();

        let now = Utc::now().timestamp_millis();
        config.extend_freeze(Family::Anthropic, "a", now + 10_000).unwrap();
        config.extend_freeze(Family::Anthropic, "a", now + 5_000).unwrap();
        assert_eq!(
            config.snapshot(Family::Anthropic).find("a").unwrap().freeze_until,
            Some(now + 10_000)
        );

        config.extend_freeze(Family::Anthropic, "a", now + 20_000).unwrap();
        assert_eq!(
            config.snapshot(Family::Anthropic).find("a").unwrap().freeze_until,
            Some(now + 20_000)
        );
    }
}

/// Wakes once a minute, scans the Config Store for profiles whose
/// `frozen-until` has elapsed, and hands each to `probe_one` — one probe per
/// profile, guarded by `FreezeManager`'s in-flight set so a slow probe is
/// never duplicated by the next tick.
pub async fn run_reprobe_loop<F, Fut>(
    family: Family,
    config: Arc<ConfigStore>,
    freeze: Arc<FreezeManager>,
    probe_one: F,
) where
    F: Fn(Family, crate::config::EndpointProfile) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    loop {
        tick.tick().await;
        let now_ms = Utc::now().timestamp_millis();
        let snapshot = config.snapshot(family);

        for profile in snapshot.configs.iter() {
            let Some(until) = profile.freeze_until else {
                continue;
            };
            if until > now_ms {
                continue;
            }
            if !freeze.begin_probe(family, &profile.name) {
                continue;
            }

            let freeze = Arc::clone(&freeze);
            let profile = profile.clone();
            let fut = probe_one(family, profile.clone());
            tokio::spawn(async move {
                fut.await;
                freeze.end_probe(family, &profile.name);
            });
        }
    }
}
