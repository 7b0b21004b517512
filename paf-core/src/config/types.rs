//! Data model: Endpoint Profile, Family State, Load-Balancer Settings.
//! Grounded in the teacher's `conf::types::service::*` serde struct style
//! (`default = "..."` helpers, `#[serde(rename_all = "snake_case")]` enums)
//! but flattened to a single JSON document per family instead of the
//! teacher's HCL/operator-DSL layering.

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

/// One upstream entry within a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointProfile {
    pub name: String,
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_weight")]
    pub weight: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Epoch milliseconds. Absent = not frozen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze_until: Option<i64>,
}

impl EndpointProfile {
    pub fn is_frozen_at(&self, now_ms: i64) -> bool {
        self.freeze_until.is_some_and(|until| until > now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Manual,
    LoadBalance,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Weighted,
    RoundRobin,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Weighted
    }
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_ms")]
    pub interval: u64,

    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval_ms(),
            timeout: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_freeze_duration_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadBalancerSettings {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub health_check: HealthCheckSettings,

    #[serde(default = "default_freeze_duration_ms")]
    pub freeze_duration: u64,
}

impl Default for LoadBalancerSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            health_check: HealthCheckSettings::default(),
            freeze_duration: default_freeze_duration_ms(),
        }
    }
}

fn default_active() -> ActiveName {
    ActiveName { name: String::new() }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveName {
    #[serde(default)]
    pub name: String,
}

/// One family's persisted + in-memory state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyState {
    #[serde(default)]
    pub mode: Mode,

    #[serde(default = "default_active")]
    pub active: ActiveName,

    #[serde(default)]
    pub configs: Vec<EndpointProfile>,

    #[serde(default)]
    pub loadbalancer: LoadBalancerSettings,
}

impl FamilyState {
    pub fn active_name(&self) -> &str {
        &self.active.name
    }

    pub fn find(&self, name: &str) -> Option<&EndpointProfile> {
        self.configs.iter().find(|p| p.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut EndpointProfile> {
        self.configs.iter_mut().find(|p| p.name == name)
    }
}

impl Default for FamilyState {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            active: default_active(),
            configs: Vec::new(),
            loadbalancer: LoadBalancerSettings::default(),
        }
    }
}

/// The system-wide file: web port, per-family proxy ports, log level, data
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_web_port")]
    pub web_port: u16,

    #[serde(default = "default_anthropic_port")]
    pub anthropic_port: u16,

    #[serde(default = "default_openai_port")]
    pub openai_port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub data_dir: String,
}

fn default_web_port() -> u16 {
    8800
}

fn default_anthropic_port() -> u16 {
    8801
}

fn default_openai_port() -> u16 {
    8802
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            web_port: default_web_port(),
            anthropic_port: default_anthropic_port(),
            openai_port: default_openai_port(),
            log_level: default_log_level(),
            data_dir: String::new(),
        }
    }
}
