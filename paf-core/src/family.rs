//! The two upstream ecosystems `paf` fronts. Each family owns an independent
//! pool, load balancer, config file and proxy listener.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Anthropic,
    OpenAi,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::Anthropic, Family::OpenAi];

    /// Name used for the on-disk config file (`{name}.json`) and `?service=` query values.
    pub fn config_name(self) -> &'static str {
        match self {
            Family::Anthropic => "anthropic",
            Family::OpenAi => "openai",
        }
    }

    pub fn from_config_name(s: &str) -> Option<Family> {
        match s {
            "anthropic" => Some(Family::Anthropic),
            "openai" => Some(Family::OpenAi),
            _ => None,
        }
    }

    /// Default listener port.
    pub fn default_port(self) -> u16 {
        match self {
            Family::Anthropic => 8801,
            Family::OpenAi => 8802,
        }
    }

    /// Whether the Anthropic-only body sanitisation and header adjustments
    /// apply to this family.
    pub fn is_anthropic(self) -> bool {
        matches!(self, Family::Anthropic)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}
