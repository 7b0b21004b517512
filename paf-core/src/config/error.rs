use thiserror::Error;

/// Error kinds surfaced to callers: `config-missing`, `config-invalid`, `persist`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file missing: {path}")]
    Missing { path: String },

    #[error("config file invalid ({path}): {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to persist config ({path}): {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown family: {0}")]
    UnknownFamily(String),
}

impl ConfigError {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigError::Missing { .. } => "config-missing",
            ConfigError::Invalid { .. } => "config-invalid",
            ConfigError::Persist { .. } => "persist",
            ConfigError::UnknownFamily(_) => "config-invalid",
        }
    }
}
