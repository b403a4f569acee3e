//! Configuration for the validation engine.
//!
//! - `HWV_*` environment variables with type checking and source tracking
//! - the JSON connection document describing every reachable target

pub mod connections;
pub mod engine;
pub mod env;
pub mod source;

pub use connections::{ConnectionSection, ConnectionsConfig, TunnelSettings};
pub use engine::EngineConfig;
pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse connection config: {source}")]
    Parse {
        path: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },

    #[error("Connection config must be a JSON object keyed by connection name")]
    NotAnObject,

    #[error("Configuration for connection '{0}' not found")]
    SectionNotFound(String),

    #[error("Connection '{name}' is missing required field '{field}'")]
    MissingField { name: String, field: String },

    #[error("Invalid value for '{field}' in connection '{name}': {value}")]
    InvalidField {
        name: String,
        field: String,
        value: String,
    },

    #[error("Invalid environment: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Environment(Vec<EnvError>),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
