//! Engine tunables read from `HWV_*` environment variables.

use super::env::EnvParser;
use super::source::Sourced;
use super::ConfigError;
use crate::types::DEFAULT_CONTINUE_WAIT_SECS;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently running background workers.
    pub max_workers: Sourced<usize>,
    /// Timeout for synchronous command execution.
    pub command_timeout: Sourced<Duration>,
    /// Timeout for transport connect probes.
    pub connect_timeout: Sourced<Duration>,
    /// Wait window for continued steps that declare no `duration`.
    pub continue_wait: Sourced<Duration>,
    /// Pause between failed attempts of a step.
    pub retry_backoff: Sourced<Duration>,
    /// Root directory for per-run outputs.
    pub workspace: Sourced<PathBuf>,
    pub log_level: Sourced<String>,
    pub log_json: Sourced<bool>,
    /// Connection configuration document.
    pub conn_config: Sourced<Option<PathBuf>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: Sourced::default_value(DEFAULT_MAX_WORKERS),
            command_timeout: Sourced::default_value(DEFAULT_COMMAND_TIMEOUT),
            connect_timeout: Sourced::default_value(DEFAULT_CONNECT_TIMEOUT),
            continue_wait: Sourced::default_value(Duration::from_secs(DEFAULT_CONTINUE_WAIT_SECS)),
            retry_backoff: Sourced::default_value(DEFAULT_RETRY_BACKOFF),
            workspace: Sourced::default_value(PathBuf::from("workspace")),
            log_level: Sourced::default_value("info".to_string()),
            log_json: Sourced::default_value(false),
            conn_config: Sourced::default_value(None),
        }
    }
}

impl EngineConfig {
    /// Read every tunable, reporting all invalid variables together.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut env = EnvParser::new();
        let defaults = Self::default();

        let config = Self {
            max_workers: env.get_range("MAX_WORKERS", DEFAULT_MAX_WORKERS, 1, 64),
            command_timeout: env.get_duration("COMMAND_TIMEOUT_SECS", DEFAULT_COMMAND_TIMEOUT),
            connect_timeout: env.get_duration("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT),
            continue_wait: env.get_duration("DEFAULT_STEP_DURATION_SECS", defaults.continue_wait.value),
            retry_backoff: env
                .get_range("RETRY_BACKOFF_MS", 1000u64, 0, 60_000)
                .map(Duration::from_millis),
            workspace: env.get_path("WORKSPACE", "workspace", false),
            log_level: env.get_log_level("LOG_LEVEL", "info"),
            log_json: env.get_bool("LOG_JSON", false),
            conn_config: env
                .get_optional_string("CONN_CONFIG")
                .map(|p| p.map(PathBuf::from)),
        };

        if env.has_errors() {
            return Err(ConfigError::Environment(env.take_errors()));
        }
        if config.command_timeout.value > Duration::from_secs(86_400) {
            return Err(ConfigError::InvalidSetting(format!(
                "command timeout {:?} exceeds 24h",
                config.command_timeout.value
            )));
        }
        Ok(config)
    }

    /// Directory for a single run: `{workspace}/logs/test_run_{timestamp}`.
    pub fn run_directory(&self, timestamp: &str) -> PathBuf {
        self.workspace
            .value
            .join("logs")
            .join(format!("test_run_{timestamp}"))
    }
}
