//! Tracing subscriber setup for the `hwv` binary.
//!
//! Console output goes to stderr (text or JSON). When a log directory is set,
//! every event is also written as JSON lines through a non-blocking appender;
//! the returned [`LoggingGuards`] must be held until exit so the appender flushes.

use crate::config::EnvParser;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const DEFAULT_LOG_FILE: &str = "hwv.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub stderr: bool,
    pub log_dir: Option<PathBuf>,
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            stderr: true,
            log_dir: None,
            file_name: DEFAULT_LOG_FILE.to_string(),
        }
    }
}

impl LogConfig {
    /// Level from `HWV_LOG_LEVEL`, JSON console from `HWV_LOG_JSON`.
    ///
    /// Invalid values fall back to the defaults; they are reported again by
    /// `EngineConfig::from_env`.
    pub fn from_env(default_level: &str) -> Self {
        let mut env = EnvParser::new();
        let level = env.get_log_level("LOG_LEVEL", default_level).value;
        let json = env.get_bool("LOG_JSON", false).value;
        Self {
            level,
            format: if json { LogFormat::Json } else { LogFormat::Text },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, enabled: bool) -> Self {
        self.stderr = enabled;
        self
    }

    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.format = if json { LogFormat::Json } else { LogFormat::Text };
        self
    }

    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Filter directive: a bare level applies to our crates, anything else is used verbatim.
    fn filter_directive(&self) -> String {
        match self.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                format!("warn,hwv={0},hwv_common={0}", self.level)
            }
            custom => custom.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("Failed to create log directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Global subscriber already installed: {0}")]
    AlreadyInitialised(String),
}

/// Keeps the non-blocking file writer alive.
#[must_use = "dropping the guards stops file logging"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

pub fn init_logging(config: &LogConfig) -> Result<LoggingGuards, LoggingError> {
    let directive = config.filter_directive();
    let filter =
        EnvFilter::try_new(&directive).map_err(|_| LoggingError::InvalidFilter(directive))?;

    let console = config.stderr.then(|| match config.format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Text => fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .boxed(),
    });

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::Io {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::never(dir, &config.file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_current_span(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialised(e.to_string()))?;

    Ok(LoggingGuards { _file: guard })
}
