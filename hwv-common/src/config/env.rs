//! `HWV_*` environment variables.
//!
//! Values are read under the `HWV_` prefix. Errors are collected instead of
//! returned one at a time so a misconfigured run reports everything at once.

use super::source::Sourced;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Reads `HWV_*` variables into [`Sourced`] values.
///
/// Every getter falls back to its default on a bad value and records why, so
/// callers check [`EnvParser::has_errors`] once after reading everything.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl EnvParser {
    pub fn new() -> Self {
        Self::with_prefix("HWV_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// `(full variable name, raw value)` when the variable is set.
    fn lookup(&self, name: &str) -> (String, Option<String>) {
        let var = format!("{}{name}", self.prefix);
        let value = env::var(&var).ok();
        (var, value)
    }

    /// Booleans: `1/true/yes/on` and `0/false/no/off/""`, case-insensitive.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let (var, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let parsed = match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        };
        if parsed.is_none() {
            self.errors.push(EnvError::InvalidValue {
                var: var.clone(),
                expected: "boolean (true/false/1/0/yes/no)".to_string(),
                value: raw,
            });
        }
        Sourced::from_env(parsed.unwrap_or(default), var)
    }

    /// Numbers within `min..=max`. Out-of-range and unparsable values keep `default`.
    pub fn get_range<T>(&mut self, name: &str, default: T, min: T, max: T) -> Sourced<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let (var, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let Ok(n) = raw.trim().parse::<T>() else {
            self.errors.push(EnvError::InvalidValue {
                var,
                expected: format!("number in {min}..={max}"),
                value: raw,
            });
            return Sourced::default_value(default);
        };
        if n < min || n > max {
            self.errors.push(EnvError::OutOfRange {
                var: var.clone(),
                value: n.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
            return Sourced::from_env(default, var);
        }
        Sourced::from_env(n, var)
    }

    /// Durations: bare integers are seconds, otherwise humantime syntax (`90s`, `5m`).
    /// Zero is rejected.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let (var, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default);
        };
        let text = raw.trim();
        let parsed = match text.parse::<u64>() {
            Ok(secs) => Some(Duration::from_secs(secs)),
            Err(_) => humantime::parse_duration(text).ok(),
        };
        match parsed.filter(|d| !d.is_zero()) {
            Some(d) => Sourced::from_env(d, var),
            None => {
                self.errors.push(EnvError::InvalidDuration { var, value: raw });
                Sourced::default_value(default)
            }
        }
    }

    /// Paths with a leading `~/` expanded. `must_exist` records missing paths.
    pub fn get_path(&mut self, name: &str, default: &str, must_exist: bool) -> Sourced<PathBuf> {
        let (var, raw) = self.lookup(name);
        let from_env = raw.is_some();
        let text = raw.unwrap_or_else(|| default.to_string());
        let path = match text.strip_prefix("~/").zip(dirs::home_dir()) {
            Some((rest, home)) => home.join(rest),
            None => PathBuf::from(&text),
        };
        if must_exist && !path.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var.clone(),
                path: path.clone(),
            });
        }
        if from_env {
            Sourced::from_env(path, var)
        } else {
            Sourced::default_value(path)
        }
    }

    /// A tracing level name, lower-cased.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let (var, Some(raw)) = self.lookup(name) else {
            return Sourced::default_value(default.to_string());
        };
        let level = raw.to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            return Sourced::from_env(level, var);
        }
        self.errors.push(EnvError::InvalidLogLevel {
            var: var.clone(),
            value: raw,
        });
        Sourced::from_env(default.to_string(), var)
    }

    /// `None` when unset or empty.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        match self.lookup(name) {
            (var, Some(raw)) => Sourced::from_env(Some(raw).filter(|v| !v.is_empty()), var),
            (_, None) => Sourced::default_value(None),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}
