//! Source tracking for configuration values.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Where a configuration value came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::File => write!(f, "file"),
            Self::Environment => write!(f, "environment"),
            Self::Cli => write!(f, "cli"),
        }
    }
}

/// A value paired with the place it was read from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable name when `source` is `Environment`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
    /// File path when `source` is `File`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
            file: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var.into()),
            file: None,
        }
    }

    pub fn from_file(value: T, path: impl Into<PathBuf>) -> Self {
        Self {
            value,
            source: ConfigSource::File,
            env_var: None,
            file: Some(path.into()),
        }
    }

    pub fn from_cli(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Cli,
            env_var: None,
            file: None,
        }
    }

    /// Replace the value when `other` comes from a source of equal or higher precedence.
    pub fn merge(self, other: Sourced<T>) -> Self {
        if other.source >= self.source {
            other
        } else {
            self
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Sourced<U> {
        Sourced {
            value: f(self.value),
            source: self.source,
            env_var: self.env_var,
            file: self.file,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    /// Human-readable origin, e.g. `environment (HWV_MAX_WORKERS)`.
    pub fn describe_source(&self) -> String {
        match (&self.env_var, &self.file) {
            (Some(var), _) => format!("{} ({var})", self.source),
            (None, Some(path)) => format!("{} ({})", self.source, path.display()),
            _ => self.source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_higher_precedence() {
        let base = Sourced::default_value(5u32);
        let env = Sourced::from_env(8u32, "HWV_MAX_WORKERS");
        let merged = base.merge(env);
        assert_eq!(merged.value, 8);
        assert_eq!(merged.source, ConfigSource::Environment);

        let cli = Sourced::from_cli(2u32);
        let kept = cli.merge(Sourced::default_value(9u32));
        assert_eq!(kept.value, 2);
    }

    #[test]
    fn test_describe_source() {
        let s = Sourced::from_env(1, "HWV_X");
        assert_eq!(s.describe_source(), "environment (HWV_X)");
        assert_eq!(Sourced::default_value(1).describe_source(), "default");
    }

    #[test]
    fn test_map_keeps_origin() {
        let s = Sourced::from_env(30u64, "HWV_T").map(std::time::Duration::from_secs);
        assert_eq!(s.value.as_secs(), 30);
        assert_eq!(s.env_var.as_deref(), Some("HWV_T"));
    }
}
