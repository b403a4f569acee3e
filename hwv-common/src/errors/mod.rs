//! Error catalog and definitions for the validation engine.
//!
//! Module-level error enums implement [`Coded`] so the CLI can print the
//! catalog entry (code, message, remediation) for any fatal error.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

/// An error that maps onto a catalog entry.
pub trait Coded {
    fn error_code(&self) -> ErrorCode;
}

impl Coded for crate::config::ConfigError {
    fn error_code(&self) -> ErrorCode {
        use crate::config::ConfigError;
        match self {
            ConfigError::Read { .. } => ErrorCode::ConfigNotFound,
            ConfigError::Parse { .. } | ConfigError::NotAnObject => ErrorCode::ConfigParseError,
            ConfigError::SectionNotFound(_)
            | ConfigError::MissingField { .. }
            | ConfigError::InvalidField { .. } => ErrorCode::ConfigConnectionMissing,
            ConfigError::Environment(_) | ConfigError::InvalidSetting(_) => {
                ErrorCode::ConfigEnvError
            }
        }
    }
}
