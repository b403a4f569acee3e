//! Shared building blocks for the hardware validation engine.
//!
//! Holds the scenario and connection data model, environment-driven engine
//! configuration, the error catalog, logging setup and small utilities used by
//! the `hwv` crate.

pub mod config;
pub mod errors;
pub mod logging;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{
    ConfigError, ConfigSource, ConnectionSection, ConnectionsConfig, EngineConfig, EnvError,
    EnvParser, Sourced, TunnelSettings,
};
pub use errors::{Coded, ErrorCategory, ErrorCode, ErrorEntry};
pub use logging::{LogConfig, LogFormat, LoggingError, LoggingGuards, init_logging};
pub use types::{
    ConnectionType, ContainerSpec, DiagnosticRule, EntryCriterion, OutputRule, Scenario,
    ScenarioFile, Step, StepType,
};
pub use util::{mask_sensitive_command, sanitize_file_stem, shorten};
