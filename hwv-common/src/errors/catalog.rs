//! Error catalog for the validation engine.
//!
//! Every user-facing failure maps to a stable code (`HWV-E001` ...) with a
//! message and remediation steps.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                             |
//! |------------|-------------|-----------------------------------------|
//! | E001-E099  | Config      | Configuration and scenario file errors  |
//! | E100-E199  | Connection  | Transport and connectivity errors       |
//! | E200-E299  | Task        | Background task lifecycle errors        |
//! | E300-E399  | Step        | Step execution and validation errors    |
//! | E400-E499  | Analysis    | Analysis rules and entry criteria       |
//! | E500-E599  | Internal    | Internal/unexpected errors              |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Connection configuration file not found or unreadable
    ConfigNotFound,
    /// Connection configuration is not valid JSON
    ConfigParseError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Connection section or required field missing
    ConfigConnectionMissing,
    /// Scenario file could not be loaded
    ScenarioLoadError,
    /// Step is missing a required field
    ScenarioInvalidStep,
    /// Scenario invokes itself through a chain of nested scenarios
    ScenarioCycle,

    // =========================================================================
    // Connection Errors (E100-E199)
    // =========================================================================
    /// Could not connect to target
    ConnectionFailed,
    /// Remote command could not be started
    ConnectionCommandFailed,
    /// Redfish request failed
    RedfishRequestFailed,
    /// SSH tunnel could not be established
    TunnelStartFailed,
    /// File upload or download failed
    TransferFailed,
    /// Connection type not supported
    ConnectionTypeUnsupported,

    // =========================================================================
    // Task Errors (E200-E299)
    // =========================================================================
    /// Task id not known to the connection
    TaskNotFound,
    /// Task exceeded its wait window
    TaskTimeout,
    /// Task was terminated
    TaskTerminated,
    /// Worker pool refused the task
    TaskPoolClosed,

    // =========================================================================
    // Step Errors (E300-E399)
    // =========================================================================
    /// Step exhausted its attempts
    StepFailed,
    /// Step exceeded its duration
    StepTimeout,
    /// No executor registered for the step type
    StepTypeUnknown,
    /// Output did not match the expected value
    StepValidationMismatch,
    /// Auxiliary container failed to start
    ContainerStartFailed,

    // =========================================================================
    // Analysis Errors (E400-E499)
    // =========================================================================
    /// Analysis regex failed to compile
    AnalysisInvalidRegex,
    /// Diagnostic rule declares both search shapes
    AnalysisRuleConflict,
    /// Diagnostic rule has no usable code
    AnalysisRuleMissingCode,
    /// Entry-criteria expression could not be evaluated
    ExpressionInvalid,
    /// Log content empty or missing
    AnalysisLogEmpty,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Results or artifacts could not be written
    InternalResultsWrite,
    /// Result update for an unknown step
    InternalStepUnknown,
    /// Logging could not be initialised
    InternalLoggingError,
}

impl ErrorCode {
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigNotFound => 1,
            Self::ConfigParseError => 2,
            Self::ConfigEnvError => 3,
            Self::ConfigConnectionMissing => 4,
            Self::ScenarioLoadError => 10,
            Self::ScenarioInvalidStep => 11,
            Self::ScenarioCycle => 12,

            Self::ConnectionFailed => 100,
            Self::ConnectionCommandFailed => 101,
            Self::RedfishRequestFailed => 110,
            Self::TunnelStartFailed => 120,
            Self::TransferFailed => 130,
            Self::ConnectionTypeUnsupported => 140,

            Self::TaskNotFound => 200,
            Self::TaskTimeout => 201,
            Self::TaskTerminated => 202,
            Self::TaskPoolClosed => 210,

            Self::StepFailed => 300,
            Self::StepTimeout => 301,
            Self::StepTypeUnknown => 302,
            Self::StepValidationMismatch => 310,
            Self::ContainerStartFailed => 320,

            Self::AnalysisInvalidRegex => 400,
            Self::AnalysisRuleConflict => 401,
            Self::AnalysisRuleMissingCode => 402,
            Self::ExpressionInvalid => 410,
            Self::AnalysisLogEmpty => 420,

            Self::InternalResultsWrite => 500,
            Self::InternalStepUnknown => 501,
            Self::InternalLoggingError => 502,
        }
    }

    /// Returns the formatted error code string (e.g., "HWV-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("HWV-E{:03}", self.code_number())
    }

    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Connection,
            200..=299 => ErrorCategory::Task,
            300..=399 => ErrorCategory::Step,
            400..=499 => ErrorCategory::Analysis,
            _ => ErrorCategory::Internal,
        }
    }

    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Connection configuration file not found",
            Self::ConfigParseError => "Connection configuration is not valid JSON",
            Self::ConfigEnvError => "Invalid HWV_* environment variable",
            Self::ConfigConnectionMissing => "Connection is not described in the configuration",
            Self::ScenarioLoadError => "Scenario file could not be loaded",
            Self::ScenarioInvalidStep => "Step is missing a required field",
            Self::ScenarioCycle => "Scenario invokes itself",

            Self::ConnectionFailed => "Failed to connect to target",
            Self::ConnectionCommandFailed => "Command could not be started on target",
            Self::RedfishRequestFailed => "Redfish request failed",
            Self::TunnelStartFailed => "SSH tunnel could not be established",
            Self::TransferFailed => "File transfer failed",
            Self::ConnectionTypeUnsupported => "Unsupported connection type",

            Self::TaskNotFound => "Background task not found",
            Self::TaskTimeout => "Background task timed out",
            Self::TaskTerminated => "Background task was terminated",
            Self::TaskPoolClosed => "Worker pool is shut down",

            Self::StepFailed => "Step failed after all attempts",
            Self::StepTimeout => "Step exceeded its duration",
            Self::StepTypeUnknown => "No executor registered for step type",
            Self::StepValidationMismatch => "Output did not match the expected value",
            Self::ContainerStartFailed => "Auxiliary container failed to start",

            Self::AnalysisInvalidRegex => "Analysis pattern is not a valid regular expression",
            Self::AnalysisRuleConflict => "Diagnostic rule declares both search_string and diagnostic_search_string",
            Self::AnalysisRuleMissingCode => "Diagnostic rule has search_string but no diagnostic_result_code",
            Self::ExpressionInvalid => "Entry-criteria expression could not be evaluated",
            Self::AnalysisLogEmpty => "Log content is empty or missing",

            Self::InternalResultsWrite => "Failed to write results",
            Self::InternalStepUnknown => "Result update for unknown step",
            Self::InternalLoggingError => "Failed to initialise logging",
        }
    }

    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Pass the connection file with --conn-config or HWV_CONN_CONFIG",
                "Check the path is readable by the current user",
            ],
            Self::ConfigParseError => &[
                "Validate the file with a JSON linter",
                "Top-level keys must be connection names mapping to objects",
            ],
            Self::ConfigEnvError => &["Unset or correct the reported HWV_* variables"],
            Self::ConfigConnectionMissing => &[
                "Add a section named after the step's connection",
                "Provide {name}_host, {name}_username and credentials",
            ],
            Self::ScenarioLoadError => &[
                "Check the file is valid YAML or JSON",
                "The document root must contain a test_scenario object",
            ],
            Self::ScenarioInvalidStep => &[
                "command_execution steps need step_command, connection and connection_type",
                "log_analysis steps need log_analysis_path",
                "invoke_scenario steps need scenario_path",
            ],
            Self::ScenarioCycle => &["Remove the invoke_scenario step that points back up the chain"],

            Self::ConnectionFailed => &[
                "Verify the host is reachable: ping <host>",
                "Verify credentials in the connection configuration",
                "For tunneled connections verify the tunnel agent is reachable",
            ],
            Self::ConnectionCommandFailed => &[
                "Check the ssh and sshpass binaries are installed when using passwords",
                "Run the command manually on the target",
            ],
            Self::RedfishRequestFailed => &[
                "Check the BMC answers GET /redfish/v1/",
                "Check use_ssl and redfish_port in the Connection section",
            ],
            Self::TunnelStartFailed => &[
                "Check the tunnel agent accepts SSH on port 22",
                "Make sure the local forward port is free",
            ],
            Self::TransferFailed => &["Check the remote path exists and scp is available"],
            Self::ConnectionTypeUnsupported => &["Use one of: ssh, redfish, local"],

            Self::TaskNotFound => &["The task id belongs to another connection or was closed"],
            Self::TaskTimeout => &["Increase the step's duration"],
            Self::TaskTerminated => &["The task was cancelled before it finished"],
            Self::TaskPoolClosed => &["Tasks cannot start after the run has shut down"],

            Self::StepFailed => &[
                "Inspect the step's output in command_outputs/",
                "Increase loop to allow more attempts",
            ],
            Self::StepTimeout => &["Increase the step's duration"],
            Self::StepTypeUnknown => &[
                "Use one of: command_execution, log_analysis, invoke_scenario",
            ],
            Self::StepValidationMismatch => &[
                "Compare expected_output with the saved command output",
            ],
            Self::ContainerStartFailed => &[
                "Check docker is installed and the image is available",
                "Remove any stale container with the same name",
            ],

            Self::AnalysisInvalidRegex => &["Fix the pattern syntax"],
            Self::AnalysisRuleConflict => &["Keep only one of search_string and diagnostic_search_string"],
            Self::AnalysisRuleMissingCode => &["Add diagnostic_result_code to the rule"],
            Self::ExpressionInvalid => &[
                "Expressions support names, literals, comparisons, and/or/not and parentheses",
                "Make sure every referenced name is set by an earlier step",
            ],
            Self::AnalysisLogEmpty => &["Check log_analysis_path points to an existing, non-empty log"],

            Self::InternalResultsWrite => &["Check the workspace directory is writable"],
            Self::InternalStepUnknown => &["Report this as a bug"],
            Self::InternalLoggingError => &["Check the log directory is writable"],
        }
    }

    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigParseError,
            Self::ConfigEnvError,
            Self::ConfigConnectionMissing,
            Self::ScenarioLoadError,
            Self::ScenarioInvalidStep,
            Self::ScenarioCycle,
            Self::ConnectionFailed,
            Self::ConnectionCommandFailed,
            Self::RedfishRequestFailed,
            Self::TunnelStartFailed,
            Self::TransferFailed,
            Self::ConnectionTypeUnsupported,
            Self::TaskNotFound,
            Self::TaskTimeout,
            Self::TaskTerminated,
            Self::TaskPoolClosed,
            Self::StepFailed,
            Self::StepTimeout,
            Self::StepTypeUnknown,
            Self::StepValidationMismatch,
            Self::ContainerStartFailed,
            Self::AnalysisInvalidRegex,
            Self::AnalysisRuleConflict,
            Self::AnalysisRuleMissingCode,
            Self::ExpressionInvalid,
            Self::AnalysisLogEmpty,
            Self::InternalResultsWrite,
            Self::InternalStepUnknown,
            Self::InternalLoggingError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Connection,
    Task,
    Step,
    Analysis,
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Connection => "Connection",
            Self::Task => "Task",
            Self::Step => "Step",
            Self::Analysis => "Analysis",
            Self::Internal => "Internal",
        }
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Config => "Connection configuration, environment and scenario files",
            Self::Connection => "SSH, Redfish, tunnel and local transports",
            Self::Task => "Background task lifecycle",
            Self::Step => "Step execution and output validation",
            Self::Analysis => "Output and diagnostic analysis rules",
            Self::Internal => "Internal errors that may indicate bugs",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("\nRemediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            assert!(
                seen.insert(code.code_number()),
                "Duplicate error code number for {code:?}"
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "HWV-E001");
        assert_eq!(ErrorCode::ConnectionFailed.code_string(), "HWV-E100");
        assert_eq!(ErrorCode::TaskNotFound.code_string(), "HWV-E200");
        assert_eq!(ErrorCode::StepFailed.code_string(), "HWV-E300");
        assert_eq!(ErrorCode::AnalysisInvalidRegex.code_string(), "HWV-E400");
        assert_eq!(ErrorCode::InternalResultsWrite.code_string(), "HWV-E500");
    }

    #[test]
    fn test_category_ranges() {
        for code in ErrorCode::all() {
            let expected = match code.code_number() {
                1..=99 => ErrorCategory::Config,
                100..=199 => ErrorCategory::Connection,
                200..=299 => ErrorCategory::Task,
                300..=399 => ErrorCategory::Step,
                400..=499 => ErrorCategory::Analysis,
                _ => ErrorCategory::Internal,
            };
            assert_eq!(code.category(), expected, "{code:?}");
        }
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{code:?}");
            assert!(!code.remediation().is_empty(), "{code:?}");
        }
    }

    #[test]
    fn test_format_full_and_brief() {
        let entry = ErrorCode::AnalysisRuleConflict.entry();
        let full = entry.format_full();
        assert!(full.starts_with("[HWV-E401]"));
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("  1. "));
        assert_eq!(entry.to_string(), entry.format_brief());
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::TaskTimeout).unwrap();
        assert_eq!(json, "\"TASK_TIMEOUT\"");
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCode::TaskTimeout);
    }
}
