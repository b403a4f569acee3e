//! Scenario data model shared by the loader, executors and result exports.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Default wait window, in seconds, applied to continued steps without a `duration`.
pub const DEFAULT_CONTINUE_WAIT_SECS: u64 = 30;

/// Root document of a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub test_scenario: Scenario,
}

/// A named, tagged, ordered list of steps. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(deserialize_with = "string_or_number")]
    pub test_id: String,
    #[serde(default)]
    pub test_name: String,
    #[serde(default)]
    pub test_group: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub test_steps: Vec<Step>,
    /// Auxiliary containers started before the first step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docker: Vec<ContainerSpec>,
}

/// One unit of work inside a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(deserialize_with = "string_or_number")]
    pub step_id: String,
    #[serde(default)]
    pub step_name: String,
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_analysis_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Maximum number of attempts.
    #[serde(rename = "loop", default = "default_loop_count")]
    pub loop_count: u32,
    /// Retry cutoff for inline steps, wait window for continued steps (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    /// Run the command in the background and validate it after the inline steps.
    #[serde(rename = "continue", default)]
    pub run_in_background: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_criteria: Vec<EntryCriterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_analysis: Vec<OutputRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostic_analysis: Vec<DiagnosticRule>,
    /// HTTP verb for Redfish steps (GET when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// JSON payload for Redfish POST/PUT/PATCH steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Per-command timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_loop_count() -> u32 {
    1
}

impl Step {
    /// Display name, falling back to the step id.
    pub fn display_name(&self) -> &str {
        if self.step_name.is_empty() {
            &self.step_id
        } else {
            &self.step_name
        }
    }

    /// Attempt budget, never below one.
    pub fn attempts(&self) -> u32 {
        self.loop_count.max(1)
    }
}

/// A boolean expression gating a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCriterion {
    #[serde(default)]
    pub expression: Option<String>,
}

/// Output analysis: set `parameter_to_set` to whether `regex` matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRule {
    pub regex: String,
    pub parameter_to_set: String,
}

/// Diagnostic analysis rule.
///
/// Either `search_string` with a fixed `diagnostic_result_code`, or
/// `diagnostic_search_string` with codes derived from capture groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_search_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_result_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_to_set: Option<String>,
}

/// Auxiliary container declared by a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub container_name: String,
    pub container_image: String,
    #[serde(default = "default_local")]
    pub connection: String,
    #[serde(default = "default_local")]
    pub connection_type: String,
    #[serde(default)]
    pub use_sudo: bool,
}

fn default_local() -> String {
    "local".to_string()
}

/// Built-in step types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    CommandExecution,
    LogAnalysis,
    InvokeScenario,
}

impl StepType {
    pub const ALL: [StepType; 3] = [
        StepType::CommandExecution,
        StepType::LogAnalysis,
        StepType::InvokeScenario,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CommandExecution => "command_execution",
            Self::LogAnalysis => "log_analysis",
            Self::InvokeScenario => "invoke_scenario",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport kind of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Ssh,
    Redfish,
    Local,
}

impl ConnectionType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Redfish => "redfish",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "redfish" => Ok(Self::Redfish),
            "local" => Ok(Self::Local),
            other => Err(format!("Unsupported connection type: {other}")),
        }
    }
}

/// Accept ids written either as strings or bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_defaults_and_renames() {
        let step: Step = serde_json::from_value(json!({
            "step_id": 3,
            "step_type": "command_execution",
            "continue": true,
            "loop": 4,
            "step_command": "echo ok"
        }))
        .unwrap();

        assert_eq!(step.step_id, "3");
        assert!(step.run_in_background);
        assert_eq!(step.loop_count, 4);
        assert_eq!(step.duration, None);
        assert_eq!(step.display_name(), "3");
    }

    #[test]
    fn test_loop_defaults_to_one() {
        let step: Step = serde_json::from_value(json!({
            "step_id": "s1",
            "step_type": "log_analysis"
        }))
        .unwrap();
        assert_eq!(step.loop_count, 1);
        assert!(!step.run_in_background);
    }

    #[test]
    fn test_zero_loop_still_attempts_once() {
        let step: Step = serde_json::from_value(json!({
            "step_id": "s1",
            "step_type": "log_analysis",
            "loop": 0
        }))
        .unwrap();
        assert_eq!(step.attempts(), 1);
    }

    #[test]
    fn test_scenario_from_yaml() {
        let yaml = r#"
test_scenario:
  test_id: T100
  test_name: Memory check
  test_group: memory
  tags: [smoke, dimm]
  docker:
    - container_name: helper
      container_image: alpine:3
  test_steps:
    - step_id: "1"
      step_name: Read dmesg
      step_type: command_execution
      connection: Inband
      connection_type: ssh
      step_command: dmesg
      diagnostic_analysis:
        - search_string: "EDAC"
          diagnostic_result_code: MEM001
"#;
        let file: ScenarioFile = serde_yaml_ng::from_str(yaml).unwrap();
        let scenario = file.test_scenario;
        assert_eq!(scenario.test_id, "T100");
        assert_eq!(scenario.tags, vec!["smoke", "dimm"]);
        assert_eq!(scenario.docker[0].connection, "local");
        assert_eq!(scenario.docker[0].connection_type, "local");
        let rule = &scenario.test_steps[0].diagnostic_analysis[0];
        assert_eq!(rule.search_string.as_deref(), Some("EDAC"));
        assert_eq!(rule.diagnostic_result_code.as_deref(), Some("MEM001"));
    }

    #[test]
    fn test_connection_type_parse() {
        assert_eq!("SSH".parse::<ConnectionType>(), Ok(ConnectionType::Ssh));
        assert_eq!(
            "redfish".parse::<ConnectionType>(),
            Ok(ConnectionType::Redfish)
        );
        assert!("telnet".parse::<ConnectionType>().is_err());
    }

    #[test]
    fn test_step_type_strings() {
        let names: Vec<_> = StepType::ALL.iter().map(StepType::as_str).collect();
        assert_eq!(
            names,
            vec!["command_execution", "log_analysis", "invoke_scenario"]
        );
    }
}
