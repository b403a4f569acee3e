//! Scenario files: loading and discovery.

use hwv_common::errors::{Coded, ErrorCode};
use hwv_common::{Scenario, ScenarioFile};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML scenario {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Invalid JSON scenario {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Scenario {path} has a step without step_id")]
    EmptyStepId { path: PathBuf },
}

impl Coded for LoadError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::EmptyStepId { .. } => ErrorCode::ScenarioInvalidStep,
            _ => ErrorCode::ScenarioLoadError,
        }
    }
}

fn is_scenario_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml" | "yml" | "json")
    )
}

/// Load a scenario from YAML or JSON (by extension); the root key is `test_scenario`.
pub fn load_scenario_file(path: &Path) -> Result<Scenario, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let file: ScenarioFile = if is_json {
        serde_json::from_str(&text).map_err(|source| LoadError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        serde_yaml_ng::from_str(&text).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?
    };

    let scenario = file.test_scenario;
    let mut seen = HashSet::new();
    for step in &scenario.test_steps {
        if step.step_id.trim().is_empty() {
            return Err(LoadError::EmptyStepId {
                path: path.to_path_buf(),
            });
        }
        if !seen.insert(step.step_id.as_str()) {
            warn!(path = %path.display(), step_id = %step.step_id, "Duplicate step_id in scenario");
        }
    }
    Ok(scenario)
}

/// Which scenarios a run or listing selects. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioFilter {
    pub test_id: Option<String>,
    /// Case-insensitive substring of `test_name`.
    pub test_name: Option<String>,
    pub test_group: Option<String>,
    /// Matches when the scenario carries any of these tags.
    pub tags: Vec<String>,
}

impl ScenarioFilter {
    pub fn matches(&self, scenario: &Scenario) -> bool {
        if let Some(id) = &self.test_id
            && &scenario.test_id != id
        {
            return false;
        }
        if let Some(name) = &self.test_name
            && !scenario
                .test_name
                .to_lowercase()
                .contains(&name.to_lowercase())
        {
            return false;
        }
        if let Some(group) = &self.test_group
            && &scenario.test_group != group
        {
            return false;
        }
        self.tags.is_empty() || self.tags.iter().any(|t| scenario.tags.contains(t))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredScenario {
    pub path: PathBuf,
    pub scenario: Scenario,
}

/// Every loadable scenario under `dir` matching `filter`, in path order.
///
/// Files that are not scenarios (connection documents, fixtures) are skipped.
pub fn discover_scenarios(dir: &Path, filter: &ScenarioFilter) -> Result<Vec<DiscoveredScenario>, LoadError> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut found = Vec::new();
    for path in files {
        match load_scenario_file(&path) {
            Ok(scenario) if filter.matches(&scenario) => found.push(DiscoveredScenario { path, scenario }),
            Ok(scenario) => debug!(path = %path.display(), test_id = %scenario.test_id, "Filtered out"),
            Err(e) => debug!("Skipping {}: {e}", path.display()),
        }
    }
    Ok(found)
}

/// `(connection, connection_type)` pairs a scenario uses, following
/// `invoke_scenario` steps into the files they name.
pub fn required_connections(scenario: &Scenario) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut visited = HashSet::from([scenario.test_id.clone()]);
    collect_connections(scenario, &mut pairs, &mut visited);
    pairs
}

fn collect_connections(scenario: &Scenario, pairs: &mut Vec<(String, String)>, visited: &mut HashSet<String>) {
    for container in &scenario.docker {
        let pair = (container.connection.clone(), container.connection_type.clone());
        if !pairs.contains(&pair) {
            pairs.push(pair);
        }
    }
    for step in &scenario.test_steps {
        if let (Some(name), Some(kind)) = (&step.connection, &step.connection_type) {
            let pair = (name.clone(), kind.clone());
            if !pairs.contains(&pair) {
                pairs.push(pair);
            }
        }
        if let Some(path) = &step.scenario_path
            && let Ok(nested) = load_scenario_file(Path::new(path))
            && visited.insert(nested.test_id.clone())
        {
            collect_connections(&nested, pairs, visited);
        }
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if is_scenario_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
test_scenario:
  test_id: T1
  test_name: Memory Stress
  test_group: memory
  tags: [smoke]
  test_steps:
    - step_id: "1"
      step_type: command_execution
      step_command: echo ok
"#;

    #[test]
    fn test_load_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("t1.yaml");
        std::fs::write(&yaml, YAML).unwrap();
        assert_eq!(load_scenario_file(&yaml).unwrap().test_id, "T1");

        let json = dir.path().join("t2.json");
        std::fs::write(
            &json,
            r#"{"test_scenario": {"test_id": 2, "test_steps": [{"step_id": 1, "step_type": "log_analysis"}]}}"#,
        )
        .unwrap();
        let scenario = load_scenario_file(&json).unwrap();
        assert_eq!(scenario.test_id, "2");
        assert_eq!(scenario.test_steps[0].step_id, "1");
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "test_scenario: [").unwrap();
        assert!(matches!(load_scenario_file(&bad), Err(LoadError::Yaml { .. })));
        let err = load_scenario_file(&dir.path().join("missing.yaml")).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ScenarioLoadError);
    }

    #[test]
    fn test_filter() {
        let scenario = serde_yaml_ng::from_str::<ScenarioFile>(YAML).unwrap().test_scenario;
        assert!(ScenarioFilter::default().matches(&scenario));
        let by_name = ScenarioFilter { test_name: Some("stress".into()), ..Default::default() };
        assert!(by_name.matches(&scenario));
        let by_tag = ScenarioFilter { tags: vec!["nightly".into(), "smoke".into()], ..Default::default() };
        assert!(by_tag.matches(&scenario));
        let wrong_group = ScenarioFilter { test_group: Some("cpu".into()), ..Default::default() };
        assert!(!wrong_group.matches(&scenario));
    }

    #[test]
    fn test_required_connections_follow_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested.yaml");
        std::fs::write(
            &nested,
            r#"
test_scenario:
  test_id: N1
  test_steps:
    - step_id: "1"
      step_type: command_execution
      connection: RackManager
      connection_type: redfish
"#,
        )
        .unwrap();
        let parent = format!(
            r#"
test_scenario:
  test_id: P1
  test_steps:
    - step_id: "1"
      step_type: command_execution
      connection: Inband
      connection_type: ssh
    - step_id: "2"
      step_type: invoke_scenario
      scenario_path: {}
"#,
            nested.display()
        );
        let scenario = serde_yaml_ng::from_str::<ScenarioFile>(&parent).unwrap().test_scenario;
        assert_eq!(
            required_connections(&scenario),
            vec![
                ("Inband".to_string(), "ssh".to_string()),
                ("RackManager".to_string(), "redfish".to_string()),
            ]
        );
    }

    #[test]
    fn test_discover_recurses_and_skips_non_scenarios() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/t1.yml"), YAML).unwrap();
        std::fs::write(dir.path().join("conn.json"), r#"{"Inband": {}}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_scenarios(dir.path(), &ScenarioFilter::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].scenario.test_id, "T1");

        let none = discover_scenarios(
            dir.path(),
            &ScenarioFilter { test_id: Some("T9".into()), ..Default::default() },
        )
        .unwrap();
        assert!(none.is_empty());
    }
}
