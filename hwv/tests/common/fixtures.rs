use hwv::{Engine, Orchestrator};
use hwv_common::{ConnectionsConfig, EngineConfig, Scenario, Sourced};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Scratch directory holding scenario files and the run workspace.
pub struct TestWorkspace {
    pub dir: TempDir,
    pub scenarios: PathBuf,
    pub output: PathBuf,
}

impl TestWorkspace {
    pub fn new() -> Self {
        crate::test_log!("FIXTURE: Creating test workspace");

        let dir = TempDir::new().expect("Failed to create temp dir");
        let scenarios = dir.path().join("scenarios");
        let output = dir.path().join("workspace");
        fs::create_dir_all(&scenarios).expect("Failed to create scenarios dir");

        Self {
            dir,
            scenarios,
            output,
        }
    }

    /// Write `yaml` to `scenarios/{name}`; `{dir}` is replaced by the scenarios directory.
    pub fn write_scenario(&self, name: &str, yaml: &str) -> PathBuf {
        let path = self.scenarios.join(name);
        let text = yaml.replace("{dir}", &self.scenarios.display().to_string());
        fs::write(&path, text).expect("Failed to write scenario");
        path
    }

    pub fn load(&self, name: &str) -> Scenario {
        hwv::loader::load_scenario_file(&self.scenarios.join(name)).expect("Failed to load scenario")
    }

    pub fn engine(&self) -> Engine {
        Engine::new(fast_config(), Arc::new(ConnectionsConfig::default()), &self.output)
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.engine())
    }
}

/// Defaults with short retry and continue windows.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry_backoff = Sourced::default_value(Duration::from_millis(10));
    config.continue_wait = Sourced::default_value(Duration::from_secs(10));
    config
}
