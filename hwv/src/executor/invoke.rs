//! `invoke_scenario` steps: run another scenario file inline.

use super::{StepEnv, StepHandler, StepOutcome};
use crate::loader::load_scenario_file;
use crate::runner::ScenarioRunner;
use anyhow::Context as _;
use async_trait::async_trait;
use hwv_common::Step;
use std::path::Path;
use tracing::{error, info};

pub struct ScenarioInvoker;

#[async_trait]
impl StepHandler for ScenarioInvoker {
    async fn execute(&self, step: &Step, env: &StepEnv<'_>) -> anyhow::Result<StepOutcome> {
        let Some(path) = step.scenario_path.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(StepOutcome::failed("Scenario path is required for ScenarioInvoker step."));
        };
        let scenario = load_scenario_file(Path::new(path))
            .with_context(|| format!("Failed to load invoked scenario {path}"))?;

        if env.ancestry.contains(&scenario.test_id) {
            let chain = env.ancestry.join(" -> ");
            error!(test_id = %scenario.test_id, "Recursive scenario invocation: {chain} -> {}", scenario.test_id);
            return Ok(StepOutcome::failed(format!(
                "Scenario {} invokes itself recursively ({chain} -> {})",
                scenario.test_id, scenario.test_id
            )));
        }

        info!(test_id = %scenario.test_id, path, "Invoking nested scenario");
        let parent_test_id = env.engine.context.test_id();
        let outcome = ScenarioRunner::new(env.engine)
            .run(&scenario, env.ancestry)
            .await;
        env.engine.context.set("test_id", parent_test_id);

        Ok(StepOutcome {
            output: String::new(),
            passed: outcome.passed,
            message: outcome.message,
        })
    }
}
