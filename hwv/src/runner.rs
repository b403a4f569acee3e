//! Sequential execution of a scenario's steps.

use crate::engine::Engine;
use crate::step::StepExecutor;
use hwv_common::Scenario;
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioOutcome {
    pub test_id: String,
    pub passed: bool,
    pub message: String,
    /// Steps started, including the failing one.
    pub steps_run: usize,
    pub failed_step: Option<String>,
}

pub struct ScenarioRunner<'a> {
    engine: &'a Engine,
}

impl<'a> ScenarioRunner<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// `ancestry` lists the `test_id`s of the scenarios already running above
    /// this one; it is empty for a top-level run.
    pub async fn run(&self, scenario: &Scenario, ancestry: &[String]) -> ScenarioOutcome {
        self.engine.context.set("test_id", scenario.test_id.clone());
        let mut chain = ancestry.to_vec();
        chain.push(scenario.test_id.clone());

        info!(
            test_id = %scenario.test_id,
            depth = ancestry.len(),
            "Running scenario: {}",
            scenario.test_name
        );

        let mut steps_run = 0;
        for step in &scenario.test_steps {
            steps_run += 1;
            info!(step_id = %step.step_id, "Executing step: {}", step.display_name());
            let outcome = StepExecutor::new(self.engine, &scenario.test_id, step, &chain)
                .run(false)
                .await;
            if !outcome.passed {
                error!(
                    test_id = %scenario.test_id,
                    "Scenario '{}' stopped at step {}",
                    scenario.test_name,
                    step.step_id
                );
                return ScenarioOutcome {
                    test_id: scenario.test_id.clone(),
                    passed: false,
                    message: format!("Step execution failed: {}", outcome.message),
                    steps_run,
                    failed_step: Some(step.step_id.clone()),
                };
            }
            info!(step_id = %step.step_id, "Step '{}' completed successfully", step.display_name());
        }

        ScenarioOutcome {
            test_id: scenario.test_id.clone(),
            passed: true,
            message: "Scenario executed successfully.".to_string(),
            steps_run,
            failed_step: None,
        }
    }
}
