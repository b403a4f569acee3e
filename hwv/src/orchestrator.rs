//! Top-level run of one scenario.
//!
//! Order of a run: metadata, containers, inline steps, continued-step
//! finalization, container teardown, worker pool shutdown.

use crate::containers::Containers;
use crate::engine::Engine;
use crate::runner::{ScenarioOutcome, ScenarioRunner};
use crate::step::StepExecutor;
use hwv_common::Scenario;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContinuedReport {
    pub scenario_id: String,
    pub step_id: String,
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub test_id: String,
    pub test_name: String,
    pub passed: bool,
    pub message: String,
    /// Absent when the run stopped before the first step.
    pub scenario: Option<ScenarioOutcome>,
    pub continued: Vec<ContinuedReport>,
    pub duration_secs: f64,
    pub journal: Option<PathBuf>,
}

pub struct Orchestrator {
    engine: Engine,
}

impl Orchestrator {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub async fn run(&self, scenario: &Scenario) -> RunReport {
        let started = Instant::now();
        let engine = &self.engine;
        self.build_metadata(scenario);

        if let Err(e) = engine.workspace.prepare() {
            warn!(workspace = %engine.workspace.root().display(), "Failed to prepare workspace: {e}");
        }
        let journal = match engine.journal.open(engine.workspace.root(), &scenario.test_id) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Run journal disabled: {e}");
                None
            }
        };
        engine.journal.run_start(&scenario.test_id, &scenario.test_name);

        let mut report = RunReport {
            test_id: scenario.test_id.clone(),
            test_name: scenario.test_name.clone(),
            passed: false,
            message: String::new(),
            scenario: None,
            continued: Vec::new(),
            duration_secs: 0.0,
            journal,
        };

        let mut containers = match Containers::start_all(engine, &scenario.docker).await {
            Ok(containers) => containers,
            Err(e) => {
                error!(test_id = %scenario.test_id, "{e}");
                report.message = e.to_string();
                engine.journal.run_end(&scenario.test_id, false, &report.message);
                engine.shutdown().await;
                report.duration_secs = started.elapsed().as_secs_f64();
                return report;
            }
        };

        info!(
            test_id = %scenario.test_id,
            "Running {} steps in scenario: {}",
            scenario.test_steps.len(),
            scenario.test_name
        );
        let outcome = ScenarioRunner::new(engine).run(scenario, &[]).await;

        info!("Finalizing continued steps");
        report.continued = self.finalize_continued().await;

        containers.stop_all().await;

        report.passed = outcome.passed && report.continued.iter().all(|c| c.passed);
        report.message = match report.continued.iter().find(|c| !c.passed) {
            Some(failed) if outcome.passed => format!(
                "Continued step {} failed: {}",
                failed.step_id, failed.message
            ),
            _ => outcome.message.clone(),
        };
        report.scenario = Some(outcome);
        engine.journal.run_end(&scenario.test_id, report.passed, &report.message);
        engine.shutdown().await;
        report.duration_secs = started.elapsed().as_secs_f64();
        info!(
            test_id = %scenario.test_id,
            passed = report.passed,
            "Test completed in {:.2} seconds",
            report.duration_secs
        );
        report
    }

    fn build_metadata(&self, scenario: &Scenario) {
        let context = &self.engine.context;
        context.set("test_id", scenario.test_id.clone());
        context.set("test_name", scenario.test_name.clone());
        context.set("test_group", scenario.test_group.clone());
        context.set("start_time", chrono::Utc::now().to_rfc3339());
        info!(test_id = %scenario.test_id, "Test metadata set");
    }

    /// Validate every continued step not yet validated, in registration order.
    ///
    /// A failure is recorded and the remaining steps are still finalized.
    /// Calling this again once everything is validated does nothing.
    pub async fn finalize_continued(&self) -> Vec<ContinuedReport> {
        let engine = &self.engine;
        let mut reports = Vec::new();
        for info in engine.context.continued_steps() {
            if info.validated {
                info!(scenario_id = %info.scenario_id, step_id = %info.step_id(), "Already validated, skipping");
                continue;
            }
            engine.context.set("scenario_id", info.scenario_id.clone());
            let chain = vec![info.scenario_id.clone()];
            let outcome = StepExecutor::new(engine, &info.scenario_id, &info.step, &chain)
                .run(true)
                .await;
            if outcome.passed {
                info!(step_id = %info.step_id(), "Continued step completed. Output snippet: {}", hwv_common::shorten(&outcome.output, 100));
            } else {
                error!(step_id = %info.step_id(), "Continued step failed: {}", outcome.message);
            }
            reports.push(ContinuedReport {
                scenario_id: info.scenario_id.clone(),
                step_id: info.step_id().to_string(),
                passed: outcome.passed,
                message: outcome.message,
            });
        }
        if reports.is_empty() {
            info!("No continued steps to finalize");
        }
        reports
    }
}
