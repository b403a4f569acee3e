//! One step: entry criteria, the retry loop, and result recording.

use crate::artifacts::{Severity, Verdict};
use crate::engine::Engine;
use crate::executor::{StepEnv, StepOutcome};
use crate::expression;
use crate::results::{StepResult, StepStatus};
use hwv_common::Step;
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const ENTRY_CRITERIA_NOT_MET: &str = "Entry criteria not met";

pub struct StepExecutor<'a> {
    engine: &'a Engine,
    scenario_id: &'a str,
    step: &'a Step,
    ancestry: &'a [String],
}

impl<'a> StepExecutor<'a> {
    pub fn new(engine: &'a Engine, scenario_id: &'a str, step: &'a Step, ancestry: &'a [String]) -> Self {
        Self {
            engine,
            scenario_id,
            step,
            ancestry,
        }
    }

    /// Run the step and return its outcome. A skipped step counts as passed.
    ///
    /// With `validate_continue` the step is a background step being collected:
    /// entry criteria are not re-checked and no new result is recorded.
    pub async fn run(&self, validate_continue: bool) -> StepOutcome {
        let step = self.step;
        let journal = &self.engine.journal;
        journal.step_start(self.scenario_id, &step.step_id, step.display_name());

        if !validate_continue && !step.entry_criteria.is_empty() {
            let params = self.engine.context.parameters_to_set();
            let criteria = expression::evaluate_detailed(&step.entry_criteria, &params);
            if !criteria.met {
                info!(
                    step_id = %step.step_id,
                    unmet = ?criteria.unmet,
                    "[SKIP] Entry criteria not met, skipping step"
                );
                let keys: Map<String, Value> = params.into_iter().collect();
                let expressions: Vec<Value> = step
                    .entry_criteria
                    .iter()
                    .map(|c| c.expression.clone().map_or(Value::Null, Value::String))
                    .collect();
                self.record(
                    StepStatus::Skip,
                    0.0,
                    ENTRY_CRITERIA_NOT_MET,
                    Some(json!({
                        "entry_criteria": expressions,
                        "unmet": criteria.unmet,
                        "keys": keys,
                    })),
                );
                journal.diagnosis(self.scenario_id, &step.step_id, Verdict::Skipped, ENTRY_CRITERIA_NOT_MET);
                return StepOutcome::passed(String::new(), ENTRY_CRITERIA_NOT_MET);
            }
        }

        let started = Instant::now();
        let outcome = self.attempt_loop(validate_continue, started).await;
        let elapsed = started.elapsed().as_secs_f64();

        if !validate_continue {
            let status = if outcome.passed { StepStatus::Success } else { StepStatus::Fail };
            self.record(status, elapsed, &outcome.message, None);
        }
        let verdict = if outcome.passed { Verdict::Passed } else { Verdict::Failed };
        journal.diagnosis(self.scenario_id, &step.step_id, verdict, &outcome.message);
        if !outcome.passed {
            error!(step_id = %step.step_id, "Step failed: {}", outcome.message);
        }
        journal.step_end(
            self.scenario_id,
            &step.step_id,
            if outcome.passed { "success" } else { "fail" },
            elapsed,
            &outcome.message,
        );
        outcome
    }

    async fn attempt_loop(&self, validate_continue: bool, started: Instant) -> StepOutcome {
        let step = self.step;
        let handler = match self.engine.executors.create(&step.step_type) {
            Ok(handler) => handler,
            Err(e) => return StepOutcome::failed(e.to_string()),
        };
        let env = StepEnv {
            engine: self.engine,
            scenario_id: self.scenario_id,
            validate_continue,
            ancestry: self.ancestry,
        };

        let attempts = step.attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match handler.execute(step, &env).await {
                Ok(outcome) => return outcome,
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(step_id = %step.step_id, "[Attempt {attempt}] Step failed: {last_error}");
                    self.engine.journal.log(
                        Severity::Warning,
                        Some(&step.step_id),
                        &format!("[Attempt {attempt}] Step failed: {last_error}"),
                    );
                    if let Some(limit) = step.duration
                        && started.elapsed() > Duration::from_secs(limit)
                    {
                        error!(step_id = %step.step_id, "[TIMEOUT] Step did not complete within {limit} seconds");
                        return StepOutcome::failed(format!("Step timed out after {limit} seconds"));
                    }
                    if attempt < attempts {
                        tokio::time::sleep(self.engine.retry_backoff()).await;
                    }
                }
            }
        }
        StepOutcome::failed(last_error)
    }

    fn record(&self, status: StepStatus, duration: f64, message: &str, details: Option<Value>) {
        let step = self.step;
        let mut result = StepResult::new(
            self.scenario_id,
            &step.step_id,
            step.display_name(),
            &step.step_type,
            status,
            duration,
            message,
        );
        if let Some(details) = details {
            result = result.with_extra("details", details);
        }
        self.engine.results.add_step_result(result);
    }
}
