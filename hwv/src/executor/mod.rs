//! Step handlers keyed by `step_type`.
//!
//! A handler returns `Ok` with a pass/fail [`StepOutcome`] for anything it can
//! judge, and `Err` for failures worth retrying (I/O, transport setup,
//! malformed rules). The step executor owns the retry loop.

pub mod command;
pub mod invoke;
pub mod log_analysis;

pub use command::CommandExecutor;
pub use invoke::ScenarioInvoker;
pub use log_analysis::LogAnalyzer;

use crate::analysis::{AnalysisScope, analyze_step};
use crate::connection::Connection;
use crate::engine::Engine;
use async_trait::async_trait;
use hwv_common::errors::{Coded, ErrorCode};
use hwv_common::{Step, StepType};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub output: String,
    pub passed: bool,
    pub message: String,
}

impl StepOutcome {
    pub fn passed(output: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            passed: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            passed: false,
            message: message.into(),
        }
    }
}

/// What a handler gets besides the step itself.
#[derive(Clone, Copy)]
pub struct StepEnv<'a> {
    pub engine: &'a Engine,
    /// `test_id` of the scenario that owns the step.
    pub scenario_id: &'a str,
    /// Validating a continued step rather than starting it.
    pub validate_continue: bool,
    /// `test_id`s of the scenarios currently being run, outermost first.
    pub ancestry: &'a [String],
}

impl StepEnv<'_> {
    pub fn analysis_scope<'s>(&'s self, step_id: &'s str) -> AnalysisScope<'s> {
        AnalysisScope {
            test_id: self.scenario_id,
            step_id,
            context: &self.engine.context,
            results: &self.engine.results,
        }
    }
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, step: &Step, env: &StepEnv<'_>) -> anyhow::Result<StepOutcome>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Unknown step type: {0}")]
    UnknownStepType(String),
}

impl Coded for ExecutorError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::StepTypeUnknown
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn StepHandler> + Send + Sync>;

/// `step_type` string to handler constructor.
pub struct ExecutorRegistry {
    factories: BTreeMap<String, HandlerFactory>,
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(StepType::CommandExecution.as_str(), || Box::new(CommandExecutor));
        registry.register(StepType::LogAnalysis.as_str(), || Box::new(LogAnalyzer));
        registry.register(StepType::InvokeScenario.as_str(), || Box::new(ScenarioInvoker));
        registry
    }
}

impl ExecutorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register (or replace) the handler for `step_type`.
    pub fn register<F>(&mut self, step_type: &str, factory: F)
    where
        F: Fn() -> Box<dyn StepHandler> + Send + Sync + 'static,
    {
        self.factories.insert(step_type.to_string(), Arc::new(factory));
    }

    pub fn create(&self, step_type: &str) -> Result<Box<dyn StepHandler>, ExecutorError> {
        self.factories
            .get(step_type)
            .map(|factory| factory())
            .ok_or_else(|| ExecutorError::UnknownStepType(step_type.to_string()))
    }

    pub fn step_types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

// ── Shared helpers ──────────────────────────────────────────────────────

/// Cached connection, connected if it is not yet.
pub(crate) async fn connected(
    engine: &Engine,
    name: &str,
    kind: &str,
) -> anyhow::Result<Result<Arc<dyn Connection>, String>> {
    let connection = engine.connections.get_connection(name, kind).await?;
    if !connection.is_connected() {
        info!(connection = %name, connection_type = %kind, "Connecting");
        if let Err(e) = connection.connect().await {
            warn!(connection = %name, connection_type = %kind, "Connect failed: {e}");
            return Ok(Err(format!("Failed to connect to {name} of type {kind}.")));
        }
    }
    Ok(Ok(connection))
}

/// Run the step's output and diagnostic rules over `text`.
pub(crate) fn run_analysis(step: &Step, text: &str, env: &StepEnv<'_>) -> anyhow::Result<()> {
    if step.output_analysis.is_empty() && step.diagnostic_analysis.is_empty() {
        return Ok(());
    }
    let scope = env.analysis_scope(&step.step_id);
    let report = analyze_step(step, text, &scope)?;
    info!(
        step_id = %step.step_id,
        parameters = ?report.parameters,
        codes = report.codes.len(),
        "Analysis complete"
    );
    Ok(())
}
