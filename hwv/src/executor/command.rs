//! `command_execution` steps.

use super::{StepEnv, StepHandler, StepOutcome, connected, run_analysis};
use crate::connection::CommandOptions;
use crate::context::ContinuedStep;
use crate::results::{StepStatus, round_millis};
use crate::task::{ExecutionMode, TaskStatus};
use crate::validator::{Validation, validate_output};
use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use hwv_common::{Step, sanitize_file_stem, shorten};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

pub const BACKGROUND_STARTED: &str =
    "Command execution started in background and will continue until completed.";

pub struct CommandExecutor;

/// `docker exec {container} ` prefix for steps that target a container.
pub fn container_command(step: &Step, command: &str) -> String {
    match step.container_name.as_deref().filter(|c| !c.is_empty()) {
        Some(container) => format!("docker exec {container} {command}"),
        None => command.to_string(),
    }
}

/// Expected output for the step: the file at `expected_output_path` wins over
/// the literal `expected_output`.
pub async fn expected_output(step: &Step) -> anyhow::Result<Option<Value>> {
    if let Some(path) = step.expected_output_path.as_deref().filter(|p| !p.is_empty()) {
        if step.expected_output.is_some() {
            info!(step_id = %step.step_id, "Both expected_output and expected_output_path given, using the file");
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read expected output file {path}"))?;
        return Ok(Some(Value::String(text)));
    }
    Ok(step
        .expected_output
        .clone()
        .filter(|v| !v.is_null() && v.as_str() != Some("")))
}

async fn validate(step: &Step, output: &str) -> anyhow::Result<Option<Validation>> {
    let Some(expected) = expected_output(step).await? else {
        return Ok(None);
    };
    let validation = validate_output(&expected, output);
    info!(
        step_id = %step.step_id,
        matched = validation.matched,
        "Output validation: {}",
        validation.reason
    );
    Ok(Some(validation))
}

fn command_options(step: &Step) -> CommandOptions {
    CommandOptions {
        timeout: step.timeout.map(Duration::from_secs),
        method: step.method.clone(),
        body: step.body.clone(),
        ..CommandOptions::default()
    }
}

async fn write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

impl CommandExecutor {
    async fn run_inline(
        &self,
        step: &Step,
        env: &StepEnv<'_>,
        command: &str,
        name: &str,
        kind: &str,
    ) -> anyhow::Result<StepOutcome> {
        let connection = match connected(env.engine, name, kind).await? {
            Ok(connection) => connection,
            Err(message) => return Ok(StepOutcome::failed(message)),
        };
        info!(connection = %name, connection_type = %kind, "Executing command: {}", hwv_common::mask_sensitive_command(command));
        let result = connection
            .execute_command(command, ExecutionMode::Synchronous, &command_options(step))
            .await;
        if result.stdout.is_empty() {
            error!(
                step_id = %step.step_id,
                status = %result.status,
                "Command execution failed: {}",
                shorten(result.stderr.trim(), 200)
            );
            return Ok(StepOutcome::failed("Command execution failed."));
        }

        let step_name = if step.step_name.is_empty() { "unnamed_step" } else { &step.step_name };
        let output_path = env.engine.workspace.command_outputs().join(format!(
            "{}_{}_{}.txt",
            env.scenario_id,
            step.step_id,
            sanitize_file_stem(step_name)
        ));
        write_text(&output_path, &result.stdout).await?;
        info!(path = %output_path.display(), "Command output written");

        run_analysis(step, &result.stdout, env)?;
        if let Some(validation) = validate(step, &result.stdout).await?
            && !validation.matched
        {
            return Ok(StepOutcome {
                output: result.stdout,
                passed: false,
                message: validation.reason,
            });
        }
        Ok(StepOutcome::passed(
            result.stdout,
            "Command executed successfully and output validated.",
        ))
    }

    async fn start_background(
        &self,
        step: &Step,
        env: &StepEnv<'_>,
        command: &str,
        name: &str,
        kind: &str,
    ) -> anyhow::Result<StepOutcome> {
        let connection = match connected(env.engine, name, kind).await? {
            Ok(connection) => connection,
            Err(message) => return Ok(StepOutcome::failed(message)),
        };
        let started = connection
            .execute_command(command, ExecutionMode::Background, &command_options(step))
            .await;
        if started.status == TaskStatus::Failed {
            return Ok(StepOutcome::failed(format!(
                "Failed to start background command: {}",
                started.stderr
            )));
        }
        env.engine.context.add_continued_step(ContinuedStep {
            scenario_id: env.scenario_id.to_string(),
            step: step.clone(),
            connection_name: name.to_string(),
            connection_type: kind.to_string(),
            task_id: started.task_id.clone(),
            validated: false,
        });
        info!(step_id = %step.step_id, task_id = %started.task_id, "Continued step started in background");
        Ok(StepOutcome::passed(String::new(), BACKGROUND_STARTED))
    }

    /// Collect a background step's result and rewrite its recorded outcome.
    async fn validate_continued(&self, step: &Step, env: &StepEnv<'_>) -> anyhow::Result<StepOutcome> {
        let engine = env.engine;
        let Some(info) = engine.context.continued_step(env.scenario_id, &step.step_id) else {
            return Ok(StepOutcome::failed(format!("Invalid step_id: {}", step.step_id)));
        };
        engine.context.mark_validated(env.scenario_id, &step.step_id);

        let connection = engine
            .connections
            .get_connection(&info.connection_name, &info.connection_type)
            .await?;
        let wait = step
            .duration
            .map(Duration::from_secs)
            .unwrap_or_else(|| engine.continue_wait());
        let result = connection.wait_for_task(&info.task_id, Some(wait)).await;
        info!(
            step_id = %step.step_id,
            task_id = %info.task_id,
            status = %result.status,
            "Continued step finished waiting"
        );

        let dir = engine.workspace.continued_steps();
        write_text(&dir.join(format!("{}_stdout.txt", step.step_id)), &result.stdout).await?;
        write_text(&dir.join(format!("{}_stderr.txt", step.step_id)), &result.stderr).await?;

        run_analysis(step, &result.stdout, env)?;
        let validation = validate(step, &result.stdout).await?;

        let completed = result.status == TaskStatus::Completed;
        let (passed, message) = match (&validation, completed) {
            (Some(v), _) if !v.matched => (false, v.reason.clone()),
            (_, false) => (
                false,
                format!(
                    "Continued step {} ended {}: {}",
                    step.step_id,
                    result.status,
                    shorten(result.stderr.trim(), 200)
                ),
            ),
            (Some(v), true) => (true, v.reason.clone()),
            (None, true) => (true, format!("Validated continued step: {}", step.step_id)),
        };

        let status = if passed { StepStatus::Success } else { StepStatus::Fail };
        let task_status = result.status.as_str().to_string();
        let return_code = result.return_code;
        let updated = engine.results.update_step_result(env.scenario_id, &step.step_id, |r| {
            let since_start = (Utc::now() - r.recorded_at).num_milliseconds() as f64 / 1000.0;
            r.status = status;
            r.message = message.clone();
            r.duration = round_millis(r.duration + since_start.max(0.0));
            r.extra.insert("task_status".into(), Value::from(task_status));
            r.extra.insert("return_code".into(), return_code.map_or(Value::Null, Value::from));
        });
        if let Err(e) = updated {
            warn!(step_id = %step.step_id, "{e}");
        }

        Ok(StepOutcome {
            output: result.stdout,
            passed,
            message,
        })
    }
}

#[async_trait]
impl StepHandler for CommandExecutor {
    async fn execute(&self, step: &Step, env: &StepEnv<'_>) -> anyhow::Result<StepOutcome> {
        let Some(command) = step.step_command.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(StepOutcome::failed("No command provided in step data."));
        };
        if env.validate_continue {
            return self.validate_continued(step, env).await;
        }

        let (Some(name), Some(kind)) = (step.connection.as_deref(), step.connection_type.as_deref())
        else {
            return Ok(StepOutcome::failed(
                "Connection name or type not provided in step data.",
            ));
        };
        let command = container_command(step, command);
        if step.run_in_background {
            self.start_background(step, env, &command, name, kind).await
        } else {
            self.run_inline(step, env, &command, name, kind).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(value: Value) -> Step {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_container_prefix() {
        let s = step(json!({"step_id": "1", "step_type": "command_execution", "container_name": "helper"}));
        assert_eq!(container_command(&s, "ls /"), "docker exec helper ls /");
        let s = step(json!({"step_id": "1", "step_type": "command_execution"}));
        assert_eq!(container_command(&s, "ls /"), "ls /");
    }

    #[tokio::test]
    async fn test_expected_output_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expected.txt");
        std::fs::write(&path, "from file").unwrap();
        let s = step(json!({
            "step_id": "1",
            "step_type": "command_execution",
            "expected_output": "literal",
            "expected_output_path": path.to_str().unwrap()
        }));
        assert_eq!(expected_output(&s).await.unwrap(), Some(json!("from file")));

        let s = step(json!({"step_id": "1", "step_type": "command_execution", "expected_output": ""}));
        assert_eq!(expected_output(&s).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_expected_file_is_an_error() {
        let s = step(json!({
            "step_id": "1",
            "step_type": "command_execution",
            "expected_output_path": "/nonexistent/expected.txt"
        }));
        assert!(expected_output(&s).await.is_err());
    }
}
