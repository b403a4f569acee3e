//! `log_analysis` steps.

use super::{StepEnv, StepHandler, StepOutcome, connected, run_analysis};
use async_trait::async_trait;
use hwv_common::{Step, shorten};
use std::path::PathBuf;
use tracing::{debug, info};

/// Marker that points a log path at this run's captured command outputs.
pub const CURRENT_LOG_DIR: &str = "current_log_dir";

pub struct LogAnalyzer;

/// Local path for a `current_log_dir/<file>` reference, if `path` is one.
pub fn resolve_current_log(path: &str, command_outputs: PathBuf) -> Option<PathBuf> {
    let (_, rest) = path.rsplit_once(CURRENT_LOG_DIR)?;
    Some(command_outputs.join(rest.trim_start_matches(['/', '\\'])))
}

#[async_trait]
impl StepHandler for LogAnalyzer {
    async fn execute(&self, step: &Step, env: &StepEnv<'_>) -> anyhow::Result<StepOutcome> {
        let Some(log_path) = step.log_analysis_path.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(StepOutcome::failed("Log path is required for LogAnalyzer step."));
        };
        let workspace = &env.engine.workspace;

        let local = match resolve_current_log(log_path, workspace.command_outputs()) {
            Some(local) => {
                info!(path = %local.display(), "Resolved log path");
                local
            }
            None => {
                let name = step.connection.as_deref().unwrap_or("local");
                let kind = step.connection_type.as_deref().unwrap_or("local");
                let connection = match connected(env.engine, name, kind).await? {
                    Ok(connection) => connection,
                    Err(message) => return Ok(StepOutcome::failed(message)),
                };
                let local = workspace
                    .step_logs()
                    .join(format!("{}_log_analyzer.log", step.step_id));
                tokio::fs::create_dir_all(workspace.step_logs()).await?;
                connection.download_file(log_path, &local).await?;
                info!(remote = %log_path, path = %local.display(), "Log downloaded");
                local
            }
        };

        let content = tokio::fs::read_to_string(&local).await.unwrap_or_default();
        if content.is_empty() {
            return Ok(StepOutcome::failed(format!(
                "Log file {} is empty or missing.",
                local.display()
            )));
        }
        debug!(step_id = %step.step_id, "Log content: {}", shorten(&content, 100));

        run_analysis(step, &content, env)?;
        Ok(StepOutcome::passed(content, "Log analyzed successfully."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_current_log() {
        let base = PathBuf::from("/ws/command_outputs");
        assert_eq!(
            resolve_current_log("current_log_dir/T1_1_dmesg.txt", base.clone()),
            Some(PathBuf::from("/ws/command_outputs/T1_1_dmesg.txt"))
        );
        assert_eq!(
            resolve_current_log("logs/current_log_dir\\a.txt", base.clone()),
            Some(PathBuf::from("/ws/command_outputs/a.txt"))
        );
        assert_eq!(resolve_current_log("/var/log/syslog", base), None);
    }
}
