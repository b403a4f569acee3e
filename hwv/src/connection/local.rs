//! Commands on the orchestrating host.

use super::{CommandOptions, Connection, ConnectionError, dispatch};
use crate::pool::WorkerPool;
use crate::process::{self, ProcessSpec};
use crate::task::{ExecutionMode, TaskRegistry, TaskResult};
use async_trait::async_trait;
use hwv_common::ConnectionType;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

pub struct LocalConnection {
    name: String,
    sudo_password: Option<String>,
    command_timeout: Duration,
    connected: AtomicBool,
    tasks: TaskRegistry,
}

impl LocalConnection {
    pub fn new(
        name: &str,
        sudo_password: Option<String>,
        command_timeout: Duration,
        pool: WorkerPool,
    ) -> Self {
        Self {
            name: name.to_string(),
            sudo_password,
            command_timeout,
            connected: AtomicBool::new(false),
            tasks: TaskRegistry::new(&format!("{name}_local"), pool),
        }
    }

    /// `sh -c`, with `sudo` rewritten to read the password from stdin.
    fn spec_for(&self, command: &str, options: &CommandOptions) -> ProcessSpec {
        let password = options
            .sudo_password
            .as_ref()
            .or(self.sudo_password.as_ref());
        match (command.strip_prefix("sudo "), password) {
            (Some(rest), Some(password)) => {
                ProcessSpec::shell(&format!("sudo -S -p '' {rest}"))
                    .stdin(format!("{password}\n"))
                    .display(command)
            }
            _ => ProcessSpec::shell(command),
        }
    }
}

async fn copy_file(from: &Path, to: &Path) -> Result<(), ConnectionError> {
    let transfer_err = |reason: String| ConnectionError::Transfer {
        from: from.display().to_string(),
        to: to.display().to_string(),
        reason,
    };
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| transfer_err(e.to_string()))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| transfer_err(e.to_string()))?;
    Ok(())
}

#[async_trait]
impl Connection for LocalConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConnectionType {
        ConnectionType::Local
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            debug!(connection = %self.name, "Local connection ready");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let closed = self.tasks.cleanup_all().await;
            info!(connection = %self.name, tasks = closed, "Closed local connection");
        }
    }

    async fn execute_command(
        &self,
        command: &str,
        mode: ExecutionMode,
        options: &CommandOptions,
    ) -> TaskResult {
        let spec = self.spec_for(command, options);
        debug!(connection = %self.name, ?mode, command = %spec.display, "Executing local command");
        let display = spec.display.clone();
        let worker_spec = spec.clone();
        dispatch(
            &self.tasks,
            &display,
            mode,
            options,
            self.command_timeout,
            |timeout| async move { process::run_to_completion(&spec, timeout).await },
            move |control| process::run_controlled(worker_spec, control, None),
        )
        .await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError> {
        copy_file(local, &PathBuf::from(remote)).await
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ConnectionError> {
        copy_file(&PathBuf::from(remote), local).await
    }

    fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    fn local() -> LocalConnection {
        LocalConnection::new("local", None, Duration::from_secs(30), WorkerPool::new(2))
    }

    #[tokio::test]
    async fn test_synchronous_echo() {
        let conn = local();
        conn.connect().await.unwrap();
        let result = conn
            .execute_command("echo ok", ExecutionMode::Synchronous, &CommandOptions::default())
            .await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_background_then_wait() {
        let conn = local();
        let started = conn
            .execute_command("sleep 0.2; echo done", ExecutionMode::Background, &CommandOptions::default())
            .await;
        assert_eq!(started.status, TaskStatus::Running);

        let done = conn
            .wait_for_task(&started.task_id, Some(Duration::from_secs(10)))
            .await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.stdout.trim(), "done");
    }

    #[tokio::test]
    async fn test_background_wait_times_out() {
        let conn = local();
        let options = CommandOptions::default().with_timeout(Duration::from_millis(300));
        let result = conn
            .execute_command("echo partial; sleep 30", ExecutionMode::BackgroundWait, &options)
            .await;
        assert_eq!(result.status, TaskStatus::Timeout);
        assert!(result.stdout.contains("partial"));
        assert!(result.stderr.contains("Task timed out after"));
    }

    #[tokio::test]
    async fn test_terminate_background_sleep() {
        let conn = local();
        let started = conn
            .execute_command("sleep 30", ExecutionMode::Background, &CommandOptions::default())
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conn.terminate_task(&started.task_id).await);
        let result = conn.wait_for_task(&started.task_id, None).await;
        assert_eq!(result.status, TaskStatus::Terminated);
        assert!(!conn.terminate_task(&started.task_id).await);
    }

    #[tokio::test]
    async fn test_sudo_rewrite_feeds_password() {
        let conn = LocalConnection::new(
            "local",
            Some("pw".into()),
            Duration::from_secs(5),
            WorkerPool::new(1),
        );
        let spec = conn.spec_for("sudo dmesg", &CommandOptions::default());
        assert_eq!(spec.args[1], "sudo -S -p '' dmesg");
        assert_eq!(spec.stdin.as_deref(), Some("pw\n"));
        assert_eq!(conn.spec_for("dmesg", &CommandOptions::default()).stdin, None);
    }

    #[tokio::test]
    async fn test_download_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.log");
        std::fs::write(&src, "line\n").unwrap();
        let dst = dir.path().join("nested/dst.log");

        local()
            .download_file(src.to_str().unwrap(), &dst)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dst).unwrap(), "line\n");
    }
}
