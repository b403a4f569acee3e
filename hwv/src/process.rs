//! Child-process driver shared by the local and SSH transports.
//!
//! Children run in their own process group so a timeout or stop can signal
//! the whole tree (`kill -SIG -- -pgid`). Output is pumped into a [`TaskIo`]
//! buffer as it arrives, which is what lets a killed task report partial
//! output.

use crate::task::{StopPhase, TaskControl, TaskIo, TaskOutcome, TaskResult, TaskStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Upper bound on draining pipes after the child is gone.
const READER_DRAIN: Duration = Duration::from_secs(1);

/// Transport hook run alongside the local SIGINT on a graceful stop.
#[async_trait]
pub trait RemoteInterrupt: Send + Sync {
    async fn interrupt(&self);
}

/// A command line to spawn.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Option<String>,
    /// Masked form used in logs and results.
    pub display: String,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            display: program.clone(),
            program,
            ..Default::default()
        }
    }

    /// `sh -c {command}`.
    pub fn shell(command: &str) -> Self {
        Self::new("sh").arg("-c").arg(command).display(command)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn display(mut self, display: &str) -> Self {
        self.display = hwv_common::mask_sensitive_command(display);
        self
    }
}

enum Ending {
    Exited(i32),
    TimedOut,
    Stopped,
    SpawnFailed(String),
}

fn spawn(spec: &ProcessSpec) -> std::io::Result<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            let _ = stdin.write_all(input.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }
    Ok(child)
}

fn pump<R>(reader: Option<R>, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut reader) = reader else {
            return;
        };
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&buf[..n]),
            }
        }
    })
}

/// Send `signal` to the process group led by `pid`.
async fn signal_group(pid: Option<u32>, signal: &str) {
    let Some(pid) = pid else {
        return;
    };
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!(pid, signal, "Failed to signal process group: {e}");
    }
}

async fn kill_child(child: &mut Child, pid: Option<u32>) {
    signal_group(pid, "KILL").await;
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Resolves when the stop phase moves past `seen`. Never resolves without a receiver.
async fn next_stop(stop: &mut Option<watch::Receiver<StopPhase>>, seen: StopPhase) -> StopPhase {
    let Some(rx) = stop else {
        return std::future::pending().await;
    };
    let next = rx.wait_for(|phase| *phase > seen).await.map(|phase| *phase);
    match next {
        Ok(phase) => phase,
        Err(_) => std::future::pending().await,
    }
}

async fn sleep_opt(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn drive(
    spec: &ProcessSpec,
    io: &TaskIo,
    mut stop: Option<watch::Receiver<StopPhase>>,
    timeout: Option<Duration>,
    interrupter: Option<Arc<dyn RemoteInterrupt>>,
) -> Ending {
    let mut child = match spawn(spec) {
        Ok(child) => child,
        Err(e) => return Ending::SpawnFailed(format!("Failed to start {}: {e}", spec.program)),
    };
    let pid = child.id();
    debug!(pid, command = %spec.display, "Spawned process");
    let readers = [
        pump(child.stdout.take(), Arc::clone(&io.stdout)),
        pump(child.stderr.take(), Arc::clone(&io.stderr)),
    ];

    let deadline = sleep_opt(timeout);
    tokio::pin!(deadline);
    let mut seen = StopPhase::None;
    let ending = loop {
        tokio::select! {
            status = child.wait() => {
                break Ending::Exited(status.ok().and_then(|s| s.code()).unwrap_or(-1));
            }
            _ = &mut deadline => {
                kill_child(&mut child, pid).await;
                break Ending::TimedOut;
            }
            phase = next_stop(&mut stop, seen) => {
                seen = phase;
                match phase {
                    StopPhase::Interrupt => {
                        signal_group(pid, "INT").await;
                        if let Some(remote) = &interrupter {
                            remote.interrupt().await;
                        }
                    }
                    StopPhase::Kill => {
                        kill_child(&mut child, pid).await;
                        break Ending::Stopped;
                    }
                    StopPhase::None => {}
                }
            }
        }
    };

    for reader in readers {
        if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
            debug!(pid, "Output reader still open after process exit");
        }
    }
    ending
}

/// Run to completion under `timeout`.
///
/// Exit code 0 is COMPLETED, anything else FAILED. On timeout the process
/// group is killed and the result is TIMEOUT with return code -1 and whatever
/// output was produced.
pub async fn run_to_completion(spec: &ProcessSpec, timeout: Duration) -> TaskResult {
    let start_time = Utc::now();
    let started = Instant::now();
    let io = TaskIo::default();
    let ending = drive(spec, &io, None, Some(timeout), None).await;
    let (stdout, stderr) = io.snapshot();

    let (status, return_code, stderr) = match ending {
        Ending::Exited(code) => {
            let status = if code == 0 {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            (status, code, stderr)
        }
        Ending::TimedOut => {
            warn!(command = %spec.display, "Command timed out after {}s", timeout.as_secs());
            let note = format!("Command timed out after {} seconds", timeout.as_secs());
            let stderr = if stderr.trim().is_empty() {
                note
            } else {
                format!("{}\n{note}", stderr.trim_end())
            };
            (TaskStatus::Timeout, -1, stderr)
        }
        Ending::Stopped => (TaskStatus::Terminated, -1, stderr),
        Ending::SpawnFailed(message) => (TaskStatus::Failed, -1, message),
    };

    TaskResult {
        task_id: Uuid::new_v4().to_string(),
        command: spec.display.clone(),
        status,
        return_code: Some(return_code),
        stdout,
        stderr,
        start_time,
        end_time: Some(Utc::now()),
        execution_time: Some(started.elapsed().as_secs_f64()),
    }
}

/// Run as a background task worker, honoring stop requests from the registry.
pub async fn run_controlled(
    spec: ProcessSpec,
    control: TaskControl,
    interrupter: Option<Arc<dyn RemoteInterrupt>>,
) -> TaskOutcome {
    let TaskControl { io, stop, .. } = control;
    let ending = drive(&spec, &io, Some(stop), None, interrupter).await;
    let (stdout, stderr) = io.snapshot();
    match ending {
        Ending::Exited(code) => TaskOutcome::from_exit(Some(code), stdout, stderr),
        Ending::TimedOut => TaskOutcome {
            status: TaskStatus::Timeout,
            return_code: Some(-1),
            stdout,
            stderr,
        },
        Ending::Stopped => TaskOutcome {
            status: TaskStatus::Terminated,
            return_code: Some(-1),
            stdout,
            stderr,
        },
        Ending::SpawnFailed(message) => TaskOutcome::failed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_to_completion_success() {
        let result = run_to_completion(&ProcessSpec::shell("echo ok"), Duration::from_secs(10)).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.return_code, Some(0));
        assert_eq!(result.stdout.trim(), "ok");
    }

    #[tokio::test]
    async fn test_run_to_completion_nonzero_exit() {
        let result =
            run_to_completion(&ProcessSpec::shell("echo bad >&2; exit 3"), Duration::from_secs(10))
                .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.return_code, Some(3));
        assert_eq!(result.stderr.trim(), "bad");
    }

    #[tokio::test]
    async fn test_run_to_completion_timeout_keeps_partial_output() {
        let started = Instant::now();
        let result = run_to_completion(
            &ProcessSpec::shell("echo early; sleep 30"),
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(result.status, TaskStatus::Timeout);
        assert_eq!(result.return_code, Some(-1));
        assert!(result.stdout.contains("early"));
        assert!(result.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let spec = ProcessSpec::new("cat").stdin("from stdin");
        let result = run_to_completion(&spec, Duration::from_secs(10)).await;
        assert_eq!(result.stdout, "from stdin");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_failed_result() {
        let spec = ProcessSpec::new("/nonexistent/hwv-binary");
        let result = run_to_completion(&spec, Duration::from_secs(5)).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.stderr.contains("Failed to start"));
    }

    #[test]
    fn test_display_is_masked() {
        let spec = ProcessSpec::shell("ipmitool PASSWORD=secret power status");
        assert!(!spec.display.contains("secret"));
        assert_eq!(spec.args[1], "ipmitool PASSWORD=secret power status");
    }

    #[tokio::test]
    async fn test_run_controlled_kill() {
        let (tx, rx) = watch::channel(StopPhase::None);
        let io = TaskIo::default();
        let control = TaskControl {
            task_id: "t".into(),
            io: io.clone(),
            stop: rx,
        };
        let handle = tokio::spawn(run_controlled(
            ProcessSpec::shell("echo started; sleep 30"),
            control,
            None,
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send_replace(StopPhase::Kill);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, TaskStatus::Terminated);
        assert!(outcome.stdout.contains("started"));
    }
}
