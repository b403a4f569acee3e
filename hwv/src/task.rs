//! Background task lifecycle.
//!
//! Every connection owns a [`TaskRegistry`]. Launching a task registers it
//! as RUNNING and hands a worker future to the shared [`WorkerPool`]. Exactly
//! one party records the terminal result: the worker on normal completion,
//! `terminate` (TERMINATED) or an expired `wait` (TIMEOUT). The party that
//! wins the per-task claim writes the result; everyone else observes it.

use crate::pool::WorkerPool;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay between the graceful interrupt and the forced kill on terminate.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(100);
/// How long a stop waits for the worker to exit after the forced kill.
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Synchronous,
    Background,
    BackgroundWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Timeout,
    Terminated,
}

impl TaskStatus {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one command or request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub command: String,
    pub status: TaskStatus,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end.
    pub execution_time: Option<f64>,
}

impl TaskResult {
    pub fn running(task_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            command: command.into(),
            status: TaskStatus::Running,
            return_code: None,
            stdout: String::new(),
            stderr: String::new(),
            start_time: Utc::now(),
            end_time: None,
            execution_time: None,
        }
    }

    /// Immediate failure that never reached the transport.
    pub fn failed(
        task_id: impl Into<String>,
        command: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            status: TaskStatus::Failed,
            return_code: Some(-1),
            stderr: stderr.into(),
            end_time: Some(now),
            execution_time: Some(0.0),
            ..Self::running(task_id, command)
        }
    }

    pub fn not_found(task_id: &str) -> Self {
        Self::failed(task_id, "", format!("Task {task_id} not found"))
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

// ── Worker side ─────────────────────────────────────────────────────────

/// Shared stdout/stderr buffers so a stopped task can still report partial output.
#[derive(Debug, Clone, Default)]
pub struct TaskIo {
    pub stdout: Arc<Mutex<Vec<u8>>>,
    pub stderr: Arc<Mutex<Vec<u8>>>,
}

impl TaskIo {
    pub fn snapshot(&self) -> (String, String) {
        let read = |buf: &Arc<Mutex<Vec<u8>>>| {
            String::from_utf8_lossy(&buf.lock().unwrap_or_else(|e| e.into_inner())).into_owned()
        };
        (read(&self.stdout), read(&self.stderr))
    }
}

/// Escalating stop request sent to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopPhase {
    None,
    Interrupt,
    Kill,
}

/// Handle given to a worker future.
pub struct TaskControl {
    pub task_id: String,
    pub io: TaskIo,
    pub stop: watch::Receiver<StopPhase>,
}

/// What a worker reports when its transport call finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl TaskOutcome {
    pub fn from_exit(code: Option<i32>, stdout: String, stderr: String) -> Self {
        Self {
            status: if code == Some(0) {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            return_code: code,
            stdout,
            stderr,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            return_code: Some(-1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────────

struct TaskShared {
    task_id: String,
    command: String,
    start_time: DateTime<Utc>,
    started: Instant,
    /// Set by whichever party records the terminal result.
    claimed: AtomicBool,
    /// Set by the worker once it holds a pool slot.
    started_work: AtomicBool,
    io: TaskIo,
    stop: watch::Sender<StopPhase>,
    exited: watch::Sender<bool>,
    result: watch::Sender<Option<TaskResult>>,
}

impl TaskShared {
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn build_result(&self, outcome: TaskOutcome) -> TaskResult {
        TaskResult {
            task_id: self.task_id.clone(),
            command: self.command.clone(),
            status: outcome.status,
            return_code: outcome.return_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            start_time: self.start_time,
            end_time: Some(Utc::now()),
            execution_time: Some(self.started.elapsed().as_secs_f64()),
        }
    }

    async fn wait_exited(&self, grace: Duration) -> bool {
        let mut exited = self.exited.subscribe();
        tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok()
    }
}

#[derive(Default)]
struct Tables {
    running: HashMap<String, Arc<TaskShared>>,
    completed: HashMap<String, TaskResult>,
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub command: String,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_for: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

enum Lookup {
    Done(TaskResult),
    Running(Arc<TaskShared>),
    Missing,
}

#[derive(Clone)]
pub struct TaskRegistry {
    owner: Arc<str>,
    pool: WorkerPool,
    tables: Arc<Mutex<Tables>>,
}

impl TaskRegistry {
    pub fn new(owner: &str, pool: WorkerPool) -> Self {
        Self {
            owner: Arc::from(owner),
            pool,
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, task_id: &str) -> Lookup {
        let tables = self.tables();
        if let Some(result) = tables.completed.get(task_id) {
            return Lookup::Done(result.clone());
        }
        match tables.running.get(task_id) {
            Some(shared) => Lookup::Running(Arc::clone(shared)),
            None => Lookup::Missing,
        }
    }

    /// Move a claimed task to the completed table and publish its result.
    fn record(&self, shared: &TaskShared, result: TaskResult) -> TaskResult {
        {
            let mut tables = self.tables();
            tables.running.remove(&shared.task_id);
            tables
                .completed
                .insert(shared.task_id.clone(), result.clone());
        }
        shared.result.send_replace(Some(result.clone()));
        debug!(
            connection = %self.owner,
            task_id = %shared.task_id,
            status = %result.status,
            "Task finished"
        );
        result
    }

    /// Register a task and hand `worker` to the pool. Returns a RUNNING result.
    pub fn launch<F, Fut>(&self, command: &str, worker: F) -> TaskResult
    where
        F: FnOnce(TaskControl) -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let task_id = Uuid::new_v4().to_string();
        let (stop, stop_rx) = watch::channel(StopPhase::None);
        let shared = Arc::new(TaskShared {
            task_id: task_id.clone(),
            command: command.to_string(),
            start_time: Utc::now(),
            started: Instant::now(),
            claimed: AtomicBool::new(false),
            started_work: AtomicBool::new(false),
            io: TaskIo::default(),
            stop,
            exited: watch::Sender::new(false),
            result: watch::Sender::new(None),
        });
        self.tables()
            .running
            .insert(task_id.clone(), Arc::clone(&shared));

        let control = TaskControl {
            task_id: task_id.clone(),
            io: shared.io.clone(),
            stop: stop_rx,
        };
        let registry = self.clone();
        let worker_shared = Arc::clone(&shared);
        let spawned = self.pool.spawn(async move {
            let shared = worker_shared;
            // A task stopped while queued never starts its transport call.
            shared.started_work.store(true, Ordering::SeqCst);
            let outcome = if shared.claimed.load(Ordering::SeqCst) {
                None
            } else {
                Some(worker(control).await)
            };
            shared.exited.send_replace(true);
            if let Some(outcome) = outcome
                && shared.claim()
            {
                let result = shared.build_result(outcome);
                registry.record(&shared, result);
            }
        });

        if let Err(e) = spawned {
            shared.claim();
            shared.exited.send_replace(true);
            let result = shared.build_result(TaskOutcome::failed(e.to_string()));
            return self.record(&shared, result);
        }

        info!(connection = %self.owner, task_id = %task_id, "Started background task");
        TaskResult {
            start_time: shared.start_time,
            ..TaskResult::running(task_id, command)
        }
    }

    /// Wait for a task's terminal result.
    ///
    /// Completed tasks return their stored result. On deadline expiry the
    /// task is killed and a TIMEOUT result with any partial output is stored.
    pub async fn wait(&self, task_id: &str, timeout: Option<Duration>) -> TaskResult {
        let shared = match self.lookup(task_id) {
            Lookup::Done(result) => return result,
            Lookup::Missing => {
                warn!(connection = %self.owner, task_id, "Task not found");
                return TaskResult::not_found(task_id);
            }
            Lookup::Running(shared) => shared,
        };

        let mut result_rx = shared.result.subscribe();
        let waited = match timeout {
            Some(limit) => {
                tokio::time::timeout(limit, result_rx.wait_for(Option::is_some))
                    .await
                    .map(|r| r.ok().and_then(|v| v.clone()))
            }
            None => Ok(result_rx
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|v| v.clone())),
        };

        match waited {
            Ok(Some(result)) => result,
            Ok(None) => TaskResult::failed(
                task_id,
                shared.command.clone(),
                "Task worker exited without a result",
            ),
            Err(_) => {
                let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                let message = format!("Task timed out after {secs} seconds");
                warn!(connection = %self.owner, task_id, "{message}");
                self.stop(&shared, TaskStatus::Timeout, message, false)
                    .await
                    .0
            }
        }
    }

    /// Terminate a running task.
    ///
    /// Returns false when the task is unknown or already finished; the stored
    /// result is left untouched in that case.
    pub async fn terminate(&self, task_id: &str) -> bool {
        let shared = match self.lookup(task_id) {
            Lookup::Running(shared) => shared,
            Lookup::Done(_) | Lookup::Missing => {
                warn!(connection = %self.owner, task_id, "Task not found or already completed");
                return false;
            }
        };
        let (result, stopped) = self
            .stop(&shared, TaskStatus::Terminated, "Task was terminated".into(), true)
            .await;
        if stopped && result.status == TaskStatus::Terminated {
            info!(connection = %self.owner, task_id, "Terminated task");
            true
        } else {
            false
        }
    }

    /// Claim, stop and record a task. Returns the stored result and whether
    /// this call performed the stop.
    async fn stop(
        &self,
        shared: &Arc<TaskShared>,
        status: TaskStatus,
        message: String,
        graceful: bool,
    ) -> (TaskResult, bool) {
        if !shared.claim() {
            // The worker or another stop got there first.
            let mut rx = shared.result.subscribe();
            let stored = tokio::time::timeout(EXIT_GRACE, rx.wait_for(Option::is_some))
                .await
                .ok()
                .and_then(|r| r.ok().and_then(|v| v.clone()));
            let result = stored.unwrap_or_else(|| {
                TaskResult::failed(&shared.task_id, shared.command.clone(), message)
            });
            return (result, false);
        }

        // Still queued: the worker will see the claim and skip its call.
        let queued = !shared.started_work.load(Ordering::SeqCst);
        if graceful && !queued {
            shared.stop.send_replace(StopPhase::Interrupt);
            tokio::time::sleep(TERMINATE_GRACE).await;
        }
        let mut exited = queued || *shared.exited.borrow();
        if !exited {
            shared.stop.send_replace(StopPhase::Kill);
            exited = shared.wait_exited(EXIT_GRACE).await;
        }

        let (stdout, partial_stderr) = shared.io.snapshot();
        let stderr = if exited {
            message
        } else {
            warn!(task_id = %shared.task_id, "Worker did not exit after kill");
            match status {
                TaskStatus::Terminated => format!(
                    "Task termination failed: worker did not exit within {:?}",
                    EXIT_GRACE
                ),
                _ => message,
            }
        };
        let stderr = if partial_stderr.trim().is_empty() {
            stderr
        } else {
            format!("{}\n{stderr}", partial_stderr.trim_end())
        };

        let result = shared.build_result(TaskOutcome {
            status,
            return_code: Some(-1),
            stdout,
            stderr,
        });
        (self.record(shared, result), exited)
    }

    /// Wait for every running task under one shared deadline.
    pub async fn wait_all(&self, timeout: Option<Duration>) -> HashMap<String, TaskResult> {
        let started = Instant::now();
        let (ids, mut results) = {
            let tables = self.tables();
            (
                tables.running.keys().cloned().collect::<Vec<_>>(),
                tables.completed.clone(),
            )
        };
        for id in ids {
            let remaining = match timeout {
                Some(limit) => match limit.checked_sub(started.elapsed()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => break,
                },
                None => None,
            };
            let result = self.wait(&id, remaining).await;
            results.insert(id, result);
        }
        results
    }

    /// Terminate every running task. Returns the ids actually terminated.
    pub async fn terminate_all(&self) -> Vec<String> {
        let ids: Vec<String> = self.tables().running.keys().cloned().collect();
        let mut terminated = Vec::new();
        for id in ids {
            if self.terminate(&id).await {
                terminated.push(id);
            }
        }
        terminated
    }

    pub fn task_output(&self, task_id: &str) -> Option<TaskResult> {
        self.tables().completed.get(task_id).cloned()
    }

    pub fn close_task(&self, task_id: &str) -> bool {
        let removed = self.tables().completed.remove(task_id).is_some();
        if removed {
            debug!(connection = %self.owner, task_id, "Closed task");
        }
        removed
    }

    pub fn close_all_completed(&self) -> Vec<String> {
        let closed: Vec<String> = self.tables().completed.drain().map(|(id, _)| id).collect();
        debug!(connection = %self.owner, count = closed.len(), "Closed completed tasks");
        closed
    }

    /// Terminate running tasks and drop every stored result.
    pub async fn cleanup_all(&self) -> usize {
        let terminated = self.terminate_all().await;
        let closed = self.close_all_completed();
        terminated.len() + closed.len()
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let tables = self.tables();
        let running = tables.running.values().map(|shared| TaskSnapshot {
            task_id: shared.task_id.clone(),
            command: shared.command.clone(),
            status: TaskStatus::Running,
            start_time: shared.start_time,
            running_for: Some(shared.started.elapsed().as_secs_f64()),
            result: None,
        });
        let completed = tables.completed.values().map(|result| TaskSnapshot {
            task_id: result.task_id.clone(),
            command: result.command.clone(),
            status: result.status,
            start_time: result.start_time,
            running_for: None,
            result: Some(result.clone()),
        });
        let mut all: Vec<_> = running.chain(completed).collect();
        all.sort_by_key(|s| s.start_time);
        all
    }

    pub fn running_count(&self) -> usize {
        self.tables().running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TaskRegistry {
        TaskRegistry::new("test", WorkerPool::new(4))
    }

    /// Worker that sleeps until `delay` passes or it is asked to stop.
    fn sleeper(delay: Duration) -> impl FnOnce(TaskControl) -> std::pin::Pin<Box<dyn Future<Output = TaskOutcome> + Send>> {
        move |mut control: TaskControl| {
            Box::pin(async move {
                control
                    .io
                    .stdout
                    .lock()
                    .unwrap()
                    .extend_from_slice(b"partial\n");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        TaskOutcome::from_exit(Some(0), "partial\ndone\n".into(), String::new())
                    }
                    _ = control.stop.wait_for(|p| *p == StopPhase::Kill) => {
                        TaskOutcome::from_exit(Some(137), "partial\n".into(), String::new())
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn test_launch_then_wait_completes() {
        let reg = registry();
        let started = reg.launch("sleep", sleeper(Duration::from_millis(20)));
        assert_eq!(started.status, TaskStatus::Running);

        let result = reg.wait(&started.task_id, Some(Duration::from_secs(5))).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.return_code, Some(0));
        assert!(result.execution_time.is_some());
    }

    #[tokio::test]
    async fn test_wait_is_idempotent() {
        let reg = registry();
        let id = reg.launch("sleep", sleeper(Duration::from_millis(5))).task_id;
        let first = reg.wait(&id, Some(Duration::from_secs(5))).await;
        let second = reg.wait(&id, Some(Duration::from_secs(5))).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_wait_unknown_task() {
        let reg = registry();
        let result = reg.wait("nope", Some(Duration::from_millis(10))).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.stderr, "Task nope not found");
    }

    #[tokio::test]
    async fn test_wait_timeout_records_timeout_with_partial_output() {
        let reg = registry();
        let id = reg.launch("sleep", sleeper(Duration::from_secs(30))).task_id;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = reg.wait(&id, Some(Duration::from_millis(50))).await;
        assert_eq!(result.status, TaskStatus::Timeout);
        assert_eq!(result.return_code, Some(-1));
        assert!(result.stderr.contains("Task timed out after"));
        assert!(result.stdout.contains("partial"));

        // stored, and the late worker exit did not overwrite it
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reg.task_output(&id).unwrap().status, TaskStatus::Timeout);
        assert_eq!(reg.running_count(), 0);
    }

    #[tokio::test]
    async fn test_terminate_running_task() {
        let reg = registry();
        let id = reg.launch("sleep", sleeper(Duration::from_secs(30))).task_id;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(reg.terminate(&id).await);
        let result = reg.wait(&id, None).await;
        assert_eq!(result.status, TaskStatus::Terminated);
        assert_eq!(result.stderr, "Task was terminated");

        // second terminate is a no-op
        assert!(!reg.terminate(&id).await);
        assert_eq!(reg.wait(&id, None).await.status, TaskStatus::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_completed_task_is_noop() {
        let reg = registry();
        let id = reg.launch("sleep", sleeper(Duration::from_millis(1))).task_id;
        let done = reg.wait(&id, Some(Duration::from_secs(5))).await;
        assert!(!reg.terminate(&id).await);
        assert_eq!(reg.task_output(&id).unwrap(), done);
    }

    #[tokio::test]
    async fn test_terminate_queued_task_never_runs() {
        let reg = TaskRegistry::new("test", WorkerPool::new(1));
        let blocker = reg.launch("block", sleeper(Duration::from_millis(300))).task_id;
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        let queued = reg
            .launch("queued", move |_control| async move {
                ran_flag.store(true, Ordering::SeqCst);
                TaskOutcome::from_exit(Some(0), String::new(), String::new())
            })
            .task_id;

        assert!(reg.terminate(&queued).await);
        reg.wait(&blocker, Some(Duration::from_secs(5))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(reg.task_output(&queued).unwrap().status, TaskStatus::Terminated);
    }

    #[tokio::test]
    async fn test_wait_all_and_cleanup() {
        let reg = registry();
        let a = reg.launch("a", sleeper(Duration::from_millis(5))).task_id;
        let b = reg.launch("b", sleeper(Duration::from_millis(10))).task_id;
        let all = reg.wait_all(Some(Duration::from_secs(5))).await;
        assert_eq!(all.len(), 2);
        assert!(all.contains_key(&a) && all.contains_key(&b));

        assert_eq!(reg.snapshot().len(), 2);
        assert!(reg.close_task(&a));
        assert!(!reg.close_task(&a));
        assert_eq!(reg.cleanup_all().await, 1);
        assert!(reg.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_launch_on_closed_pool_fails() {
        let pool = WorkerPool::new(1);
        pool.shutdown(Duration::from_millis(1)).await;
        let reg = TaskRegistry::new("test", pool);
        let result = reg.launch("x", sleeper(Duration::from_millis(1)));
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(
            reg.wait(&result.task_id, None).await.status,
            TaskStatus::Failed
        );
    }
}
