//! Transports to validation targets.
//!
//! Every transport implements [`Connection`] and owns a [`TaskRegistry`] for
//! its background tasks. [`ConnectionRegistry`] builds transports from the
//! connection document and caches one instance per `{name}_{type}`.

pub mod local;
pub mod redfish;
pub mod registry;
pub mod ssh;
pub mod tunnel;

pub use local::LocalConnection;
pub use redfish::{RedfishConnection, RedfishResponse};
pub use registry::{ConnectionRegistry, ProbeReport, ProbeStatus, TransportSettings};
pub use ssh::SshConnection;
pub use tunnel::{SshTunnel, TunnelInfo};

use crate::task::{ExecutionMode, TaskControl, TaskOutcome, TaskRegistry, TaskResult};
use async_trait::async_trait;
use hwv_common::config::ConfigError;
use hwv_common::errors::{Coded, ErrorCode};
use hwv_common::ConnectionType;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unsupported connection type: {0}")]
    UnsupportedType(String),

    #[error("Failed to connect to {name}: {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("Tunnel via {agent} failed: {reason}")]
    Tunnel { agent: String, reason: String },

    #[error("Transfer {from} -> {to} failed: {reason}")]
    Transfer {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Redfish request failed: {0}")]
    Request(String),

    #[error("{operation} is not supported by {kind} connections")]
    Unsupported {
        operation: &'static str,
        kind: ConnectionType,
    },
}

impl Coded for ConnectionError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Config(e) => e.error_code(),
            Self::UnsupportedType(_) | Self::Unsupported { .. } => {
                ErrorCode::ConnectionTypeUnsupported
            }
            Self::ConnectFailed { .. } => ErrorCode::ConnectionFailed,
            Self::Tunnel { .. } => ErrorCode::TunnelStartFailed,
            Self::Transfer { .. } => ErrorCode::TransferFailed,
            Self::Request(_) => ErrorCode::RedfishRequestFailed,
        }
    }
}

/// Per-call options for [`Connection::execute_command`].
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Overrides the transport's default command timeout.
    pub timeout: Option<Duration>,
    /// In `Background` mode, wait for the result when a timeout is also set.
    pub wait: bool,
    /// HTTP verb for Redfish.
    pub method: Option<String>,
    /// JSON payload for Redfish.
    pub body: Option<Value>,
    /// Overrides the configured sudo password.
    pub sudo_password: Option<String>,
}

impl CommandOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ConnectionType;

    async fn connect(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);

    /// Run `command` in `mode`.
    ///
    /// Synchronous mode returns the terminal result. Background mode returns
    /// a RUNNING result at once, unless `options.wait` and `options.timeout`
    /// are both set. BackgroundWait always waits up to the timeout.
    async fn execute_command(
        &self,
        command: &str,
        mode: ExecutionMode,
        options: &CommandOptions,
    ) -> TaskResult;

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError>;

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ConnectionError>;

    fn tasks(&self) -> &TaskRegistry;

    async fn wait_for_task(&self, task_id: &str, timeout: Option<Duration>) -> TaskResult {
        self.tasks().wait(task_id, timeout).await
    }

    async fn terminate_task(&self, task_id: &str) -> bool {
        self.tasks().terminate(task_id).await
    }
}

/// Mode dispatch shared by every transport.
pub(crate) async fn dispatch<S, SFut, W, WFut>(
    tasks: &TaskRegistry,
    display: &str,
    mode: ExecutionMode,
    options: &CommandOptions,
    default_timeout: Duration,
    sync: S,
    worker: W,
) -> TaskResult
where
    S: FnOnce(Duration) -> SFut,
    SFut: Future<Output = TaskResult>,
    W: FnOnce(TaskControl) -> WFut + Send + 'static,
    WFut: Future<Output = TaskOutcome> + Send + 'static,
{
    let timeout = options.timeout.unwrap_or(default_timeout);
    match mode {
        ExecutionMode::Synchronous => sync(timeout).await,
        ExecutionMode::Background => {
            let started = tasks.launch(display, worker);
            match options.timeout {
                Some(limit) if options.wait && !started.status.is_terminal() => {
                    tasks.wait(&started.task_id, Some(limit)).await
                }
                _ => started,
            }
        }
        ExecutionMode::BackgroundWait => {
            let started = tasks.launch(display, worker);
            if started.status.is_terminal() {
                return started;
            }
            tasks.wait(&started.task_id, Some(timeout)).await
        }
    }
}
