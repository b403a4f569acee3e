//! SSH transport driving the system `ssh`/`scp` clients.

use super::{CommandOptions, Connection, ConnectionError, SshTunnel, dispatch};
use crate::pool::WorkerPool;
use crate::process::{self, ProcessSpec, RemoteInterrupt};
use crate::task::{ExecutionMode, TaskRegistry, TaskResult};
use async_trait::async_trait;
use hwv_common::{ConnectionSection, ConnectionType};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timeout for the remote `pkill` sent on a graceful stop.
const REMOTE_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Login details for one SSH target.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<String>,
    pub sudo_password: Option<String>,
}

impl SshTarget {
    pub fn from_section(section: &ConnectionSection) -> Result<Self, ConnectionError> {
        Ok(Self {
            host: section.host()?,
            port: section.ssh_port()?,
            username: section.username(),
            password: section.password(),
            identity_file: section.identity_file(),
            sudo_password: section.sudo_password(),
        })
    }
}

/// A dialable address: the target itself or the local end of its tunnel.
#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    identity_file: Option<String>,
    connect_timeout: Duration,
}

impl Endpoint {
    fn login(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }

    /// `ssh` or `scp` with auth and options; `port_flag` differs between the two.
    fn client(&self, program: &str, port_flag: &str) -> ProcessSpec {
        let spec = match &self.password {
            Some(password) => ProcessSpec::new("sshpass")
                .args(["-e", program])
                .env("SSHPASS", password.as_str()),
            None => ProcessSpec::new(program).args(["-o", "BatchMode=yes"]),
        };
        let spec = spec
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(port_flag)
            .arg(self.port.to_string());
        match (&self.identity_file, &self.password) {
            (Some(identity), None) => spec.arg("-i").arg(identity.as_str()),
            _ => spec,
        }
    }

    fn ssh(&self, remote: &str) -> ProcessSpec {
        self.client("ssh", "-p")
            .arg(self.login())
            .arg(remote)
            .display(&format!("ssh {} {remote}", self.login()))
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}:{}", self.login(), path)
    }
}

/// Sends SIGINT to the remote process tree tagged with a task marker.
struct RemoteKill {
    endpoint: Endpoint,
    marker: String,
}

#[async_trait]
impl RemoteInterrupt for RemoteKill {
    async fn interrupt(&self) {
        // The bracket keeps pkill from matching its own command line.
        let pattern = format!("[{}]{}", &self.marker[..1], &self.marker[1..]);
        let spec = self
            .endpoint
            .ssh(&format!("pkill -INT -f {}", shell_escape::escape(pattern.into())));
        let result = process::run_to_completion(&spec, REMOTE_INTERRUPT_TIMEOUT).await;
        debug!(marker = %self.marker, status = %result.status, "Remote interrupt sent");
    }
}

pub struct SshConnection {
    name: String,
    target: SshTarget,
    tunnel: Option<Arc<SshTunnel>>,
    connect_timeout: Duration,
    command_timeout: Duration,
    connected: AtomicBool,
    tasks: TaskRegistry,
}

impl SshConnection {
    pub fn new(
        name: &str,
        target: SshTarget,
        tunnel: Option<Arc<SshTunnel>>,
        connect_timeout: Duration,
        command_timeout: Duration,
        pool: WorkerPool,
    ) -> Self {
        Self {
            name: name.to_string(),
            target,
            tunnel,
            connect_timeout,
            command_timeout,
            connected: AtomicBool::new(false),
            tasks: TaskRegistry::new(&format!("{name}_ssh"), pool),
        }
    }

    pub fn tunnel(&self) -> Option<&Arc<SshTunnel>> {
        self.tunnel.as_ref()
    }

    fn endpoint(&self) -> Endpoint {
        let (host, port) = match &self.tunnel {
            Some(tunnel) if tunnel.is_active() => tunnel.local_bind(),
            _ => (self.target.host.clone(), self.target.port),
        };
        Endpoint {
            host,
            port,
            username: self.target.username.clone(),
            password: self.target.password.clone(),
            identity_file: self.target.identity_file.clone(),
            connect_timeout: self.connect_timeout,
        }
    }

    /// Remote command line plus optional stdin for `sudo -S`.
    fn remote_command<'a>(
        &self,
        command: &'a str,
        options: &CommandOptions,
    ) -> (Cow<'a, str>, Option<String>) {
        let password = options
            .sudo_password
            .as_ref()
            .or(self.target.sudo_password.as_ref());
        match (command.strip_prefix("sudo "), password) {
            (Some(rest), Some(password)) => (
                Cow::Owned(format!("sudo -S -p '' {rest}")),
                Some(format!("{password}\n")),
            ),
            _ => (Cow::Borrowed(command), None),
        }
    }

    fn with_stdin(spec: ProcessSpec, stdin: Option<String>) -> ProcessSpec {
        match stdin {
            Some(input) => spec.stdin(input),
            None => spec,
        }
    }

    fn transfer_error(&self, from: &str, to: &str, result: &TaskResult) -> ConnectionError {
        ConnectionError::Transfer {
            from: from.to_string(),
            to: to.to_string(),
            reason: format!("{} (exit {:?}): {}", result.status, result.return_code, result.stderr.trim()),
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConnectionType {
        ConnectionType::Ssh
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.start().await?;
        }
        let endpoint = self.endpoint();
        let probe = endpoint.ssh("true");
        // The ssh ConnectTimeout covers the TCP phase; this bounds authentication too.
        let result = process::run_to_completion(&probe, self.connect_timeout + Duration::from_secs(5)).await;
        if !result.is_success() {
            return Err(ConnectionError::ConnectFailed {
                name: self.name.clone(),
                reason: format!(
                    "{}:{} {}: {}",
                    endpoint.host,
                    endpoint.port,
                    result.status,
                    result.stderr.trim()
                ),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(connection = %self.name, host = %endpoint.host, port = endpoint.port, "SSH connection established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        let closed = self.tasks.cleanup_all().await;
        if let Some(tunnel) = &self.tunnel {
            tunnel.stop().await;
        }
        if was_connected {
            info!(connection = %self.name, tasks = closed, "Closed SSH connection");
        }
    }

    async fn execute_command(
        &self,
        command: &str,
        mode: ExecutionMode,
        options: &CommandOptions,
    ) -> TaskResult {
        let endpoint = self.endpoint();
        let (remote, stdin) = self.remote_command(command, options);
        let shown = hwv_common::mask_sensitive_command(command);
        debug!(connection = %self.name, ?mode, command = %shown, "Executing SSH command");

        let sync_spec = Self::with_stdin(endpoint.ssh(&remote), stdin.clone());
        let remote = remote.into_owned();
        dispatch(
            &self.tasks,
            &shown,
            mode,
            options,
            self.command_timeout,
            |timeout| async move { process::run_to_completion(&sync_spec, timeout).await },
            move |control| {
                let marker = format!("hwv-task-{}", control.task_id);
                // The marker rides along as $0 so the remote tree is findable.
                let tagged = format!(
                    "sh -c {} {marker}",
                    shell_escape::escape(Cow::Owned(remote))
                );
                let spec = Self::with_stdin(endpoint.ssh(&tagged), stdin);
                let interrupter: Arc<dyn RemoteInterrupt> = Arc::new(RemoteKill { endpoint, marker });
                process::run_controlled(spec, control, Some(interrupter))
            },
        )
        .await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<(), ConnectionError> {
        let endpoint = self.endpoint();
        let local_str = local.display().to_string();
        let spec = endpoint
            .client("scp", "-P")
            .arg(local_str.as_str())
            .arg(endpoint.remote_path(remote));
        let result = process::run_to_completion(&spec, self.command_timeout).await;
        if !result.is_success() {
            return Err(self.transfer_error(&local_str, remote, &result));
        }
        debug!(connection = %self.name, local = %local_str, remote, "Uploaded file");
        Ok(())
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ConnectionError> {
        let endpoint = self.endpoint();
        let local_str = local.display().to_string();
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(path = %parent.display(), "Failed to create download directory: {e}");
        }
        let spec = endpoint
            .client("scp", "-P")
            .arg(endpoint.remote_path(remote))
            .arg(local_str.as_str());
        let result = process::run_to_completion(&spec, self.command_timeout).await;
        if !result.is_success() {
            return Err(self.transfer_error(remote, &local_str, &result));
        }
        debug!(connection = %self.name, remote, local = %local_str, "Downloaded file");
        Ok(())
    }

    fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}
