//! Local port forwarding through a jump host (`ssh -N -L`).

use super::ConnectionError;
use hwv_common::TunnelSettings;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Pause after spawning before the forward is assumed usable.
const TUNNEL_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    pub active: bool,
    pub agent: String,
    pub local_host: String,
    pub local_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

/// Forwards `local_host:local_port` to `target_host:target_port` via the agent.
pub struct SshTunnel {
    settings: TunnelSettings,
    target_host: String,
    target_port: u16,
    local_port: u16,
    connect_timeout: Duration,
    active: AtomicBool,
    child: Mutex<Option<Child>>,
}

impl SshTunnel {
    pub fn new(
        settings: TunnelSettings,
        target_host: &str,
        target_port: u16,
        local_port: u16,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            settings,
            target_host: target_host.to_string(),
            target_port,
            local_port,
            connect_timeout,
            active: AtomicBool::new(false),
            child: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Host and port clients should dial while the tunnel is up.
    pub fn local_bind(&self) -> (String, u16) {
        (self.settings.local_host.clone(), self.local_port)
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            active: self.is_active(),
            agent: self.settings.agent.clone(),
            local_host: self.settings.local_host.clone(),
            local_port: self.local_port,
            target_host: self.target_host.clone(),
            target_port: self.target_port,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = match &self.settings.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => {
                let mut cmd = Command::new("ssh");
                cmd.args(["-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args(["-N", "-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-L")
            .arg(format!(
                "{}:{}:{}:{}",
                self.settings.local_host, self.local_port, self.target_host, self.target_port
            ))
            .arg("-p")
            .arg(self.settings.agent_port.to_string());
        if self.settings.username.is_empty() {
            cmd.arg(&self.settings.agent);
        } else {
            cmd.arg(format!("{}@{}", self.settings.username, self.settings.agent));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn failure(&self, reason: impl Into<String>) -> ConnectionError {
        ConnectionError::Tunnel {
            agent: self.settings.agent.clone(),
            reason: reason.into(),
        }
    }

    /// Start the forward. A no-op while the tunnel process is alive.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
            *guard = None;
            self.active.store(false, Ordering::SeqCst);
        }

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| self.failure(format!("failed to spawn ssh: {e}")))?;
        tokio::time::sleep(TUNNEL_SETTLE).await;

        match child.try_wait() {
            Ok(None) => {
                info!(
                    agent = %self.settings.agent,
                    local = %format!("{}:{}", self.settings.local_host, self.local_port),
                    target = %format!("{}:{}", self.target_host, self.target_port),
                    "SSH tunnel established"
                );
                *guard = Some(child);
                self.active.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(Some(status)) => {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                Err(self.failure(format!("ssh exited with {status}: {}", stderr.trim())))
            }
            Err(e) => Err(self.failure(e.to_string())),
        }
    }

    /// Flag the forward as up without spawning ssh.
    #[cfg(test)]
    pub(crate) fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                warn!(agent = %self.settings.agent, "Failed to stop tunnel: {e}");
            }
            info!(agent = %self.settings.agent, "SSH tunnel closed");
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TunnelSettings {
        TunnelSettings {
            agent: "jump.example".into(),
            agent_port: 22,
            local_host: "localhost".into(),
            ssh_local_port: 2222,
            redfish_local_port: 8443,
            username: "ops".into(),
            password: None,
        }
    }

    #[test]
    fn test_info_before_start() {
        let tunnel = SshTunnel::new(settings(), "10.0.0.5", 22, 2222, Duration::from_secs(5));
        let info = tunnel.info();
        assert!(!info.active);
        assert_eq!(info.local_port, 2222);
        assert_eq!(tunnel.local_bind(), ("localhost".to_string(), 2222));
    }

    #[tokio::test]
    async fn test_stop_clears_active_flag() {
        let tunnel = SshTunnel::new(settings(), "10.0.0.5", 22, 2222, Duration::from_secs(5));
        tunnel.mark_active();
        assert!(tunnel.info().active);
        tunnel.stop().await;
        assert!(!tunnel.is_active());
    }

    #[test]
    fn test_command_line_forward_spec() {
        let tunnel = SshTunnel::new(settings(), "10.0.0.5", 443, 8443, Duration::from_secs(5));
        let cmd = tunnel.command();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"localhost:8443:10.0.0.5:443".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("ops@jump.example"));
    }
}
