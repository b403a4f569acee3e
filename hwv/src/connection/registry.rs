//! Connection cache and factory.

use super::local::LocalConnection;
use super::redfish::{RedfishConnection, RedfishTarget, SERVICE_ROOT};
use super::ssh::{SshConnection, SshTarget};
use super::{CommandOptions, Connection, ConnectionError, SshTunnel};
use crate::pool::WorkerPool;
use crate::task::{ExecutionMode, TaskStatus};
use hwv_common::config::connections::DEFAULT_REDFISH_PORT;
use hwv_common::{ConnectionType, ConnectionsConfig, EngineConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Timeouts applied to every transport the registry builds.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl TransportSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout.value,
            command_timeout: config.command_timeout.value,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Success,
    Partial,
    Failed,
    Error,
}

/// Reachability of one `(name, type)` combination.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub connection: String,
    pub connection_type: String,
    pub status: ProbeStatus,
    pub message: String,
    pub connect_time: Option<f64>,
    pub command_time: Option<f64>,
    pub total_time: f64,
}

fn is_local(name: &str, kind: &str) -> bool {
    kind.eq_ignore_ascii_case("local") || name.eq_ignore_ascii_case("local")
}

pub struct ConnectionRegistry {
    config: Arc<ConnectionsConfig>,
    settings: TransportSettings,
    pool: WorkerPool,
    cache: Mutex<HashMap<String, Arc<dyn Connection>>>,
    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(config: Arc<ConnectionsConfig>, settings: TransportSettings, pool: WorkerPool) -> Self {
        Self {
            config,
            settings,
            pool,
            cache: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionsConfig {
        &self.config
    }

    /// Cached connection for `name`/`kind`, created on first use. Not connected yet.
    pub async fn get_connection(
        &self,
        name: &str,
        kind: &str,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        let key = format!("{name}_{kind}");
        let mut cache = self.cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let created = self.create_connection(name, kind)?;
        debug!(connection = %key, "Created connection");
        cache.insert(key, Arc::clone(&created));
        self.closed.store(false, Ordering::SeqCst);
        Ok(created)
    }

    /// Build a new transport from the connection document.
    pub fn create_connection(
        &self,
        name: &str,
        kind: &str,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        let kind = if is_local(name, kind) {
            ConnectionType::Local
        } else {
            ConnectionType::from_str(kind)
                .map_err(|_| ConnectionError::UnsupportedType(kind.to_string()))?
        };

        match kind {
            ConnectionType::Local => {
                let sudo_password = self
                    .config
                    .section(name)
                    .ok()
                    .and_then(|section| section.sudo_password());
                Ok(Arc::new(LocalConnection::new(
                    name,
                    sudo_password,
                    self.settings.command_timeout,
                    self.pool.clone(),
                )))
            }
            ConnectionType::Ssh => {
                let section = self.config.section(name)?;
                let tunnel_settings = self.config.tunnel_for(name)?;
                let target = SshTarget::from_section(&section)?;
                let tunnel = tunnel_settings.map(|settings| {
                    let local_port = settings.ssh_local_port;
                    Arc::new(SshTunnel::new(
                        settings,
                        &target.host,
                        target.port,
                        local_port,
                        self.settings.connect_timeout,
                    ))
                });
                Ok(Arc::new(SshConnection::new(
                    name,
                    target,
                    tunnel,
                    self.settings.connect_timeout,
                    self.settings.command_timeout,
                    self.pool.clone(),
                )))
            }
            ConnectionType::Redfish => {
                let section = self.config.section(name)?;
                let tunnel_settings = self.config.tunnel_for(name)?;
                let port = section
                    .redfish_port()?
                    .or_else(|| self.config.global_redfish_port())
                    .unwrap_or(DEFAULT_REDFISH_PORT);
                let target = RedfishTarget {
                    host: section.host()?,
                    port,
                    use_ssl: self.config.use_ssl(),
                    username: section.username(),
                    password: section.password(),
                };
                let tunnel = tunnel_settings.map(|settings| {
                    let local_port = settings.redfish_local_port;
                    Arc::new(SshTunnel::new(
                        settings,
                        &target.host,
                        target.port,
                        local_port,
                        self.settings.connect_timeout,
                    ))
                });
                Ok(Arc::new(RedfishConnection::new(
                    name,
                    target,
                    tunnel,
                    self.settings.command_timeout,
                    self.pool.clone(),
                )?))
            }
        }
    }

    /// Disconnect every cached connection. Later calls are no-ops.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<(String, Arc<dyn Connection>)> =
            self.cache.lock().await.drain().collect();
        for (key, connection) in connections {
            connection.disconnect().await;
            debug!(connection = %key, "Disconnected");
        }
        info!("All connections closed");
    }

    /// `(name, type)` pairs worth probing: local once, plus every declared
    /// connection whose section has the fields its transport needs.
    pub fn probe_targets(&self) -> Vec<(String, String)> {
        let types = self.config.declared_types();
        let mut targets = Vec::new();
        if types.iter().any(|t| t == "local") {
            targets.push(("local".to_string(), "local".to_string()));
        }
        for name in self.config.declared_connections() {
            let Ok(section) = self.config.section(&name) else {
                continue;
            };
            for kind in types.iter().filter(|t| t.as_str() != "local") {
                let usable = match kind.as_str() {
                    "ssh" => section.has_field("host") && section.has_field("username"),
                    "redfish" => section.has_field("host"),
                    _ => false,
                };
                if usable {
                    targets.push((name.clone(), kind.clone()));
                }
            }
        }
        targets
    }

    /// Connect to every probe target and run a trivial command on it.
    pub async fn probe_all(&self) -> Vec<ProbeReport> {
        let mut reports = Vec::new();
        for (name, kind) in self.probe_targets() {
            let report = self.probe(&name, &kind).await;
            info!(
                connection = %name,
                connection_type = %kind,
                status = ?report.status,
                "{}",
                report.message
            );
            reports.push(report);
        }
        reports
    }

    async fn probe(&self, name: &str, kind: &str) -> ProbeReport {
        let started = Instant::now();
        let mut report = ProbeReport {
            connection: name.to_string(),
            connection_type: kind.to_string(),
            status: ProbeStatus::Error,
            message: String::new(),
            connect_time: None,
            command_time: None,
            total_time: 0.0,
        };

        let connection = match self.get_connection(name, kind).await {
            Ok(connection) => connection,
            Err(e) => {
                report.message = e.to_string();
                report.total_time = started.elapsed().as_secs_f64();
                return report;
            }
        };

        let connect_started = Instant::now();
        let connected = connection.connect().await;
        report.connect_time = Some(connect_started.elapsed().as_secs_f64());
        if let Err(e) = connected {
            warn!(connection = %name, connection_type = %kind, "Probe connect failed: {e}");
            report.status = ProbeStatus::Failed;
            report.message = "Connection failed".to_string();
            report.total_time = started.elapsed().as_secs_f64();
            return report;
        }

        let probe_command = match connection.kind() {
            ConnectionType::Ssh => "echo \"SSH test successful\"",
            ConnectionType::Redfish => SERVICE_ROOT,
            ConnectionType::Local => "echo \"Local test successful\"",
        };
        let command_started = Instant::now();
        let result = connection
            .execute_command(
                probe_command,
                ExecutionMode::Synchronous,
                &CommandOptions::default().with_timeout(self.settings.connect_timeout),
            )
            .await;
        report.command_time = Some(command_started.elapsed().as_secs_f64());
        if result.status == TaskStatus::Completed {
            report.status = ProbeStatus::Success;
            report.message = hwv_common::shorten(result.stdout.trim(), 120);
        } else {
            report.status = ProbeStatus::Partial;
            report.message = format!("Connected, but test command {}: {}", result.status, hwv_common::shorten(result.stderr.trim(), 120));
        }
        report.total_time = started.elapsed().as_secs_f64();
        report
    }
}
