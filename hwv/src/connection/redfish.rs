//! Redfish management API over HTTPS.
//!
//! A "command" is a resource path (`/redfish/v1/Systems/1`). The result's
//! stdout carries the JSON envelope `{success, status_code, response,
//! headers}` so analysis rules can run against it like shell output.

use super::{CommandOptions, Connection, ConnectionError, SshTunnel, dispatch};
use crate::pool::WorkerPool;
use crate::task::{
    ExecutionMode, StopPhase, TaskOutcome, TaskRegistry, TaskResult, TaskStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use hwv_common::ConnectionType;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SERVICE_ROOT: &str = "/redfish/v1/";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedfishResponse {
    pub success: bool,
    pub status_code: u16,
    pub response: Value,
    pub headers: BTreeMap<String, String>,
}

/// Endpoint and credentials for one Redfish service.
#[derive(Debug, Clone)]
pub struct RedfishTarget {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug)]
enum RequestError {
    Timeout,
    Other(String),
}

/// Cheap-to-clone request sender handed to background workers.
#[derive(Clone)]
struct Client {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: Option<String>,
}

impl Client {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<RedfishResponse, RequestError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self
            .http
            .request(method, &url)
            .timeout(timeout)
            .basic_auth(&self.username, self.password.as_ref());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(classify)?;

        let status_code = response.status().as_u16();
        let success = response.status().is_success();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let text = response.text().await.map_err(classify)?;
        let response = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(RedfishResponse {
            success,
            status_code,
            response,
            headers,
        })
    }
}

fn classify(e: reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Other(e.to_string())
    }
}

fn parse_method(method: Option<&str>) -> Result<Method, String> {
    let upper = method.unwrap_or("GET").to_ascii_uppercase();
    match upper.as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(format!("Unsupported HTTP method: {other}")),
    }
}

/// Map a request outcome onto task terms.
fn outcome_of(result: Result<RedfishResponse, RequestError>, timeout: Duration) -> TaskOutcome {
    match result {
        Ok(response) => TaskOutcome {
            status: if response.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            },
            return_code: Some(if response.success {
                0
            } else {
                i32::from(response.status_code)
            }),
            stdout: serde_json::to_string_pretty(&response).unwrap_or_default(),
            stderr: String::new(),
        },
        Err(RequestError::Timeout) => {
            let message = format!("Request timed out after {} seconds", timeout.as_secs());
            TaskOutcome {
                status: TaskStatus::Timeout,
                return_code: Some(-1),
                stdout: error_envelope(&message),
                stderr: message,
            }
        }
        Err(RequestError::Other(message)) => TaskOutcome {
            status: TaskStatus::Failed,
            return_code: Some(-1),
            stdout: error_envelope(&message),
            stderr: message,
        },
    }
}

fn error_envelope(message: &str) -> String {
    json!({"success": false, "error": message, "status_code": -1}).to_string()
}

pub struct RedfishConnection {
    name: String,
    target: RedfishTarget,
    http: reqwest::Client,
    tunnel: Option<Arc<SshTunnel>>,
    command_timeout: Duration,
    connected: AtomicBool,
    tasks: TaskRegistry,
}

impl RedfishConnection {
    pub fn new(
        name: &str,
        target: RedfishTarget,
        tunnel: Option<Arc<SshTunnel>>,
        command_timeout: Duration,
        pool: WorkerPool,
    ) -> Result<Self, ConnectionError> {
        // BMCs ship self-signed certificates.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ConnectionError::Request(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            target,
            http,
            tunnel,
            command_timeout,
            connected: AtomicBool::new(false),
            tasks: TaskRegistry::new(&format!("{name}_redfish"), pool),
        })
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.target.use_ssl { "https" } else { "http" };
        let (host, port) = match &self.tunnel {
            Some(tunnel) if tunnel.is_active() => tunnel.local_bind(),
            _ => (self.target.host.clone(), self.target.port),
        };
        format!("{scheme}://{host}:{port}")
    }

    fn client(&self) -> Client {
        Client {
            http: self.http.clone(),
            base_url: self.base_url(),
            username: self.target.username.clone(),
            password: self.target.password.clone(),
        }
    }

    /// Issue one request with the default command timeout.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> Result<RedfishResponse, ConnectionError> {
        let method = parse_method(Some(method)).map_err(ConnectionError::Request)?;
        self.client()
            .send(method, path, body, self.command_timeout)
            .await
            .map_err(|e| match e {
                RequestError::Timeout => ConnectionError::Request(format!(
                    "{path} timed out after {} seconds",
                    self.command_timeout.as_secs()
                )),
                RequestError::Other(message) => ConnectionError::Request(message),
            })
    }
}

#[async_trait]
impl Connection for RedfishConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConnectionType {
        ConnectionType::Redfish
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_connected() {
            return Ok(());
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.start().await?;
        }
        let client = self.client();
        let probe = client
            .send(Method::GET, SERVICE_ROOT, None, PROBE_TIMEOUT)
            .await;
        match probe {
            Ok(response) if response.success => {
                self.connected.store(true, Ordering::SeqCst);
                info!(connection = %self.name, url = %client.base_url, "Redfish service reachable");
                Ok(())
            }
            Ok(response) => Err(ConnectionError::ConnectFailed {
                name: self.name.clone(),
                reason: format!("{} returned HTTP {}", client.base_url, response.status_code),
            }),
            Err(RequestError::Timeout) => Err(ConnectionError::ConnectFailed {
                name: self.name.clone(),
                reason: format!("{} did not answer within {:?}", client.base_url, PROBE_TIMEOUT),
            }),
            Err(RequestError::Other(reason)) => Err(ConnectionError::ConnectFailed {
                name: self.name.clone(),
                reason,
            }),
        }
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
            info!(connection = %self.name, tasks = closed, "Closed Redfish connection");
        }
    }

    async fn execute_command(
        &self,
        command: &str,
        mode: ExecutionMode,
        options: &CommandOptions,
    ) -> TaskResult {
        let method = match parse_method(options.method.as_deref()) {
            Ok(method) => method,
            Err(message) => {
                warn!(connection = %self.name, "{message}");
                return TaskResult::failed(Uuid::new_v4().to_string(), command, message);
            }
        };
        let shown = format!("{method} {command}");
        debug!(connection = %self.name, ?mode, request = %shown, "Executing Redfish request");

        let client = self.client();
        let worker_client = client.clone();
        let path = command.to_string();
        let worker_path = path.clone();
        let body = options.body.clone();
        let worker_body = body.clone();
        let worker_method = method.clone();
        let worker_timeout = options.timeout.unwrap_or(self.command_timeout);

        dispatch(
            &self.tasks,
            &shown,
            mode,
            options,
            self.command_timeout,
            |timeout| {
                let shown = shown.clone();
                async move {
                    let start_time = Utc::now();
                    let started = Instant::now();
                    let sent = client.send(method, &path, body.as_ref(), timeout).await;
                    let outcome = outcome_of(sent, timeout);
                    TaskResult {
                        task_id: Uuid::new_v4().to_string(),
                        command: shown,
                        status: outcome.status,
                        return_code: outcome.return_code,
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        start_time,
                        end_time: Some(Utc::now()),
                        execution_time: Some(started.elapsed().as_secs_f64()),
                    }
                }
            },
            move |mut control| async move {
                let send = worker_client.send(
                    worker_method,
                    &worker_path,
                    worker_body.as_ref(),
                    worker_timeout,
                );
                tokio::select! {
                    sent = send => outcome_of(sent, worker_timeout),
                    _ = control.stop.wait_for(|phase| *phase != StopPhase::None) => {
                        TaskOutcome::failed("Request cancelled")
                    }
                }
            },
        )
        .await
    }

    async fn upload_file(&self, _local: &Path, _remote: &str) -> Result<(), ConnectionError> {
        Err(ConnectionError::Unsupported {
            operation: "upload",
            kind: ConnectionType::Redfish,
        })
    }

    /// Fetch a resource (for example a LogService entries collection) into a file.
    async fn download_file(&self, remote: &str, local: &Path) -> Result<(), ConnectionError> {
        let transfer_err = |reason: String| ConnectionError::Transfer {
            from: remote.to_string(),
            to: local.display().to_string(),
            reason,
        };
        let response = self.request("GET", remote, None).await?;
        if !response.success {
            return Err(transfer_err(format!("HTTP {}", response.status_code)));
        }
        let content = match &response.response {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).map_err(|e| transfer_err(e.to_string()))?,
        };
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_err(e.to_string()))?;
        }
        tokio::fs::write(local, content)
            .await
            .map_err(|e| transfer_err(e.to_string()))
    }

    fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hwv_common::TunnelSettings;

    fn target(use_ssl: bool) -> RedfishTarget {
        RedfishTarget {
            host: "bmc.example".into(),
            port: 443,
            use_ssl,
            username: "admin".into(),
            password: Some("pw".into()),
        }
    }

    #[test]
    fn test_base_url_scheme() {
        let pool = WorkerPool::new(1);
        let https = RedfishConnection::new("RackManager", target(true), None, Duration::from_secs(5), pool.clone()).unwrap();
        assert_eq!(https.base_url(), "https://bmc.example:443");
        let http = RedfishConnection::new("RackManager", target(false), None, Duration::from_secs(5), pool).unwrap();
        assert_eq!(http.base_url(), "http://bmc.example:443");
    }

    #[tokio::test]
    async fn test_base_url_follows_tunnel_state() {
        let tunnel = Arc::new(SshTunnel::new(
            TunnelSettings {
                agent: "jump.example".into(),
                agent_port: 22,
                local_host: "localhost".into(),
                ssh_local_port: 2222,
                redfish_local_port: 8443,
                username: "ops".into(),
                password: None,
            },
            "bmc.example",
            443,
            8443,
            Duration::from_secs(5),
        ));
        let conn = RedfishConnection::new(
            "RackManager",
            target(true),
            Some(Arc::clone(&tunnel)),
            Duration::from_secs(5),
            WorkerPool::new(1),
        )
        .unwrap();
        assert_eq!(conn.base_url(), "https://bmc.example:443");

        tunnel.mark_active();
        assert_eq!(conn.base_url(), "https://localhost:8443");

        tunnel.stop().await;
        assert_eq!(conn.base_url(), "https://bmc.example:443");
    }

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method(None).unwrap(), Method::GET);
        assert_eq!(parse_method(Some("patch")).unwrap(), Method::PATCH);
        assert!(parse_method(Some("TRACE")).unwrap_err().contains("Unsupported"));
    }

    #[test]
    fn test_outcome_of_http_error_is_failed() {
        let outcome = outcome_of(
            Ok(RedfishResponse {
                success: false,
                status_code: 404,
                response: json!({"error": "not found"}),
                headers: BTreeMap::new(),
            }),
            Duration::from_secs(5),
        );
        assert_eq!(outcome.status, TaskStatus::Failed);
        assert_eq!(outcome.return_code, Some(404));
        let envelope: Value = serde_json::from_str(&outcome.stdout).unwrap();
        assert_eq!(envelope["status_code"], 404);
    }

    #[test]
    fn test_outcome_of_transport_error_envelope() {
        let outcome = outcome_of(Err(RequestError::Other("refused".into())), Duration::from_secs(5));
        let envelope: Value = serde_json::from_str(&outcome.stdout).unwrap();
        assert_eq!(envelope["success"], false);
        assert_eq!(envelope["status_code"], -1);
        assert_eq!(envelope["error"], "refused");
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_connect() {
        let conn = RedfishConnection::new(
            "RackManager",
            RedfishTarget {
                host: "127.0.0.1".into(),
                port: 1,
                use_ssl: false,
                username: String::new(),
                password: None,
            },
            None,
            Duration::from_secs(2),
            WorkerPool::new(1),
        )
        .unwrap();
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_request_to_closed_port_reports_method_and_path() {
        let conn = RedfishConnection::new(
            "RackManager",
            RedfishTarget {
                host: "127.0.0.1".into(),
                port: 1,
                use_ssl: false,
                username: String::new(),
                password: None,
            },
            None,
            Duration::from_secs(2),
            WorkerPool::new(1),
        )
        .unwrap();
        let result = conn
            .execute_command(SERVICE_ROOT, ExecutionMode::Synchronous, &CommandOptions::default())
            .await;
        assert_eq!(result.command, format!("GET {SERVICE_ROOT}"));
        assert_ne!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unsupported_method_fails_fast() {
        let conn = RedfishConnection::new("RackManager", target(true), None, Duration::from_secs(5), WorkerPool::new(1)).unwrap();
        let options = CommandOptions {
            method: Some("TRACE".into()),
            ..Default::default()
        };
        let result = conn
            .execute_command(SERVICE_ROOT, ExecutionMode::Synchronous, &options)
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.stderr.contains("Unsupported HTTP method"));
    }
}
