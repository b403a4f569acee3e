//! Auxiliary containers declared by a scenario.

use crate::connection::{CommandOptions, Connection, ConnectionError};
use crate::engine::Engine;
use crate::task::{ExecutionMode, TaskStatus};
use hwv_common::errors::{Coded, ErrorCode};
use hwv_common::{ContainerSpec, shorten};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Connection for container {container} unavailable: {source}")]
    Connection {
        container: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Failed to start container {container}: {reason}")]
    Start { container: String, reason: String },
}

impl Coded for ContainerError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Connection { source, .. } => source.error_code(),
            Self::Start { .. } => ErrorCode::ContainerStartFailed,
        }
    }
}

fn docker(spec: &ContainerSpec, args: &str) -> String {
    if spec.use_sudo {
        format!("sudo docker {args}")
    } else {
        format!("docker {args}")
    }
}

pub fn start_command(spec: &ContainerSpec) -> String {
    docker(
        spec,
        &format!("run -dit --name {} {}", spec.container_name, spec.container_image),
    )
}

pub fn stop_commands(spec: &ContainerSpec) -> [String; 2] {
    [
        docker(spec, &format!("stop {}", spec.container_name)),
        docker(spec, &format!("rm {}", spec.container_name)),
    ]
}

/// A started container and the connection it runs behind.
pub struct RunningContainer {
    pub spec: ContainerSpec,
    pub container_id: String,
    connection: Arc<dyn Connection>,
}

/// Containers started for the current run, stopped in reverse order.
#[derive(Default)]
pub struct Containers {
    running: Vec<RunningContainer>,
}

impl Containers {
    /// Start every container; on the first failure the ones already started are torn down.
    pub async fn start_all(engine: &Engine, specs: &[ContainerSpec]) -> Result<Self, ContainerError> {
        let mut containers = Self::default();
        for (idx, spec) in specs.iter().enumerate() {
            info!("Starting container {}/{}: {}", idx + 1, specs.len(), spec.container_name);
            match start(engine, spec).await {
                Ok(running) => containers.running.push(running),
                Err(e) => {
                    containers.stop_all().await;
                    return Err(e);
                }
            }
        }
        if !specs.is_empty() {
            info!("All containers started");
        }
        Ok(containers)
    }

    pub fn running(&self) -> &[RunningContainer] {
        &self.running
    }

    /// `docker stop` then `docker rm` for each container. Errors are logged.
    pub async fn stop_all(&mut self) {
        while let Some(container) = self.running.pop() {
            for command in stop_commands(&container.spec) {
                let result = container
                    .connection
                    .execute_command(&command, ExecutionMode::Synchronous, &CommandOptions::default())
                    .await;
                if result.status != TaskStatus::Completed {
                    warn!(
                        container = %container.spec.container_name,
                        "{command} failed: {}",
                        shorten(result.stderr.trim(), 200)
                    );
                }
            }
            info!(container = %container.spec.container_name, "Container stopped and removed");
        }
    }
}

async fn start(engine: &Engine, spec: &ContainerSpec) -> Result<RunningContainer, ContainerError> {
    let connection = engine
        .connections
        .get_connection(&spec.connection, &spec.connection_type)
        .await
        .map_err(|source| ContainerError::Connection {
            container: spec.container_name.clone(),
            source,
        })?;
    if !connection.is_connected() {
        connection
            .connect()
            .await
            .map_err(|source| ContainerError::Connection {
                container: spec.container_name.clone(),
                source,
            })?;
    }

    let result = connection
        .execute_command(&start_command(spec), ExecutionMode::Synchronous, &CommandOptions::default())
        .await;
    let container_id = result.stdout.trim().to_string();
    if result.status != TaskStatus::Completed || container_id.is_empty() {
        return Err(ContainerError::Start {
            container: spec.container_name.clone(),
            reason: shorten(result.stderr.trim(), 300),
        });
    }
    info!(container = %spec.container_name, container_id = %container_id, "Container started");
    Ok(RunningContainer {
        spec: spec.clone(),
        container_id,
        connection,
    })
}
