//! Everything one orchestrator run shares.
//!
//! An [`Engine`] is built per scenario run and borrowed by the runner, the
//! step executor and every handler. It is single-use: the orchestrator shuts
//! the worker pool down at the end of the run.

use crate::artifacts::RunJournal;
use crate::connection::{ConnectionRegistry, TransportSettings};
use crate::context::DiagnosticContext;
use crate::executor::ExecutorRegistry;
use crate::pool::WorkerPool;
use crate::results::ResultCollector;
use hwv_common::{ConnectionsConfig, EngineConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Per-run output directory layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Captured stdout of synchronous command steps.
    pub fn command_outputs(&self) -> PathBuf {
        self.root.join("command_outputs")
    }

    /// stdout/stderr of background steps once they are validated.
    pub fn continued_steps(&self) -> PathBuf {
        self.root.join("continued_steps")
    }

    /// Logs fetched by log-analysis steps.
    pub fn step_logs(&self) -> PathBuf {
        self.root.join("step_logs")
    }

    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [self.command_outputs(), self.continued_steps(), self.step_logs()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub workspace: Workspace,
    pub context: DiagnosticContext,
    pub results: ResultCollector,
    pub connections: ConnectionRegistry,
    pub executors: ExecutorRegistry,
    pub journal: RunJournal,
    pub pool: WorkerPool,
}

impl Engine {
    pub fn new(config: EngineConfig, connections: Arc<ConnectionsConfig>, workspace: impl Into<PathBuf>) -> Self {
        let pool = WorkerPool::new(config.max_workers.value);
        let registry = ConnectionRegistry::new(
            connections,
            TransportSettings::from_config(&config),
            pool.clone(),
        );
        Self {
            workspace: Workspace::new(workspace),
            context: DiagnosticContext::new(),
            results: ResultCollector::new(),
            connections: registry,
            executors: ExecutorRegistry::default(),
            journal: RunJournal::default(),
            pool,
            config,
        }
    }

    #[must_use]
    pub fn with_executors(mut self, executors: ExecutorRegistry) -> Self {
        self.executors = executors;
        self
    }

    pub fn retry_backoff(&self) -> Duration {
        self.config.retry_backoff.value
    }

    pub fn continue_wait(&self) -> Duration {
        self.config.continue_wait.value
    }

    /// Stop accepting background work, wait for queued workers, drop connections.
    pub async fn shutdown(&self) {
        self.pool.shutdown(POOL_SHUTDOWN_GRACE).await;
        self.connections.close_all().await;
        self.journal.close();
        debug!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("run"));
        ws.prepare().unwrap();
        assert!(ws.command_outputs().is_dir());
        assert!(ws.continued_steps().is_dir());
        assert!(ws.step_logs().is_dir());
        assert_eq!(ws.step_logs(), dir.path().join("run/step_logs"));
    }

    #[tokio::test]
    async fn test_engine_uses_config_pool_size() {
        let mut config = EngineConfig::default();
        config.max_workers.value = 3;
        let engine = Engine::new(config, Arc::new(ConnectionsConfig::default()), "ws");
        assert_eq!(engine.pool.max_workers(), 3);
        engine.shutdown().await;
        assert!(engine.pool.is_closed());
    }
}
