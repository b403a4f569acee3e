//! hwv - hardware validation test runner.
//!
//! Discovers scenario files, runs them against the targets described in the
//! connection document and writes per-scenario results under the workspace.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hwv::connection::{ConnectionRegistry, TransportSettings};
use hwv::containers::ContainerError;
use hwv::loader::{LoadError, ScenarioFilter, discover_scenarios, required_connections};
use hwv::pool::WorkerPool;
use hwv::results::{ResultError, render_grid};
use hwv::{Engine, Orchestrator};
use hwv_common::{
    Coded, ConfigError, ConnectionsConfig, EngineConfig, ErrorCode, LogConfig, LoggingError,
    Sourced, init_logging, sanitize_file_stem,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hwv")]
#[command(author, version, about = "Hardware validation test orchestration")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit console logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every scenario matching the filters
    Run {
        /// Directory searched recursively for scenario files
        #[arg(long)]
        test_dir: PathBuf,

        /// Root for logs and results (defaults to HWV_WORKSPACE)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Connection configuration document (defaults to HWV_CONN_CONFIG)
        #[arg(long)]
        conn_config: Option<PathBuf>,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// List scenarios matching the filters
    List {
        #[arg(long)]
        test_dir: PathBuf,

        /// Also report whether every connection a scenario needs is configured
        #[arg(long)]
        conn_config: Option<PathBuf>,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Probe every connection described in the configuration
    Discover {
        #[arg(long)]
        conn_config: Option<PathBuf>,

        /// Print the reports as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    test_id: Option<String>,

    /// Case-insensitive substring of the test name
    #[arg(long)]
    test_name: Option<String>,

    #[arg(long)]
    test_group: Option<String>,

    /// Matches scenarios carrying any of these tags
    #[arg(long, value_delimiter = ',')]
    tags: Vec<String>,
}

impl From<FilterArgs> for ScenarioFilter {
    fn from(args: FilterArgs) -> Self {
        Self {
            test_id: args.test_id,
            test_name: args.test_name,
            test_group: args.test_group,
            tags: args.tags,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = EngineConfig::from_env()?;
    let level = if cli.verbose { "debug".to_string() } else { config.log_level.value.clone() };
    let json = cli.json_logs || config.log_json.value;

    match cli.command {
        Command::Run {
            test_dir,
            workspace,
            conn_config,
            filter,
        } => {
            if let Some(workspace) = workspace {
                config.workspace = Sourced::from_cli(workspace);
            }
            if let Some(path) = conn_config {
                config.conn_config = Sourced::from_cli(Some(path));
            }
            let run_dir = config.run_directory(&chrono::Local::now().format("%Y%m%d_%H%M%S").to_string());
            let _guards = init_logging(
                &LogConfig::default()
                    .with_level(level)
                    .with_json(json)
                    .with_log_dir(&run_dir),
            )?;
            run(config, &test_dir, &run_dir, filter.into()).await
        }
        Command::List {
            test_dir,
            conn_config,
            filter,
        } => {
            let _guards = init_logging(&LogConfig::default().with_level(level).with_json(json))?;
            let connections = match conn_config.or(config.conn_config.value) {
                Some(path) => Some(ConnectionsConfig::load(&path)?),
                None => None,
            };
            list(&test_dir, connections.as_ref(), &filter.into())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Discover { conn_config, json: as_json } => {
            let _guards = init_logging(&LogConfig::default().with_level(level).with_json(json))?;
            let path = conn_config
                .or(config.conn_config.value.clone())
                .context("--conn-config or HWV_CONN_CONFIG is required")?;
            discover(&config, &path, as_json).await
        }
    }
}

fn load_connections(config: &EngineConfig) -> Result<ConnectionsConfig> {
    match &config.conn_config.value {
        Some(path) => Ok(ConnectionsConfig::load(path)?),
        None => {
            warn!("No connection configuration given, only local connections are available");
            Ok(ConnectionsConfig::default())
        }
    }
}

async fn run(config: EngineConfig, test_dir: &Path, run_dir: &Path, filter: ScenarioFilter) -> Result<ExitCode> {
    let connections = Arc::new(load_connections(&config)?);
    let scenarios = discover_scenarios(test_dir, &filter)?;
    if scenarios.is_empty() {
        warn!(test_dir = %test_dir.display(), "No scenarios matched");
        return Ok(ExitCode::SUCCESS);
    }
    info!("Running {} scenario(s); results under {}", scenarios.len(), run_dir.display());

    let mut failed = 0usize;
    for found in scenarios {
        let scenario = found.scenario;
        info!(path = %found.path.display(), "Running test: {}", scenario.test_id);
        let workspace = run_dir.join(sanitize_file_stem(&scenario.test_id));
        let orchestrator = Orchestrator::new(Engine::new(config.clone(), Arc::clone(&connections), &workspace));
        let report = orchestrator.run(&scenario).await;
        if !report.passed {
            failed += 1;
        }

        let results = &orchestrator.engine().results;
        info!("---------------------- Test Summary -------------------------");
        results.log_summary();
        results.dump_results(&workspace.join("test_results.json"))?;
        results.dump_diagnostics(&workspace.join("diagnostics_codes.json"))?;
        info!("\n{}", results.summary_table());
        info!(
            test_id = %report.test_id,
            passed = report.passed,
            "Total execution time: {:.2}s",
            report.duration_secs
        );
    }

    if failed > 0 {
        error!("{failed} scenario(s) failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn list(test_dir: &Path, connections: Option<&ConnectionsConfig>, filter: &ScenarioFilter) -> Result<()> {
    let mut headers = vec!["Test ID", "Test Name", "Test Group", "Tags"];
    if connections.is_some() {
        headers.push("Executable");
    }
    let rows: Vec<Vec<String>> = discover_scenarios(test_dir, filter)?
        .into_iter()
        .map(|found| {
            let s = found.scenario;
            let mut row = vec![s.test_id.clone(), s.test_name.clone(), s.test_group.clone(), s.tags.join(", ")];
            if let Some(config) = connections {
                let executable = required_connections(&s)
                    .iter()
                    .all(|(name, kind)| is_configured(config, name, kind));
                row.push(executable.to_string());
            }
            row
        })
        .collect();
    let headers: Vec<String> = headers.into_iter().map(String::from).collect();
    println!("{}", render_grid(&headers, &rows));
    Ok(())
}

fn is_configured(config: &ConnectionsConfig, name: &str, kind: &str) -> bool {
    if name.eq_ignore_ascii_case("local") || kind.eq_ignore_ascii_case("local") {
        return true;
    }
    config.has_section(name) && config.declared_types().iter().any(|t| t == kind)
}

async fn discover(config: &EngineConfig, path: &Path, as_json: bool) -> Result<ExitCode> {
    let connections = Arc::new(ConnectionsConfig::load(path)?);
    let pool = WorkerPool::new(config.max_workers.value);
    let registry = ConnectionRegistry::new(connections, TransportSettings::from_config(config), pool.clone());
    let reports = registry.probe_all().await;
    registry.close_all().await;
    pool.shutdown(config.connect_timeout.value).await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        let headers: Vec<String> = ["Connection", "Type", "Status", "Connect (s)", "Total (s)", "Message"]
            .map(String::from)
            .to_vec();
        let rows: Vec<Vec<String>> = reports
            .iter()
            .map(|r| {
                vec![
                    r.connection.clone(),
                    r.connection_type.clone(),
                    format!("{:?}", r.status).to_uppercase(),
                    r.connect_time.map(|t| format!("{t:.2}")).unwrap_or_default(),
                    format!("{:.2}", r.total_time),
                    hwv_common::shorten(&r.message, 60),
                ]
            })
            .collect();
        println!("{}", render_grid(&headers, &rows));
    }
    let succeeded = reports
        .iter()
        .filter(|r| r.status == hwv::connection::ProbeStatus::Success)
        .count();
    info!("{succeeded}/{} connections reachable", reports.len());
    Ok(ExitCode::SUCCESS)
}

/// Print the catalog entry for errors that carry one.
fn report_error(err: &anyhow::Error) {
    let code = err
        .downcast_ref::<ConfigError>()
        .map(Coded::error_code)
        .or_else(|| err.downcast_ref::<LoadError>().map(Coded::error_code))
        .or_else(|| err.downcast_ref::<ResultError>().map(Coded::error_code))
        .or_else(|| err.downcast_ref::<ContainerError>().map(Coded::error_code))
        .or_else(|| {
            err.downcast_ref::<LoggingError>()
                .map(|_| ErrorCode::InternalLoggingError)
        });
    eprintln!("error: {err:#}");
    if let Some(code) = code {
        eprintln!("{}", code.entry().format_full());
    }
}
