pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::engine::planner::FilterRequest;
use crate::engine::types::*;
use crate::engine::{USAGE_STATES, WorkflowMonitor};
use crate::lock::LockService;
use crate::lock::memory::MemoryLockService;
use crate::storage::sql::render;
use crate::storage::sql_store::SqlStepStore;

pub use self::config::FlowWatchConfig;

const DEFAULT_DATABASE_URL: &str = "sqlite://flowwatch.db?mode=rwc";

#[derive(Parser)]
#[command(name = "flowwatch", version, about = "Workflow instance lifecycle monitor")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a flowwatch.yaml config file (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL of the step store
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Filters shared by `list` and `plan`.
#[derive(Args, Debug, Default)]
pub struct FilterArgs {
    /// States to include (comma separated, e.g. active,halted)
    #[arg(long, value_delimiter = ',')]
    state: Vec<String>,

    /// Statuses to include (error, success)
    #[arg(long, value_delimiter = ',')]
    status: Vec<String>,

    /// Workflow definition ids to include
    #[arg(long, value_delimiter = ',')]
    definition: Vec<i64>,

    /// Workflow ids to include
    #[arg(long, value_delimiter = ',')]
    id: Vec<i64>,

    /// Earliest instance start time (RFC 3339 or "YYYY-MM-DD HH:MM:SS")
    #[arg(long)]
    from: Option<String>,

    /// Latest instance start time
    #[arg(long)]
    to: Option<String>,

    /// Maximum number of ids (default: max_to_display from config)
    #[arg(long)]
    cap: Option<usize>,

    /// Scan without a cap
    #[arg(long, conflicts_with = "cap")]
    all: bool,
}

impl FilterArgs {
    fn into_request(self, default_cap: usize) -> Result<FilterRequest> {
        let states = self
            .state
            .iter()
            .map(|s| s.parse::<LifecycleState>())
            .collect::<Result<Vec<_>, _>>()?;
        let statuses = self
            .status
            .iter()
            .map(|s| s.parse::<Status>())
            .collect::<Result<Vec<_>, _>>()?;
        let window = TimeWindow {
            from: self.from.as_deref().map(parse_timestamp).transpose()?,
            to: self.to.as_deref().map(parse_timestamp).transpose()?,
        };
        let cap = if self.all {
            None
        } else {
            Some(self.cap.unwrap_or(default_cap))
        };

        Ok(FilterRequest {
            states,
            statuses,
            definition_ids: self.definition,
            workflow_ids: self.id,
            window,
            cap,
        })
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the lifecycle state of an instance
    State {
        /// Workflow id
        id: String,
    },

    /// Show the status of one or more instances
    Status {
        /// Workflow ids
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List instance ids matching state/status filters
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Print the query plan and SQL a listing would run
    Plan {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Terminate an instance
    Terminate {
        /// Workflow id
        id: String,

        /// Operator requesting the terminate
        #[arg(long)]
        user: Option<String>,
    },

    /// Mark an instance as interrupted
    Interrupt {
        /// Workflow id
        id: String,

        /// Record the interrupt as automatic instead of manual
        #[arg(long)]
        auto: bool,
    },

    /// Overwrite every branch of an instance as terminated
    ForceTerminate {
        /// Workflow id
        id: String,
    },

    /// Mark an instance administratively inactive
    Stop {
        /// Workflow id
        id: String,
    },

    /// Show the step log of one branch
    History {
        /// Workflow id
        id: String,

        /// Branch id
        branch: String,
    },

    /// List instances left dangling by a system shutdown
    ShutdownList,

    /// Count instances per non-final state
    Usage {
        /// Maximum number of instances to inspect
        #[arg(long)]
        cap: Option<usize>,
    },

    /// List finished instances that can be archived
    Movable {
        /// complete, terminated or complete_or_terminated
        #[arg(long, default_value = "complete_or_terminated")]
        selection: String,

        /// Maximum number of ids
        #[arg(long)]
        max_rows: Option<usize>,
    },

    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, env = "HOST")]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let file_config = FlowWatchConfig::load(cli.config.as_deref())?;
    let database_url = cli
        .database_url
        .or_else(|| file_config.database_url.clone())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

    let monitor = build_monitor(&file_config, &database_url).await?;

    match cli.command {
        Commands::State { id } => {
            let id = parse_workflow_id(&id)?;
            println!("{}", monitor.instance_state(id).await);
            Ok(())
        }
        Commands::Status { ids } => cmd_status(&monitor, ids).await,
        Commands::List { filter, format } => cmd_list(&monitor, filter, format).await,
        Commands::Plan { filter } => cmd_plan(&monitor, filter),
        Commands::Terminate { id, user } => {
            let id = parse_workflow_id(&id)?;
            let requester = user.map(Requester::user).unwrap_or_default();
            report_transition("terminate", id, monitor.terminate_as(id, &requester).await)
        }
        Commands::Interrupt { id, auto } => {
            let id = parse_workflow_id(&id)?;
            let kind = if auto {
                InterruptKind::Automatic
            } else {
                InterruptKind::Manual
            };
            report_transition("interrupt", id, monitor.interrupt(id, kind).await)
        }
        Commands::ForceTerminate { id } => {
            let id = parse_workflow_id(&id)?;
            let report = monitor.force_terminate_report(id).await;
            for row in &report.rows {
                println!(
                    "  {} {}",
                    row.branch_id,
                    if row.success { "terminated" } else { "FAILED" }
                );
            }
            report_transition("force-terminate", id, report.succeeded())
        }
        Commands::Stop { id } => {
            let id = parse_workflow_id(&id)?;
            report_transition("stop", id, monitor.stop(id).await)
        }
        Commands::History { id, branch } => cmd_history(&monitor, id, branch).await,
        Commands::ShutdownList => {
            let ids = monitor.system_shutdown_list().await?;
            print_ids(&ids);
            Ok(())
        }
        Commands::Usage { cap } => cmd_usage(&monitor, cap).await,
        Commands::Movable { selection, max_rows } => {
            let selection: MovableSelection = selection.parse()?;
            let ids = monitor.movable_ids(selection, max_rows).await?;
            print_ids(&ids);
            Ok(())
        }
        Commands::Serve { host, port } => {
            let host = host
                .or_else(|| file_config.host.clone())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            let port = port.or(file_config.port).unwrap_or(3000);
            crate::api::serve(&host, port, monitor).await
        }
    }
}

/// Build a monitor from configuration: SQL step store plus the configured
/// lock service.
pub async fn build_monitor(config: &FlowWatchConfig, database_url: &str) -> Result<Arc<WorkflowMonitor>> {
    let mut monitor_config = config.monitor_config();

    let store = SqlStepStore::connect(database_url)
        .await?
        .with_fetch_size(monitor_config.fetch_size);

    // Rendered plans must match the SQL the store actually runs.
    if let Some(configured) = config.dialect.filter(|d| *d != store.dialect()) {
        warn!(
            configured = %configured,
            connected = %store.dialect(),
            "Configured dialect does not match the database, using the database's"
        );
    }
    monitor_config.dialect = store.dialect();

    let locks = lock_service(config).await?;

    Ok(Arc::new(WorkflowMonitor::new(
        Arc::new(store),
        locks,
        monitor_config,
    )))
}

#[cfg(feature = "redis")]
async fn lock_service(config: &FlowWatchConfig) -> Result<Arc<dyn LockService>> {
    match config.redis_url.as_deref() {
        Some(url) => {
            let service = crate::lock::redis_lock::RedisLockService::connect(url).await?;
            info!("Using redis lock service");
            Ok(Arc::new(service))
        }
        None => Ok(Arc::new(MemoryLockService::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn lock_service(config: &FlowWatchConfig) -> Result<Arc<dyn LockService>> {
    if config.redis_url.is_some() {
        anyhow::bail!("redis_url is set but flowwatch was built without the 'redis' feature");
    }
    Ok(Arc::new(MemoryLockService::new()))
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn report_transition(action: &str, id: WorkflowId, success: bool) -> Result<()> {
    if success {
        println!("{} {}: ok", action, id);
        Ok(())
    } else {
        anyhow::bail!("{} {} failed (see log for details)", action, id)
    }
}

fn print_ids(ids: &[WorkflowId]) {
    for id in ids {
        println!("{}", id);
    }
    println!("({} instances)", ids.len());
}

async fn cmd_status(monitor: &WorkflowMonitor, ids: Vec<String>) -> Result<()> {
    let ids = ids
        .iter()
        .map(|s| parse_workflow_id(s))
        .collect::<Result<Vec<_>, _>>()?;

    if let [id] = ids.as_slice() {
        println!("{}", monitor.instance_status(*id).await);
        return Ok(());
    }

    let statuses = monitor.instance_statuses(&ids).await;
    for id in &ids {
        let status = statuses.get(id).map_or("-".to_string(), |s| s.to_string());
        println!("{:<12} {}", id, status);
    }
    Ok(())
}

async fn cmd_list(monitor: &WorkflowMonitor, filter: FilterArgs, format: String) -> Result<()> {
    let request = filter.into_request(monitor.config().max_to_display)?;
    let ids = monitor.list_ids(&request).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&ids)?);
        return Ok(());
    }

    print_ids(&ids);
    Ok(())
}

fn cmd_plan(monitor: &WorkflowMonitor, filter: FilterArgs) -> Result<()> {
    let request = filter.into_request(monitor.config().max_to_display)?;
    let plan = monitor.explain(&request)?;

    println!("Shape: {:?}", plan.shape);
    println!("Clauses:");
    println!("{}", serde_json::to_string_pretty(&plan.clauses)?);
    println!("\nSQL ({}):", monitor.config().dialect);
    println!("{}", render(&plan, monitor.config().dialect));
    Ok(())
}

async fn cmd_history(monitor: &WorkflowMonitor, id: String, branch: String) -> Result<()> {
    let id = parse_workflow_id(&id)?;
    let records = monitor
        .branch_history(id, &branch)
        .await
        .with_context(|| format!("Failed to read history of branch '{}'", branch))?;

    if records.is_empty() {
        println!("No records for workflow {} branch '{}'.", id, branch);
        return Ok(());
    }

    println!(
        "{:<5} {:<10} {:<8} {:<8} {:<28} REPORT",
        "STEP", "ACTIVITY", "BASIC", "ENGINE", "SERVICE"
    );
    for r in &records {
        println!(
            "{:<5} {:<10} {:<8} {:<8} {:<28} {}",
            r.step,
            r.activity_id,
            r.basic_status.code(),
            r.engine_status.code(),
            r.service_name,
            r.status_report.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn cmd_usage(monitor: &WorkflowMonitor, cap: Option<usize>) -> Result<()> {
    let summary = monitor.usage_by_state(cap).await?;
    for state in USAGE_STATES {
        println!("{:<18} {}", state, summary.count(state));
    }
    Ok(())
}
