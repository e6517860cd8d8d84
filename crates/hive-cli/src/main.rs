use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hive_core::HiveConfig;
use hive_core::app::{
    BatchReport, ClaimDispatcher, Claimer, CycleSummary, ParallelOrchestrator, StopReason,
    TaskScheduler, sort_candidates,
};
use hive_core::domain::TaskId;
use hive_core::graph::DependencyGraph;
use hive_core::impls::{CommandExecutor, JsonFileTaskStore};
use hive_core::lease::{CoordinatorClient, CoordinatorState, LeaseStore, serve};
use hive_core::ports::{LeaseBackend, TaskStore};

#[derive(Parser)]
#[command(name = "hive")]
#[command(about = "Coordinate agents over a shared task list")]
struct Cli {
    /// JSON config file; every field is optional
    #[arg(long, global = true, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the lease coordinator over HTTP
    Coordinator {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List ready tasks in scheduling order
    Ready {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Show the dependency summary, or why one task is blocked
    Deps {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run one scheduling cycle that claims ready tasks for an agent
    Dispatch {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        max: Option<usize>,
        #[arg(long, default_value = "hive-agent")]
        agent: String,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Run execution loops over ready tasks in parallel
    Weave {
        #[arg(long)]
        tasks: PathBuf,
        #[arg(long)]
        parallel: Option<usize>,
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Per-loop timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Whole-batch deadline in seconds
        #[arg(long)]
        deadline: Option<u64>,
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Program (and arguments) run once per iteration
        #[arg(long, num_args = 1.., required = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hive_core=info,hive_cli=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HiveConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Coordinator { host, port } => run_coordinator(config, host, port).await,
        Commands::Ready { tasks, json } => run_ready(&tasks, json).await,
        Commands::Deps { tasks, task, json } => run_deps(&tasks, task, json).await,
        Commands::Dispatch {
            tasks,
            max,
            agent,
            dry_run,
        } => run_dispatch(config, &tasks, max, agent, dry_run).await,
        Commands::Weave {
            tasks,
            parallel,
            max_iterations,
            timeout,
            deadline,
            json,
            command,
        } => {
            let mut config = config;
            if let Some(n) = parallel {
                config.orchestrator.max_parallel = n;
            }
            if let Some(n) = max_iterations {
                config.execution.max_iterations = n;
            }
            if let Some(secs) = timeout {
                config.execution.timeout_secs = secs;
            }
            if let Some(secs) = deadline {
                config.orchestrator.deadline_secs = secs;
            }
            config.validate()?;
            run_weave(config, &tasks, command, json).await
        }
    }
}

async fn run_coordinator(
    mut config: HiveConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.coordinator.host = host;
    }
    if let Some(port) = port {
        config.coordinator.port = port;
    }
    let addr: SocketAddr = format!("{}:{}", config.coordinator.host, config.coordinator.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.coordinator.host))?;

    let state = CoordinatorState::new(
        LeaseStore::new(config.lease_settings()),
        config.auth_policy(),
    );
    let sweep = Duration::from_secs(config.coordinator.sweep_interval_secs);
    serve(addr, state, sweep, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            // Without a signal handler the only way out is killing the process.
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

async fn load_graph(tasks: &Path) -> Result<DependencyGraph> {
    let records = JsonFileTaskStore::new(tasks).list_all().await?;
    Ok(DependencyGraph::build(records))
}

async fn run_ready(tasks: &Path, json: bool) -> Result<()> {
    let graph = load_graph(tasks).await?;
    let mut ready = graph.ready_records();
    sort_candidates(&mut ready);

    if json {
        println!("{}", serde_json::to_string_pretty(&ready)?);
        return Ok(());
    }
    if ready.is_empty() {
        println!("no ready tasks");
        return Ok(());
    }
    for record in ready {
        let updated = record
            .last_updated
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:<32} {updated}",
            record.priority.as_str(),
            record.task_id.as_str()
        );
    }
    Ok(())
}

async fn run_deps(tasks: &Path, task: Option<String>, json: bool) -> Result<()> {
    let graph = load_graph(tasks).await?;

    if let Some(task) = task {
        let info = graph.blocking_info(&TaskId::new(task));
        if json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else if !info.is_blocked {
            println!("{} is not blocked", info.task_id);
        } else {
            println!("{} is blocked:", info.task_id);
            for reason in &info.reasons {
                println!("  - {reason}");
            }
        }
        return Ok(());
    }

    let summary = graph.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("{} tasks", summary.total_tasks);
    for cycle in &summary.cycles {
        let ids: Vec<&str> = cycle.iter().map(TaskId::as_str).collect();
        println!("cycle: {}", ids.join(" -> "));
    }
    for task in &summary.tasks {
        let marker = if task.effectively_blocked { "blocked" } else { "ok" };
        println!("{:<8} {:<10} {}", marker, task.status.as_str(), task.task_id);
        for reason in &task.blocking_reasons {
            println!("         {reason}");
        }
    }
    Ok(())
}

/// Claimer over the task file, plus the coordinator when one is configured.
async fn claimer_for(config: &HiveConfig, tasks: &Path) -> Result<Claimer> {
    let store: Arc<dyn TaskStore> = Arc::new(JsonFileTaskStore::new(tasks));
    let claimer = Claimer::new(store);
    let Some(url) = config.client.url.as_deref() else {
        return Ok(claimer);
    };

    let client = CoordinatorClient::new(
        url,
        config.client.api_key.clone(),
        Duration::from_secs(config.client.timeout_secs),
        config.client.retry_count,
    )?;
    if !client.is_available().await {
        warn!(url, "coordinator not reachable, claims will fall back to the owner field");
    }
    let leases: Arc<dyn LeaseBackend> = Arc::new(client);
    Ok(claimer.with_leases(leases, config.lease_ttl()))
}

async fn run_dispatch(
    config: HiveConfig,
    tasks: &Path,
    max: Option<usize>,
    agent: String,
    dry_run: bool,
) -> Result<()> {
    let max = max.unwrap_or(config.scheduler.max_dispatches);
    if max == 0 {
        bail!("--max must be at least 1");
    }
    let claimer = claimer_for(&config, tasks).await?;
    let store = Arc::clone(claimer.store());
    let dispatcher = ClaimDispatcher::new(claimer, agent).dry_run(dry_run);

    let summary = TaskScheduler::new(max)
        .run_cycle(store.as_ref(), &dispatcher)
        .await;
    print_cycle(&summary, dry_run);
    if let StopReason::StoreUnavailable { message } = summary.stop_reason {
        bail!("task store unavailable: {message}");
    }
    Ok(())
}

fn print_cycle(summary: &CycleSummary, dry_run: bool) {
    let verb = if dry_run { "would claim" } else { "claimed" };
    for id in &summary.dispatched {
        println!("{verb} {id}");
    }
    for skipped in &summary.skipped {
        println!("skipped {}: {}", skipped.task_id, skipped.reason);
    }
    println!(
        "{} attempted, {} dispatched, stop: {:?}",
        summary.attempts,
        summary.dispatched.len(),
        summary.stop_reason
    );
}

async fn run_weave(
    config: HiveConfig,
    tasks: &Path,
    command: Vec<String>,
    json: bool,
) -> Result<()> {
    let mut command = command.into_iter();
    let Some(program) = command.next() else {
        bail!("--command needs a program");
    };
    let executor = Arc::new(CommandExecutor::new(program).args(command));

    let claimer = claimer_for(&config, tasks).await?;
    let orchestrator = ParallelOrchestrator::new(claimer, executor, config.orchestrator_config());
    let report = orchestrator.weave_until(shutdown_signal()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_batch(&report);
    }
    Ok(())
}

fn print_batch(report: &BatchReport) {
    for (loop_id, state) in &report.loops {
        println!(
            "{loop_id} {} {} after {} iteration(s)",
            state.task_id, state.status, state.current_iteration
        );
        if let Some(err) = state.error() {
            println!("    {:?}: {err}", err.kind());
        }
    }
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.task_id, skipped.reason);
    }
    let counts: Vec<String> = report
        .status_counts
        .iter()
        .map(|(status, n)| format!("{status}={n}"))
        .collect();
    println!(
        "{} loop(s) in {:.1}s [{}]{}{}",
        report.loops.len(),
        report.elapsed_secs,
        counts.join(", "),
        if report.deadline_hit { " deadline hit" } else { "" },
        if report.interrupted { " interrupted" } else { "" },
    );
}
