//! `arcana`: command-line front end for the task scheduler.

mod observation_feed;

use arcana_orchestrator::{
    AgentExecutor, CollaborationRouter, CommandExecutor, EventJournal, LoadBalancer, NewTask,
    ObservationWatcher, OrchestratorConfig, SchedulerLoop, SchedulerSettings, StoreHealth,
    SystemStatus, TaskPriority, TaskStore,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use observation_feed::ObservationFeed;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "arcana", about = "Arcana: multi-agent task scheduler")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "arcana.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run {
        /// Directory of observation event files to watch
        #[arg(long)]
        observations: Option<PathBuf>,
    },
    /// Show the task pool status
    Status {
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a task to the pool
    Add {
        description: String,
        #[arg(short, long)]
        agent: String,
        #[arg(short, long, default_value = "medium")]
        priority: TaskPriority,
        /// Task ids that must complete first
        #[arg(long = "depends-on")]
        depends_on: Vec<Uuid>,
        /// Agent that takes over once retries are exhausted
        #[arg(long)]
        escalate_to: Option<String>,
        #[arg(long)]
        tag: Vec<String>,
    },
    /// Feed an observation to the watcher
    Observe {
        /// Free-text observation
        text: Option<String>,
        /// JSON event file instead of text
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
    },
    /// Drop terminal tasks older than the retention period
    Cleanup {
        /// Overrides `tasks.retention_days`
        #[arg(long)]
        days: Option<u32>,
    },
    /// Queue the self-improvement catalogue
    Inject,
    /// Write a status report
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

/// Snapshot written by `status --json` and `export`.
#[derive(Serialize)]
struct StatusReport {
    generated_at: DateTime<Utc>,
    pool_path: PathBuf,
    status: SystemStatus,
    health: StoreHealth,
    blocked_tasks: usize,
    dependency_cycle: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = OrchestratorConfig::load_or_default(&cli.config).await?;
    config.apply_env()?;
    config.validate()?;

    match cli.command {
        Commands::Run { observations } => run(config, observations).await?,
        Commands::Status { json } => {
            let store = open_store(&config, None).await?;
            let report = report(&config, &store).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
        }
        Commands::Add {
            description,
            agent,
            priority,
            depends_on,
            escalate_to,
            tag,
        } => {
            let journal = Arc::new(EventJournal::new(config.journal_dir()));
            let store = open_store(&config, Some(journal.clone())).await?;
            if !config.agents.contains(&agent) {
                warn!(agent = %agent, "Agent is not in the configured agent list");
            }

            let mut spec = NewTask::new(description, agent)
                .with_priority(priority)
                .with_dependencies(depends_on)
                .with_tags(tag);
            if let Some(target) = escalate_to {
                spec = spec.with_escalation_agent(target);
            }
            let id = store.add_task(spec).await;
            journal.flush().await;
            println!("{id}");
        }
        Commands::Observe { text, file } => {
            let journal = Arc::new(EventJournal::new(config.journal_dir()));
            let store = open_store(&config, Some(journal.clone())).await?;
            let watcher = ObservationWatcher::new(store, config.rules.clone())
                .with_journal(journal.clone());

            let created = match (text, file) {
                (_, Some(path)) => {
                    let raw = tokio::fs::read_to_string(&path).await?;
                    watcher.process_event(&serde_json::from_str(&raw)?).await
                }
                (Some(text), None) => watcher.process_observation(&text).await,
                (None, None) => anyhow::bail!("Provide observation text or --file"),
            };
            journal.flush().await;
            if created.is_empty() {
                println!("No rule matched or a similar task is already queued.");
            }
            for id in created {
                println!("{id}");
            }
        }
        Commands::Cleanup { days } => {
            let journal = Arc::new(EventJournal::new(config.journal_dir()));
            let store = open_store(&config, Some(journal.clone())).await?;
            let removed = store
                .cleanup_older_than(days.unwrap_or(config.tasks.retention_days))
                .await;
            journal.flush().await;
            println!("Removed {removed} task(s)");
        }
        Commands::Inject => {
            let journal = Arc::new(EventJournal::new(config.journal_dir()));
            let store = open_store(&config, Some(journal.clone())).await?;
            let watcher = ObservationWatcher::new(store, config.rules.clone())
                .with_maintenance(config.maintenance.clone())
                .with_journal(journal.clone());
            let created = watcher.inject_self_improvement_tasks().await;
            journal.flush().await;
            println!("Queued {created} self-improvement task(s)");
        }
        Commands::Export { output } => {
            let store = open_store(&config, None).await?;
            let json = serde_json::to_string_pretty(&report(&config, &store).await)?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    info!(path = %path.display(), "Status report exported");
                }
                None => println!("{json}"),
            }
        }
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

async fn run(config: OrchestratorConfig, observations: Option<PathBuf>) -> anyhow::Result<()> {
    let journal = Arc::new(EventJournal::new(config.journal_dir()));
    let store = open_store(&config, Some(journal.clone())).await?;

    let balancer = Arc::new(
        LoadBalancer::new(config.dispatch.default_max_concurrent_tasks)
            .with_limits(config.dispatch.max_concurrent_tasks.clone()),
    );
    let router = Arc::new(CollaborationRouter::new(
        config.collaboration.triggers.clone(),
        config.collaboration.specializations.clone(),
        config.agents.clone(),
    ));
    let watcher = Arc::new(
        ObservationWatcher::new(store.clone(), config.rules.clone())
            .with_maintenance(config.maintenance.clone())
            .with_journal(journal.clone()),
    );

    let scheduler = Arc::new(
        SchedulerLoop::new(
            store,
            balancer,
            executor(&config),
            router,
            SchedulerSettings::from_config(&config),
        )
        .with_watcher(watcher.clone())
        .with_journal(journal),
    );

    let _feed = match observations {
        Some(dir) => Some(start_feed(dir, watcher).await?),
        None => None,
    };

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!(error = %e, "Signal handler failed, shutting down"),
        }
        let _ = tx.send(true);
    });

    info!(
        agents = config.agents.len(),
        pool = %config.pool_path().display(),
        "Starting Arcana scheduler"
    );
    scheduler.run(rx).await?;
    Ok(())
}

async fn start_feed(dir: PathBuf, watcher: Arc<ObservationWatcher>) -> anyhow::Result<ObservationFeed> {
    tokio::fs::create_dir_all(&dir).await?;
    let created =
        observation_feed::catch_up(&watcher, &dir, observation_feed::CATCH_UP_WINDOW).await;
    if created > 0 {
        info!(created, "Processed recent observation files");
    }
    Ok(ObservationFeed::start(
        dir,
        watcher,
        observation_feed::DEBOUNCE,
    )?)
}

fn executor(config: &OrchestratorConfig) -> Arc<dyn AgentExecutor> {
    let mut executor = CommandExecutor::new(config.executor.commands.clone());
    if let Some(fallback) = &config.executor.fallback {
        executor = executor.with_fallback(fallback.clone());
    }
    if config.executor.commands.is_empty() && config.executor.fallback.is_none() {
        warn!("No executor commands configured, every dispatch will fail");
    }
    Arc::new(executor)
}

async fn open_store(
    config: &OrchestratorConfig,
    journal: Option<Arc<EventJournal>>,
) -> anyhow::Result<Arc<TaskStore>> {
    let mut store = TaskStore::open(config.pool_path(), config.store_options()).await?;
    if let Some(journal) = journal {
        store = store.with_journal(journal);
    }
    Ok(Arc::new(store))
}

async fn report(config: &OrchestratorConfig, store: &TaskStore) -> StatusReport {
    StatusReport {
        generated_at: Utc::now(),
        pool_path: config.pool_path(),
        status: store.system_status().await,
        health: store.health().await,
        blocked_tasks: store.blocked_count().await,
        dependency_cycle: store.has_cycle().await,
    }
}

fn print_status(report: &StatusReport) {
    let status = &report.status;
    println!("Task pool: {}", report.pool_path.display());
    println!(
        "  {} task(s), {} created, {} completed, {} collaboration request(s)",
        status.total_tasks,
        status.total_tasks_created,
        status.total_tasks_completed,
        status.collaboration_requests
    );
    if !report.health.healthy {
        println!(
            "  DEGRADED: {}",
            report.health.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    if report.blocked_tasks > 0 {
        println!("  {} pending task(s) blocked on dependencies", report.blocked_tasks);
    }
    if report.dependency_cycle {
        println!("  dependency cycle detected");
    }

    println!();
    for (state, count) in &status.status_breakdown {
        println!("  {state:<12} {count}");
    }

    println!();
    println!(
        "  {:<18} {:>7} {:>7} {:>9} {:>6} {:>8}",
        "agent", "pending", "active", "completed", "failed", "avg min"
    );
    for (agent, load) in &status.agent_workloads {
        println!(
            "  {:<18} {:>7} {:>7} {:>9} {:>6} {:>8.1}",
            agent,
            load.pending_tasks,
            load.in_progress_tasks,
            load.completed_tasks,
            load.failed_tasks,
            load.average_task_time
        );
    }
}
