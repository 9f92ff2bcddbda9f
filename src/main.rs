use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipewright_core::config::AppConfig;
use pipewright_core::graph::GraphDefinition;
use pipewright_core::traits::{GraphStore, NotificationSink};
use pipewright_core::types::{RunRecord, TriggerInfo, TriggerKind};
use pipewright_engine::{
    ExecutionPlanner, FileNotifier, LogNotifier, Orchestrator, RunLogger, ScheduleTrigger,
    TriggerDispatcher,
};
use pipewright_executors::{ExecutorRegistry, HttpTextGenerator};
use pipewright_store::{MemoryGraphStore, SqliteGraphStore};

#[derive(Parser)]
#[command(name = "pipewright", version, about = "Run node-graph data pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "pipewright.toml", env = "PIPEWRIGHT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a pipeline definition from a JSON file
    Import {
        /// Graph definition (JSON)
        file: PathBuf,
    },
    /// Validate a pipeline and print its run order
    Plan {
        /// Stored pipeline id, or a path to a JSON definition
        pipeline: String,
    },
    /// Run a stored pipeline once
    Run {
        /// Pipeline id
        pipeline_id: String,
        /// Trigger data (JSON)
        #[arg(long)]
        data: Option<String>,
        /// Trigger type to report (manual, schedule, webhook, file_watch)
        #[arg(long, default_value = "manual")]
        trigger: String,
    },
    /// Show recent runs of a pipeline
    History {
        /// Pipeline id
        pipeline_id: String,
        /// Number of runs to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// List stored pipelines
    List,
    /// List the available node types
    Types,
    /// Run configured schedules until Ctrl-C
    Schedule,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PIPEWRIGHT_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("pipewright=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "pipewright", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Types => {
            print_types();
            return Ok(());
        }
        _ => {}
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let store = open_store(&config)?;
    let registry = Arc::new(ExecutorRegistry::with_builtins());

    match cli.command {
        Commands::Import { file } => {
            let graph = read_graph(&file)?;
            let errors = ExecutionPlanner::validate(&graph);
            if !errors.is_empty() {
                bail!("{} is not a valid pipeline: {}", file.display(), errors.join("; "));
            }
            for problem in graph.nodes.iter().flat_map(|n| registry.validate_node(n)) {
                warn!("{}", problem);
            }
            store.put_graph(&graph).await?;
            println!("Imported {} ({} nodes)", graph.id, graph.nodes.len());
        }
        Commands::Plan { pipeline } => {
            let graph = if Path::new(&pipeline).exists() {
                read_graph(Path::new(&pipeline))?
            } else {
                store
                    .get(&pipeline)
                    .await?
                    .with_context(|| format!("no pipeline named {}", pipeline))?
            };
            let plan = ExecutionPlanner::plan(&graph)?;
            for (i, node_id) in plan.order.iter().enumerate() {
                let kind = graph.node(node_id).map(|n| n.kind.as_str()).unwrap_or("?");
                println!("{:>3}. {} ({})", i + 1, node_id, kind);
            }
            let problems: Vec<String> = graph
                .nodes
                .iter()
                .flat_map(|n| registry.validate_node(n))
                .collect();
            if !problems.is_empty() {
                println!();
                for problem in problems {
                    println!("  warning: {}", problem);
                }
            }
        }
        Commands::Run {
            pipeline_id,
            data,
            trigger,
        } => {
            let kind: TriggerKind = trigger.parse().map_err(anyhow::Error::msg)?;
            let data = data
                .map(|raw| serde_json::from_str(&raw))
                .transpose()
                .context("--data must be valid JSON")?;
            let orchestrator = build_orchestrator(&config, store, registry);
            let record = orchestrator
                .run(&pipeline_id, TriggerInfo::new(kind, data))
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::History { pipeline_id, limit } => {
            let runs = store.list_runs(&pipeline_id, limit).await?;
            if runs.is_empty() {
                println!("No runs recorded for {}", pipeline_id);
            }
            for run in &runs {
                print_run_line(run);
            }
        }
        Commands::List => {
            let graphs = store.list_graphs().await?;
            if graphs.is_empty() {
                println!("No pipelines stored. Use `pipewright import <file>`.");
            }
            for graph in graphs {
                let updated = graph
                    .updated_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{:<24} {:<32} {:>3} nodes  {}",
                    graph.id, graph.name, graph.node_count, updated
                );
            }
        }
        Commands::Schedule => {
            if config.schedules.is_empty() {
                bail!("no [[schedules]] configured in {}", cli.config.display());
            }
            let trigger = ScheduleTrigger::new(&config.schedules);
            if trigger.is_empty() {
                bail!("none of the configured schedules have a valid cron expression");
            }

            let orchestrator = Arc::new(build_orchestrator(&config, store, registry));
            let mut dispatcher = TriggerDispatcher::new(orchestrator);
            dispatcher.add_source(Arc::new(trigger));

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down scheduler...");
                cancel_clone.cancel();
            });

            let dispatched = dispatcher.run(cancel).await?;
            info!(runs = dispatched, "Scheduler stopped");
        }
        Commands::Completions { .. } | Commands::Types => unreachable!("handled before config load"),
    }

    Ok(())
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn GraphStore>> {
    Ok(match config.store_path() {
        Some(path) => Arc::new(SqliteGraphStore::open(&path)?),
        None => {
            warn!("In-memory store configured; nothing will be kept after exit");
            Arc::new(MemoryGraphStore::new())
        }
    })
}

fn build_orchestrator(
    config: &AppConfig,
    store: Arc<dyn GraphStore>,
    registry: Arc<ExecutorRegistry>,
) -> Orchestrator {
    let notifier: Arc<dyn NotificationSink> = match config.notification_file() {
        Some(path) => Arc::new(FileNotifier::new(path)),
        None => Arc::new(LogNotifier),
    };

    let mut orchestrator = Orchestrator::new(store, registry)
        .with_config(config.engine.clone())
        .with_notifier(notifier);

    if let Some(ai) = &config.ai {
        orchestrator = orchestrator.with_text_generator(Arc::new(HttpTextGenerator::new(ai.clone())));
    }
    if let Some(logger) = config
        .log
        .as_ref()
        .and_then(|log| RunLogger::from_config(log, config.log_dir()))
    {
        orchestrator = orchestrator.with_run_log(logger);
    }
    orchestrator
}

fn read_graph(path: &Path) -> anyhow::Result<GraphDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn print_types() {
    let registry = ExecutorRegistry::with_builtins();
    for kind in registry.kinds() {
        let description = registry
            .get(kind.as_str())
            .map(|e| e.description().to_string())
            .unwrap_or_default();
        println!(
            "{:<16} {:<11} {}",
            kind.as_str(),
            kind.category().to_string(),
            description
        );
    }
}

fn print_run_line(run: &RunRecord) {
    let outcome = match &run.error {
        Some(e) => format!("failed: {}", e),
        None => "success".to_string(),
    };
    println!(
        "{}  {}  {:>6}ms  {:<10} {}",
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.id,
        run.duration_ms,
        run.trigger_type.to_string(),
        outcome
    );
}
