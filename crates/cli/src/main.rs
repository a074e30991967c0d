//! `workflow-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`  - check a workflow definition JSON file.
//! - `migrate`   - run pending database migrations.
//! - `reconcile` - replay lifecycle events the runtime rejected.
//! - `cleanup`   - delete instances whose definition is gone.
//! - `metrics`   - print the engine's Prometheus metrics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::{DbPool, PgStore};
use engine::metrics::{init_metrics, render_metrics};
use engine::{CelEvaluator, Reconciler, WorkflowConfig};
use queue::{PgRuntime, Runtime};

#[derive(Parser)]
#[command(
    name = "workflow-engine",
    about = "Workflow and approval engine maintenance tool",
    version
)]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true, env = "WORKFLOW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the definition JSON file.
        path: PathBuf,
    },
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Re-emit events whose delivery failed.
    Reconcile {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// Run a single pass instead of looping until interrupted.
        #[arg(long)]
        once: bool,
    },
    /// Delete orphaned workflow instances.
    Cleanup {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
        /// Restrict to one organization.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Print metrics in the Prometheus text format.
    Metrics,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    init_metrics();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => WorkflowConfig::load(path)?,
        None => WorkflowConfig::default(),
    };

    match cli.command {
        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&content).context("invalid JSON")?;

            let cel = CelEvaluator::new(config.cel.clone());
            match engine::validate_definition_value(&value, &cel, None) {
                Ok(doc) => {
                    println!(
                        "definition is valid: {} trigger(s), {} action(s) on {}",
                        doc.triggers.len(),
                        doc.actions.len(),
                        doc.schema_type
                    );
                }
                Err(engine::EngineError::DefinitionInvalid(problems)) => {
                    for problem in &problems {
                        eprintln!("- {problem}");
                    }
                    bail!("{} problem(s) in {}", problems.len(), path.display());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Migrate { database_url } => {
            let pool = connect(&database_url, 2).await?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("migrations applied");
        }
        Command::Reconcile { database_url, once } => {
            let pool = connect(&database_url, 5).await?;
            let store = Arc::new(PgStore::new(pool.clone()));
            let runtime: Arc<dyn Runtime> = Arc::new(PgRuntime::new(pool));
            let reconciler = Reconciler::new(store, Some(runtime), config.reconciler.clone());

            if once {
                let report = reconciler.reconcile_once().await?;
                println!(
                    "scanned {}, recovered {}, retried {}, terminal {}",
                    report.scanned, report.recovered, report.retried, report.terminal
                );
            } else {
                let shutdown = CancellationToken::new();
                let signal = shutdown.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("interrupt received; stopping reconciler");
                        signal.cancel();
                    }
                });
                reconciler.run(shutdown).await;
            }
        }
        Command::Cleanup { database_url, owner } => {
            let pool = connect(&database_url, 2).await?;
            let store = PgStore::new(pool);
            let deleted = engine::cleanup_orphan_workflow_instances(&store, owner.as_deref()).await?;
            println!("deleted {} orphaned instance(s)", deleted.len());
        }
        Command::Metrics => {
            print!("{}", render_metrics());
        }
    }
    Ok(())
}

async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<DbPool> {
    db::pool::create_pool(database_url, max_connections)
        .await
        .context("failed to connect to database")
}
