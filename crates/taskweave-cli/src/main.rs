//! `taskweave`: administer persisted context records.

mod config;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use config::TaskweaveConfig;
use std::path::PathBuf;
use std::sync::Arc;
use taskweave_agent::{AgentAdapter, FallbackPolicy};
use taskweave_context::{
    ContextRecord, ContextStore, FileContextStore, Priority, RecordFilter, RecordMetadata,
    RecordStatus,
};
use taskweave_core::CapabilityRegistry;
use taskweave_orchestrator::{HealthMonitor, HealthStatus, WorkflowEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "taskweave", about = "Taskweave: multi-agent workflow context admin")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskweave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new active record
    Create {
        /// Task description
        task: String,
        #[arg(long, default_value = "normal")]
        priority: Priority,
        /// Hours until the record expires (0 never expires)
        #[arg(long)]
        ttl_hours: Option<u64>,
        #[arg(long)]
        workflow_type: Option<String>,
        /// Tag to attach (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Print a record as JSON
    Show { id: Uuid },
    /// List active (or archived) records
    List {
        #[arg(long)]
        archived: bool,
    },
    /// Search both locations
    Search {
        /// Case-insensitive substring of the task
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        workflow_type: Option<String>,
        /// Matches records carrying any of the given tags (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// active, completed or failed
        #[arg(long)]
        status: Option<RecordStatus>,
    },
    /// Move a record to the archive
    Archive { id: Uuid },
    /// Archive a record, or remove it for good with --permanent
    Delete {
        id: Uuid,
        #[arg(long)]
        permanent: bool,
    },
    /// Archive every active record past its TTL
    Cleanup {
        /// Only report what would be archived
        #[arg(long)]
        dry_run: bool,
    },
    /// Mark a record cancelled so no workflow runs against it
    Cancel { id: Uuid },
    /// Print store statistics
    Stats,
    /// Check the configuration and run the health checks
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = TaskweaveConfig::load(&cli.config).await?;
    config.resolve_data_dir(&cli.config);

    let store = Arc::new(
        FileContextStore::new(&config.data_dir)
            .await
            .with_context(|| format!("opening store at '{}'", config.data_dir.display()))?,
    );

    match cli.command {
        Commands::Create {
            task,
            priority,
            ttl_hours,
            workflow_type,
            tags,
        } => {
            let mut metadata = RecordMetadata::default()
                .with_priority(priority)
                .with_tags(tags);
            if let Some(hours) = ttl_hours.or(config.store.default_ttl_hours) {
                metadata = metadata.with_ttl_hours(hours);
            }
            if let Some(workflow_type) = workflow_type {
                metadata = metadata.with_workflow_type(workflow_type);
            }
            let record = store.create(&task, metadata).await?;
            info!(record_id = %record.id, "Record created");
            println!("{}", record.id);
        }
        Commands::Show { id } => {
            let record = store.get(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { archived } => {
            let records = if archived {
                store.list_archived(&RecordFilter::default()).await?
            } else {
                store.list_active().await?
            };
            print_records(&records);
        }
        Commands::Search {
            text,
            priority,
            workflow_type,
            tags,
            status,
        } => {
            let filter = RecordFilter {
                priority,
                workflow_type,
                tags,
                text,
                status,
            };
            print_records(&store.search(&filter).await?);
        }
        Commands::Archive { id } => {
            let record = store.archive(id).await?;
            println!("Archived {} (version {})", record.id, record.version);
        }
        Commands::Delete { id, permanent } => {
            store.delete(id, permanent).await?;
            if permanent {
                println!("Deleted {id}");
            } else {
                println!("Archived {id}");
            }
        }
        Commands::Cleanup { dry_run } => {
            let report = store.cleanup_expired(dry_run).await?;
            if dry_run {
                println!("{} expired record(s) would be archived:", report.expired.len());
                for id in &report.expired {
                    println!("  {id}");
                }
            } else {
                println!("Archived {} expired record(s)", report.archived.len());
            }
        }
        Commands::Cancel { id } => {
            let capabilities = Arc::new(CapabilityRegistry::new());
            let engine = WorkflowEngine::new(
                store.clone(),
                Arc::new(AgentAdapter::new(config.adapter.clone(), capabilities)),
                Arc::new(FallbackPolicy::new(config.fallback.clone())),
            )
            .with_config(config.engine.clone());
            let record = engine.cancel(id).await?;
            println!("Cancelled {} (version {})", record.id, record.version);
        }
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Validate => {
            let problems = config.problems();
            for problem in &problems {
                println!("config: {problem}");
            }

            let monitor = HealthMonitor::standard(
                &config.health,
                store.clone(),
                Arc::new(CapabilityRegistry::new()),
            );
            let report = monitor.run_checks().await;
            for check in &report.checks {
                println!(
                    "{:<12} {:<8} {} ({}ms)",
                    check.name,
                    check.status.to_string(),
                    check.message,
                    check.duration_ms
                );
            }
            println!(
                "overall: {} (primary ready: {}, fallback ready: {})",
                report.overall, report.ready_for_primary, report.ready_for_fallback
            );

            if !problems.is_empty() {
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
            if report.overall == HealthStatus::Critical && !report.ready_for_fallback {
                anyhow::bail!("store is not usable");
            }
        }
    }

    Ok(())
}

fn print_records(records: &[ContextRecord]) {
    if records.is_empty() {
        println!("No records.");
        return;
    }
    for record in records {
        println!(
            "{}  {:<8}  {:<12}  v{:<3}  {}",
            record.id,
            record.priority.to_string(),
            record.phase,
            record.version,
            record.task
        );
    }
    println!("\nTotal: {} record(s)", records.len());
}
