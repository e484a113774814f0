use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod catalog;
mod conditions;
mod config;
mod coordinator;
mod db;
mod error;
mod evaluator;
mod models;
mod priority;
mod report;
mod risk;
mod seed;
mod series;
mod server;
mod statistical;
mod store;
mod threshold;
mod writer;

use crate::conditions::RuleConditions;
use crate::config::{EngineConfig, ModelSettings, RetryPolicy};
use crate::coordinator::ExecutionCoordinator;
use crate::models::{
    ExecutionReport, ManualPriority, PriorityEntry, PriorityStatus, RuleCategory, RuleDefinition,
    RuleScope, Severity,
};
use crate::priority::{PriorityConsolidator, PriorityFilter};
use crate::risk::TimeRange;
use crate::store::{DataAccess, MemoryStore};

#[derive(Parser)]
#[command(name = "cohort-warning-engine")]
#[command(about = "Rule-driven early warning engine for student performance", long_about = None)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct EngineArgs {
    /// Rules evaluated in parallel
    #[arg(long, global = true, env = "ENGINE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
    /// Wall-clock limit for one run
    #[arg(long, global = true, env = "ENGINE_RUN_TIMEOUT_SECS", default_value_t = 300)]
    run_timeout_secs: u64,
    /// Attempts per data access call inside a rule
    #[arg(long, global = true, env = "ENGINE_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,
    #[arg(long, global = true, env = "ENGINE_RETRY_BASE_MS", default_value_t = 100)]
    retry_base_ms: u64,
    /// JSON file with risk model and heuristic settings
    #[arg(long, global = true, env = "ENGINE_CONFIG")]
    config: Option<PathBuf>,
}

impl EngineArgs {
    fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        if self.concurrency == 0 {
            anyhow::bail!("--concurrency must be at least 1");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("--max-attempts must be at least 1");
        }
        let settings = ModelSettings::load(self.config.as_deref())?;
        Ok(EngineConfig {
            concurrency: self.concurrency,
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.retry_base_ms),
            },
            risk_model: settings.risk_model,
            heuristics: settings.heuristics,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import performance records from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Register a warning rule
    AddRule {
        #[arg(long)]
        name: String,
        /// Condition JSON, e.g. '{"type":"exam_fail","threshold":60}'
        #[arg(long)]
        conditions: String,
        #[arg(long, default_value = "grade")]
        category: RuleCategory,
        #[arg(long, default_value = "medium")]
        severity: Severity,
        #[arg(long, default_value = "global")]
        scope: RuleScope,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Evaluate every active rule once
    Execute {
        #[arg(long)]
        trigger: Option<String>,
    },
    /// Show the ranked follow-up list
    Priority {
        #[command(flatten)]
        filter: PriorityArgs,
    },
    /// Add a student to the follow-up list by hand
    AddPriority {
        #[arg(long)]
        entity_id: String,
        #[arg(long, default_value = "medium")]
        severity: Severity,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        goals: Vec<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Pause, complete, cancel or reactivate a manual entry
    SetPriorityStatus {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        status: PriorityStatus,
    },
    /// Resolve an active warning
    ResolveWarning {
        #[arg(long)]
        id: Uuid,
    },
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: String,
    },
    /// Run the engine on the sample dataset in memory
    Demo,
}

#[derive(Args)]
struct PriorityArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long = "class", value_delimiter = ',')]
    class_names: Vec<String>,
    #[arg(long = "exam", value_delimiter = ',')]
    assessment_titles: Vec<String>,
    #[arg(long, default_value = "all")]
    range: TimeRange,
}

impl PriorityArgs {
    fn filter(&self) -> PriorityFilter {
        PriorityFilter {
            class_names: self.class_names.clone(),
            assessment_titles: self.assessment_titles.clone(),
            time_range: self.range,
        }
    }
}

async fn connect_pool() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    db::connect(&database_url).await
}

async fn connect_store() -> anyhow::Result<Arc<dyn DataAccess>> {
    Ok(Arc::new(db::PgStore::new(connect_pool().await?)))
}

fn print_execution(report: &ExecutionReport) {
    println!(
        "Execution {}: {} rules, {} matches, {} new warnings in {} ms.",
        report.execution_id,
        report.summary.total_rules,
        report.summary.matched_entities,
        report.summary.generated_warnings,
        report.summary.total_execution_time_ms
    );
    for result in report.results.iter() {
        match &result.error {
            Some(error) => println!("- rule {} failed: {}", result.rule_id, error),
            None => println!(
                "- rule {}: {} matched, {} new",
                result.rule_id,
                result.matched_entities.len(),
                result.generated_warnings
            ),
        }
    }
}

fn print_priorities(entries: &[PriorityEntry]) {
    if entries.is_empty() {
        println!("No students flagged for follow-up.");
        return;
    }

    println!("Priority follow-up list:");
    for entry in entries.iter() {
        println!(
            "- {} ({}) [{}] {} priority, risk {:.0}: {}",
            entry.entity_name.as_deref().unwrap_or(&entry.entity_id),
            entry.class_name.as_deref().unwrap_or("unknown class"),
            entry.provenance,
            entry.severity,
            entry.risk_score,
            entry.reason
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let engine = cli.engine.engine_config()?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&connect_pool().await?).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&connect_pool().await?).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&connect_pool().await?, &csv).await?;
            println!("Inserted {inserted} performance records from {}.", csv.display());
        }
        Commands::AddRule {
            name,
            conditions,
            category,
            severity,
            scope,
            priority,
        } => {
            let conditions: serde_json::Value =
                serde_json::from_str(&conditions).context("conditions must be valid JSON")?;
            RuleConditions::parse(&conditions)?;

            let rule = RuleDefinition {
                id: Uuid::new_v4(),
                name,
                category,
                conditions,
                severity,
                scope,
                priority,
                is_active: true,
            };
            connect_store().await?.insert_rule(&rule).await?;
            println!("Rule {} added ({}).", rule.id, rule.name);
        }
        Commands::Execute { trigger } => {
            let coordinator = ExecutionCoordinator::new(connect_store().await?, &engine);
            let report = coordinator
                .execute_all(Some(trigger.as_deref().unwrap_or("manual")))
                .await?;
            print_execution(&report);
        }
        Commands::Priority { filter } => {
            let consolidator = PriorityConsolidator::new(connect_store().await?, engine.heuristics);
            let entries = consolidator.priority_list(filter.limit, &filter.filter()).await?;
            print_priorities(&entries);
        }
        Commands::AddPriority {
            entity_id,
            severity,
            reason,
            tags,
            goals,
            notes,
        } => {
            let mut entry = ManualPriority::new(&entity_id, severity, reason);
            entry.custom_tags = tags;
            entry.intervention_goals = goals;
            entry.notes = notes;

            let consolidator = PriorityConsolidator::new(connect_store().await?, engine.heuristics);
            let entry = consolidator.add_priority_entry(entry).await?;
            println!("Priority entry {} added for {}.", entry.id, entry.entity_id);
        }
        Commands::SetPriorityStatus { id, status } => {
            let consolidator = PriorityConsolidator::new(connect_store().await?, engine.heuristics);
            if consolidator.set_priority_status(id, status).await? {
                println!("Priority entry {id} is now {status}.");
            } else {
                println!("No priority entry with id {id}.");
            }
        }
        Commands::ResolveWarning { id } => {
            if connect_store().await?.resolve_warning(id).await? {
                println!("Warning {id} resolved.");
            } else {
                println!("No active warning with id {id}.");
            }
        }
        Commands::Report { out, limit } => {
            let store = connect_store().await?;
            let consolidator = PriorityConsolidator::new(store.clone(), engine.heuristics);
            let priorities = consolidator
                .priority_list(limit, &PriorityFilter::default())
                .await?;
            let report = report::build_report(
                chrono::Utc::now().date_naive(),
                &store.active_warnings().await?,
                &store.active_rules().await?,
                &store.entities().await?,
                &priorities,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Serve { addr } => {
            let store = connect_store().await?;
            let state = server::AppState::new(
                ExecutionCoordinator::new(store.clone(), &engine),
                PriorityConsolidator::new(store, engine.heuristics.clone()),
            );
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            tracing::info!(%addr, "listening");
            axum::serve(listener, server::build_router(state)).await?;
        }
        Commands::Demo => {
            let store: Arc<dyn DataAccess> = Arc::new(MemoryStore::with_dataset(seed::sample_dataset()?)?);
            let coordinator = ExecutionCoordinator::new(store.clone(), &engine);
            let report = coordinator.execute_all(Some("demo")).await?;
            print_execution(&report);

            println!();
            let consolidator = PriorityConsolidator::new(store.clone(), engine.heuristics);
            let entries = consolidator
                .priority_list(10, &PriorityFilter::default())
                .await?;
            print_priorities(&entries);
        }
    }

    Ok(())
}
