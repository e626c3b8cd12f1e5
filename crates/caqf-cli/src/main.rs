use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use caqf_core::Scope;
use caqf_sync::{
    default_quiz_filename, maybe_build_scheduler, migrate, SyncConfig, SyncService,
    DEFAULT_QUIZ_SIZE,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "caqf-cli")]
#[command(about = "Current affairs question feed: ingestion and practice sets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, translate and store questions for a scope.
    Ingest {
        #[command(subcommand)]
        scope: ScopeArg,
    },
    /// Bundle stored questions of a scope into a practice set.
    Assemble {
        #[command(subcommand)]
        scope: ScopeArg,
    },
    /// One practice set per day that has questions.
    DailySets { start: NaiveDate, end: NaiveDate },
    /// Ledger totals per month.
    Stats,
    /// Write a random quiz for a scope to a JSON file.
    Quiz {
        #[arg(long, default_value_t = DEFAULT_QUIZ_SIZE)]
        size: usize,
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(subcommand)]
        scope: ScopeArg,
    },
    Migrate,
    /// Run the cron job (current month ingestion + monthly set) until interrupted.
    Schedule,
}

#[derive(Debug, Clone, Subcommand)]
enum ScopeArg {
    Date { date: NaiveDate },
    Month { year: i32, month: u32 },
    /// Trailing seven days.
    Week,
    Days { days: u32 },
    Range { start: NaiveDate, end: NaiveDate },
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Date { date } => Scope::Date(date),
            ScopeArg::Month { year, month } => Scope::Month { year, month },
            ScopeArg::Week => Scope::week(),
            ScopeArg::Days { days } => Scope::TrailingDays(days),
            ScopeArg::Range { start, end } => Scope::Range { start, end },
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Migrate => migrate(&config).await?,
        Commands::Ingest { scope } => {
            let service = SyncService::connect(&config).await?;
            let summary = service.run_ingestion_for_scope(scope.into()).await?;
            println!(
                "ingest complete: run_id={} attempted={} succeeded={} skipped={} no_content={} failed={} questions={} (failed {}, unindexed {})",
                summary.run_id,
                summary.attempted,
                summary.succeeded,
                summary.skipped,
                summary.no_content,
                summary.failed,
                summary.questions_persisted,
                summary.questions_failed,
                summary.questions_unindexed
            );
        }
        Commands::Assemble { scope } => {
            let service = SyncService::connect(&config).await?;
            let set = service.run_assembly_for_scope(scope.into()).await?;
            println!(
                "practice set {} '{}': {} questions, {} linked",
                set.id, set.title, set.total_questions, set.linked
            );
        }
        Commands::DailySets { start, end } => {
            let service = SyncService::connect(&config).await?;
            let report = service.assemble_daily_sets(start, end).await?;
            println!(
                "daily sets: created={} skipped={}",
                report.created.len(),
                report.skipped.len()
            );
        }
        Commands::Stats => {
            let service = SyncService::connect(&config).await?;
            let stats = service.stats().await?;
            println!("processed identifiers: {}", stats.total);
            for month in &stats.monthly {
                println!("  {:<16} {}", month.month, month.count);
            }
        }
        Commands::Quiz { size, out, scope } => {
            let scope = Scope::from(scope);
            let path = out.unwrap_or_else(|| PathBuf::from(default_quiz_filename(&scope)));
            let service = SyncService::connect(&config).await?;
            let quiz = service.export_quiz(scope, size, &path).await?;
            println!("quiz '{}' with {} questions -> {}", quiz.title, quiz.questions.len(), path.display());
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let service = Arc::new(SyncService::connect(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, service).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
