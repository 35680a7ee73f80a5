use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backfill;
mod classify;
mod config;
mod db;
mod dedup;
mod dimensions;
mod error;
mod journey;
mod metrics;
mod models;
mod plan;
mod report;
mod sequence;
#[cfg(test)]
mod testing;

use config::FunnelConfig;
use error::FunnelResult;
use models::{AnalysisLevel, RunContext};
use plan::{ExecutionPlan, PlanBuilder};

#[derive(Parser)]
#[command(name = "funnel-metrics")]
#[command(about = "Multi-step conversion funnels from raw event logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load sample checkout events
    Seed,
    /// Import events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Validate a funnel config and print its execution plan
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Build the funnel and metrics relations for a config
    Run {
        #[arg(long)]
        config: PathBuf,
        /// Overrides the config's time_period_days
        #[arg(long)]
        since_days: Option<i64>,
        /// Compute and print metrics without publishing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a markdown report from the published metrics
    Report {
        #[arg(long)]
        config: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("funnel_metrics=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            let inserted = db::seed(&pool).await?;
            println!("Seed data inserted ({inserted} events).");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} events from {}.", csv.display());
        }
        Commands::Validate { config } => {
            let (_, plan) = load_plan(&config)
                .with_context(|| format!("invalid funnel config {}", config.display()))?;
            for warning in &plan.warnings {
                println!("warning: {warning}");
            }
            print!("{}", plan.describe());
        }
        Commands::Run {
            config,
            since_days,
            dry_run,
        } => {
            let (funnel, mut plan) = load_plan(&config)
                .with_context(|| format!("invalid funnel config {}", config.display()))?;
            if let Some(days) = since_days {
                anyhow::ensure!(days > 0, "--since-days must be positive, got {days}");
                plan.time_period_days = Some(days);
            }

            let pool = connect().await?;
            let ctx = RunContext::new(funnel.destination.clone());
            let events = db::fetch_events(&pool, &funnel, plan.window_start(&ctx)).await?;
            let records = match &funnel.dimension_lookup {
                Some(lookup) => {
                    db::fetch_dimension_records(&pool, lookup, &plan.dimensions).await?
                }
                None => Vec::new(),
            };

            let output = plan.execute(&ctx, &events, records)?;
            if dry_run {
                info!(run_id = %ctx.run_id, "dry run, nothing published");
            } else {
                db::publish(&pool, &ctx, &output).await?;
                println!(
                    "Published {} and {}.",
                    ctx.destination.funnel_table(),
                    ctx.destination.metrics_table()
                );
            }

            let stats = &output.stats;
            println!(
                "{} events, {} matched, {} unmapped, {} duplicates removed, {} backfilled",
                stats.raw_events,
                stats.matched_events,
                stats.unmapped_events(),
                stats.duplicates_removed,
                stats.backfilled_rows
            );
            println!(
                "{} funnel rows across {} sessions and {} users",
                stats.funnel_rows, stats.sessions, stats.users
            );
            for metric in output
                .metrics
                .iter()
                .filter(|metric| metric.analysis_level == AnalysisLevel::E2e)
            {
                println!(
                    "- {}: {} of {} starters completed ({})",
                    report::dimension_label(&metric.dimension_values),
                    metric.completers_count,
                    metric.starters_count,
                    report::format_pct(metric.conversion_rate_pct)
                );
            }
        }
        Commands::Report { config, out } => {
            let funnel = FunnelConfig::from_path(&config)
                .with_context(|| format!("failed to load funnel config {}", config.display()))?;
            let pool = connect().await?;
            let (run_at, metrics) = db::fetch_metrics(&pool, &funnel.destination).await?;
            let report = report::build_report(&funnel.funnel_name, run_at, &metrics);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn load_plan(path: &Path) -> FunnelResult<(FunnelConfig, ExecutionPlan)> {
    let config = FunnelConfig::from_path(path)?;
    let plan = PlanBuilder::new(config.clone()).build()?;
    Ok((config, plan))
}
