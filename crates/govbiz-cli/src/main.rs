use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use govbiz_storage::OpportunityStore;
use govbiz_sync::{parse_code_list, write_report, Collector, CollectorConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "govbiz-cli")]
#[command(about = "Collect SAM.gov contract opportunities into a local store")]
struct Cli {
    /// YAML configuration file; defaults to ./govbiz.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection pass and print the newly collected opportunities.
    Collect {
        /// Comma separated NAICS codes (at most three).
        #[arg(long)]
        naics_codes: Option<String>,
        /// Days back from now to search (at most seven).
        #[arg(long)]
        days_back: Option<u32>,
        #[arg(long)]
        storage_path: Option<PathBuf>,
        /// Skip page rendering for reference-only descriptions.
        #[arg(long)]
        no_fallback: bool,
        /// Print the full collection report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show what the store holds.
    Summary {
        #[arg(long)]
        storage_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,govbiz_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = CollectorConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Collect {
        naics_codes: None,
        days_back: None,
        storage_path: None,
        no_fallback: false,
        json: false,
    }) {
        Commands::Collect {
            naics_codes,
            days_back,
            storage_path,
            no_fallback,
            json,
        } => {
            if let Some(codes) = naics_codes {
                config.naics_codes = parse_code_list(&codes);
            }
            if let Some(days) = days_back {
                config.days_back = days;
            }
            if let Some(path) = storage_path {
                config.storage_path = path;
            }
            if no_fallback {
                config.fallback.enabled = false;
            }
            for note in config.enforce_limits() {
                warn!("{note}");
            }

            let collector = Collector::from_config(&config).await?;
            let report = collector
                .collect_recent(config.days_back, &config.naics_codes)
                .await
                .context("collection pass failed")?;

            if let Some(dir) = &config.reports_dir {
                let path = write_report(dir, &report).await?;
                info!(path = %path.display(), "collection report written");
            }

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("serializing report")?
                );
            } else {
                println!(
                    "collect complete: run_id={} new={} already_collected={} category_failures={} fallback_failures={} timed_out={}",
                    report.run_id,
                    report.new_records.len(),
                    report.already_collected,
                    report.category_failures.len(),
                    report.fallback_failures.len(),
                    report.timed_out
                );
                for record in &report.new_records {
                    println!(
                        "  {} | {} | {}",
                        record.notice_id,
                        record.title,
                        record.public_view_url()
                    );
                }
            }
        }
        Commands::Summary { storage_path } => {
            let path = storage_path.unwrap_or(config.storage_path);
            let store = OpportunityStore::open(&path)
                .await
                .with_context(|| format!("opening store {}", path.display()))?;
            let summary = store.summary();
            println!("store: {}", path.display());
            println!("total opportunities: {}", summary.total);
            for (code, count) in &summary.category_breakdown {
                println!("  {code}: {count}");
            }
            if let (Some(first), Some(last)) = (summary.earliest_collected, summary.latest_collected) {
                println!("collected between {} and {}", first.to_rfc3339(), last.to_rfc3339());
            }
        }
    }

    Ok(())
}
