use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use moneyplot::apis::dpe::DpeScope;
use moneyplot::config::Config;
use moneyplot::logging;
use moneyplot::metrics;
use moneyplot::pipeline::{Materializer, PipelineContext, Step, UpstreamPolicy, SCHEDULES};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "moneyplot")]
#[command(about = "French real-estate transactions and macro indicators ingestion pipeline")]
#[command(version)]
struct Cli {
    /// Config file (defaults to $MONEYPLOT_CONFIG or ./moneyplot.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every destination table if missing
    InitDb,
    /// Materialize one step, running missing upstream steps first
    Materialize {
        /// Step name, see `steps`
        step: String,
        /// Run every upstream step again even if its output exists
        #[arg(long)]
        recompute_upstream: bool,
    },
    /// Materialize every step
    RunAll,
    /// Show the step graph and what is already materialized
    Steps,
    /// Show the declared schedules
    Schedules,
    /// Fetch one batch of DPE diagnostics into the store
    Dpe {
        #[arg(long, conflicts_with = "department", required_unless_present = "department")]
        commune: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    let _log_guard = logging::init_logging(&config.paths.log_dir)
        .with_context(|| format!("creating log directory {}", config.paths.log_dir.display()))?;
    metrics::init_metrics();

    let ctx = PipelineContext::from_config(config)?;
    let materializer = Materializer::new(ctx);

    match cli.command {
        Commands::InitDb => {
            let stores = &materializer.context().stores;
            stores.run_blocking(|store| store.create_tables()).await?;
            println!("✅ Tables ready in {}", stores.db_path().display());
        }
        Commands::Materialize {
            step,
            recompute_upstream,
        } => {
            let step: Step = step.parse()?;
            let policy = if recompute_upstream {
                UpstreamPolicy::Recompute
            } else {
                UpstreamPolicy::ReuseMaterialized
            };
            let runs = materializer.materialize(step, policy).await?;
            for run in &runs {
                println!(
                    "✅ {} ({}ms) {}",
                    run.step,
                    run.duration().num_milliseconds(),
                    run.metadata.to_json()?
                );
            }
        }
        Commands::RunAll => {
            info!("Materializing every step");
            let report = materializer.run_all().await;
            for run in &report.runs {
                println!("✅ {} {}", run.step, run.metadata.to_json()?);
            }
            for failure in &report.failures {
                println!("❌ {}: {}", failure.step, failure.error);
            }
            if !report.success() {
                error!("{} steps failed", report.failures.len());
                bail!("{} of {} steps failed", report.failures.len(), Step::ALL.len());
            }
        }
        Commands::Steps => {
            println!("{:<20} {:<8} {:<28} {:<13} description", "step", "group", "deps", "materialized");
            for status in materializer.status().await? {
                let deps = status
                    .step
                    .deps()
                    .iter()
                    .map(|d| d.name())
                    .collect::<Vec<_>>()
                    .join(",");
                let last = status
                    .last_run
                    .as_ref()
                    .map(|r| r.materialized_at.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<8} {:<28} {:<13} {} (last run: {})",
                    status.step.name(),
                    status.step.group(),
                    if deps.is_empty() { "-" } else { deps.as_str() },
                    if status.materialized { "yes" } else { "no" },
                    status.step.description(),
                    last
                );
            }
        }
        Commands::Schedules => {
            for schedule in SCHEDULES {
                let steps = schedule.steps.iter().map(|s| s.name()).collect::<Vec<_>>();
                println!("{:<16} {:<18} {}", schedule.name, schedule.cron, steps.join(", "));
            }
        }
        Commands::Dpe { commune, department } => {
            let scope = match (commune, department) {
                (Some(code), None) => DpeScope::Commune(code),
                (None, Some(code)) => DpeScope::Department(code),
                _ => bail!("pass exactly one of --commune or --department"),
            };
            let metadata = materializer.fetch_dpe_scopes(&[scope]).await?;
            println!("📊 {}", metadata.to_json()?);
        }
    }

    Ok(())
}
