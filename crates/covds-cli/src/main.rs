use anyhow::Result;
use clap::{Parser, Subcommand};
use covds_load::{run_once_from_env, RunReport, Stage};
use tracing_subscriber::EnvFilter;

/// Every option comes from `COVDS_*` environment variables; the command only picks the stage.
#[derive(Debug, Parser)]
#[command(name = "covds-cli")]
#[command(about = "Load CoWIN public report snapshots into a relational store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load reference data and every snapshot under COVDS_DATA_DIR.
    Load,
    /// Rebuild the derived metric tables from already loaded data.
    Derive,
    /// Load, then derive.
    Run,
}

impl From<Commands> for Stage {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Load => Stage::Load,
            Commands::Derive => Stage::Derive,
            Commands::Run => Stage::Run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let stage = Stage::from(cli.command.unwrap_or(Commands::Run));
    let report = run_once_from_env(stage).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    let (payloads, records, failures, skipped) = report
        .load
        .as_ref()
        .map(|load| {
            (
                load.payloads_loaded,
                load.total_records(),
                load.failures.len(),
                load.skipped.len(),
            )
        })
        .unwrap_or_default();
    println!(
        "{} complete: run_id={} payloads={} records={} failures={} skipped={} derived={} reports={}",
        report.stage,
        report.run_id,
        payloads,
        records,
        failures,
        skipped,
        report.derived.len(),
        report.reports_dir
    );
    if failures > 0 {
        tracing::warn!(failures, "some payload entries were not loaded; see load_summary.json");
    }
}
