use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use cove_sync::{ImportPipeline, ImportSummary, MoveDirection, MoveSummary, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cove-cli")]
#[command(about = "Registry import into the COVID evidence store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Convert a source screening table and upsert the diffs.
    Import {
        /// Registry key of the source, e.g. `ictrp`.
        source_id: Option<String>,
        /// Run every enabled source in registry order.
        #[arg(long, conflicts_with = "source_id")]
        all: bool,
        /// Write the diffs to the store; without it the run only produces reports.
        #[arg(long)]
        apply: bool,
    },
    /// Move included records flagged not covid, not a trial or duplicate to `exclusions`.
    MoveExclusions {
        #[arg(long)]
        apply: bool,
    },
    /// Copy excluded records screened back in to `covebasic`.
    RestoreInclusions {
        #[arg(long)]
        apply: bool,
    },
    /// Print a digest of the most recent import reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn print_summary(summary: &ImportSummary) {
    println!(
        "import {}: run_id={} upserts={} (new={} updates={}) skipped={} conflicts={} duplicates={} written={} reports={}",
        summary.source_id,
        summary.run_id,
        summary.upserts,
        summary.inserts,
        summary.updates,
        summary.skipped_existing,
        summary.conflicts,
        summary.duplicate_candidates,
        summary.written,
        summary.reports_dir
    );
}

fn print_move_summary(summary: &MoveSummary) {
    println!(
        "{:?}: run_id={} moves={} already_present={} written={} deleted={} reports={}",
        summary.direction,
        summary.run_id,
        summary.moves,
        summary.already_present,
        summary.written,
        summary.deleted,
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import { source_id, all, apply } => {
            let pipeline = ImportPipeline::from_env().await?;
            let summaries = match (source_id, all) {
                (Some(source_id), false) => vec![pipeline.run(&source_id, apply).await?],
                (None, true) => pipeline.run_enabled(apply).await?,
                _ => bail!("pass a source id or --all"),
            };
            for summary in &summaries {
                print_summary(summary);
            }
            if !apply {
                tracing::info!("dry run; pass --apply to write the upserts");
            }
        }
        Commands::MoveExclusions { apply } => {
            let pipeline = ImportPipeline::from_env().await?;
            print_move_summary(&pipeline.move_partitions(MoveDirection::ToExclusions, apply).await?);
        }
        Commands::RestoreInclusions { apply } => {
            let pipeline = ImportPipeline::from_env().await?;
            print_move_summary(&pipeline.move_partitions(MoveDirection::ToIncluded, apply).await?);
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env()?;
            let markdown = cove_sync::report_recent_markdown(runs, Some(config.workspace_root))?;
            println!("{markdown}");
        }
    }

    Ok(())
}
