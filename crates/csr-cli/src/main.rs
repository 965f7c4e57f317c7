use anyhow::Result;
use clap::{Parser, Subcommand};
use csr_pipeline::RunSummary;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "csr")]
#[command(about = "Companion specialty reconciler command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract records, resolve duplicates, write the mapping artifact.
    Derive,
    /// Patch the remote store from the persisted mapping artifact.
    ApplyRemote,
    /// Patch the seed file and source array from the mapping artifact.
    PatchLocal,
    /// Derive, then apply both propagations against the same artifact.
    Run,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} complete: run_id={} mapping={} unassigned={} remote={}/{} local_applied={} local_flagged={} reports={}",
        summary.command,
        summary.run_id,
        summary.mapping_entries,
        summary.unassigned,
        summary.remote_succeeded,
        summary.remote_attempted,
        summary.local_applied,
        summary.local_flagged,
        summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let summary = match cli.command.unwrap_or(Commands::Derive) {
        Commands::Derive => csr_pipeline::run_derive_from_env().await?,
        Commands::ApplyRemote => csr_pipeline::run_apply_remote_from_env().await?,
        Commands::PatchLocal => csr_pipeline::run_patch_local_from_env().await?,
        Commands::Run => csr_pipeline::run_full_from_env().await?,
    };
    print_summary(&summary);

    Ok(())
}
