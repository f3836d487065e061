//! Cairn CLI binary.

use anyhow::Result;
use cairn::cli::Cli;
use tracing_subscriber::EnvFilter;

/// Main entry point for the cairn CLI.
///
/// A current-thread runtime is enough: commands are sequential, and the
/// watch loop is a single task fed by the watcher's own thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default, e.g. RUST_LOG=cairn=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cairn=info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Starting cairn CLI");

    let cli = Cli::parse_args();
    cli.execute().await?;

    tracing::debug!("Cairn CLI completed successfully");
    Ok(())
}
