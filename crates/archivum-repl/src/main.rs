#![warn(missing_docs)]

//! `arc-repl`: inspect reconstruction offsets and backup-log lag.

use anyhow::Result;
use archivum_repl::cli::Cli;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "arc-repl starting");
    cli.run().await
}
