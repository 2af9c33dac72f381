//! # rill
//!
//! Entry point: parse flags, load the layered config, install tracing and run
//! one subcommand against the broker snapshot in the data directory.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use rill::cli::Cli;
use rill::commands::execute_command;
use rill::config::RillConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RillConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?
        .with_overrides(cli.data_dir, cli.log_level);

    init_tracing(&config.log_level);

    execute_command(&config, cli.command).await
}

/// Initialize tracing, preferring `RUST_LOG` over the configured level.
fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
