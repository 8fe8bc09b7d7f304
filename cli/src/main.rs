// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # deskbundle
//!
//! Launches a desktop service bundle: reads `bundle.json`, starts every
//! service in dependency order, waits for readiness and keeps supervising
//! until interrupted. Ctrl-C (or SIGTERM) stops services in reverse order.
//!
//! ```text
//! deskbundle --bundle-root /opt/myapp
//! deskbundle --manifest ./bundle.json --app-data ~/.local/share/myapp --dry-run
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use deskbundle_cli::run::{run, RunArgs};

/// Desktop bundle runtime supervisor
#[derive(Parser)]
#[command(name = "deskbundle")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DESKBUNDLE_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(2);
    }

    let code = match run(cli.run).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            2
        }
    };
    std::process::exit(code);
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    Ok(())
}
