// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bundle session: load, start, serve, shut down.
//!
//! Exit codes:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | clean shutdown |
//! | 1 | manifest invalid (parse, validation, host, GPU, cycle, template) |
//! | 2 | startup failure, or the launcher itself could not run |
//! | 3 | a service failed after the bundle became ready |

use crate::paths::{resolve_app_data, BundlePaths};
use crate::report;
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use deskbundle_core::domain::config::SupervisorConfig;
use deskbundle_core::infrastructure::event_bus::EventBusError;
use deskbundle_core::infrastructure::ManifestLoader;
use deskbundle_core::{Supervisor, SupervisorError};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Bundle manifest (default: <bundle-root>/bundle.json)
    #[arg(long, value_name = "FILE")]
    pub manifest: Option<PathBuf>,

    /// Per-user app-data directory (default: <data dir>/<app_name>)
    #[arg(long, value_name = "DIR", env = "DESKBUNDLE_APP_DATA")]
    pub app_data: Option<PathBuf>,

    /// Bundle root holding binaries and assets (default: manifest directory)
    #[arg(long, value_name = "DIR")]
    pub bundle_root: Option<PathBuf>,

    /// Plan, allocate ports and probe once, but launch nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Supervisor configuration file (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Do not print lifecycle progress
    #[arg(short, long)]
    pub quiet: bool,
}

/// Run one bundle session and return the process exit code.
pub async fn run(args: RunArgs) -> Result<i32> {
    let mut config =
        SupervisorConfig::load_or_default(args.config.clone()).context("Failed to load supervisor configuration")?;
    if args.dry_run {
        config.dry_run = true;
    }

    let paths = BundlePaths::resolve(args.manifest.clone(), args.bundle_root.clone());
    debug!(manifest = ?paths.manifest, bundle_root = ?paths.bundle_root, "Resolved bundle paths");

    let manifest = match ManifestLoader::load(&paths.manifest) {
        Ok(manifest) => manifest,
        Err(e) => {
            let err = SupervisorError::from(e);
            eprint!("{}", report::format_failure(&err));
            return Ok(err.exit_code());
        }
    };
    let app_data = resolve_app_data(args.app_data.clone(), &manifest.app_name)?;

    info!(
        app = %manifest.app_name,
        version = %manifest.app_version,
        bundle_root = ?paths.bundle_root,
        app_data = ?app_data,
        "Launching bundle"
    );

    let mut supervisor = Supervisor::builder(manifest, &paths.bundle_root, &app_data)
        .config(config)
        .build();

    let progress = (!args.quiet).then(|| spawn_progress_printer(&supervisor));

    let code = match supervisor.start(CancellationToken::new()).await {
        Ok(()) => {
            println!("{}", report::format_status(&supervisor.status()));
            let outcome = supervisor.run_until_shutdown().await?;
            print!("{}", report::format_session_end(&outcome));
            outcome.exit_code()
        }
        Err(err) => {
            eprint!("{}", report::format_failure(&err));
            err.exit_code()
        }
    };

    if let Some(progress) = progress {
        progress.abort();
    }
    Ok(code)
}

fn spawn_progress_printer(supervisor: &Supervisor) -> tokio::task::JoinHandle<()> {
    let mut events = supervisor.handle().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = report::format_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(EventBusError::Lagged(n)) => {
                    println!("  {}", format!("({} events skipped)", n).dimmed());
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_manifest_exits_with_manifest_code() {
        let dir = tempfile::tempdir().unwrap();
        let args = RunArgs {
            bundle_root: Some(dir.path().to_path_buf()),
            app_data: Some(dir.path().join("data")),
            quiet: true,
            ..RunArgs::default()
        };
        assert_eq!(run(args).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_manifest_fields_exit_with_manifest_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("bundle.json"),
            r#"{"schema_version":1,"app_name":"x","app_version":"1","platforms":[],"services":[],"extra":1}"#,
        )
        .unwrap();
        let args = RunArgs {
            bundle_root: Some(dir.path().to_path_buf()),
            app_data: Some(dir.path().join("data")),
            quiet: true,
            ..RunArgs::default()
        };
        assert_eq!(run(args).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bad_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("supervisor.yaml");
        std::fs::write(&config, "no_such_option: true\n").unwrap();
        let args = RunArgs {
            bundle_root: Some(dir.path().to_path_buf()),
            config: Some(config),
            quiet: true,
            ..RunArgs::default()
        };
        assert!(run(args).await.is_err());
    }
}
