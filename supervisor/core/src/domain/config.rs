// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Supervisor Configuration
//
// Runtime knobs that are not part of the bundle manifest:
// - startup budget and post-ready health threshold
// - event queue sizing
// - how much of a failed service's stderr is reported
// - probe host and dry-run mode
//
// Loaded from an optional YAML file; every field has a default so an empty
// file (or no file at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Global startup budget. A manifest `startup_timeout` takes precedence.
    #[serde(default = "default_startup_timeout", with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Consecutive post-ready probe failures before the service is reported degraded.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,

    /// Host used by tcp/http probes.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,

    /// Plan, allocate and probe, but launch nothing.
    #[serde(default)]
    pub dry_run: bool,

    /// Install SIGINT/SIGTERM handlers when `start` begins.
    #[serde(default = "default_true")]
    pub handle_signals: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: default_startup_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            event_queue_capacity: default_event_queue_capacity(),
            stderr_tail_lines: default_stderr_tail_lines(),
            probe_host: default_probe_host(),
            dry_run: false,
            handle_signals: true,
        }
    }
}

impl SupervisorConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        // An empty document deserializes to unit, not an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load from an explicit path (which must exist), or fall back to defaults.
    pub fn load_or_default(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                tracing::info!("Loading supervisor configuration from {:?}", path);
                Self::from_yaml_file(&path).map_err(|e| {
                    anyhow::anyhow!("Failed to load supervisor config at {:?}: {}", path, e)
                })?
            }
            None => {
                tracing::debug!("No supervisor configuration given, using defaults");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.startup_timeout.is_zero() {
            anyhow::bail!("startup_timeout must be greater than zero");
        }
        if self.unhealthy_threshold == 0 {
            anyhow::bail!("unhealthy_threshold must be at least 1");
        }
        if self.event_queue_capacity == 0 {
            anyhow::bail!("event_queue_capacity must be at least 1");
        }
        if self.probe_host.trim().is_empty() {
            anyhow::bail!("probe_host cannot be empty");
        }
        Ok(())
    }

    /// Effective startup budget given the manifest override.
    pub fn startup_budget(&self, manifest_override: Option<Duration>) -> Duration {
        manifest_override.unwrap_or(self.startup_timeout)
    }
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_stderr_tail_lines() -> usize {
    20
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}
