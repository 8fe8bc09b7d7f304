// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health probing capability.
//!
//! A probe is one bounded attempt; pacing (initial delay, interval) and the
//! readiness decision belong to the monitor task and the supervisor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A health check with every template and port already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Tcp { host: String, port: u16 },
    Http { url: String, expect_status: Option<u16> },
    Command { argv: Vec<String>, working_dir: PathBuf },
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Http { url, .. } => f.write_str(url),
            Self::Command { argv, .. } => write!(f, "command {:?}", argv.first()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Ok,
    /// The service answered but is not healthy (refused, bad status, non-zero exit).
    Fail(String),
    /// The probe itself could not run (bad URL, command not found).
    Error(String),
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthObservation {
    pub at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
}

#[async_trait]
pub trait HealthProber: Send + Sync {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome;
}
