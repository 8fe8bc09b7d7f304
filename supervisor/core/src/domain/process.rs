// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process Runner Capability
//!
//! The supervisor never spawns processes itself; it asks a [`ProcessRunner`]
//! to launch and stop them. Exits are observed through a watch channel carried
//! by [`RunningProcess`], so a dedicated exit-watcher task can forward them to
//! the supervisor's event queue.

use crate::domain::manifest::StopSignal;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Where a service's stdout/stderr are appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    /// `<logs>/<id>.stdout.log` and `<logs>/<id>.stderr.log`.
    pub fn for_service(logs_dir: &Path, service_id: &str) -> Self {
        Self {
            stdout: logs_dir.join(format!("{}.stdout.log", service_id)),
            stderr: logs_dir.join(format!("{}.stderr.log", service_id)),
        }
    }
}

/// Fully resolved launch parameters: no templates remain.
#[derive(Clone)]
pub struct LaunchRequest {
    pub service_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub log_paths: LogPaths,
}

// The environment carries materialised secrets; only keys are printed.
impl fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("service_id", &self.service_id)
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("working_dir", &self.working_dir)
            .field("log_paths", &self.log_paths)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    /// Terminating signal number (unix only).
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signalled(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Open stdout/stderr handles of a launched child.
#[derive(Debug)]
pub struct LogFiles {
    pub stdout: File,
    pub stderr: File,
}

/// Handle to a launched child process.
///
/// The OS child itself is owned by the runner's waiter task; this handle only
/// observes its exit and can request a forced kill.
#[derive(Debug)]
pub struct RunningProcess {
    pub service_id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub log_paths: LogPaths,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: mpsc::Sender<()>,
    log_files: Option<LogFiles>,
}

impl RunningProcess {
    pub fn new(
        service_id: impl Into<String>,
        pid: Option<u32>,
        log_paths: LogPaths,
        exit: watch::Receiver<Option<ProcessExit>>,
        kill: mpsc::Sender<()>,
        log_files: Option<LogFiles>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            pid,
            started_at: Utc::now(),
            log_paths,
            exit,
            kill,
            log_files,
        }
    }

    /// `Some` once the process has exited.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_status().is_none()
    }

    /// A fresh receiver for an exit-watcher task.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Wait for the process to exit.
    ///
    /// Returns `None` if the waiter went away without reporting a status.
    pub async fn wait(&mut self) -> Option<ProcessExit> {
        let waited = self.exit.wait_for(|status| status.is_some()).await.map(|status| *status);
        match waited {
            Ok(status) => status,
            Err(_) => *self.exit.borrow(),
        }
    }

    /// Ask the waiter task to force-kill the child. No-op once it has exited.
    pub fn request_kill(&self) {
        let _ = self.kill.try_send(());
    }

    /// Detached [`request_kill`](Self::request_kill), usable while a stop
    /// holds the process borrowed.
    pub fn kill_switch(&self) -> KillSwitch {
        KillSwitch(self.kill.clone())
    }

    pub fn close_logs(&mut self) {
        self.log_files = None;
    }
}

#[derive(Debug, Clone)]
pub struct KillSwitch(mpsc::Sender<()>);

impl KillSwitch {
    pub fn kill(&self) {
        let _ = self.0.try_send(());
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub exit: Option<ProcessExit>,
    /// The graceful signal was ignored and a kill had to be issued.
    pub forced: bool,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("binary not found: {0:?}")]
    BinaryNotFound(PathBuf),

    #[error("cannot prepare working directory {path:?}: {source}")]
    WorkingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("{service} did not exit after being killed")]
    NoExit { service: String },
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> Result<RunningProcess, LaunchError>;

    /// Send `signal`, wait up to `grace`, then kill. Log files are closed in
    /// every case.
    async fn stop(
        &self,
        process: &mut RunningProcess,
        signal: StopSignal,
        grace: Duration,
    ) -> Result<StopOutcome, StopError>;
}
