// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Supervisor Error Taxonomy
//!
//! Every component returns its own typed error. The supervisor wraps them in
//! [`SupervisorError`], whose [`kind`](SupervisorError::kind) is the stable
//! classification callers match on and the CLI maps to an exit code.
//!
//! | Exit code | Kinds |
//! |-----------|-------|
//! | 1 | manifest parse/validation, host, GPU, cycle, template references |
//! | 2 | everything that fails the `Start` phase |
//! | 3 | `UnexpectedExit` of a service that had reached `Ready` |

use crate::domain::manifest::ManifestError;
use crate::domain::ports::PortError;
use crate::domain::process::{LaunchError, ProcessExit};
use crate::domain::secrets::SecretError;
use crate::domain::template::TemplateError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Stable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ManifestParseError,
    ManifestValidationError,
    UnsupportedHost,
    GpuRequirementsUnmet,
    CycleError,
    TemplateReferenceError,
    PortUnavailable,
    SecretMissing,
    SecretIoError,
    LaunchError,
    HealthTimeout,
    HealthProbeError,
    UnexpectedExit,
    AnotherSupervisorRunning,
    ShutdownTimeout,
    StartCancelled,
    AppDataError,
    InvalidState,
}

impl ErrorKind {
    /// Errors detected before any process is launched.
    pub fn is_manifest_error(self) -> bool {
        matches!(
            self,
            Self::ManifestParseError
                | Self::ManifestValidationError
                | Self::UnsupportedHost
                | Self::GpuRequirementsUnmet
                | Self::CycleError
                | Self::TemplateReferenceError
        )
    }

    pub fn exit_code(self) -> i32 {
        if self.is_manifest_error() {
            1
        } else {
            2
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<&ManifestError> for ErrorKind {
    fn from(err: &ManifestError) -> Self {
        match err {
            ManifestError::Read { .. } | ManifestError::Parse(_) => Self::ManifestParseError,
            ManifestError::UnsupportedSchema { .. } | ManifestError::Invalid(_) => {
                Self::ManifestValidationError
            }
            ManifestError::UnsupportedHost { .. } => Self::UnsupportedHost,
            ManifestError::GpuRequirementsUnmet(_) => Self::GpuRequirementsUnmet,
            ManifestError::Cycle { .. } => Self::CycleError,
            ManifestError::TemplateReference { .. } => Self::TemplateReferenceError,
        }
    }
}

/// Why a single service ended up `Failed`.
#[derive(Debug, Error)]
pub enum ServiceFailure {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    DataDir(#[from] AppDataError),

    #[error("not ready within {budget:?}{}", last_probe_suffix(.last_failure))]
    HealthTimeout {
        budget: Duration,
        last_failure: Option<String>,
    },

    #[error("health probe error: {reason}")]
    HealthProbe { reason: String },

    #[error("process exited unexpectedly ({exit})")]
    UnexpectedExit { exit: ProcessExit },
}

fn last_probe_suffix(last_failure: &Option<String>) -> String {
    match last_failure {
        Some(reason) => format!(" (last probe: {})", reason),
        None => String::new(),
    }
}

fn owner_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

impl ServiceFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Port(_) => ErrorKind::PortUnavailable,
            Self::Secret(SecretError::Missing { .. }) => ErrorKind::SecretMissing,
            Self::Secret(SecretError::Io { .. }) => ErrorKind::SecretIoError,
            Self::Template(_) => ErrorKind::TemplateReferenceError,
            Self::Launch(_) => ErrorKind::LaunchError,
            Self::DataDir(_) => ErrorKind::AppDataError,
            Self::HealthTimeout { .. } => ErrorKind::HealthTimeout,
            Self::HealthProbe { .. } => ErrorKind::HealthProbeError,
            Self::UnexpectedExit { .. } => ErrorKind::UnexpectedExit,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppDataError {
    #[error("app-data I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("another supervisor{} holds the lock {path:?}", owner_suffix(.pid))]
    Locked { pid: Option<u32>, path: PathBuf },

    #[error("invalid app-data layout: {0}")]
    InvalidLayout(String),
}

impl AppDataError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("service '{service}' failed: {failure}")]
    ServiceFailed {
        service: String,
        #[source]
        failure: ServiceFailure,
        /// Last lines of the service's stderr log, oldest first.
        stderr_tail: Vec<String>,
    },

    #[error(transparent)]
    AppData(#[from] AppDataError),

    #[error("startup cancelled: {reason}")]
    StartCancelled { reason: String },

    #[error("cannot {operation} while the session is {phase}")]
    InvalidPhase {
        phase: String,
        operation: &'static str,
    },
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Manifest(err) => ErrorKind::from(err),
            Self::ServiceFailed { failure, .. } => failure.kind(),
            Self::AppData(AppDataError::Locked { .. }) => ErrorKind::AnotherSupervisorRunning,
            Self::AppData(_) => ErrorKind::AppDataError,
            Self::StartCancelled { .. } => ErrorKind::StartCancelled,
            Self::InvalidPhase { .. } => ErrorKind::InvalidState,
        }
    }

    /// Id of the service that caused the error, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            Self::ServiceFailed { service, .. } => Some(service),
            _ => None,
        }
    }

    pub fn stderr_tail(&self) -> &[String] {
        match self {
            Self::ServiceFailed { stderr_tail, .. } => stderr_tail,
            _ => &[],
        }
    }

    /// Exit code of a session that failed with this error.
    ///
    /// A service that fails while starting always yields 2, even when the
    /// failure is a template that could not be rendered at launch.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ServiceFailed { .. } => 2,
            _ => self.kind().exit_code(),
        }
    }
}
