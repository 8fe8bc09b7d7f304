// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Supervisor Events
//!
//! Two kinds of events flow through the runtime:
//!
//! - [`SupervisorEvent`]: observations submitted *to* the supervisor by exit
//!   watchers, health monitors and the signal watcher. They travel through a
//!   single bounded queue and are the only way state changes are triggered.
//! - [`LifecycleEvent`]: notifications published *by* the supervisor to any
//!   number of observers (CLI progress output, tests).

use crate::domain::health::ProbeOutcome;
use crate::domain::ports::AllocatedPorts;
use crate::domain::process::ProcessExit;
use crate::domain::state::ServiceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What asked the session to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ShutdownReason {
    /// An OS interrupt/terminate signal.
    Signal { name: String },
    /// A caller of [`SupervisorHandle::request_shutdown`](crate::SupervisorHandle::request_shutdown).
    Requested,
    /// The start cancellation token fired.
    Cancelled,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal { name } => write!(f, "received {}", name),
            Self::Requested => f.write_str("shutdown requested"),
            Self::Cancelled => f.write_str("start cancelled"),
        }
    }
}

/// Input to the supervisor's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    ExitObserved {
        service: String,
        exit: ProcessExit,
    },
    HealthObserved {
        service: String,
        outcome: ProbeOutcome,
        observed_at: DateTime<Utc>,
    },
    ShutdownRequested {
        reason: ShutdownReason,
    },
}

/// Notification published on the lifecycle event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
        at: DateTime<Utc>,
    },
    PortsAllocated {
        service: String,
        ports: AllocatedPorts,
    },
    ProcessLaunched {
        service: String,
        pid: Option<u32>,
        at: DateTime<Utc>,
    },
    ProcessExited {
        service: String,
        exit: ProcessExit,
        at: DateTime<Utc>,
    },
    HealthDegraded {
        service: String,
        consecutive_failures: u32,
        reason: String,
    },
    HealthRecovered {
        service: String,
    },
    ShutdownTimeout {
        service: String,
        #[serde(with = "humantime_serde")]
        grace: Duration,
    },
}

impl LifecycleEvent {
    pub fn service(&self) -> &str {
        match self {
            Self::StateChanged { service, .. }
            | Self::PortsAllocated { service, .. }
            | Self::ProcessLaunched { service, .. }
            | Self::ProcessExited { service, .. }
            | Self::HealthDegraded { service, .. }
            | Self::HealthRecovered { service }
            | Self::ShutdownTimeout { service, .. } => service,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::PortsAllocated { .. } => "ports_allocated",
            Self::ProcessLaunched { .. } => "process_launched",
            Self::ProcessExited { .. } => "process_exited",
            Self::HealthDegraded { .. } => "health_degraded",
            Self::HealthRecovered { .. } => "health_recovered",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
        }
    }
}
