// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Runtime State
//!
//! In-memory projection of the services the supervisor owns. It is mutated
//! only by the supervisor task; everyone else gets a [`RuntimeSnapshot`].
//!
//! # Service State Machine
//!
//! ```text
//! Pending ──▶ Starting ──▶ Ready ──▶ Stopping ──▶ Stopped
//!    │            │          │
//!    └────────────┴──────────┴──▶ Failed
//! ```
//!
//! A `Starting` service interrupted by shutdown goes `Starting → Stopping`.
//! `Stopped` and `Failed` are terminal.

use crate::domain::error::ErrorKind;
use crate::domain::health::{HealthObservation, ProbeOutcome};
use crate::domain::ports::AllocatedPorts;
use crate::domain::process::LogPaths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use thiserror::Error;

/// Number of health observations kept per service.
pub const HEALTH_HISTORY_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Pending,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Failed)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Ready, Stopping)
                | (Ready, Failed)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("invalid transition for '{service}': {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },
}

/// Failure summary kept on a `Failed` service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub service_type: String,
    pub state: ServiceState,
    pub allocated_ports: AllocatedPorts,
    /// Names only; values never leave the secret store.
    pub secret_names: Vec<String>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub log_paths: Option<LogPaths>,
    pub health_history: VecDeque<HealthObservation>,
    pub consecutive_ok: u32,
    pub consecutive_failures: u32,
    pub failure: Option<FailureRecord>,
    /// Killed because it did not stop within its grace.
    pub shutdown_timeout: bool,
    /// Every state entered, in order, starting with `Pending`.
    pub transitions: Vec<ServiceState>,
}

impl ServiceRecord {
    pub fn new(id: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service_type: service_type.into(),
            state: ServiceState::Pending,
            allocated_ports: AllocatedPorts::new(),
            secret_names: vec![],
            pid: None,
            started_at: None,
            ready_at: None,
            log_paths: None,
            health_history: VecDeque::with_capacity(HEALTH_HISTORY_LEN),
            consecutive_ok: 0,
            consecutive_failures: 0,
            failure: None,
            shutdown_timeout: false,
            transitions: vec![ServiceState::Pending],
        }
    }

    /// Record a probe result and update the consecutive counters.
    pub fn record_health(&mut self, observation: HealthObservation) {
        if observation.outcome.is_ok() {
            self.consecutive_ok += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_ok = 0;
            self.consecutive_failures += 1;
        }
        if self.health_history.len() == HEALTH_HISTORY_LEN {
            self.health_history.pop_front();
        }
        self.health_history.push_back(observation);
    }

    /// Reason of the most recent non-Ok probe.
    pub fn last_probe_failure(&self) -> Option<String> {
        self.health_history
            .iter()
            .rev()
            .find_map(|observation| match &observation.outcome {
                ProbeOutcome::Ok => None,
                ProbeOutcome::Fail(reason) | ProbeOutcome::Error(reason) => Some(reason.clone()),
            })
    }
}

/// All service records of the session, in start order.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    app_name: String,
    phase: SessionPhase,
    order: Vec<String>,
    services: BTreeMap<String, ServiceRecord>,
}

impl RuntimeState {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            phase: SessionPhase::Idle,
            order: vec![],
            services: BTreeMap::new(),
        }
    }

    /// Register services in start order, all `Pending`.
    pub fn plan<'a>(&mut self, services: impl IntoIterator<Item = (&'a str, &'a str)>) {
        self.order.clear();
        self.services.clear();
        for (id, service_type) in services {
            self.order.push(id.to_string());
            self.services
                .insert(id.to_string(), ServiceRecord::new(id, service_type));
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, id: &str) -> Option<&ServiceRecord> {
        self.services.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ServiceRecord> {
        self.services.get_mut(id)
    }

    pub fn state_of(&self, id: &str) -> Option<ServiceState> {
        self.services.get(id).map(|record| record.state)
    }

    /// Move a service to `next`, rejecting backward or skipping transitions.
    pub fn transition(&mut self, id: &str, next: ServiceState) -> Result<ServiceState, StateError> {
        let record = self
            .services
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownService(id.to_string()))?;
        let from = record.state;
        if !from.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                service: id.to_string(),
                from,
                to: next,
            });
        }
        record.state = next;
        record.transitions.push(next);
        Ok(from)
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            app_name: self.app_name.clone(),
            phase: self.phase,
            services: self
                .order
                .iter()
                .filter_map(|id| self.services.get(id).cloned())
                .collect(),
            taken_at: Utc::now(),
        }
    }
}

/// Read-only projection of [`RuntimeState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub app_name: String,
    pub phase: SessionPhase,
    /// In start order.
    pub services: Vec<ServiceRecord>,
    pub taken_at: DateTime<Utc>,
}

impl RuntimeSnapshot {
    pub fn service(&self, id: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|record| record.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<ServiceState> {
        self.service(id).map(|record| record.state)
    }

    pub fn all_in(&self, state: ServiceState) -> bool {
        self.services.iter().all(|record| record.state == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RuntimeState {
        let mut state = RuntimeState::new("demo");
        state.plan([("db", "database"), ("api", "api")]);
        state
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = state();
        for next in [
            ServiceState::Starting,
            ServiceState::Ready,
            ServiceState::Stopping,
            ServiceState::Stopped,
        ] {
            state.transition("db", next).unwrap();
        }
        let record = state.get("db").unwrap();
        assert_eq!(
            record.transitions,
            vec![
                ServiceState::Pending,
                ServiceState::Starting,
                ServiceState::Ready,
                ServiceState::Stopping,
                ServiceState::Stopped
            ]
        );
        assert!(record.state.is_terminal());
    }

    #[test]
    fn test_rejects_backward_and_terminal_transitions() {
        let mut state = state();
        state.transition("api", ServiceState::Starting).unwrap();
        state.transition("api", ServiceState::Ready).unwrap();
        assert!(state.transition("api", ServiceState::Starting).is_err());

        state.transition("api", ServiceState::Failed).unwrap();
        assert!(matches!(
            state.transition("api", ServiceState::Stopping),
            Err(StateError::InvalidTransition { from: ServiceState::Failed, .. })
        ));
        assert!(state.transition("ghost", ServiceState::Starting).is_err());
    }

    #[test]
    fn test_starting_service_can_be_stopped() {
        let mut state = state();
        state.transition("api", ServiceState::Starting).unwrap();
        state.transition("api", ServiceState::Stopping).unwrap();
        state.transition("api", ServiceState::Stopped).unwrap();
        assert!(!ServiceState::Stopping.can_transition_to(ServiceState::Ready));
    }

    #[test]
    fn test_pending_cannot_skip_to_ready() {
        assert!(!ServiceState::Pending.can_transition_to(ServiceState::Ready));
        assert!(!ServiceState::Stopped.can_transition_to(ServiceState::Failed));
    }

    #[test]
    fn test_health_history_is_bounded() {
        let mut record = ServiceRecord::new("db", "database");
        for i in 0..(HEALTH_HISTORY_LEN + 5) {
            let outcome = if i % 2 == 0 {
                ProbeOutcome::Fail(format!("attempt {}", i))
            } else {
                ProbeOutcome::Ok
            };
            record.record_health(HealthObservation { at: Utc::now(), outcome });
        }
        assert_eq!(record.health_history.len(), HEALTH_HISTORY_LEN);
        assert_eq!(record.last_probe_failure(), Some(format!("attempt {}", HEALTH_HISTORY_LEN + 4)));
        assert_eq!(record.consecutive_failures, 1);
    }

    #[test]
    fn test_snapshot_keeps_start_order() {
        let snapshot = state().snapshot();
        let ids: Vec<&str> = snapshot.services.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["db", "api"]);
        assert!(snapshot.all_in(ServiceState::Pending));
        assert_eq!(snapshot.phase, SessionPhase::Idle);
    }
}
