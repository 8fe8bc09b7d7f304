// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Health Monitor Task
//
// One task per service with a health check. Waits `initial_delay`, then
// probes every `interval` and submits each outcome to the supervisor's event
// queue. It never decides anything: readiness and degradation are the
// supervisor's call.
//
// The task ends when its token is cancelled or the queue is gone. Observations
// of one service are sent from this single task, so they arrive in order.

use crate::domain::events::SupervisorEvent;
use crate::domain::health::{HealthProber, ProbeTarget};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub struct HealthMonitor {
    pub service: String,
    pub target: ProbeTarget,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub prober: Arc<dyn HealthProber>,
    pub events: mpsc::Sender<SupervisorEvent>,
}

/// A running monitor task.
pub struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl HealthMonitor {
    pub fn spawn(self) -> MonitorHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        MonitorHandle { cancel, task }
    }

    async fn run(self, cancel: CancellationToken) {
        debug!(service = %self.service, target = %self.target, "Health monitor started");

        if !self.initial_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.initial_delay) => {}
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.prober.probe(&self.target, self.probe_timeout) => outcome,
            };
            trace!(service = %self.service, outcome = ?outcome, "Health observation");

            let event = SupervisorEvent::HealthObserved {
                service: self.service.clone(),
                outcome,
                observed_at: Utc::now(),
            };
            let sent = tokio::select! {
                _ = cancel.cancelled() => break,
                sent = self.events.send(event) => sent,
            };
            if sent.is_err() {
                break;
            }
        }

        debug!(service = %self.service, "Health monitor stopped");
    }
}
