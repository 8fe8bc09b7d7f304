// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runtime Supervisor
//!
//! Coordinates a bundle session: validate → plan → start in order → await
//! ready → serve → shutdown.
//!
//! ## Concurrency
//!
//! The supervisor is the single writer of [`RuntimeState`]. Exit watchers,
//! health monitors, the signal watcher and [`SupervisorHandle`]s only submit
//! [`SupervisorEvent`]s into one bounded queue; the supervisor consumes them
//! in `start`, `run_until_shutdown` and nowhere else. Other tasks read state
//! through snapshots published on a watch channel.
//!
//! ## Failure Policy
//!
//! | When | What happens |
//! |------|--------------|
//! | a service fails while `Starting` | startup aborts, everything is torn down, `start` returns the failure |
//! | a `Ready` service exits during `start` | same as above |
//! | a `Ready` service exits while serving | marked `Failed`, recorded in the [`SessionOutcome`], no restart |
//! | post-ready probes keep failing | reported as degraded after `unhealthy_threshold` failures, never killed |
//! | shutdown requested during `start` | teardown, `start` returns `StartCancelled` |

use crate::application::health_monitor::{HealthMonitor, MonitorHandle};
use crate::domain::config::SupervisorConfig;
use crate::domain::error::{ServiceFailure, SupervisorError};
use crate::domain::events::{LifecycleEvent, ShutdownReason, SupervisorEvent};
use crate::domain::health::{HealthObservation, HealthProber, ProbeOutcome, ProbeTarget};
use crate::domain::host::{GpuDetector, HostPlatform};
use crate::domain::manifest::{HealthCheck, HealthSpec, Manifest, ServiceSpec, StopSignal};
use crate::domain::ports::AllocatedPorts;
use crate::domain::process::{LaunchRequest, LogPaths, ProcessExit, ProcessRunner, RunningProcess};
use crate::domain::secrets::EnvReader;
use crate::domain::state::{FailureRecord, RuntimeSnapshot, RuntimeState, ServiceState, SessionPhase};
use crate::domain::template::{render_list, render_map, TemplateContext, TemplateError};
use crate::infrastructure::app_data::{AppDataDir, SessionLock};
use crate::infrastructure::dry_run::DryRunProcessRunner;
use crate::infrastructure::event_bus::{EventBus, EventReceiver};
use crate::infrastructure::health_probes::NetworkHealthProber;
use crate::infrastructure::host::NvidiaSmiGpuDetector;
use crate::infrastructure::log_tail::tail_lines;
use crate::infrastructure::port_allocator::PortAllocator;
use crate::infrastructure::process_runner::OsProcessRunner;
use crate::infrastructure::secret_store::{OsEnvReader, SecretStore};
use crate::infrastructure::signals::ShutdownSignals;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Directory under the bundle root holding file-sourced secrets.
const DEFAULT_VAULT_DIR: &str = "secrets";

// ============================================================================
// Outcomes
// ============================================================================

/// What happened while tearing the session down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Services that reached `Stopped`, in stop order.
    pub stopped: Vec<String>,
    /// Services force-killed after their stop grace expired.
    pub timeouts: Vec<String>,
    /// `(service, error)` pairs observed while stopping; never fatal.
    pub errors: Vec<(String, String)>,
}

/// A `Ready` service that failed while the session was serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostReadyFailure {
    pub service: String,
    pub exit: ProcessExit,
}

/// Result of a session that started successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub reason: Option<ShutdownReason>,
    pub failures: Vec<PostReadyFailure>,
    pub shutdown: ShutdownReport,
}

impl SessionOutcome {
    /// 0 for a clean session, 3 when a service failed after becoming ready.
    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else {
            3
        }
    }
}

/// Why startup stopped early.
enum StartAbort {
    Failed { service: String, failure: ServiceFailure },
    Shutdown(ShutdownReason),
}

/// Background observation that interrupts the current phase.
enum Interrupt {
    Shutdown(ShutdownReason),
    ReadyServiceExited { service: String, exit: ProcessExit },
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable access to a supervisor owned by another task.
#[derive(Clone)]
pub struct SupervisorHandle {
    status: watch::Receiver<RuntimeSnapshot>,
    events: mpsc::Sender<SupervisorEvent>,
    bus: EventBus,
}

impl SupervisorHandle {
    /// Latest published snapshot.
    pub fn status(&self) -> RuntimeSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver that is notified whenever the snapshot changes.
    pub fn watch_status(&self) -> watch::Receiver<RuntimeSnapshot> {
        self.status.clone()
    }

    /// Ask the supervisor to shut down. Harmless if it already has.
    pub async fn request_shutdown(&self) {
        let event = SupervisorEvent::ShutdownRequested {
            reason: ShutdownReason::Requested,
        };
        if self.events.send(event).await.is_err() {
            debug!("Supervisor is gone, shutdown request ignored");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct SupervisorBuilder {
    manifest: Manifest,
    bundle_root: PathBuf,
    app_data_dir: PathBuf,
    vault_dir: Option<PathBuf>,
    config: SupervisorConfig,
    runner: Option<Arc<dyn ProcessRunner>>,
    prober: Option<Arc<dyn HealthProber>>,
    env_reader: Option<Arc<dyn EnvReader>>,
    gpu_detector: Option<Arc<dyn GpuDetector>>,
    host: Option<HostPlatform>,
    event_bus: Option<EventBus>,
}

impl SupervisorBuilder {
    pub fn config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn HealthProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn env_reader(mut self, env_reader: Arc<dyn EnvReader>) -> Self {
        self.env_reader = Some(env_reader);
        self
    }

    pub fn gpu_detector(mut self, gpu_detector: Arc<dyn GpuDetector>) -> Self {
        self.gpu_detector = Some(gpu_detector);
        self
    }

    /// Override the detected host platform.
    pub fn host(mut self, host: HostPlatform) -> Self {
        self.host = Some(host);
        self
    }

    /// Directory for `file(relpath)` secrets; defaults to `<bundle_root>/secrets`.
    pub fn vault_dir(mut self, vault_dir: impl Into<PathBuf>) -> Self {
        self.vault_dir = Some(vault_dir.into());
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> Supervisor {
        let runner: Arc<dyn ProcessRunner> = match self.runner {
            Some(runner) => runner,
            None if self.config.dry_run => Arc::new(DryRunProcessRunner::new()),
            None => Arc::new(OsProcessRunner::new()),
        };
        let prober = self
            .prober
            .unwrap_or_else(|| Arc::new(NetworkHealthProber::new()));
        let env_reader = self.env_reader.unwrap_or_else(|| Arc::new(OsEnvReader));
        let gpu_detector = self
            .gpu_detector
            .unwrap_or_else(|| Arc::new(NvidiaSmiGpuDetector::new()));
        let vault_dir = self
            .vault_dir
            .unwrap_or_else(|| self.bundle_root.join(DEFAULT_VAULT_DIR));

        let state = RuntimeState::new(self.manifest.app_name.clone());
        let (status_tx, _) = watch::channel(state.snapshot());
        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_capacity.max(1));
        let app_data = AppDataDir::new(self.app_data_dir, self.manifest.app_data_layout.clone());

        Supervisor {
            manifest: Arc::new(self.manifest),
            bundle_root: self.bundle_root,
            app_data,
            host: self.host.unwrap_or_else(HostPlatform::current),
            runner,
            prober,
            gpu_detector,
            ports: PortAllocator::new(),
            secrets: SecretStore::new(vault_dir, env_reader),
            bus: self.event_bus.unwrap_or_default(),
            state,
            status_tx,
            events_tx,
            events_rx,
            processes: HashMap::new(),
            monitors: HashMap::new(),
            exit_watchers: Vec::new(),
            background: Vec::new(),
            allocated: BTreeMap::new(),
            lock: None,
            force_stop: CancellationToken::new(),
            shutdown_reason: None,
            shutdown_report: None,
            post_ready_failures: Vec::new(),
            config: self.config,
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    manifest: Arc<Manifest>,
    bundle_root: PathBuf,
    app_data: AppDataDir,
    config: SupervisorConfig,
    host: HostPlatform,
    runner: Arc<dyn ProcessRunner>,
    prober: Arc<dyn HealthProber>,
    gpu_detector: Arc<dyn GpuDetector>,
    ports: PortAllocator,
    secrets: SecretStore,
    bus: EventBus,
    state: RuntimeState,
    status_tx: watch::Sender<RuntimeSnapshot>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
    processes: HashMap<String, RunningProcess>,
    monitors: HashMap<String, MonitorHandle>,
    exit_watchers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    /// Ports of every launched service, for template rendering.
    allocated: BTreeMap<String, AllocatedPorts>,
    lock: Option<SessionLock>,
    /// Cancelled by a repeated shutdown signal: stop without grace.
    force_stop: CancellationToken,
    shutdown_reason: Option<ShutdownReason>,
    shutdown_report: Option<ShutdownReport>,
    post_ready_failures: Vec<PostReadyFailure>,
}

impl Supervisor {
    pub fn builder(
        manifest: Manifest,
        bundle_root: impl Into<PathBuf>,
        app_data_dir: impl Into<PathBuf>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            manifest,
            bundle_root: bundle_root.into(),
            app_data_dir: app_data_dir.into(),
            vault_dir: None,
            config: SupervisorConfig::default(),
            runner: None,
            prober: None,
            env_reader: None,
            gpu_detector: None,
            host: None,
            event_bus: None,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            status: self.status_tx.subscribe(),
            events: self.events_tx.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Read-only projection of the runtime state.
    pub fn status(&self) -> RuntimeSnapshot {
        self.state.snapshot()
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn app_data(&self) -> &AppDataDir {
        &self.app_data
    }

    /// Port ledger of the session.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    /// Bring every service up in dependency order.
    ///
    /// Returns once all services are `Ready`. On any failure everything that
    /// was started is torn down before the error is returned. Cancelling
    /// `cancel` (now or later in the session) requests a shutdown.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        if self.state.phase() != SessionPhase::Idle {
            return Err(SupervisorError::InvalidPhase {
                phase: self.state.phase().to_string(),
                operation: "start",
            });
        }

        let gpus = if self.manifest.requires_gpu() {
            self.gpu_detector.detect()
        } else {
            vec![]
        };
        self.manifest.validate(&self.host, &gpus)?;
        let order = self.manifest.start_order()?;

        let manifest = Arc::clone(&self.manifest);
        self.state.plan(order.iter().filter_map(|id| {
            manifest
                .service(id)
                .map(|spec| (spec.id.as_str(), spec.service_type.as_str()))
        }));
        self.publish_status();

        self.lock = Some(self.app_data.acquire_lock()?);
        if let Err(e) = self.app_data.ensure_layout() {
            self.release_lock();
            return Err(e.into());
        }

        info!(
            app = %self.manifest.app_name,
            version = %self.manifest.app_version,
            order = ?order,
            dry_run = self.config.dry_run,
            "Starting bundle"
        );
        self.state.set_phase(SessionPhase::Starting);
        self.publish_status();
        self.spawn_background_watchers(cancel);

        let budget = self.config.startup_budget(self.manifest.startup_timeout);
        let deadline = Instant::now() + budget;

        for id in &order {
            let result = match self.drain_pending_events() {
                Some(abort) => Err(abort),
                None => self.start_service(id, deadline).await,
            };
            match result {
                Ok(()) => {}
                Err(StartAbort::Failed { service, failure }) => {
                    return Err(self.abort_start(service, failure).await);
                }
                Err(StartAbort::Shutdown(reason)) => {
                    info!(reason = %reason, "Shutdown requested during startup");
                    self.shutdown().await;
                    return Err(SupervisorError::StartCancelled {
                        reason: reason.to_string(),
                    });
                }
            }
        }

        self.state.set_phase(SessionPhase::Running);
        self.publish_status();
        info!(app = %self.manifest.app_name, services = order.len(), "All services ready");
        Ok(())
    }

    fn spawn_background_watchers(&mut self, cancel: CancellationToken) {
        if self.config.handle_signals {
            // Installed before the task runs so no early signal hits the
            // default handler.
            match ShutdownSignals::install() {
                Ok(mut signals) => {
                    let tx = self.events_tx.clone();
                    let force_stop = self.force_stop.clone();
                    self.background.push(tokio::spawn(async move {
                        let Some(name) = signals.recv().await else {
                            return;
                        };
                        let reason = ShutdownReason::Signal {
                            name: name.to_string(),
                        };
                        let _ = tx.send(SupervisorEvent::ShutdownRequested { reason }).await;

                        if let Some(name) = signals.recv().await {
                            warn!(signal = name, "Repeated shutdown signal, killing services");
                            force_stop.cancel();
                        }
                    }));
                }
                Err(e) => warn!("Failed to install signal handlers: {}", e),
            }
        }

        let tx = self.events_tx.clone();
        self.background.push(tokio::spawn(async move {
            cancel.cancelled().await;
            let reason = ShutdownReason::Cancelled;
            let _ = tx.send(SupervisorEvent::ShutdownRequested { reason }).await;
        }));
    }

    /// Apply queued background events without waiting.
    fn drain_pending_events(&mut self) -> Option<StartAbort> {
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(interrupt) = self.handle_background_event(event) {
                return Some(self.interrupt_to_abort(interrupt));
            }
        }
        None
    }

    fn interrupt_to_abort(&self, interrupt: Interrupt) -> StartAbort {
        match interrupt {
            Interrupt::Shutdown(reason) => StartAbort::Shutdown(reason),
            Interrupt::ReadyServiceExited { service, exit } => StartAbort::Failed {
                service,
                failure: ServiceFailure::UnexpectedExit { exit },
            },
        }
    }

    async fn start_service(&mut self, id: &str, deadline: Instant) -> Result<(), StartAbort> {
        let manifest = Arc::clone(&self.manifest);
        let Some(spec) = manifest.service(id) else {
            return Ok(());
        };

        self.transition(id, ServiceState::Starting);
        debug!(service = %id, "Preparing service");

        let (request, target) = match self.prepare_launch(spec) {
            Ok(prepared) => prepared,
            Err(failure) => return Err(self.fail_service(id, failure)),
        };

        let process = match self.runner.launch(request).await {
            Ok(process) => process,
            Err(e) => return Err(self.fail_service(id, e.into())),
        };
        let launched_at = Instant::now();
        self.record_launch(id, process);

        let Some(target) = target else {
            self.mark_ready(id);
            return Ok(());
        };

        if self.config.dry_run {
            let outcome = self
                .prober
                .probe(&target, spec.health.effective_probe_timeout())
                .await;
            info!(service = %id, target = %target, outcome = ?outcome, "Dry run: single health probe");
            self.mark_ready(id);
            return Ok(());
        }

        let monitor = HealthMonitor {
            service: id.to_string(),
            target,
            initial_delay: spec.health.initial_delay,
            interval: spec.health.interval,
            probe_timeout: spec.health.effective_probe_timeout(),
            prober: Arc::clone(&self.prober),
            events: self.events_tx.clone(),
        };
        self.monitors.insert(id.to_string(), monitor.spawn());

        self.await_ready(id, &spec.health, launched_at, deadline).await
    }

    /// Allocate ports, materialise secrets and render templates.
    fn prepare_launch(&mut self, spec: &ServiceSpec) -> Result<(LaunchRequest, Option<ProbeTarget>), ServiceFailure> {
        let id = spec.id.as_str();
        let data_dir = self.app_data.ensure_service_data_dir(id)?;

        let ports = self.ports.allocate(id, &spec.ports)?;
        self.allocated.insert(id.to_string(), ports.clone());
        if let Some(record) = self.state.get_mut(id) {
            record.allocated_ports = ports.clone();
        }
        if !ports.is_empty() {
            self.bus.publish(LifecycleEvent::PortsAllocated {
                service: id.to_string(),
                ports: ports.clone(),
            });
        }

        let secrets = self.secrets.materialize(id, &spec.secrets)?;
        if let Some(record) = self.state.get_mut(id) {
            record.secret_names = secrets.names();
        }

        let working_dir = match &spec.working_dir {
            Some(dir) => self.bundle_root.join(dir),
            None => self.bundle_root.clone(),
        };

        let ctx = TemplateContext {
            service_id: id,
            ports: &self.allocated,
            secrets: &secrets,
            data_dir: &data_dir,
            bundle_root: &self.bundle_root,
            app_data: self.app_data.root(),
        };
        let env = render_map(&spec.env_template, &ctx)?;
        let args = render_list(&spec.args, &ctx)?;
        let target = probe_target(&spec.health, &ports, &self.config.probe_host, &working_dir, &ctx)?;

        let request = LaunchRequest {
            service_id: id.to_string(),
            program: self.bundle_root.join(&spec.binary_path),
            args,
            env,
            working_dir,
            log_paths: LogPaths::for_service(&self.app_data.logs_dir(), id),
        };
        Ok((request, target))
    }

    fn record_launch(&mut self, id: &str, process: RunningProcess) {
        if let Some(record) = self.state.get_mut(id) {
            record.pid = process.pid;
            record.started_at = Some(process.started_at);
            record.log_paths = Some(process.log_paths.clone());
        }
        self.bus.publish(LifecycleEvent::ProcessLaunched {
            service: id.to_string(),
            pid: process.pid,
            at: process.started_at,
        });

        let mut exit_rx = process.exit_watch();
        let tx = self.events_tx.clone();
        let service = id.to_string();
        self.exit_watchers.push(tokio::spawn(async move {
            let exit = exit_rx
                .wait_for(|status| status.is_some())
                .await
                .ok()
                .and_then(|status| *status);
            if let Some(exit) = exit {
                let _ = tx.send(SupervisorEvent::ExitObserved { service, exit }).await;
            }
        }));

        self.processes.insert(id.to_string(), process);
        self.publish_status();
    }

    /// Consume events until the service has enough consecutive Ok probes, or
    /// fails, or the readiness budget runs out.
    async fn await_ready(
        &mut self,
        id: &str,
        health: &HealthSpec,
        launched_at: Instant,
        deadline: Instant,
    ) -> Result<(), StartAbort> {
        let until = (launched_at + health.timeout).min(deadline);
        let budget = until.saturating_duration_since(launched_at);
        let sleep = tokio::time::sleep_until(until);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => {
                    let last_failure = self.state.get(id).and_then(|record| record.last_probe_failure());
                    warn!(service = %id, ?budget, "Service not ready within budget");
                    return Err(self.fail_service(id, ServiceFailure::HealthTimeout { budget, last_failure }));
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        return Err(StartAbort::Shutdown(ShutdownReason::Cancelled));
                    };
                    match event {
                        SupervisorEvent::HealthObserved { service, outcome, observed_at } if service == id => {
                            if let Some(done) = self.observe_startup_health(id, health, outcome, observed_at) {
                                return done;
                            }
                        }
                        SupervisorEvent::ExitObserved { service, exit } if service == id => {
                            self.publish_exit(id, exit);
                            warn!(service = %id, exit = %exit, "Service exited before becoming ready");
                            return Err(self.fail_service(id, ServiceFailure::UnexpectedExit { exit }));
                        }
                        other => {
                            if let Some(interrupt) = self.handle_background_event(other) {
                                return Err(self.interrupt_to_abort(interrupt));
                            }
                        }
                    }
                }
            }
        }
    }

    fn observe_startup_health(
        &mut self,
        id: &str,
        health: &HealthSpec,
        outcome: ProbeOutcome,
        observed_at: chrono::DateTime<Utc>,
    ) -> Option<Result<(), StartAbort>> {
        let record = self.state.get_mut(id)?;
        record.record_health(HealthObservation {
            at: observed_at,
            outcome: outcome.clone(),
        });
        let consecutive_ok = record.consecutive_ok;

        match outcome {
            ProbeOutcome::Ok => {
                debug!(service = %id, consecutive_ok, needed = health.consecutive_ok_to_ready, "Health probe ok");
                if consecutive_ok >= health.consecutive_ok_to_ready {
                    self.mark_ready(id);
                    return Some(Ok(()));
                }
            }
            ProbeOutcome::Fail(reason) => {
                debug!(service = %id, "Health probe failed while starting: {}", reason);
            }
            ProbeOutcome::Error(reason) => {
                return Some(Err(self.fail_service(id, ServiceFailure::HealthProbe { reason })));
            }
        }
        self.publish_status();
        None
    }

    fn mark_ready(&mut self, id: &str) {
        if let Some(record) = self.state.get_mut(id) {
            record.ready_at = Some(Utc::now());
            record.consecutive_failures = 0;
        }
        self.transition(id, ServiceState::Ready);
        info!(service = %id, "Service ready");
    }

    /// Move a starting service to `Failed`; its process, if any, is killed
    /// right away and reaped during teardown.
    fn fail_service(&mut self, id: &str, failure: ServiceFailure) -> StartAbort {
        error!(service = %id, kind = %failure.kind(), "Service failed: {}", failure);
        if let Some(record) = self.state.get_mut(id) {
            record.failure = Some(FailureRecord {
                kind: failure.kind(),
                message: failure.to_string(),
                at: Utc::now(),
            });
        }
        self.transition(id, ServiceState::Failed);

        if let Some(monitor) = self.monitors.remove(id) {
            monitor.stop();
        }
        if let Some(process) = self.processes.get(id) {
            process.request_kill();
        }

        StartAbort::Failed {
            service: id.to_string(),
            failure,
        }
    }

    async fn abort_start(&mut self, service: String, failure: ServiceFailure) -> SupervisorError {
        self.shutdown().await;

        let stderr_tail = self
            .state
            .get(&service)
            .and_then(|record| record.log_paths.as_ref())
            .map(|paths| tail_lines(&paths.stderr, self.config.stderr_tail_lines))
            .unwrap_or_default();

        SupervisorError::ServiceFailed {
            service,
            failure,
            stderr_tail,
        }
    }

    // ------------------------------------------------------------------------
    // Serve
    // ------------------------------------------------------------------------

    /// Serve until a shutdown is requested or no service is left alive, then
    /// shut down.
    pub async fn run_until_shutdown(&mut self) -> Result<SessionOutcome, SupervisorError> {
        match self.state.phase() {
            SessionPhase::Running => {}
            SessionPhase::Stopped if self.shutdown_report.is_some() => {}
            phase => {
                return Err(SupervisorError::InvalidPhase {
                    phase: phase.to_string(),
                    operation: "serve",
                })
            }
        }

        while self.state.phase() == SessionPhase::Running {
            if !self.any_service_alive() {
                warn!("No services remain alive, ending session");
                break;
            }
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            match self.handle_background_event(event) {
                Some(Interrupt::Shutdown(reason)) => {
                    info!(reason = %reason, "Shutting down");
                    break;
                }
                Some(Interrupt::ReadyServiceExited { .. }) | None => {}
            }
        }

        let shutdown = self.shutdown().await;
        Ok(SessionOutcome {
            reason: self.shutdown_reason.clone(),
            failures: self.post_ready_failures.clone(),
            shutdown,
        })
    }

    fn any_service_alive(&self) -> bool {
        self.state.order().iter().any(|id| {
            matches!(
                self.state.state_of(id),
                Some(ServiceState::Ready | ServiceState::Starting)
            )
        })
    }

    /// Apply an event that is not part of the current readiness wait.
    fn handle_background_event(&mut self, event: SupervisorEvent) -> Option<Interrupt> {
        match event {
            SupervisorEvent::ShutdownRequested { reason } => {
                self.shutdown_reason.get_or_insert_with(|| reason.clone());
                Some(Interrupt::Shutdown(reason))
            }
            SupervisorEvent::ExitObserved { service, exit } => {
                self.publish_exit(&service, exit);
                if self.state.state_of(&service) != Some(ServiceState::Ready) {
                    return None;
                }

                error!(service = %service, exit = %exit, "Ready service exited unexpectedly");
                let failure = ServiceFailure::UnexpectedExit { exit };
                if let Some(record) = self.state.get_mut(&service) {
                    record.failure = Some(FailureRecord {
                        kind: failure.kind(),
                        message: failure.to_string(),
                        at: Utc::now(),
                    });
                }
                self.transition(&service, ServiceState::Failed);
                if let Some(monitor) = self.monitors.remove(&service) {
                    monitor.stop();
                }
                self.post_ready_failures.push(PostReadyFailure {
                    service: service.clone(),
                    exit,
                });
                Some(Interrupt::ReadyServiceExited { service, exit })
            }
            SupervisorEvent::HealthObserved {
                service,
                outcome,
                observed_at,
            } => {
                self.observe_ready_health(&service, outcome, observed_at);
                None
            }
        }
    }

    /// Post-ready health: observe and report, never kill.
    fn observe_ready_health(&mut self, id: &str, outcome: ProbeOutcome, observed_at: chrono::DateTime<Utc>) {
        let threshold = self.config.unhealthy_threshold;
        let Some(record) = self.state.get_mut(id) else {
            return;
        };
        if record.state != ServiceState::Ready {
            return;
        }

        let was_degraded = record.consecutive_failures >= threshold;
        record.record_health(HealthObservation {
            at: observed_at,
            outcome: outcome.clone(),
        });
        let failures = record.consecutive_failures;

        match outcome {
            ProbeOutcome::Ok => {
                if was_degraded {
                    info!(service = %id, "Service health recovered");
                    self.bus.publish(LifecycleEvent::HealthRecovered {
                        service: id.to_string(),
                    });
                }
            }
            ProbeOutcome::Fail(reason) | ProbeOutcome::Error(reason) => {
                warn!(service = %id, consecutive_failures = failures, "Health check failed: {}", reason);
                if failures == threshold {
                    warn!(service = %id, threshold, "Service health degraded");
                    self.bus.publish(LifecycleEvent::HealthDegraded {
                        service: id.to_string(),
                        consecutive_failures: failures,
                        reason,
                    });
                }
            }
        }
        self.publish_status();
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Tear every service down in reverse start order.
    ///
    /// Idempotent: later calls return the first report without doing anything.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = &self.shutdown_report {
            return report.clone();
        }

        let mut report = ShutdownReport::default();
        if self.state.phase() == SessionPhase::Idle {
            self.state.set_phase(SessionPhase::Stopped);
            self.publish_status();
            self.shutdown_report = Some(report.clone());
            return report;
        }

        info!(app = %self.manifest.app_name, "Shutting down bundle");
        self.state.set_phase(SessionPhase::ShuttingDown);
        self.publish_status();

        for (_, monitor) in self.monitors.drain() {
            monitor.stop();
        }

        let manifest = Arc::clone(&self.manifest);
        let order: Vec<String> = self.state.order().to_vec();
        for id in order.iter().rev() {
            let Some(spec) = manifest.service(id) else {
                continue;
            };
            match self.state.state_of(id) {
                Some(ServiceState::Ready) => {
                    self.transition(id, ServiceState::Stopping);
                    self.stop_process(id, spec.stop_signal, spec.stop_grace, &mut report).await;
                    self.transition(id, ServiceState::Stopped);
                    report.stopped.push(id.clone());
                }
                Some(ServiceState::Starting) => {
                    self.transition(id, ServiceState::Stopping);
                    self.stop_process(id, spec.stop_signal, Duration::ZERO, &mut report).await;
                    self.transition(id, ServiceState::Stopped);
                    report.stopped.push(id.clone());
                }
                Some(ServiceState::Failed) => {
                    self.stop_process(id, spec.stop_signal, Duration::ZERO, &mut report).await;
                }
                _ => {}
            }
        }

        self.ports.release_all();
        self.allocated.clear();
        for task in self.exit_watchers.drain(..).chain(self.background.drain(..)) {
            task.abort();
        }
        self.release_lock();

        self.state.set_phase(SessionPhase::Stopped);
        self.publish_status();
        info!(
            stopped = report.stopped.len(),
            timeouts = report.timeouts.len(),
            errors = report.errors.len(),
            "Bundle stopped"
        );

        self.shutdown_report = Some(report.clone());
        report
    }

    async fn stop_process(&mut self, id: &str, signal: StopSignal, grace: Duration, report: &mut ShutdownReport) {
        let Some(mut process) = self.processes.remove(id) else {
            return;
        };
        let grace = if self.force_stop.is_cancelled() {
            Duration::ZERO
        } else {
            grace
        };
        debug!(service = %id, pid = ?process.pid, ?grace, "Stopping process");

        let runner = Arc::clone(&self.runner);
        let force_stop = self.force_stop.clone();
        let kill_switch = process.kill_switch();
        let mut escalated = false;
        let stop = runner.stop(&mut process, signal, grace);
        tokio::pin!(stop);
        let result = tokio::select! {
            result = &mut stop => result,
            _ = force_stop.cancelled(), if !grace.is_zero() => {
                warn!(service = %id, "Killing service before its stop grace expired");
                escalated = true;
                kill_switch.kill();
                stop.await
            }
        };

        match result {
            Ok(outcome) => {
                if let Some(exit) = outcome.exit {
                    debug!(service = %id, exit = %exit, "Process stopped");
                }
                if outcome.forced || escalated {
                    warn!(service = %id, ?grace, "Service did not stop gracefully and was killed");
                    if let Some(record) = self.state.get_mut(id) {
                        record.shutdown_timeout = true;
                    }
                    self.bus.publish(LifecycleEvent::ShutdownTimeout {
                        service: id.to_string(),
                        grace,
                    });
                    report.timeouts.push(id.to_string());
                }
            }
            Err(e) => {
                error!(service = %id, "Failed to stop service: {}", e);
                report.errors.push((id.to_string(), e.to_string()));
            }
        }
    }

    fn release_lock(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }

    // ------------------------------------------------------------------------
    // State helpers
    // ------------------------------------------------------------------------

    fn transition(&mut self, id: &str, next: ServiceState) {
        match self.state.transition(id, next) {
            Ok(from) => {
                info!(service = %id, from = %from, to = %next, "Service state changed");
                self.bus.publish(LifecycleEvent::StateChanged {
                    service: id.to_string(),
                    from,
                    to: next,
                    at: Utc::now(),
                });
                self.publish_status();
            }
            Err(e) => error!("Rejected state transition: {}", e),
        }
    }

    fn publish_exit(&self, id: &str, exit: ProcessExit) {
        self.bus.publish(LifecycleEvent::ProcessExited {
            service: id.to_string(),
            exit,
            at: Utc::now(),
        });
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.state.snapshot());
    }
}

/// Resolve a health check against allocated ports and rendered templates.
fn probe_target(
    health: &HealthSpec,
    ports: &AllocatedPorts,
    host: &str,
    working_dir: &Path,
    ctx: &TemplateContext<'_>,
) -> Result<Option<ProbeTarget>, ServiceFailure> {
    let port_of = |name: &str| {
        ports.get(name).ok_or_else(|| TemplateError::Unresolved {
            token: format!("port.self.{}", name),
        })
    };

    let target = match &health.check {
        HealthCheck::Tcp { port_name } => Some(ProbeTarget::Tcp {
            host: host.to_string(),
            port: port_of(port_name)?,
        }),
        HealthCheck::Http {
            port_name,
            path,
            expect_status,
        } => {
            let port = port_of(port_name)?;
            let path = if path.starts_with('/') {
                path.clone()
            } else {
                format!("/{}", path)
            };
            Some(ProbeTarget::Http {
                url: format!("http://{}:{}{}", host, port, path),
                expect_status: *expect_status,
            })
        }
        HealthCheck::Command { argv } => Some(ProbeTarget::Command {
            argv: render_list(argv, ctx)?,
            working_dir: working_dir.to_path_buf(),
        }),
        HealthCheck::None => None,
    };
    Ok(target)
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for (_, monitor) in self.monitors.drain() {
            monitor.stop();
        }
        for task in self.exit_watchers.drain(..).chain(self.background.drain(..)) {
            task.abort();
        }
        // Remaining children are killed by the runner's kill-on-drop.
        for (_, process) in self.processes.iter() {
            process.request_kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::secrets::SecretValues;

    fn health(check: HealthCheck) -> HealthSpec {
        HealthSpec {
            check,
            ..HealthSpec::default()
        }
    }

    fn resolve(check: HealthCheck) -> Result<Option<ProbeTarget>, ServiceFailure> {
        let ports = AllocatedPorts::from_pairs([("http".to_string(), 18080)]);
        let all = BTreeMap::from([("api".to_string(), ports.clone())]);
        let secrets = SecretValues::default();
        let ctx = TemplateContext {
            service_id: "api",
            ports: &all,
            secrets: &secrets,
            data_dir: Path::new("/data/api"),
            bundle_root: Path::new("/bundle"),
            app_data: Path::new("/data"),
        };
        probe_target(&health(check), &ports, "127.0.0.1", Path::new("/bundle"), &ctx)
    }

    #[test]
    fn test_http_target_gets_leading_slash() {
        let target = resolve(HealthCheck::Http {
            port_name: "http".to_string(),
            path: "health".to_string(),
            expect_status: None,
        })
        .unwrap();
        assert_eq!(
            target,
            Some(ProbeTarget::Http {
                url: "http://127.0.0.1:18080/health".to_string(),
                expect_status: None,
            })
        );
    }

    #[test]
    fn test_command_argv_is_rendered() {
        let target = resolve(HealthCheck::Command {
            argv: vec!["check".to_string(), "--port={{port.self.http}}".to_string()],
        })
        .unwrap();
        match target {
            Some(ProbeTarget::Command { argv, working_dir }) => {
                assert_eq!(argv, vec!["check", "--port=18080"]);
                assert_eq!(working_dir, PathBuf::from("/bundle"));
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_unknown_port_name_is_unresolved() {
        let result = resolve(HealthCheck::Tcp {
            port_name: "grpc".to_string(),
        });
        assert!(matches!(result, Err(ServiceFailure::Template(TemplateError::Unresolved { .. }))));
        assert_eq!(resolve(HealthCheck::None).unwrap(), None);
    }

    #[test]
    fn test_session_exit_code() {
        let mut outcome = SessionOutcome {
            reason: Some(ShutdownReason::Requested),
            failures: vec![],
            shutdown: ShutdownReport::default(),
        };
        assert_eq!(outcome.exit_code(), 0);
        outcome.failures.push(PostReadyFailure {
            service: "api".to_string(),
            exit: ProcessExit::code(1),
        });
        assert_eq!(outcome.exit_code(), 3);
    }
}
