// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// OS Process Runner
//
// Launches service binaries as child processes with stdout/stderr appended to
// per-service log files, and stops them with a graceful signal followed by a
// kill once the grace period runs out.
//
// Each child gets a waiter task that owns the tokio `Child`. The waiter
// publishes the exit status on a watch channel and force-kills the child when
// asked through the kill channel, so the supervisor never has to share the
// `Child` itself.
//
// On unix every child leads its own process group: terminal interrupts do not
// reach services directly, and stop signals are delivered to the whole group.

use crate::domain::manifest::StopSignal;
use crate::domain::process::{
    LaunchError, LaunchRequest, LogFiles, ProcessExit, ProcessRunner, RunningProcess, StopError, StopOutcome,
};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long to wait for an exit after a kill before giving up.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessRunner;

impl OsProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

fn open_log(path: &Path) -> Result<File, LaunchError> {
    let to_err = |source| LaunchError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    OpenOptions::new().create(true).append(true).open(path).map_err(to_err)
}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessExit::signalled(signal);
        }
    }
    ProcessExit {
        code: status.code(),
        signal: None,
    }
}

#[cfg(unix)]
fn signal_number(signal: StopSignal) -> i32 {
    match signal {
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Interrupt => libc::SIGINT,
        StopSignal::Quit => libc::SIGQUIT,
        StopSignal::Hangup => libc::SIGHUP,
        StopSignal::Kill => libc::SIGKILL,
    }
}

/// Signal the process group led by `pid`, falling back to the process alone.
#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<(), String> {
    let pid = pid as i32;
    unsafe {
        if libc::kill(-pid, signal) == 0 || libc::kill(pid, signal) == 0 {
            return Ok(());
        }
    }
    Err(std::io::Error::last_os_error().to_string())
}

/// Owns the child until it exits.
async fn wait_child(
    service_id: String,
    mut child: Child,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    mut kill_rx: mpsc::Receiver<()>,
) {
    let pid = child.id();
    let mut kill_requests_open = true;

    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => exit_from_status(status),
                    Err(e) => {
                        warn!(service = %service_id, "Failed to wait for child: {}", e);
                        ProcessExit { code: None, signal: None }
                    }
                };
            }
            request = kill_rx.recv(), if kill_requests_open => {
                match request {
                    Some(()) => {
                        debug!(service = %service_id, pid = ?pid, "Killing child");
                        #[cfg(unix)]
                        if let Some(pid) = pid {
                            let _ = send_signal(pid, libc::SIGKILL);
                        }
                        let _ = child.start_kill();
                    }
                    None => kill_requests_open = false,
                }
            }
        }
    };

    debug!(service = %service_id, pid = ?pid, exit = %exit, "Child exited");
    exit_tx.send_replace(Some(exit));
}

#[async_trait]
impl ProcessRunner for OsProcessRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<RunningProcess, LaunchError> {
        std::fs::create_dir_all(&request.working_dir).map_err(|source| LaunchError::WorkingDir {
            path: request.working_dir.clone(),
            source,
        })?;

        if !request.program.is_file() {
            return Err(LaunchError::BinaryNotFound(request.program.clone()));
        }

        let stdout = open_log(&request.log_paths.stdout)?;
        let stderr = open_log(&request.log_paths.stderr)?;
        let clone_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| LaunchError::LogFile { path, source }
        };
        let child_stdout = stdout.try_clone().map_err(clone_err(&request.log_paths.stdout))?;
        let child_stderr = stderr.try_clone().map_err(clone_err(&request.log_paths.stderr))?;

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(child_stdout))
            .stderr(Stdio::from(child_stderr))
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: request.program.clone(),
            source,
        })?;
        let pid = child.id();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        tokio::spawn(wait_child(request.service_id.clone(), child, exit_tx, kill_rx));

        info!(
            service = %request.service_id,
            pid = ?pid,
            program = ?request.program,
            "Launched service process"
        );

        Ok(RunningProcess::new(
            request.service_id,
            pid,
            request.log_paths,
            exit_rx,
            kill_tx,
            Some(LogFiles { stdout, stderr }),
        ))
    }

    async fn stop(
        &self,
        process: &mut RunningProcess,
        signal: StopSignal,
        grace: Duration,
    ) -> Result<StopOutcome, StopError> {
        let result = stop_process(process, signal, grace).await;
        process.close_logs();
        result
    }
}

async fn stop_process(
    process: &mut RunningProcess,
    signal: StopSignal,
    grace: Duration,
) -> Result<StopOutcome, StopError> {
    if let Some(exit) = process.exit_status() {
        return Ok(StopOutcome { exit: Some(exit), forced: false });
    }
    let pid = process.pid;

    #[cfg(unix)]
    match pid {
        Some(pid) => {
            if let Err(reason) = send_signal(pid, signal_number(signal)) {
                if process.is_alive() {
                    warn!(service = %process.service_id, pid, "Graceful signal failed: {}", reason);
                }
            }
        }
        // No process group to address; the waiter's kill is the only lever.
        None => {
            warn!(service = %process.service_id, "Process has no pid, killing");
            process.request_kill();
        }
    }

    // Windows has no graceful signal for arbitrary processes; the stop
    // request is the termination itself.
    #[cfg(not(unix))]
    {
        let _ = signal;
        process.request_kill();
    }

    if !grace.is_zero() {
        if let Ok(exit) = tokio::time::timeout(grace, process.wait()).await {
            return Ok(StopOutcome { exit, forced: false });
        }
    }
    if let Some(exit) = process.exit_status() {
        return Ok(StopOutcome { exit: Some(exit), forced: false });
    }

    if !grace.is_zero() {
        warn!(service = %process.service_id, pid = ?pid, ?grace, "Stop grace exceeded, killing");
    }
    process.request_kill();
    match tokio::time::timeout(KILL_WAIT, process.wait()).await {
        Ok(exit) => Ok(StopOutcome { exit, forced: !grace.is_zero() }),
        Err(_) => Err(StopError::NoExit {
            service: process.service_id.clone(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::process::LogPaths;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(dir: &Path, program: PathBuf) -> LaunchRequest {
        LaunchRequest {
            service_id: "svc".to_string(),
            program,
            args: vec!["one".to_string()],
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            working_dir: dir.join("work"),
            log_paths: LogPaths::for_service(&dir.join("logs"), "svc"),
        }
    }

    #[tokio::test]
    async fn test_launch_redirects_output_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "echo.sh", "echo \"$GREETING $1\"; echo oops >&2; exit 3");
        let runner = OsProcessRunner::new();

        let mut process = runner.launch(request(dir.path(), program)).await.unwrap();
        assert!(process.pid.is_some());
        assert_eq!(process.wait().await, Some(ProcessExit::code(3)));

        let stdout = std::fs::read_to_string(dir.path().join("logs/svc.stdout.log")).unwrap();
        let stderr = std::fs::read_to_string(dir.path().join("logs/svc.stderr.log")).unwrap();
        assert_eq!(stdout.trim(), "hello one");
        assert_eq!(stderr.trim(), "oops");
        assert!(dir.path().join("work").is_dir());
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = OsProcessRunner::new();
        let err = runner
            .launch(request(dir.path(), dir.path().join("bin/absent")))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "sleepy.sh", "exec sleep 30");
        let runner = OsProcessRunner::new();

        let mut process = runner.launch(request(dir.path(), program)).await.unwrap();
        let outcome = runner
            .stop(&mut process, StopSignal::Terminate, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.forced);
        assert_eq!(outcome.exit.and_then(|e| e.signal), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_force_kill_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "stubborn.sh", "trap '' TERM\nwhile true; do sleep 0.1; done");
        let runner = OsProcessRunner::new();

        let mut process = runner.launch(request(dir.path(), program)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = runner
            .stop(&mut process, StopSignal::Terminate, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(outcome.forced);
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_stop_after_exit_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "quick.sh", "exit 0");
        let runner = OsProcessRunner::new();

        let mut process = runner.launch(request(dir.path(), program)).await.unwrap();
        process.wait().await;
        let outcome = runner
            .stop(&mut process, StopSignal::Terminate, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome { exit: Some(ProcessExit::code(0)), forced: false });
    }

    #[tokio::test]
    async fn test_stop_without_pid_kills_through_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            if kill_rx.recv().await.is_some() {
                exit_tx.send_replace(Some(ProcessExit { code: None, signal: Some(libc::SIGKILL) }));
            }
        });
        let log_paths = LogPaths::for_service(&dir.path().join("logs"), "svc");
        let mut process = RunningProcess::new("svc", None, log_paths, exit_rx, kill_tx, None);

        // Reaching the assertions at all means no signal went to our own group.
        let outcome = OsProcessRunner::new()
            .stop(&mut process, StopSignal::Terminate, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit.and_then(|e| e.signal), Some(libc::SIGKILL));
        assert!(!process.is_alive());
    }
}
