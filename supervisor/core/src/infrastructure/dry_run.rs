// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Dry-Run Process Runner
//
// Records what would have been launched and hands back a synthetic process
// that stays "alive" until it is stopped. Port allocation, secret
// materialisation and template rendering still run for real upstream.

use crate::domain::manifest::StopSignal;
use crate::domain::process::{
    LaunchError, LaunchRequest, ProcessExit, ProcessRunner, RunningProcess, StopError, StopOutcome,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::info;

#[derive(Debug, Default, Clone)]
pub struct DryRunProcessRunner {
    launched: Arc<Mutex<Vec<LaunchRequest>>>,
}

impl DryRunProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every launch request seen so far, in order.
    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched.lock().clone()
    }
}

#[async_trait]
impl ProcessRunner for DryRunProcessRunner {
    async fn launch(&self, request: LaunchRequest) -> Result<RunningProcess, LaunchError> {
        info!(
            service = %request.service_id,
            program = ?request.program,
            args = ?request.args,
            env_keys = ?request.env.keys().collect::<Vec<_>>(),
            working_dir = ?request.working_dir,
            "Dry run: would launch service"
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            // A dropped handle counts as a stop as well.
            let _ = kill_rx.recv().await;
            exit_tx.send_replace(Some(ProcessExit::code(0)));
        });

        let process = RunningProcess::new(
            request.service_id.clone(),
            None,
            request.log_paths.clone(),
            exit_rx,
            kill_tx,
            None,
        );
        self.launched.lock().push(request);
        Ok(process)
    }

    async fn stop(
        &self,
        process: &mut RunningProcess,
        _signal: StopSignal,
        _grace: Duration,
    ) -> Result<StopOutcome, StopError> {
        process.request_kill();
        let exit = process.wait().await;
        process.close_logs();
        Ok(StopOutcome { exit, forced: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::process::LogPaths;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    #[tokio::test]
    async fn test_records_requests_and_stops_cleanly() {
        let runner = DryRunProcessRunner::new();
        let request = LaunchRequest {
            service_id: "db".to_string(),
            program: PathBuf::from("/bundle/bin/db"),
            args: vec!["--port=5432".to_string()],
            env: BTreeMap::from([("PORT".to_string(), "5432".to_string())]),
            working_dir: PathBuf::from("/bundle"),
            log_paths: LogPaths::for_service(Path::new("/app/logs"), "db"),
        };

        let mut process = runner.launch(request).await.unwrap();
        assert!(process.is_alive());
        assert_eq!(process.pid, None);

        let launched = runner.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].args, vec!["--port=5432"]);

        let outcome = runner
            .stop(&mut process, StopSignal::Terminate, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome.exit, Some(ProcessExit::code(0)));
        assert!(!process.is_alive());
    }
}
