// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Real child processes driven by shell scripts.
#![cfg(unix)]

use deskbundle_core::domain::config::SupervisorConfig;
use deskbundle_core::domain::error::ErrorKind;
use deskbundle_core::domain::host::HostPlatform;
use deskbundle_core::domain::state::ServiceState;
use deskbundle_core::infrastructure::manifest_loader::MANIFEST_FILE_NAME;
use deskbundle_core::infrastructure::ManifestLoader;
use deskbundle_core::Supervisor;
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Bundle {
    root: TempDir,
    app_data: TempDir,
}

impl Bundle {
    fn new(services: serde_json::Value) -> Self {
        let root = tempfile::tempdir().unwrap();
        let host = HostPlatform::current();
        let manifest = json!({
            "schema_version": 1,
            "app_name": "lifecycle",
            "app_version": "0.1.0",
            "platforms": [{"os": host.os, "arch": host.arch}],
            "services": services,
        });
        std::fs::write(
            root.path().join(MANIFEST_FILE_NAME),
            serde_json::to_string_pretty(&manifest).unwrap(),
        )
        .unwrap();
        std::fs::create_dir_all(root.path().join("bin")).unwrap();

        Self {
            root,
            app_data: tempfile::tempdir().unwrap(),
        }
    }

    fn script(&self, name: &str, body: &str) -> &Self {
        let path = self.root.path().join("bin").join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        self
    }

    fn supervisor(&self) -> Supervisor {
        let manifest = ManifestLoader::load(self.root.path().join(MANIFEST_FILE_NAME)).unwrap();
        Supervisor::builder(manifest, self.root.path(), self.app_data.path())
            .config(SupervisorConfig {
                handle_signals: false,
                ..SupervisorConfig::default()
            })
            .build()
    }

    fn log(&self, file: &str) -> String {
        std::fs::read_to_string(self.app_data.path().join("logs").join(file)).unwrap_or_default()
    }
}

fn alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn marker_health() -> serde_json::Value {
    json!({
        "command": ["test", "-f", "{{data_dir}}/ready"],
        "interval": "50ms",
        "timeout": "10s"
    })
}

const READY_THEN_SLEEP: &str = "touch \"$DATA_DIR/ready\"\nexec sleep 30";

#[tokio::test]
async fn test_real_services_start_and_stop_cleanly() {
    let bundle = Bundle::new(json!([
        {"id": "db", "type": "database", "binary_path": "bin/db",
         "env_template": {"DATA_DIR": "{{data_dir}}"},
         "health": marker_health(), "stop_grace": "2s"},
        {"id": "api", "type": "api", "binary_path": "bin/api",
         "dependencies": ["db"],
         "ports": [{"name": "http", "policy": "dynamic"}],
         "env_template": {"DATA_DIR": "{{data_dir}}", "HTTP_PORT": "{{port.self}}",
                          "DB_DATA": "{{app_data}}/data/db"},
         "health": marker_health(), "stop_grace": "2s"}
    ]));
    bundle
        .script("db", READY_THEN_SLEEP)
        .script(
            "api",
            "echo \"api listening on $HTTP_PORT\"\ntest -f \"$DB_DATA/ready\" || exit 9\ntouch \"$DATA_DIR/ready\"\nexec sleep 30",
        );

    let mut supervisor = bundle.supervisor();
    supervisor.start(CancellationToken::new()).await.unwrap();

    let status = supervisor.status();
    assert!(status.all_in(ServiceState::Ready));
    let pids: Vec<u32> = status.services.iter().map(|record| record.pid.unwrap()).collect();
    assert!(pids.iter().all(|pid| alive(*pid)));
    let port = status.service("api").unwrap().allocated_ports.primary().unwrap();

    let report = supervisor.shutdown().await;
    assert_eq!(report.stopped, vec!["api", "db"]);
    assert!(report.timeouts.is_empty(), "{:?}", report);
    assert!(report.errors.is_empty(), "{:?}", report);
    assert!(pids.iter().all(|pid| !alive(*pid)));

    assert_eq!(bundle.log("api.stdout.log").trim(), format!("api listening on {}", port));
    let owner = std::fs::read_to_string(bundle.app_data.path().join("run").join("supervisor.lock")).unwrap();
    assert!(owner.is_empty(), "lock still names an owner: {}", owner);
}

#[tokio::test]
async fn test_service_ignoring_sigterm_is_killed_after_grace() {
    let bundle = Bundle::new(json!([
        {"id": "stubborn", "binary_path": "bin/stubborn",
         "env_template": {"DATA_DIR": "{{data_dir}}"},
         "health": marker_health(), "stop_grace": "300ms"}
    ]));
    bundle.script(
        "stubborn",
        "trap '' TERM\ntouch \"$DATA_DIR/ready\"\nwhile true; do sleep 0.1; done",
    );

    let mut supervisor = bundle.supervisor();
    supervisor.start(CancellationToken::new()).await.unwrap();
    let pid = supervisor.status().service("stubborn").unwrap().pid.unwrap();

    let report = supervisor.shutdown().await;
    assert_eq!(report.timeouts, vec!["stubborn"]);
    assert_eq!(report.stopped, vec!["stubborn"]);
    assert!(!alive(pid));

    let record = supervisor.status().service("stubborn").cloned().unwrap();
    assert_eq!(record.state, ServiceState::Stopped);
    assert!(record.shutdown_timeout);
}

#[tokio::test]
async fn test_crashing_service_reports_stderr_tail() {
    let bundle = Bundle::new(json!([
        {"id": "broken", "binary_path": "bin/broken",
         "health": {"command": ["false"], "interval": "50ms", "timeout": "10s"}}
    ]));
    bundle.script("broken", "echo 'loading config' >&2\necho 'fatal: config missing' >&2\nexit 3");

    let mut supervisor = bundle.supervisor();
    let err = supervisor.start(CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnexpectedExit);
    assert_eq!(err.exit_code(), 2);
    assert_eq!(err.service(), Some("broken"));
    assert_eq!(err.stderr_tail(), ["loading config", "fatal: config missing"]);
}

#[tokio::test]
async fn test_missing_binary_is_launch_error() {
    let bundle = Bundle::new(json!([
        {"id": "ghost", "binary_path": "bin/ghost"}
    ]));

    let mut supervisor = bundle.supervisor();
    let err = supervisor.start(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LaunchError);
    assert_eq!(err.exit_code(), 2);
    assert!(!bundle.root.path().join("bin/ghost").exists());
}
