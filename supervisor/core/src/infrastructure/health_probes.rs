// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Network Health Prober
//
// One bounded probe per call:
// - tcp: connect and close immediately
// - http: GET, status in [200, 400) or equal to the expected status
// - command: run argv, exit code 0
//
// A refused connection, bad status or non-zero exit is a `Fail`; a probe that
// cannot be carried out at all (unparseable URL, missing executable) is an
// `Error`, which the supervisor treats as fatal for a starting service.

use crate::domain::health::{HealthProber, ProbeOutcome, ProbeTarget};
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::trace;

#[derive(Clone)]
pub struct NetworkHealthProber {
    client: Client,
}

impl NetworkHealthProber {
    pub fn new() -> Self {
        // Probes target loopback; never route them through a proxy. A 3xx is
        // itself a healthy answer, so redirects are not followed.
        let client = Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    async fn probe_tcp(&self, host: &str, port: u16, timeout: Duration) -> ProbeOutcome {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                ProbeOutcome::Ok
            }
            Ok(Err(e)) => ProbeOutcome::Fail(format!("connect {}:{}: {}", host, port, e)),
            Err(_) => ProbeOutcome::Fail(format!("connect {}:{} timed out after {:?}", host, port, timeout)),
        }
    }

    async fn probe_http(&self, url: &str, expect_status: Option<u16>, timeout: Duration) -> ProbeOutcome {
        let parsed = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return ProbeOutcome::Error(format!("invalid health URL '{}': {}", url, e)),
        };

        match self.client.get(parsed).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let healthy = match expect_status {
                    Some(expected) => status == expected,
                    None => (200..400).contains(&status),
                };
                if healthy {
                    ProbeOutcome::Ok
                } else {
                    ProbeOutcome::Fail(format!("GET {} returned {}", url, status))
                }
            }
            Err(e) if e.is_timeout() => ProbeOutcome::Fail(format!("GET {} timed out after {:?}", url, timeout)),
            Err(e) => ProbeOutcome::Fail(format!("GET {}: {}", url, e)),
        }
    }

    async fn probe_command(&self, argv: &[String], working_dir: &Path, timeout: Duration) -> ProbeOutcome {
        let Some((program, args)) = argv.split_first() else {
            return ProbeOutcome::Error("health command argv is empty".to_string());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return ProbeOutcome::Error(format!("cannot run health command '{}': {}", program, e)),
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => ProbeOutcome::Ok,
            Ok(Ok(status)) => ProbeOutcome::Fail(format!("health command '{}' exited with {}", program, status)),
            Ok(Err(e)) => ProbeOutcome::Error(format!("waiting for health command '{}': {}", program, e)),
            Err(_) => {
                let _ = child.start_kill();
                ProbeOutcome::Fail(format!("health command '{}' timed out after {:?}", program, timeout))
            }
        }
    }
}

impl Default for NetworkHealthProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProber for NetworkHealthProber {
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> ProbeOutcome {
        let outcome = match target {
            ProbeTarget::Tcp { host, port } => self.probe_tcp(host, *port, timeout).await,
            ProbeTarget::Http { url, expect_status } => self.probe_http(url, *expect_status, timeout).await,
            ProbeTarget::Command { argv, working_dir } => self.probe_command(argv, working_dir, timeout).await,
        };
        trace!(target = %target, outcome = ?outcome, "Health probe");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_tcp_probe_ok_and_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = NetworkHealthProber::new();

        let target = ProbeTarget::Tcp { host: "127.0.0.1".to_string(), port };
        assert_eq!(prober.probe(&target, TIMEOUT).await, ProbeOutcome::Ok);

        drop(listener);
        let outcome = prober.probe(&target, TIMEOUT).await;
        assert!(matches!(outcome, ProbeOutcome::Fail(_)));
    }

    #[tokio::test]
    async fn test_http_probe_status_ranges() {
        let mut server = mockito::Server::new_async().await;
        let healthy = server
            .mock("GET", "/health")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let redirect = server.mock("GET", "/moved").with_status(302).create_async().await;
        let broken = server.mock("GET", "/broken").with_status(503).create_async().await;
        let prober = NetworkHealthProber::new();

        let probe = |path: &str, expect_status: Option<u16>| ProbeTarget::Http {
            url: format!("{}{}", server.url(), path),
            expect_status,
        };

        assert_eq!(prober.probe(&probe("/health", None), TIMEOUT).await, ProbeOutcome::Ok);
        assert_eq!(prober.probe(&probe("/moved", None), TIMEOUT).await, ProbeOutcome::Ok);
        assert!(matches!(prober.probe(&probe("/broken", None), TIMEOUT).await, ProbeOutcome::Fail(_)));
        assert!(matches!(prober.probe(&probe("/health", Some(204)), TIMEOUT).await, ProbeOutcome::Fail(_)));

        healthy.assert_async().await;
        redirect.assert_async().await;
        broken.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_redirect_is_not_followed() {
        let mut server = mockito::Server::new_async().await;
        let login = server
            .mock("GET", "/health")
            .with_status(302)
            .with_header("location", "/login")
            .expect(2)
            .create_async()
            .await;
        let target_page = server
            .mock("GET", "/login")
            .with_status(404)
            .expect(0)
            .create_async()
            .await;
        let prober = NetworkHealthProber::new();

        let target = ProbeTarget::Http {
            url: format!("{}/health", server.url()),
            expect_status: None,
        };
        assert_eq!(prober.probe(&target, TIMEOUT).await, ProbeOutcome::Ok);

        let expect_redirect = ProbeTarget::Http {
            url: format!("{}/health", server.url()),
            expect_status: Some(302),
        };
        assert_eq!(prober.probe(&expect_redirect, TIMEOUT).await, ProbeOutcome::Ok);

        login.assert_async().await;
        target_page.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url_is_error() {
        let prober = NetworkHealthProber::new();
        let target = ProbeTarget::Http { url: "not a url".to_string(), expect_status: None };
        assert!(matches!(prober.probe(&target, TIMEOUT).await, ProbeOutcome::Error(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_probe_exit_codes() {
        let prober = NetworkHealthProber::new();
        let dir = std::env::temp_dir();
        let run = |argv: &[&str]| ProbeTarget::Command {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            working_dir: dir.clone(),
        };

        assert_eq!(prober.probe(&run(&["sh", "-c", "exit 0"]), TIMEOUT).await, ProbeOutcome::Ok);
        assert!(matches!(prober.probe(&run(&["sh", "-c", "exit 1"]), TIMEOUT).await, ProbeOutcome::Fail(_)));
        assert!(matches!(
            prober.probe(&run(&["sleep", "5"]), Duration::from_millis(100)).await,
            ProbeOutcome::Fail(reason) if reason.contains("timed out")
        ));
        assert!(matches!(
            prober.probe(&run(&["/no/such/health-binary"]), TIMEOUT).await,
            ProbeOutcome::Error(_)
        ));
    }
}
