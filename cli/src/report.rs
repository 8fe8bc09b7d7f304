// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Terminal output for a bundle session.

use colored::{ColoredString, Colorize};
use deskbundle_core::application::supervisor::{SessionOutcome, ShutdownReport};
use deskbundle_core::domain::events::LifecycleEvent;
use deskbundle_core::domain::state::{RuntimeSnapshot, ServiceState};
use deskbundle_core::SupervisorError;
use std::fmt::Write;

fn state_label(state: ServiceState) -> ColoredString {
    let label = state.to_string();
    match state {
        ServiceState::Ready => label.green(),
        ServiceState::Failed => label.red().bold(),
        ServiceState::Starting | ServiceState::Stopping => label.yellow(),
        ServiceState::Pending | ServiceState::Stopped => label.dimmed(),
    }
}

/// One progress line per interesting lifecycle event.
pub fn format_event(event: &LifecycleEvent) -> Option<String> {
    let line = match event {
        LifecycleEvent::StateChanged { service, to, .. } => {
            format!("  {} {} {}", "▸".cyan(), service.bold(), state_label(*to))
        }
        LifecycleEvent::HealthDegraded {
            service,
            consecutive_failures,
            reason,
        } => format!(
            "  {} {} unhealthy after {} failed probes: {}",
            "!".yellow().bold(),
            service.bold(),
            consecutive_failures,
            reason
        ),
        LifecycleEvent::HealthRecovered { service } => {
            format!("  {} {} healthy again", "✓".green(), service.bold())
        }
        LifecycleEvent::ShutdownTimeout { service, grace } => format!(
            "  {} {} did not stop within {:?}, killed",
            "!".yellow().bold(),
            service.bold(),
            grace
        ),
        _ => return None,
    };
    Some(line)
}

/// Service table printed once every service is ready.
pub fn format_status(snapshot: &RuntimeSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {} ({})",
        "✓".green().bold(),
        snapshot.app_name.bold(),
        snapshot.phase
    );
    for record in &snapshot.services {
        let ports: Vec<String> = record
            .allocated_ports
            .iter()
            .map(|(name, port)| format!("{}={}", name, port))
            .collect();
        let pid = record
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:<16} {:<10} {:<10} pid {:<8} {}",
            record.id,
            record.service_type,
            state_label(record.state),
            pid,
            ports.join(" ")
        );
    }
    out
}

/// Report for a session that never became ready.
///
/// Names the offending service, the error kind and the tail of its stderr log.
pub fn format_failure(err: &SupervisorError) -> String {
    let mut out = String::new();
    let title = if err.kind().is_manifest_error() {
        "Invalid bundle manifest"
    } else {
        "Startup failed"
    };
    let _ = writeln!(out, "{} {}", "✗".red().bold(), title.red().bold());
    if let Some(service) = err.service() {
        let _ = writeln!(out, "  service: {}", service.bold());
    }
    let _ = writeln!(out, "  error:   {}", err.kind().to_string().yellow());
    let _ = writeln!(out, "  reason:  {}", err);

    let tail = err.stderr_tail();
    if !tail.is_empty() {
        let _ = writeln!(out, "  stderr (last {} lines):", tail.len());
        for line in tail {
            let _ = writeln!(out, "    {} {}", "|".dimmed(), line);
        }
    }
    out
}

pub fn format_shutdown(report: &ShutdownReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Stopped {} service(s)", report.stopped.len());
    for service in &report.timeouts {
        let _ = writeln!(out, "  {} {} was force-killed", "!".yellow().bold(), service.bold());
    }
    for (service, error) in &report.errors {
        let _ = writeln!(out, "  {} {}: {}", "✗".red(), service.bold(), error);
    }
    out
}

/// Summary of a session that reached readiness.
pub fn format_session_end(outcome: &SessionOutcome) -> String {
    let mut out = String::new();
    if let Some(reason) = &outcome.reason {
        let _ = writeln!(out, "Shutting down ({})", reason);
    }
    for failure in &outcome.failures {
        let _ = writeln!(
            out,
            "{} {} exited while running ({})",
            "✗".red().bold(),
            failure.service.bold(),
            failure.exit
        );
    }
    out.push_str(&format_shutdown(&outcome.shutdown));
    out
}
