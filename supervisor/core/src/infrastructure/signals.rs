// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// OS Shutdown Signals
//
// Once tokio registers a handler for a signal it stays registered until the
// process exits, even after every listener is gone; the default action
// (terminate) never comes back. Whoever installs `ShutdownSignals` must keep
// listening for the whole session: the supervisor treats the first signal
// as a graceful shutdown request and a repeated one as an order to kill.

use std::io;

pub struct ShutdownSignals {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Name of the next interrupt/terminate signal, or `None` if signal
    /// delivery stopped.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Option<&'static str> {
        let name = tokio::select! {
            received = self.sigint.recv() => received.map(|_| "SIGINT"),
            received = self.sigterm.recv() => received.map(|_| "SIGTERM"),
        };
        if let Some(name) = name {
            tracing::info!(signal = name, "Received shutdown signal");
        }
        name
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::signal::ctrl_c().await.ok()?;
        tracing::info!(signal = "ctrl-c", "Received shutdown signal");
        Some("ctrl-c")
    }
}
