// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod health_monitor;
pub mod supervisor;

pub use supervisor::{PostReadyFailure, SessionOutcome, ShutdownReport, Supervisor, SupervisorBuilder, SupervisorHandle};
