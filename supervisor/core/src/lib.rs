// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Desktop bundle runtime supervisor.
//!
//! Takes a declarative bundle manifest describing co-resident services
//! (databases, caches, APIs, UIs, sidecars), brings them up in dependency
//! order on the local machine, keeps watching them for the lifetime of the
//! session and tears them down in reverse order on shutdown.
//!
//! # Architecture
//!
//! - **domain:** manifest model, state machine, template DSL, resolver and
//!   the capability traits the supervisor is written against
//! - **application:** the [`Supervisor`](application::supervisor::Supervisor)
//!   coordinator and its per-service health monitors
//! - **infrastructure:** OS-backed implementations (ports, secrets, probes,
//!   child processes, app-data directory, signals)

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::supervisor::{Supervisor, SupervisorBuilder, SupervisorHandle};
pub use domain::error::{ErrorKind, SupervisorError};
pub use domain::manifest::Manifest;
