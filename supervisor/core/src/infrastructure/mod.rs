// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod app_data;
pub mod dry_run;
pub mod event_bus;
pub mod health_probes;
pub mod host;
pub mod log_tail;
pub mod manifest_loader;
pub mod port_allocator;
pub mod process_runner;
pub mod secret_store;
pub mod signals;

pub use app_data::{AppDataDir, SessionLock};
pub use dry_run::DryRunProcessRunner;
pub use event_bus::EventBus;
pub use health_probes::NetworkHealthProber;
pub use host::{NvidiaSmiGpuDetector, StaticGpuDetector};
pub use manifest_loader::ManifestLoader;
pub use port_allocator::PortAllocator;
pub use process_runner::OsProcessRunner;
pub use secret_store::{MapEnvReader, OsEnvReader, SecretStore};
