// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Bundle Manifest Domain Model
//!
//! The manifest (`bundle.json`) is the declarative contract between the
//! bundle builder and this runtime. It is immutable once loaded.
//!
//! Parsing is strict: unknown keys at the top level or inside a service are
//! rejected, so new fields always come with a `schema_version` bump.
//!
//! # Validation Order
//!
//! [`Manifest::validate`] fails fast, in this order:
//!
//! 1. `schema_version` is supported
//! 2. the host platform is listed in `platforms`
//! 3. GPU requirements (if any) are met by the host
//! 4. service ids are unique, then per-service structure (ports, secrets, paths, health)
//! 5. dependencies exist and form a DAG
//! 6. every template reference resolves to a declared port or secret
//! 7. `gpu_access` services only appear when GPU requirements are declared

use crate::domain::host::{normalize_arch, normalize_os, GpuInfo, HostPlatform};
use crate::domain::resolver::{topo_sort, DependencyGraph, ResolveError};
use crate::domain::template::{PortOwner, Template, TemplateError, TemplateRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Manifest schema versions this runtime understands.
pub const SUPPORTED_SCHEMA_VERSIONS: RangeInclusive<u32> = 1..=1;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported schema_version {found} (supported: {min}..={max})")]
    UnsupportedSchema { found: u32, min: u32, max: u32 },

    #[error("manifest validation failed: {0}")]
    Invalid(String),

    #[error("host {host} is not among the supported platforms [{supported}]")]
    UnsupportedHost { host: String, supported: String },

    #[error("GPU requirements unmet: {0}")]
    GpuRequirementsUnmet(String),

    #[error("dependency cycle between services: {}", ids.join(", "))]
    Cycle { ids: Vec<String> },

    #[error("service '{service}' template '{template}': {source}")]
    TemplateReference {
        service: String,
        template: String,
        #[source]
        source: TemplateError,
    },
}

fn invalid(message: impl Into<String>) -> ManifestError {
    ManifestError::Invalid(message.into())
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub schema_version: u32,
    pub app_name: String,
    pub app_version: String,
    pub platforms: Vec<Platform>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_requirements: Option<GpuRequirements>,

    #[serde(default)]
    pub app_data_layout: AppDataLayout,

    #[serde(default)]
    pub ipc: IpcEndpoint,

    /// Overrides the supervisor's global startup timeout.
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub startup_timeout: Option<Duration>,

    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn matches(&self, host: &HostPlatform) -> bool {
        normalize_os(&self.os) == host.os && normalize_arch(&self.arch) == host.arch
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GpuRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_vram_mb: Option<u64>,
    #[serde(default)]
    pub features: Vec<String>,
}

impl GpuRequirements {
    pub fn is_empty(&self) -> bool {
        self.vendor.is_none() && self.min_vram_mb.is_none() && self.features.is_empty()
    }

    /// `None` when at least one device satisfies every requirement.
    pub fn unmet_reason(&self, gpus: &[GpuInfo]) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        if gpus.is_empty() {
            return Some("no GPU detected on this host".to_string());
        }

        let mut reasons = Vec::new();
        for gpu in gpus {
            match self.check_device(gpu) {
                Ok(()) => return None,
                Err(reason) => reasons.push(format!("{} {}: {}", gpu.vendor, gpu.name, reason)),
            }
        }
        Some(reasons.join("; "))
    }

    fn check_device(&self, gpu: &GpuInfo) -> Result<(), String> {
        if let Some(vendor) = &self.vendor {
            if !gpu.vendor.to_ascii_lowercase().contains(&vendor.to_ascii_lowercase()) {
                return Err(format!("vendor is not {}", vendor));
            }
        }
        if let Some(min) = self.min_vram_mb {
            if gpu.vram_mb < min {
                return Err(format!("{} MB VRAM < {} MB", gpu.vram_mb, min));
            }
        }
        for feature in &self.features {
            if !gpu.features.iter().any(|f| f.eq_ignore_ascii_case(feature)) {
                return Err(format!("missing feature '{}'", feature));
            }
        }
        Ok(())
    }
}

/// Sub-paths created under the app-data directory before any service launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppDataLayout {
    #[serde(default = "default_logs_dir")]
    pub logs: String,
    #[serde(default = "default_data_dir")]
    pub data: String,
    #[serde(default = "default_secrets_dir")]
    pub secrets: String,
    #[serde(default = "default_run_dir")]
    pub run: String,
    #[serde(default)]
    pub extra: Vec<String>,
}

impl Default for AppDataLayout {
    fn default() -> Self {
        Self {
            logs: default_logs_dir(),
            data: default_data_dir(),
            secrets: default_secrets_dir(),
            run: default_run_dir(),
            extra: vec![],
        }
    }
}

impl AppDataLayout {
    pub fn sub_paths(&self) -> impl Iterator<Item = &str> {
        [self.logs.as_str(), self.data.as_str(), self.secrets.as_str(), self.run.as_str()]
            .into_iter()
            .chain(self.extra.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpcEndpoint {
    #[serde(default = "default_ipc_host")]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl Default for IpcEndpoint {
    fn default() -> Self {
        Self {
            host: default_ipc_host(),
            port: 0,
        }
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    pub id: String,

    /// Display-only tag (`database`, `cache`, `api`, ...).
    #[serde(rename = "type", default)]
    pub service_type: String,

    /// Relative to the bundle root.
    pub binary_path: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Relative to the bundle root; defaults to the bundle root itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub env_template: BTreeMap<String, String>,

    #[serde(default)]
    pub ports: Vec<PortSpec>,

    #[serde(default)]
    pub secrets: Vec<SecretSpec>,

    #[serde(default)]
    pub health: HealthSpec,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub stop_signal: StopSignal,

    #[serde(default = "default_stop_grace", with = "humantime_serde")]
    pub stop_grace: Duration,

    #[serde(default)]
    pub gpu_access: bool,
}

impl ServiceSpec {
    pub fn port(&self, name: &str) -> Option<&PortSpec> {
        self.ports.iter().find(|port| port.name == name)
    }

    pub fn secret(&self, name: &str) -> Option<&SecretSpec> {
        self.secrets.iter().find(|secret| secret.name == name)
    }

    /// Every template-bearing string of the service.
    pub fn templates(&self) -> impl Iterator<Item = &str> {
        let probe_argv: &[String] = match &self.health.check {
            HealthCheck::Command { argv } => argv,
            _ => &[],
        };
        self.env_template
            .values()
            .chain(self.args.iter())
            .chain(probe_argv.iter())
            .map(String::as_str)
    }
}

// ----------------------------------------------------------------------------
// Ports
// ----------------------------------------------------------------------------

/// `{"name": "http", "policy": "fixed", "value": 8080}`,
/// `{"name": "http", "policy": "range", "range": [18000, 18100]}` or
/// `{"name": "main", "policy": "dynamic"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPortSpec", into = "RawPortSpec")]
pub struct PortSpec {
    pub name: String,
    pub policy: PortPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    Fixed(u16),
    Range { lo: u16, hi: u16 },
    Dynamic,
}

impl std::fmt::Display for PortPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(port) => write!(f, "{}", port),
            Self::Range { lo, hi } => write!(f, "{}-{}", lo, hi),
            Self::Dynamic => f.write_str("dynamic"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RawPortPolicy {
    Fixed,
    Range,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPortSpec {
    name: String,
    policy: RawPortPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    range: Option<[u16; 2]>,
}

impl TryFrom<RawPortSpec> for PortSpec {
    type Error = String;

    fn try_from(raw: RawPortSpec) -> Result<Self, Self::Error> {
        let policy = match (raw.policy, raw.value, raw.range) {
            (RawPortPolicy::Fixed, Some(value), None) => PortPolicy::Fixed(value),
            (RawPortPolicy::Range, None, Some([lo, hi])) => PortPolicy::Range { lo, hi },
            (RawPortPolicy::Dynamic, None, None) => PortPolicy::Dynamic,
            (RawPortPolicy::Fixed, ..) => {
                return Err(format!("port '{}': policy 'fixed' requires 'value' only", raw.name))
            }
            (RawPortPolicy::Range, ..) => {
                return Err(format!("port '{}': policy 'range' requires 'range' only", raw.name))
            }
            (RawPortPolicy::Dynamic, ..) => {
                return Err(format!("port '{}': policy 'dynamic' takes no value or range", raw.name))
            }
        };
        Ok(Self { name: raw.name, policy })
    }
}

impl From<PortSpec> for RawPortSpec {
    fn from(spec: PortSpec) -> Self {
        let (policy, value, range) = match spec.policy {
            PortPolicy::Fixed(port) => (RawPortPolicy::Fixed, Some(port), None),
            PortPolicy::Range { lo, hi } => (RawPortPolicy::Range, None, Some([lo, hi])),
            PortPolicy::Dynamic => (RawPortPolicy::Dynamic, None, None),
        };
        Self {
            name: spec.name,
            policy,
            value,
            range,
        }
    }
}

// ----------------------------------------------------------------------------
// Secrets
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretSpec {
    pub name: String,
    pub source: SecretSource,
    #[serde(default = "default_true")]
    pub required: bool,
}

/// `{"env": "KEY"}`, `{"file": "relpath"}` or `{"generate": {"kind": "hex", "length": 32}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SecretSource {
    Env(String),
    File(String),
    Generate {
        kind: GeneratedKind,
        #[serde(default = "default_secret_length")]
        length: usize,
    },
}

impl std::fmt::Display for SecretSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env(key) => write!(f, "env({})", key),
            Self::File(path) => write!(f, "file({})", path),
            Self::Generate { kind, length } => write!(f, "generate({:?}, {})", kind, length),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratedKind {
    Hex,
    Base64,
    Uuid,
}

// ----------------------------------------------------------------------------
// Health
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    Tcp { port_name: String },
    Http { port_name: String, path: String, expect_status: Option<u16> },
    Command { argv: Vec<String> },
    None,
}

/// Health check plus readiness timing.
///
/// `timeout` is the readiness budget measured from launch; each individual
/// probe is bounded by `probe_timeout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHealthSpec", into = "RawHealthSpec")]
pub struct HealthSpec {
    pub check: HealthCheck,
    pub initial_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
    pub probe_timeout: Option<Duration>,
    pub consecutive_ok_to_ready: u32,
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            check: HealthCheck::None,
            initial_delay: Duration::ZERO,
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            probe_timeout: None,
            consecutive_ok_to_ready: 1,
        }
    }
}

impl HealthSpec {
    pub fn effective_probe_timeout(&self) -> Duration {
        self.probe_timeout
            .unwrap_or(DEFAULT_PROBE_TIMEOUT)
            .min(self.timeout)
    }

    pub fn port_name(&self) -> Option<&str> {
        match &self.check {
            HealthCheck::Tcp { port_name } | HealthCheck::Http { port_name, .. } => Some(port_name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpCheckSpec {
    pub port_name: String,
    #[serde(default = "default_http_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHealthSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tcp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    http: Option<HttpCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<Vec<String>>,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    initial_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    interval: Option<Duration>,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    probe_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consecutive_ok_to_ready: Option<u32>,
}

impl TryFrom<RawHealthSpec> for HealthSpec {
    type Error = String;

    fn try_from(raw: RawHealthSpec) -> Result<Self, Self::Error> {
        let check = match (raw.tcp, raw.http, raw.command) {
            (Some(port_name), None, None) => HealthCheck::Tcp { port_name },
            (None, Some(http), None) => HealthCheck::Http {
                port_name: http.port_name,
                path: http.path,
                expect_status: http.expect_status,
            },
            (None, None, Some(argv)) => HealthCheck::Command { argv },
            (None, None, None) => HealthCheck::None,
            _ => return Err("health declares more than one of tcp, http, command".to_string()),
        };
        let defaults = HealthSpec::default();
        Ok(Self {
            check,
            initial_delay: raw.initial_delay.unwrap_or(defaults.initial_delay),
            interval: raw.interval.unwrap_or(defaults.interval),
            timeout: raw.timeout.unwrap_or(defaults.timeout),
            probe_timeout: raw.probe_timeout,
            consecutive_ok_to_ready: raw.consecutive_ok_to_ready.unwrap_or(defaults.consecutive_ok_to_ready),
        })
    }
}

impl From<HealthSpec> for RawHealthSpec {
    fn from(spec: HealthSpec) -> Self {
        let (tcp, http, command) = match spec.check {
            HealthCheck::Tcp { port_name } => (Some(port_name), None, None),
            HealthCheck::Http { port_name, path, expect_status } => (
                None,
                Some(HttpCheckSpec { port_name, path, expect_status }),
                None,
            ),
            HealthCheck::Command { argv } => (None, None, Some(argv)),
            HealthCheck::None => (None, None, None),
        };
        Self {
            tcp,
            http,
            command,
            initial_delay: Some(spec.initial_delay),
            interval: Some(spec.interval),
            timeout: Some(spec.timeout),
            probe_timeout: spec.probe_timeout,
            consecutive_ok_to_ready: Some(spec.consecutive_ok_to_ready),
        }
    }
}

// ----------------------------------------------------------------------------
// Stop signal
// ----------------------------------------------------------------------------

/// Graceful stop request sent before `stop_grace` elapses and a kill follows.
///
/// On Windows every variant maps to a termination request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopSignal {
    #[default]
    #[serde(alias = "SIGTERM", alias = "TERM")]
    Terminate,
    #[serde(alias = "SIGINT", alias = "INT")]
    Interrupt,
    #[serde(alias = "SIGQUIT", alias = "QUIT")]
    Quit,
    #[serde(alias = "SIGHUP", alias = "HUP")]
    Hangup,
    #[serde(alias = "SIGKILL", alias = "KILL")]
    Kill,
}

// ============================================================================
// Validation
// ============================================================================

impl Manifest {
    pub fn service(&self, id: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|service| service.id == id)
    }

    pub fn requires_gpu(&self) -> bool {
        self.gpu_requirements.as_ref().is_some_and(|req| !req.is_empty())
    }

    /// Service ids in start order: dependencies first, ties broken by id.
    pub fn start_order(&self) -> Result<Vec<String>, ManifestError> {
        topo_sort(&self.services).map_err(resolve_to_manifest)
    }

    /// Validate against the current host; see the module docs for the order.
    pub fn validate(&self, host: &HostPlatform, gpus: &[GpuInfo]) -> Result<(), ManifestError> {
        self.check_schema_version()?;
        self.check_platform(host)?;
        self.check_gpu(gpus)?;
        self.check_services()?;
        let graph = self.check_dependencies()?;
        self.check_templates(&graph)?;
        self.check_gpu_access()?;
        Ok(())
    }

    fn check_schema_version(&self) -> Result<(), ManifestError> {
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&self.schema_version) {
            return Err(ManifestError::UnsupportedSchema {
                found: self.schema_version,
                min: *SUPPORTED_SCHEMA_VERSIONS.start(),
                max: *SUPPORTED_SCHEMA_VERSIONS.end(),
            });
        }
        Ok(())
    }

    fn check_platform(&self, host: &HostPlatform) -> Result<(), ManifestError> {
        if self.platforms.iter().any(|platform| platform.matches(host)) {
            return Ok(());
        }
        let supported = self
            .platforms
            .iter()
            .map(|p| format!("{}/{}", p.os, p.arch))
            .collect::<Vec<_>>()
            .join(", ");
        Err(ManifestError::UnsupportedHost {
            host: host.to_string(),
            supported,
        })
    }

    fn check_gpu(&self, gpus: &[GpuInfo]) -> Result<(), ManifestError> {
        match &self.gpu_requirements {
            Some(requirements) => match requirements.unmet_reason(gpus) {
                Some(reason) => Err(ManifestError::GpuRequirementsUnmet(reason)),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn check_services(&self) -> Result<(), ManifestError> {
        if self.services.is_empty() {
            return Err(invalid("manifest declares no services"));
        }

        let mut ids = BTreeSet::new();
        for service in &self.services {
            if !is_identifier(&service.id) {
                return Err(invalid(format!(
                    "service id '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                    service.id
                )));
            }
            if !ids.insert(service.id.as_str()) {
                return Err(invalid(format!("duplicate service id '{}'", service.id)));
            }
        }

        for sub_path in self.app_data_layout.sub_paths() {
            if !is_safe_relative(sub_path) {
                return Err(invalid(format!("app_data_layout path '{}' must be relative", sub_path)));
            }
        }

        for service in &self.services {
            check_service(service)?;
        }
        Ok(())
    }

    fn check_dependencies(&self) -> Result<DependencyGraph, ManifestError> {
        let graph = DependencyGraph::from_services(&self.services).map_err(resolve_to_manifest)?;
        graph.order().map_err(resolve_to_manifest)?;
        Ok(graph)
    }

    fn check_templates(&self, graph: &DependencyGraph) -> Result<(), ManifestError> {
        for service in &self.services {
            let ancestors = graph.ancestors(&service.id);
            for source in service.templates() {
                let wrap = |source_err: TemplateError| ManifestError::TemplateReference {
                    service: service.id.clone(),
                    template: source.to_string(),
                    source: source_err,
                };
                let template = Template::parse(source).map_err(wrap)?;
                for reference in template.references() {
                    self.check_reference(service, &ancestors, reference).map_err(wrap)?;
                }
            }
        }
        Ok(())
    }

    fn check_reference(
        &self,
        service: &ServiceSpec,
        ancestors: &BTreeSet<String>,
        reference: &TemplateRef,
    ) -> Result<(), TemplateError> {
        let token = reference.to_string();
        match reference {
            TemplateRef::Port { owner, name } => {
                let owner_spec = match owner {
                    PortOwner::SelfService => service,
                    PortOwner::Service(id) if id == &service.id => service,
                    PortOwner::Service(id) => {
                        if !ancestors.contains(id) {
                            return Err(TemplateError::NotADependency {
                                token,
                                service: id.clone(),
                            });
                        }
                        self.service(id).ok_or_else(|| TemplateError::NotADependency {
                            token: token.clone(),
                            service: id.clone(),
                        })?
                    }
                };
                let declared = match name {
                    Some(name) => owner_spec.port(name).is_some(),
                    None => !owner_spec.ports.is_empty(),
                };
                if !declared {
                    return Err(TemplateError::Undeclared { token, what: "port" });
                }
                Ok(())
            }
            TemplateRef::Secret(name) => {
                if service.secret(name).is_none() {
                    return Err(TemplateError::Undeclared { token, what: "secret" });
                }
                Ok(())
            }
            TemplateRef::DataDir | TemplateRef::BundleRoot | TemplateRef::AppData => Ok(()),
        }
    }

    fn check_gpu_access(&self) -> Result<(), ManifestError> {
        if self.requires_gpu() {
            return Ok(());
        }
        match self.services.iter().find(|service| service.gpu_access) {
            Some(service) => Err(invalid(format!(
                "service '{}' requests gpu_access but the manifest declares no gpu_requirements",
                service.id
            ))),
            None => Ok(()),
        }
    }
}

fn check_service(service: &ServiceSpec) -> Result<(), ManifestError> {
    let id = &service.id;

    if !is_safe_relative(&service.binary_path) {
        return Err(invalid(format!("service '{}': binary_path must be a relative path inside the bundle", id)));
    }
    if let Some(dir) = &service.working_dir {
        if !is_safe_relative(dir) {
            return Err(invalid(format!("service '{}': working_dir must be a relative path inside the bundle", id)));
        }
    }

    let mut port_names = BTreeSet::new();
    for port in &service.ports {
        if !is_identifier(&port.name) {
            return Err(invalid(format!("service '{}': invalid port name '{}'", id, port.name)));
        }
        if !port_names.insert(port.name.as_str()) {
            return Err(invalid(format!("service '{}': duplicate port name '{}'", id, port.name)));
        }
        match port.policy {
            PortPolicy::Fixed(0) => {
                return Err(invalid(format!("service '{}': fixed port '{}' cannot be 0", id, port.name)))
            }
            PortPolicy::Range { lo, hi } if lo == 0 || lo > hi => {
                return Err(invalid(format!("service '{}': port '{}' has an empty range {}-{}", id, port.name, lo, hi)))
            }
            _ => {}
        }
    }

    let mut secret_names = BTreeSet::new();
    for secret in &service.secrets {
        if secret.name.is_empty() {
            return Err(invalid(format!("service '{}': secret name cannot be empty", id)));
        }
        if !secret_names.insert(secret.name.as_str()) {
            return Err(invalid(format!("service '{}': duplicate secret '{}'", id, secret.name)));
        }
        match &secret.source {
            SecretSource::File(path) if !is_safe_relative(path) => {
                return Err(invalid(format!("service '{}': secret '{}' file must be relative to the vault", id, secret.name)))
            }
            SecretSource::Generate { kind, length } if *kind != GeneratedKind::Uuid && *length == 0 => {
                return Err(invalid(format!("service '{}': generated secret '{}' needs a length", id, secret.name)))
            }
            _ => {}
        }
    }

    let health = &service.health;
    if let Some(port_name) = health.port_name() {
        if service.port(port_name).is_none() {
            return Err(invalid(format!("service '{}': health check references undeclared port '{}'", id, port_name)));
        }
    }
    if let HealthCheck::Command { argv } = &health.check {
        if argv.is_empty() {
            return Err(invalid(format!("service '{}': health command argv is empty", id)));
        }
    }
    if health.interval.is_zero() {
        return Err(invalid(format!("service '{}': health interval must be positive", id)));
    }
    if health.consecutive_ok_to_ready == 0 {
        return Err(invalid(format!("service '{}': consecutive_ok_to_ready must be at least 1", id)));
    }

    Ok(())
}

fn resolve_to_manifest(err: ResolveError) -> ManifestError {
    match err {
        ResolveError::Cycle { ids } => ManifestError::Cycle { ids },
        other => ManifestError::Invalid(other.to_string()),
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Relative, non-empty and without `..` components.
pub fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_logs_dir() -> String {
    "logs".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_secrets_dir() -> String {
    "secrets".to_string()
}

fn default_run_dir() -> String {
    "run".to_string()
}

fn default_ipc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_stop_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_secret_length() -> usize {
    32
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(30)
}

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
