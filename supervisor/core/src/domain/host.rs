// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Host platform and GPU capability model.
//!
//! Manifests name platforms loosely (`x86_64` vs `amd64`, `darwin` vs
//! `macos`); everything is normalised here before comparison.

use serde::{Deserialize, Serialize};

/// Operating system and CPU architecture of the machine the supervisor runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPlatform {
    pub os: String,
    pub arch: String,
}

impl HostPlatform {
    pub fn new(os: impl AsRef<str>, arch: impl AsRef<str>) -> Self {
        Self {
            os: normalize_os(os.as_ref()),
            arch: normalize_arch(arch.as_ref()),
        }
    }

    /// Platform of the running process.
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }
}

impl std::fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

pub fn normalize_os(os: &str) -> String {
    let os = os.trim().to_ascii_lowercase();
    match os.as_str() {
        "darwin" | "macos" | "osx" => "macos".to_string(),
        "win" | "win32" | "windows" => "windows".to_string(),
        _ => os,
    }
}

pub fn normalize_arch(arch: &str) -> String {
    let arch = arch.trim().to_ascii_lowercase();
    match arch.as_str() {
        "x86_64" | "amd64" | "x64" => "amd64".to_string(),
        "aarch64" | "arm64" => "arm64".to_string(),
        "x86" | "i386" | "i686" | "386" => "386".to_string(),
        _ => arch,
    }
}

/// One GPU device as reported by a [`GpuDetector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: String,
    #[serde(default)]
    pub name: String,
    pub vram_mb: u64,
    #[serde(default)]
    pub features: Vec<String>,
}

/// Source of GPU information for the host.
///
/// Detection is best effort: a detector that cannot find any device returns
/// an empty list rather than an error.
pub trait GpuDetector: Send + Sync {
    fn detect(&self) -> Vec<GpuInfo>;
}
