// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Host GPU Detection
//
// Best-effort inventory used when validating `gpu_requirements`. Detection
// never fails: a missing tool or unparseable output means "no GPU".

use crate::domain::host::{GpuDetector, GpuInfo};
use std::process::Command;
use tracing::debug;

/// Queries `nvidia-smi` for NVIDIA devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvidiaSmiGpuDetector;

impl NvidiaSmiGpuDetector {
    pub fn new() -> Self {
        Self
    }

    /// Parse `--query-gpu=name,memory.total --format=csv,noheader,nounits` output.
    pub fn parse_csv(output: &str) -> Vec<GpuInfo> {
        output
            .lines()
            .filter_map(|line| {
                let (name, memory) = line.rsplit_once(',')?;
                let vram_mb = memory.trim().parse::<u64>().ok()?;
                Some(GpuInfo {
                    vendor: "nvidia".to_string(),
                    name: name.trim().to_string(),
                    vram_mb,
                    features: vec!["cuda".to_string()],
                })
            })
            .collect()
    }
}

impl GpuDetector for NvidiaSmiGpuDetector {
    fn detect(&self) -> Vec<GpuInfo> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let gpus = Self::parse_csv(&String::from_utf8_lossy(&output.stdout));
                debug!(count = gpus.len(), "Detected NVIDIA GPUs");
                gpus
            }
            Ok(output) => {
                debug!(status = %output.status, "nvidia-smi reported no usable GPU");
                vec![]
            }
            Err(e) => {
                debug!("nvidia-smi not available: {}", e);
                vec![]
            }
        }
    }
}

/// Fixed GPU inventory, for tests and explicit overrides.
#[derive(Debug, Default, Clone)]
pub struct StaticGpuDetector {
    gpus: Vec<GpuInfo>,
}

impl StaticGpuDetector {
    pub fn new(gpus: Vec<GpuInfo>) -> Self {
        Self { gpus }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

impl GpuDetector for StaticGpuDetector {
    fn detect(&self) -> Vec<GpuInfo> {
        self.gpus.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi_csv() {
        let output = "NVIDIA GeForce RTX 3090, 24576\nTesla T4, 15360\n\ngarbage line\n";
        let gpus = NvidiaSmiGpuDetector::parse_csv(output);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 3090");
        assert_eq!(gpus[0].vram_mb, 24576);
        assert_eq!(gpus[1].vendor, "nvidia");
        assert!(gpus[1].features.contains(&"cuda".to_string()));
    }

    #[test]
    fn test_static_detector() {
        assert!(StaticGpuDetector::none().detect().is_empty());
    }
}
