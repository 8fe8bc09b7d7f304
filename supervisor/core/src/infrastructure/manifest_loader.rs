// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bundle Manifest Loader
//!
//! Reads `bundle.json` from disk into the domain [`Manifest`].
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Parse external JSON → Domain objects
//! - **Anti-Corruption:** unknown fields are rejected here, before anything
//!   else sees the manifest
//!
//! Loading and validation are separate steps: validation needs the host
//! platform and GPU inventory, which the supervisor supplies.

use crate::domain::host::{GpuInfo, HostPlatform};
use crate::domain::manifest::{Manifest, ManifestError};
use std::path::Path;
use tracing::debug;

/// Conventional manifest file name inside a bundle root.
pub const MANIFEST_FILE_NAME: &str = "bundle.json";

pub struct ManifestLoader;

impl ManifestLoader {
    /// Parse a manifest from a JSON string (structure only).
    pub fn parse_json(json: &str) -> Result<Manifest, ManifestError> {
        let manifest: Manifest = serde_json::from_str(json)?;
        debug!(
            app = %manifest.app_name,
            version = %manifest.app_version,
            services = manifest.services.len(),
            "Parsed bundle manifest"
        );
        Ok(manifest)
    }

    /// Load a manifest file (structure only).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Manifest, ManifestError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_json(&json)
    }

    /// Load and validate against the given host.
    pub fn load_and_validate<P: AsRef<Path>>(
        path: P,
        host: &HostPlatform,
        gpus: &[GpuInfo],
    ) -> Result<Manifest, ManifestError> {
        let manifest = Self::load(path)?;
        manifest.validate(host, gpus)?;
        Ok(manifest)
    }

    /// Serialize back to pretty JSON.
    pub fn to_json(manifest: &Manifest) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(manifest)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;

    const MINIMAL: &str = r#"{
      "schema_version": 1,
      "app_name": "demo",
      "app_version": "1.0.0",
      "platforms": [{"os":"linux","arch":"amd64"}, {"os":"darwin","arch":"arm64"}],
      "services": [{"id":"db","binary_path":"bin/db"}]
    }"#;

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = ManifestLoader::parse_json(MINIMAL).unwrap();
        assert_eq!(manifest.app_name, "demo");
        assert_eq!(manifest.ipc.host, "127.0.0.1");
        assert_eq!(manifest.app_data_layout.logs, "logs");

        let db = &manifest.services[0];
        assert_eq!(db.service_type, "");
        assert!(db.ports.is_empty());
        assert!(manifest.validate(&HostPlatform::new("macos", "aarch64"), &[]).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(&path, MINIMAL).unwrap();

        let manifest = ManifestLoader::load_and_validate(&path, &HostPlatform::new("linux", "x86_64"), &[]).unwrap();
        assert_eq!(manifest.services.len(), 1);
    }

    #[test]
    fn test_missing_file_is_parse_error() {
        let err = ManifestLoader::load("/definitely/not/here/bundle.json").unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
        assert_eq!(ErrorKind::from(&err), ErrorKind::ManifestParseError);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = ManifestLoader::parse_json("{ not json").unwrap_err();
        assert_eq!(ErrorKind::from(&err), ErrorKind::ManifestParseError);
    }

    #[test]
    fn test_unknown_top_level_key_fails_loading() {
        let json = MINIMAL.replacen("\"app_name\"", "\"telemetry\": true, \"app_name\"", 1);
        let err = ManifestLoader::parse_json(&json).unwrap_err();
        assert!(err.to_string().contains("telemetry"));
    }

    #[test]
    fn test_unsupported_host_kind() {
        let manifest = ManifestLoader::parse_json(MINIMAL).unwrap();
        let err = manifest.validate(&HostPlatform::new("windows", "amd64"), &[]).unwrap_err();
        assert_eq!(ErrorKind::from(&err), ErrorKind::UnsupportedHost);
    }

    #[test]
    fn test_json_roundtrip_preserves_services() {
        let manifest = ManifestLoader::parse_json(MINIMAL).unwrap();
        let json = ManifestLoader::to_json(&manifest).unwrap();
        let reparsed = ManifestLoader::parse_json(&json).unwrap();
        assert_eq!(reparsed.services[0].id, "db");
        assert_eq!(reparsed.services[0].stop_grace, manifest.services[0].stop_grace);
    }
}
