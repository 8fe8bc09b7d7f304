// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bundle path resolution
//!
//! `--manifest`, `--bundle-root` and `--app-data` all have defaults derived
//! from each other:
//!
//! 1. manifest: `--manifest`, else `<bundle-root>/bundle.json`, else `./bundle.json`
//! 2. bundle root: `--bundle-root`, else the manifest's directory
//! 3. app data: `--app-data`, else `<platform data dir>/<app_name>`

use anyhow::{Context, Result};
use deskbundle_core::infrastructure::manifest_loader::MANIFEST_FILE_NAME;
use std::path::{Path, PathBuf};

/// Manifest file and bundle root, known before the manifest is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub manifest: PathBuf,
    pub bundle_root: PathBuf,
}

impl BundlePaths {
    pub fn resolve(manifest: Option<PathBuf>, bundle_root: Option<PathBuf>) -> Self {
        let manifest = manifest.unwrap_or_else(|| {
            bundle_root
                .as_deref()
                .unwrap_or_else(|| Path::new("."))
                .join(MANIFEST_FILE_NAME)
        });
        let bundle_root = bundle_root.unwrap_or_else(|| match manifest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        });
        Self {
            manifest,
            bundle_root,
        }
    }
}

/// App-data directory for `app_name` when `--app-data` is not given.
pub fn resolve_app_data(app_data: Option<PathBuf>, app_name: &str) -> Result<PathBuf> {
    if let Some(dir) = app_data {
        return Ok(dir);
    }
    let base = dirs_next::data_dir().context("Could not determine the platform data directory; pass --app-data")?;
    Ok(base.join(app_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_current_directory() {
        let paths = BundlePaths::resolve(None, None);
        assert_eq!(paths.manifest, PathBuf::from("./bundle.json"));
        assert_eq!(paths.bundle_root, PathBuf::from("."));
    }

    #[test]
    fn test_bundle_root_implies_manifest() {
        let paths = BundlePaths::resolve(None, Some(PathBuf::from("/opt/demo")));
        assert_eq!(paths.manifest, PathBuf::from("/opt/demo/bundle.json"));
        assert_eq!(paths.bundle_root, PathBuf::from("/opt/demo"));
    }

    #[test]
    fn test_manifest_implies_bundle_root() {
        let paths = BundlePaths::resolve(Some(PathBuf::from("/opt/demo/custom.json")), None);
        assert_eq!(paths.bundle_root, PathBuf::from("/opt/demo"));

        let bare = BundlePaths::resolve(Some(PathBuf::from("bundle.json")), None);
        assert_eq!(bare.bundle_root, PathBuf::from("."));
    }

    #[test]
    fn test_explicit_app_data_wins() {
        let dir = resolve_app_data(Some(PathBuf::from("/tmp/x")), "demo").unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/x"));
    }
}
