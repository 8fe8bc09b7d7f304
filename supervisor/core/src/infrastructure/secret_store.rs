// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Secret Store
//!
//! Materialises the secrets a service declares, just before it launches.
//!
//! | Source | Behaviour |
//! |--------|-----------|
//! | `env(key)` | read through the [`EnvReader`]; empty or unset is missing |
//! | `file(relpath)` | read `<vault>/<relpath>`, one trailing newline trimmed |
//! | `generate(kind, length)` | OS randomness, cached for the session only |
//!
//! Optional secrets that cannot be produced materialise as the empty string,
//! so templates referencing them still render.
//!
//! Values are never logged; only secret names and sources appear in traces.

use crate::domain::manifest::{GeneratedKind, SecretSource, SecretSpec};
use crate::domain::secrets::{EnvReader, SecretError, SecretValue, SecretValues};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// [`EnvReader`] over the supervisor's own process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnvReader;

impl EnvReader for OsEnvReader {
    fn read(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// [`EnvReader`] over a fixed map, for tests and embedding.
#[derive(Debug, Default, Clone)]
pub struct MapEnvReader {
    values: HashMap<String, String>,
}

impl MapEnvReader {
    pub fn new<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl EnvReader for MapEnvReader {
    fn read(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

pub struct SecretStore {
    vault_dir: PathBuf,
    env: Arc<dyn EnvReader>,
    generated: Mutex<HashMap<(String, String), SecretValue>>,
}

impl SecretStore {
    pub fn new(vault_dir: impl Into<PathBuf>, env: Arc<dyn EnvReader>) -> Self {
        Self {
            vault_dir: vault_dir.into(),
            env,
            generated: Mutex::new(HashMap::new()),
        }
    }

    /// Produce every declared secret of a service, failing on the first
    /// required secret that cannot be produced.
    pub fn materialize(&self, service_id: &str, specs: &[SecretSpec]) -> Result<SecretValues, SecretError> {
        let mut values = SecretValues::default();
        for spec in specs {
            let value = match &spec.source {
                SecretSource::Env(key) => self.from_env(service_id, spec, key)?,
                SecretSource::File(relpath) => self.from_file(service_id, spec, relpath)?,
                SecretSource::Generate { kind, length } => self.generated(service_id, &spec.name, *kind, *length),
            };
            debug!(service = %service_id, secret = %spec.name, source = %spec.source, "Materialised secret");
            values.insert(spec.name.clone(), value);
        }
        Ok(values)
    }

    fn from_env(&self, service_id: &str, spec: &SecretSpec, key: &str) -> Result<SecretValue, SecretError> {
        match self.env.read(key) {
            Some(value) if !value.is_empty() => Ok(SecretValue::new(value)),
            _ if spec.required => Err(SecretError::Missing {
                service: service_id.to_string(),
                secret: spec.name.clone(),
                origin: format!("environment variable {} is unset or empty", key),
            }),
            _ => {
                debug!(service = %service_id, secret = %spec.name, "Optional secret not set, using empty value");
                Ok(SecretValue::new(""))
            }
        }
    }

    fn from_file(&self, service_id: &str, spec: &SecretSpec, relpath: &str) -> Result<SecretValue, SecretError> {
        let path = self.vault_dir.join(relpath);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let value = trim_one_newline(&content);
                if value.is_empty() && spec.required {
                    return Err(SecretError::Missing {
                        service: service_id.to_string(),
                        secret: spec.name.clone(),
                        origin: format!("vault file {:?} is empty", path),
                    });
                }
                Ok(SecretValue::new(value))
            }
            Err(source) if spec.required => Err(SecretError::Io {
                service: service_id.to_string(),
                secret: spec.name.clone(),
                path,
                source,
            }),
            Err(e) => {
                warn!(service = %service_id, secret = %spec.name, "Optional secret file unreadable: {}", e);
                Ok(SecretValue::new(""))
            }
        }
    }

    fn generated(&self, service_id: &str, name: &str, kind: GeneratedKind, length: usize) -> SecretValue {
        self.generated
            .lock()
            .entry((service_id.to_string(), name.to_string()))
            .or_insert_with(|| SecretValue::new(generate(kind, length)))
            .clone()
    }
}

fn trim_one_newline(content: &str) -> &str {
    content
        .strip_suffix("\r\n")
        .or_else(|| content.strip_suffix('\n'))
        .unwrap_or(content)
}

/// `length` counts output characters for hex and base64; uuids are always 36.
fn generate(kind: GeneratedKind, length: usize) -> String {
    match kind {
        GeneratedKind::Hex => {
            let mut encoded = hex::encode(random_bytes(length.div_ceil(2)));
            encoded.truncate(length);
            encoded
        }
        GeneratedKind::Base64 => {
            let mut encoded = URL_SAFE_NO_PAD.encode(random_bytes(length.div_ceil(4) * 3));
            encoded.truncate(length);
            encoded
        }
        GeneratedKind::Uuid => Uuid::new_v4().to_string(),
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, source: SecretSource, required: bool) -> SecretSpec {
        SecretSpec {
            name: name.to_string(),
            source,
            required,
        }
    }

    fn store(vault: &Path, env: MapEnvReader) -> SecretStore {
        SecretStore::new(vault, Arc::new(env))
    }

    #[test]
    fn test_env_secret_present_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MapEnvReader::new([("APP_TOKEN", "abc"), ("EMPTY", "")]));

        let values = store
            .materialize("api", &[spec("TOKEN", SecretSource::Env("APP_TOKEN".into()), true)])
            .unwrap();
        assert_eq!(values.get("TOKEN").unwrap().expose(), "abc");

        let err = store
            .materialize("api", &[spec("TOKEN", SecretSource::Env("EMPTY".into()), true)])
            .unwrap_err();
        assert!(matches!(err, SecretError::Missing { ref secret, .. } if secret == "TOKEN"));

        let values = store
            .materialize("api", &[spec("OPT", SecretSource::Env("NOPE".into()), false)])
            .unwrap();
        assert!(values.get("OPT").unwrap().is_empty());
    }

    #[test]
    fn test_file_secret_trims_single_newline() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("db.txt"), "s3cret\n\n").unwrap();
        let store = store(dir.path(), MapEnvReader::default());

        let values = store
            .materialize("db", &[spec("PASSWORD", SecretSource::File("db.txt".into()), true)])
            .unwrap();
        assert_eq!(values.get("PASSWORD").unwrap().expose(), "s3cret\n");
    }

    #[test]
    fn test_missing_required_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MapEnvReader::default());

        let err = store
            .materialize("db", &[spec("PASSWORD", SecretSource::File("absent.txt".into()), true)])
            .unwrap_err();
        assert!(matches!(err, SecretError::Io { .. }));

        let values = store
            .materialize("db", &[spec("PASSWORD", SecretSource::File("absent.txt".into()), false)])
            .unwrap();
        assert!(values.get("PASSWORD").unwrap().is_empty());
    }

    #[test]
    fn test_generated_secrets_respect_kind_and_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MapEnvReader::default());
        let values = store
            .materialize(
                "api",
                &[
                    spec("HEX", SecretSource::Generate { kind: GeneratedKind::Hex, length: 31 }, true),
                    spec("B64", SecretSource::Generate { kind: GeneratedKind::Base64, length: 22 }, true),
                    spec("ID", SecretSource::Generate { kind: GeneratedKind::Uuid, length: 0 }, true),
                ],
            )
            .unwrap();

        let hex_value = values.get("HEX").unwrap().expose();
        assert_eq!(hex_value.len(), 31);
        assert!(hex_value.chars().all(|c| c.is_ascii_hexdigit()));

        let b64 = values.get("B64").unwrap().expose();
        assert_eq!(b64.len(), 22);
        assert!(b64.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));

        assert!(Uuid::parse_str(values.get("ID").unwrap().expose()).is_ok());
    }

    #[test]
    fn test_generated_secret_is_cached_per_service() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), MapEnvReader::default());
        let specs = [spec("KEY", SecretSource::Generate { kind: GeneratedKind::Hex, length: 32 }, true)];

        let first = store.materialize("api", &specs).unwrap();
        let second = store.materialize("api", &specs).unwrap();
        let other = store.materialize("worker", &specs).unwrap();

        assert_eq!(first.get("KEY"), second.get("KEY"));
        assert_ne!(first.get("KEY"), other.get("KEY"));
    }
}
