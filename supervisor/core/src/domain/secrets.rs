// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Secret values and the environment capability used to source them.
//!
//! [`SecretValue`] deliberately has no `Display` impl and a redacting `Debug`
//! impl so that a value cannot end up in a log line by accident.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Read access to environment variables used by `env(key)` secrets.
pub trait EnvReader: Send + Sync {
    /// Returns `None` for unset variables.
    fn read(&self, key: &str) -> Option<String>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

/// Materialised secrets of one service, by declared name.
#[derive(Debug, Clone, Default)]
pub struct SecretValues {
    values: BTreeMap<String, SecretValue>,
}

impl SecretValues {
    pub fn insert(&mut self, name: impl Into<String>, value: SecretValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("required secret '{secret}' of service '{service}' is missing ({origin})")]
    Missing {
        service: String,
        secret: String,
        origin: String,
    },

    #[error("failed to read secret '{secret}' of service '{service}' from {path:?}: {source}")]
    Io {
        service: String,
        secret: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
