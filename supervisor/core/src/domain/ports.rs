// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Port allocation results and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ports handed to one service, in manifest declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPorts {
    entries: Vec<(String, u16)>,
}

impl AllocatedPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(name, port)| (name.into(), port)).collect(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, port: u16) {
        self.entries.push((name.into(), port));
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, port)| *port)
    }

    /// First declared port, used by unnamed `{{port.<id>}}` references.
    pub fn primary(&self) -> Option<u16> {
        self.entries.first().map(|(_, port)| *port)
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.iter().map(|(_, port)| *port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.entries.iter().map(|(name, port)| (name.as_str(), *port))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("port unavailable for service '{service}' (port={port}, requested={requested}): {reason}")]
    Unavailable {
        service: String,
        port: String,
        requested: String,
        reason: String,
    },
}

impl PortError {
    pub fn unavailable(
        service: impl Into<String>,
        port: impl Into<String>,
        requested: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            service: service.into(),
            port: port.into(),
            requested: requested.into(),
            reason: reason.into(),
        }
    }
}
