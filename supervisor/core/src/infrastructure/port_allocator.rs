// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Port Allocator
//
// Assigns concrete loopback ports to services:
// - fixed(n): n itself, if bindable and not yet handed out
// - range(lo, hi): first bindable, unused port scanning upwards
// - dynamic: an OS ephemeral port (bind to 0, read back)
//
// "Bindable" is a bind-then-close probe on 127.0.0.1. The port is free when
// the probe closes but nothing reserves it afterwards, so the supervisor
// launches the service right after allocating.
//
// Every port handed out stays in the session ledger until released, even if
// the owning service has exited.

use crate::domain::manifest::{PortPolicy, PortSpec};
use crate::domain::ports::{AllocatedPorts, PortError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::{debug, info};

/// Attempts to get a dynamic port that is not already in the ledger.
const DYNAMIC_ATTEMPTS: usize = 32;

#[derive(Debug, Default)]
pub struct PortAllocator {
    ledger: Mutex<Ledger>,
}

#[derive(Debug, Default)]
struct Ledger {
    used: BTreeSet<u16>,
    by_service: BTreeMap<String, Vec<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate every declared port of one service, in declaration order.
    ///
    /// On failure nothing allocated by this call is kept.
    pub fn allocate(&self, service_id: &str, specs: &[PortSpec]) -> Result<AllocatedPorts, PortError> {
        let mut ledger = self.ledger.lock();
        let mut allocated = AllocatedPorts::new();
        let mut taken: Vec<u16> = Vec::with_capacity(specs.len());

        for spec in specs {
            let result = match spec.policy {
                PortPolicy::Fixed(port) => allocate_fixed(&ledger.used, port),
                PortPolicy::Range { lo, hi } => allocate_range(&ledger.used, lo, hi),
                PortPolicy::Dynamic => allocate_dynamic(&ledger.used),
            };
            match result {
                Ok(port) => {
                    debug!(service = %service_id, port_name = %spec.name, port, "Allocated port");
                    ledger.used.insert(port);
                    taken.push(port);
                    allocated.push(spec.name.clone(), port);
                }
                Err(reason) => {
                    for port in &taken {
                        ledger.used.remove(port);
                    }
                    return Err(PortError::unavailable(
                        service_id,
                        spec.name.clone(),
                        spec.policy.to_string(),
                        reason,
                    ));
                }
            }
        }

        if !taken.is_empty() {
            ledger
                .by_service
                .entry(service_id.to_string())
                .or_default()
                .extend(taken);
            info!(service = %service_id, ports = ?allocated, "Ports allocated");
        }
        Ok(allocated)
    }

    /// Return a service's ports to the pool.
    pub fn release(&self, service_id: &str) {
        let mut ledger = self.ledger.lock();
        if let Some(ports) = ledger.by_service.remove(service_id) {
            for port in ports {
                ledger.used.remove(&port);
            }
            debug!(service = %service_id, "Released ports");
        }
    }

    pub fn release_all(&self) {
        let mut ledger = self.ledger.lock();
        ledger.used.clear();
        ledger.by_service.clear();
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.ledger.lock().used.contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.ledger.lock().used.len()
    }
}

fn allocate_fixed(used: &BTreeSet<u16>, port: u16) -> Result<u16, String> {
    if used.contains(&port) {
        return Err("already allocated this session".to_string());
    }
    probe_bind(port).map_err(|e| e.to_string())
}

fn allocate_range(used: &BTreeSet<u16>, lo: u16, hi: u16) -> Result<u16, String> {
    for port in lo..=hi {
        if used.contains(&port) {
            continue;
        }
        if let Ok(port) = probe_bind(port) {
            return Ok(port);
        }
    }
    Err(format!("no bindable port in {}-{}", lo, hi))
}

fn allocate_dynamic(used: &BTreeSet<u16>) -> Result<u16, String> {
    for _ in 0..DYNAMIC_ATTEMPTS {
        let port = probe_bind(0).map_err(|e| e.to_string())?;
        if !used.contains(&port) {
            return Ok(port);
        }
    }
    Err("OS kept returning ports already allocated this session".to_string())
}

/// Bind `127.0.0.1:port`, read back the bound port and close the socket.
fn probe_bind(port: u16) -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
    let bound = listener.local_addr()?.port();
    drop(listener);
    Ok(bound)
}
