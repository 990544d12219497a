//! Host-side RPC port allocation
//!
//! Controllers claim a port when starting a container and surrender it when
//! they go offline or terminate. The allocator itself is stateless apart from
//! the range bounds; the in-use ledger is the set of ports currently held by
//! live controllers.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free ports in range")]
    NoPorts,
}

/// Pick the lowest port in `range` not present in `used`.
pub fn pick(range: &RangeInclusive<u16>, used: &HashSet<u16>) -> Result<u16, PortError> {
    range
        .clone()
        .find(|p| !used.contains(p))
        .ok_or(PortError::NoPorts)
}

/// Shared allocator handed to every controller at start time.
#[derive(Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    in_use: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            in_use: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim a port, avoiding every port currently held by a live controller.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut in_use = self.in_use.lock().expect("port ledger lock poisoned");
        let port = pick(&self.range, &in_use)?;
        in_use.insert(port);
        Ok(port)
    }

    /// Surrender a previously claimed port.
    pub fn release(&self, port: u16) {
        let mut in_use = self.in_use.lock().expect("port ledger lock poisoned");
        in_use.remove(&port);
    }
}
