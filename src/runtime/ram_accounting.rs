// src/runtime/ram_accounting.rs
//! RAM accounting for scripts and servers
//!
//! Two budgets are tracked:
//! - **Static**: computed once from the script source before launch. Every
//!   thread reserves this much RAM on the host.
//! - **Dynamic**: grows as the script touches capabilities for the first
//!   time. It may never exceed the static budget.
//!
//! Comparisons use a relative tolerance of a few ULPs so that summing costs in
//! a different order cannot trip a violation.

use crate::capability::CapabilityRegistry;
use crate::runtime::server::Server;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeSet;

/// Limits applied to dynamic RAM charging
#[derive(Debug, Clone, Copy)]
pub struct RamLimits {
    /// Relative tolerance for RAM comparisons
    pub tolerance: f64,

    /// Ceiling for the dynamic counter
    pub max_dynamic: f64,
}

impl From<&RuntimeConfig> for RamLimits {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            tolerance: config.ram_tolerance,
            max_dynamic: config.max_dynamic_ram,
        }
    }
}

/// `used` is over `allowed` by more than the rounding tolerance
pub fn exceeds(used: f64, allowed: f64, tolerance: f64) -> bool {
    used > allowed * (1.0 + tolerance)
}

/// Result of charging a capability
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChargeOutcome {
    /// Zero-cost capability, nothing recorded
    Free,
    /// Already paid for by this script
    AlreadyCharged,
    /// Newly charged; carries the new dynamic total
    Charged(f64),
}

/// Dynamic usage exceeded the static allocation
#[derive(Debug, Clone, PartialEq)]
pub struct RamOverrun {
    pub used: f64,
    pub allocated: f64,
    pub capabilities: Vec<String>,
}

/// Per-script dynamic RAM counter
#[derive(Debug, Clone)]
pub struct RamAccount {
    /// Static per-thread allocation
    allocated: f64,

    /// Dynamic usage so far
    used: f64,

    /// Capabilities already paid for, in charge order
    charged: Vec<String>,
    charged_set: BTreeSet<String>,
}

impl RamAccount {
    /// Start an account at the base script cost
    pub fn new(base_cost: f64, allocated: f64) -> Self {
        Self {
            allocated,
            used: base_cost,
            charged: Vec::new(),
            charged_set: BTreeSet::new(),
        }
    }

    pub fn allocated(&self) -> f64 {
        self.allocated
    }

    pub fn used(&self) -> f64 {
        self.used
    }

    pub fn is_charged(&self, path: &str) -> bool {
        self.charged_set.contains(path)
    }

    /// Capabilities paid for so far, in first-use order
    pub fn charged(&self) -> &[String] {
        &self.charged
    }

    /// Charge `cost` for the first use of `path`
    pub fn charge(
        &mut self,
        path: &str,
        cost: f64,
        limits: RamLimits,
    ) -> std::result::Result<ChargeOutcome, RamOverrun> {
        if cost == 0.0 {
            return Ok(ChargeOutcome::Free);
        }
        if !self.charged_set.insert(path.to_string()) {
            return Ok(ChargeOutcome::AlreadyCharged);
        }
        self.charged.push(path.to_string());
        self.used = (self.used + cost).min(limits.max_dynamic);

        if exceeds(self.used, self.allocated, limits.tolerance) {
            return Err(RamOverrun {
                used: self.used,
                allocated: self.allocated,
                capabilities: self.charged.clone(),
            });
        }

        Ok(ChargeOutcome::Charged(self.used))
    }
}

/// Reserve `bytes` of the server's free RAM
pub fn reserve(server: &mut Server, bytes: f64, tolerance: f64) -> Result<()> {
    check_available(server, bytes, tolerance)?;
    server.ram_used += bytes;
    Ok(())
}

/// Fail with [`EngineError::InsufficientRam`] unless `bytes` fit on the server
pub fn check_available(server: &Server, bytes: f64, tolerance: f64) -> Result<()> {
    let available = server.available_ram();
    if exceeds(bytes, available, tolerance) {
        return Err(EngineError::InsufficientRam {
            hostname: server.hostname.clone(),
            required: bytes,
            available,
        });
    }
    Ok(())
}

/// Return `bytes` to the server
pub fn release(server: &mut Server, bytes: f64) {
    server.ram_used = (server.ram_used - bytes).max(0.0);
}

/// Capability paths referenced as `ns.<path>` in script source
pub fn scan_references(source: &str) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    let bytes = source.as_bytes();
    let is_ident = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$';

    let mut i = 0;
    while let Some(offset) = source[i..].find("ns.") {
        let start = i + offset;
        i = start + 3;

        if start > 0 && (is_ident(bytes[start - 1]) || bytes[start - 1] == b'.') {
            continue;
        }

        let mut end = i;
        while end < bytes.len() && (is_ident(bytes[end]) || bytes[end] == b'.') {
            end += 1;
        }

        let path = source[i..end].trim_end_matches('.');
        if !path.is_empty() {
            refs.insert(path.to_string());
        }
        i = end;
    }

    refs
}

/// Static per-thread RAM cost of a script: the base cost plus every distinct
/// capability its source references.
pub fn static_cost(source: &str, registry: &CapabilityRegistry, base_cost: f64) -> f64 {
    let capabilities: BTreeSet<String> = scan_references(source)
        .iter()
        .filter_map(|reference| registry.leaf_for_reference(reference))
        .collect();

    capabilities
        .iter()
        .filter_map(|path| registry.cost(path))
        .fold(base_cost, |total, cost| total + cost)
}
