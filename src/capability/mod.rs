// src/capability/mod.rs
//! Capability exposure layer
//!
//! Scripts reach the runtime only through a tree of named capabilities.
//! Each capability carries a RAM cost that is charged the first time a
//! script touches it.
//!
//! - **Registry**: static tree of namespaces and function descriptors
//! - **Dispatch**: per-script resolution, metering and the call guard
//! - **Builtins**: the default capability set

pub mod builtins;
pub mod dispatch;
pub mod registry;

pub use dispatch::{CallContext, CapabilityHandle, NamespaceView, Resolved, ScriptContext};
pub use registry::{CapabilityDescriptor, CapabilityFn, CapabilityNode, CapabilityRegistry, RamCost};
