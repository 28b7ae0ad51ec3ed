// src/ipc/mod.rs
//! Inter-process communication between scripts
//!
//! Scripts exchange values through numbered ports. Writes are delivered in
//! order and any number of scripts may wait for the next write to a port.

pub mod port;

pub use port::{Port, PortRegistry, EMPTY_PORT_DATA};
