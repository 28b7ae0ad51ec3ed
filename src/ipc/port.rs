// src/ipc/port.rs
//! Bounded FIFO ports shared between scripts
//!
//! Ports are created on first reference and live for the rest of the
//! session. A full port evicts its oldest value on `write`; `try_write`
//! refuses instead.

use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Value scripts see when reading or peeking an empty port
pub const EMPTY_PORT_DATA: &str = "NULL PORT DATA";

/// A single port
pub struct Port {
    number: u32,
    capacity: usize,
    data: Mutex<VecDeque<Value>>,

    /// Bumped on every successful write; waiters watch for the change
    writes: watch::Sender<u64>,
}

impl Port {
    pub fn new(number: u32, capacity: usize) -> Self {
        let (writes, _) = watch::channel(0);
        Self {
            number,
            capacity: capacity.max(1),
            data: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            writes,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// Append a value, evicting and returning the oldest one if full
    pub fn write(&self, value: Value) -> Option<Value> {
        let evicted = {
            let mut data = self.data.lock();
            let evicted = if data.len() >= self.capacity {
                data.pop_front()
            } else {
                None
            };
            data.push_back(value);
            evicted
        };

        trace!(port = self.number, evicted = evicted.is_some(), "port write");
        self.notify_write();
        evicted
    }

    /// Append a value only if there is room
    pub fn try_write(&self, value: Value) -> bool {
        {
            let mut data = self.data.lock();
            if data.len() >= self.capacity {
                return false;
            }
            data.push_back(value);
        }

        self.notify_write();
        true
    }

    /// Remove and return the oldest value
    pub fn read(&self) -> Option<Value> {
        self.data.lock().pop_front()
    }

    /// Oldest value without removing it
    pub fn peek(&self) -> Option<Value> {
        self.data.lock().front().cloned()
    }

    pub fn clear(&self) {
        self.data.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Resolves on the next successful write after this call. Every pending
    /// waiter is woken by the same write.
    pub fn next_write(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut receiver = self.writes.subscribe();
        async move {
            // The sender lives as long as the port, which is never dropped
            // while a session runs
            let _ = receiver.changed().await;
        }
    }

    fn notify_write(&self) {
        self.writes.send_modify(|count| *count = count.wrapping_add(1));
    }
}

/// Registry of all ports of a session
pub struct PortRegistry {
    ports: DashMap<u32, Arc<Port>>,
    max_ports: u32,
    capacity: usize,
}

impl PortRegistry {
    pub fn new(max_ports: u32, capacity: usize) -> Self {
        Self {
            ports: DashMap::new(),
            max_ports,
            capacity,
        }
    }

    pub fn max_ports(&self) -> u32 {
        self.max_ports
    }

    /// Get a port, creating it on first reference
    pub fn port(&self, number: u32) -> Result<Arc<Port>> {
        if number == 0 || number > self.max_ports {
            return Err(EngineError::PortIndex {
                port: number.to_string(),
                max: self.max_ports,
            });
        }

        let port = self
            .ports
            .entry(number)
            .or_insert_with(|| Arc::new(Port::new(number, self.capacity)));
        Ok(Arc::clone(port.value()))
    }

    /// Validate a script-supplied port number
    pub fn port_for_value(&self, value: &Value) -> Result<Arc<Port>> {
        let invalid = || EngineError::PortIndex {
            port: value.to_string(),
            max: self.max_ports,
        };

        let n = value.as_f64().ok_or_else(invalid)?;
        if n.fract() != 0.0 || n < 1.0 || n > self.max_ports as f64 {
            return Err(invalid());
        }
        self.port(n as u32)
    }

    /// Ports referenced so far
    pub fn active_ports(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.ports.iter().map(|entry| *entry.key()).collect();
        numbers.sort_unstable();
        numbers
    }
}
