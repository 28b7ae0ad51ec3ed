// src/runtime/server.rs
//! Host servers: RAM, script files and the running-process map
//!
//! Servers are owned by the engine state. Their RAM counters and running maps
//! are only touched during process creation and termination.

use crate::runtime::process_table::Pid;
use crate::runtime::script::ScriptKey;
use std::collections::{BTreeSet, HashMap};

/// A machine in the simulated network
#[derive(Debug, Clone)]
pub struct Server {
    pub hostname: String,
    pub max_ram: f64,
    pub ram_used: f64,

    /// Script files by path
    scripts: HashMap<String, String>,

    /// PIDs running each script key
    running: HashMap<ScriptKey, BTreeSet<Pid>>,
}

impl Server {
    pub fn new(hostname: impl Into<String>, max_ram: f64) -> Self {
        Self {
            hostname: hostname.into(),
            max_ram,
            ram_used: 0.0,
            scripts: HashMap::new(),
            running: HashMap::new(),
        }
    }

    pub fn with_script(mut self, path: impl Into<String>, source: impl Into<String>) -> Self {
        self.write_script(path, source);
        self
    }

    /// Create or overwrite a script file
    pub fn write_script(&mut self, path: impl Into<String>, source: impl Into<String>) {
        self.scripts.insert(path.into(), source.into());
    }

    pub fn script_source(&self, path: &str) -> Option<&str> {
        self.scripts.get(path).map(String::as_str)
    }

    pub fn available_ram(&self) -> f64 {
        (self.max_ram - self.ram_used).max(0.0)
    }

    /// PIDs currently running `key`
    pub fn running_pids(&self, key: &ScriptKey) -> Vec<Pid> {
        self.running
            .get(key)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_running(&self, key: &ScriptKey) -> bool {
        self.running.get(key).is_some_and(|pids| !pids.is_empty())
    }

    /// Number of live processes on this server
    pub fn process_count(&self) -> usize {
        self.running.values().map(BTreeSet::len).sum()
    }

    pub(crate) fn register_process(&mut self, key: ScriptKey, pid: Pid) {
        self.running.entry(key).or_default().insert(pid);
    }

    pub(crate) fn unregister_process(&mut self, key: &ScriptKey, pid: Pid) {
        if let Some(pids) = self.running.get_mut(key) {
            pids.remove(&pid);
            if pids.is_empty() {
                self.running.remove(key);
            }
        }
    }
}
