// src/runtime/process_table.rs
//! Process table and PID allocation
//!
//! PIDs are handed out from a cursor that moves forward and wraps at the
//! configured maximum, skipping identifiers that are still in use. A released
//! PID therefore becomes eligible again once the cursor comes back around.
//!
//! The table is generic over its entries so the bookkeeping can be exercised
//! on its own; the engine stores `Arc<WorkerScript>` values in it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Process identifier. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Wrap a raw identifier. Zero is clamped to one.
    pub fn new(raw: u32) -> Self {
        Self(raw.max(1))
    }

    /// Parse a script-supplied number into a PID
    pub fn from_number(n: f64) -> Option<Self> {
        if n.fract() == 0.0 && n >= 1.0 && n <= u32::MAX as f64 {
            Some(Self(n as u32))
        } else {
            None
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Slot<T> {
    /// Allocated but not yet populated
    Reserved,
    Live(T),
}

/// PID-indexed table of live processes
pub struct ProcessTable<T> {
    slots: HashMap<Pid, Slot<T>>,

    /// Next candidate PID
    cursor: u32,

    /// Largest PID handed out
    max_pid: u32,
}

impl<T> ProcessTable<T> {
    /// Create an empty table handing out PIDs in `1..=max_pid`
    pub fn new(max_pid: u32) -> Self {
        Self {
            slots: HashMap::new(),
            cursor: 1,
            max_pid: max_pid.max(1),
        }
    }

    /// Reserve a PID that no live process holds. Returns `None` once every
    /// identifier in the range is taken.
    pub fn allocate(&mut self) -> Option<Pid> {
        if self.slots.len() as u64 >= self.max_pid as u64 {
            return None;
        }

        loop {
            let candidate = Pid(self.cursor);
            self.cursor = if self.cursor >= self.max_pid {
                1
            } else {
                self.cursor + 1
            };

            if !self.slots.contains_key(&candidate) {
                self.slots.insert(candidate, Slot::Reserved);
                return Some(candidate);
            }
        }
    }

    /// Populate a reserved PID. Fails if the PID was not reserved.
    pub fn attach(&mut self, pid: Pid, entry: T) -> bool {
        match self.slots.get_mut(&pid) {
            Some(slot @ Slot::Reserved) => {
                *slot = Slot::Live(entry);
                true
            }
            _ => false,
        }
    }

    /// Return a PID to the free pool. Releasing a free PID is a no-op.
    pub fn release(&mut self, pid: Pid) -> Option<T> {
        match self.slots.remove(&pid) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn lookup(&self, pid: Pid) -> Option<&T> {
        match self.slots.get(&pid) {
            Some(Slot::Live(entry)) => Some(entry),
            _ => None,
        }
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.lookup(pid).is_some()
    }

    /// Iterate over live entries in no particular order
    pub fn iter(&self) -> impl Iterator<Item = (Pid, &T)> {
        self.slots.iter().filter_map(|(pid, slot)| match slot {
            Slot::Live(entry) => Some((*pid, entry)),
            Slot::Reserved => None,
        })
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
