// src/runtime/concurrency_guard.rs
//! Per-script call guard
//!
//! Enforces two rules on every capability call:
//! - a stopped script cannot run anything (cancellation)
//! - at most one long-running call may be in flight (concurrency violation)
//!
//! ```text
//!   Idle ──call──▶ Running ──return──▶ Idle
//!                     │
//!                     └──suspend──▶ Suspended ──resume──▶ Running
//!
//!   any state ──stop──▶ Terminated
//! ```

use crate::runtime::process_table::Pid;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

/// Observable guard state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Running,
    Suspended,
    Terminated,
}

pub struct ConcurrencyGuard {
    pid: Pid,

    stop_flag: AtomicBool,

    /// Name of the long-running call currently in flight
    running_fn: Mutex<Option<String>>,

    /// Calls whose body is currently executing
    active_calls: AtomicUsize,

    /// Fires when the script is stopped; rejects pending suspensions
    cancel: CancellationToken,
}

impl ConcurrencyGuard {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            stop_flag: AtomicBool::new(false),
            running_fn: Mutex::new(None),
            active_calls: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> GuardState {
        if self.is_stopped() {
            GuardState::Terminated
        } else if self.running_fn.lock().is_some() {
            GuardState::Suspended
        } else if self.active_calls.load(Ordering::Acquire) > 0 {
            GuardState::Running
        } else {
            GuardState::Idle
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn running_fn(&self) -> Option<String> {
        self.running_fn.lock().clone()
    }

    /// Set the stop flag and reject any pending suspension. Returns `true`
    /// only for the call that actually stopped the script.
    pub fn stop(&self) -> bool {
        if self.stop_flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Resolves once the script has been stopped
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fail with a cancellation error if the script was stopped
    pub fn ensure_alive(&self) -> Result<()> {
        if self.is_stopped() {
            Err(EngineError::Cancelled { pid: self.pid })
        } else {
            Ok(())
        }
    }

    /// Pre-call check run before every capability body.
    ///
    /// `concurrent_ok` marks the one sanctioned primitive that may run while
    /// another call is in flight.
    pub fn check(&self, path: &str, concurrent_ok: bool) -> Result<()> {
        self.ensure_alive()?;

        if concurrent_ok {
            return Ok(());
        }

        if let Some(running) = self.running_fn.lock().as_ref() {
            return Err(EngineError::ConcurrencyViolation {
                pid: self.pid,
                running: running.clone(),
                attempted: path.to_string(),
            });
        }

        Ok(())
    }

    /// Mark a call body as executing until the returned guard drops
    pub fn enter_call(&self) -> CallGuard<'_> {
        self.active_calls.fetch_add(1, Ordering::AcqRel);
        CallGuard { guard: self }
    }

    /// Suspend on `fut` as the single long-running call of this script.
    ///
    /// Resolves to a cancellation error if the script is stopped before or
    /// while waiting, even if `fut` completes in the same instant.
    pub async fn suspend<F>(&self, name: &str, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.ensure_alive()?;
        let _running = self.set_running(name)?;
        trace!(pid = %self.pid, call = name, "suspending");

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        };

        match output {
            Some(output) if !self.is_stopped() => Ok(output),
            _ => Err(EngineError::Cancelled { pid: self.pid }),
        }
    }

    /// Wait on `fut` without claiming the in-flight slot. Still cancelled
    /// when the script stops.
    pub async fn wait<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.ensure_alive()?;

        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        };

        match output {
            Some(output) if !self.is_stopped() => Ok(output),
            _ => Err(EngineError::Cancelled { pid: self.pid }),
        }
    }

    fn set_running(&self, name: &str) -> Result<RunningFnGuard<'_>> {
        let mut running = self.running_fn.lock();
        if let Some(current) = running.as_ref() {
            return Err(EngineError::ConcurrencyViolation {
                pid: self.pid,
                running: current.clone(),
                attempted: name.to_string(),
            });
        }
        *running = Some(name.to_string());
        Ok(RunningFnGuard { guard: self })
    }
}

/// Clears `running_fn` when the suspension ends or is dropped
struct RunningFnGuard<'a> {
    guard: &'a ConcurrencyGuard,
}

impl Drop for RunningFnGuard<'_> {
    fn drop(&mut self) {
        *self.guard.running_fn.lock() = None;
    }
}

pub struct CallGuard<'a> {
    guard: &'a ConcurrencyGuard,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.guard.active_calls.fetch_sub(1, Ordering::AcqRel);
    }
}
