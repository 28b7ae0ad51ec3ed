// src/runtime/worker_script.rs
//! Live execution context of one running script
//!
//! A `WorkerScript` wraps exactly one [`RunningScript`] and owns everything
//! that only matters while the script is alive: the call guard, the dynamic
//! RAM account, the per-script capability memo and the exit handlers.

use crate::capability::CapabilityDescriptor;
use crate::runtime::concurrency_guard::{ConcurrencyGuard, GuardState};
use crate::runtime::process_table::Pid;
use crate::runtime::ram_accounting::{ChargeOutcome, RamAccount, RamLimits, RamOverrun};
use crate::runtime::running_script::{ProcessInfo, RunningScript};
use crate::runtime::script::{ScriptArg, ScriptKey};
use crate::utils::errors::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback run once when the script terminates
pub type ExitHandler = Box<dyn FnOnce() -> Result<()> + Send>;

pub struct WorkerScript {
    pid: Pid,
    hostname: String,
    key: ScriptKey,

    script: Mutex<RunningScript>,
    guard: ConcurrencyGuard,
    ram: Mutex<RamAccount>,

    /// Capabilities already resolved (and paid for) by this script
    resolved: Mutex<HashMap<String, Arc<CapabilityDescriptor>>>,

    /// Exit handlers in registration order
    exit_handlers: Mutex<Vec<(String, ExitHandler)>>,

    task: Mutex<Option<JoinHandle<()>>>,

    timestamp_logs: bool,
    started_at: Instant,
}

impl WorkerScript {
    pub fn new(script: RunningScript, base_cost: f64, timestamp_logs: bool) -> Self {
        let pid = script.pid;
        let hostname = script.hostname.clone();
        let key = script.key();
        let ram = RamAccount::new(base_cost, script.ram_usage);

        Self {
            pid,
            hostname,
            key,
            script: Mutex::new(script),
            guard: ConcurrencyGuard::new(pid),
            ram: Mutex::new(ram),
            resolved: Mutex::new(HashMap::new()),
            exit_handlers: Mutex::new(Vec::new()),
            task: Mutex::new(None),
            timestamp_logs,
            started_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn key(&self) -> &ScriptKey {
        &self.key
    }

    pub fn filename(&self) -> String {
        self.script.lock().filename.clone()
    }

    pub fn args(&self) -> Vec<ScriptArg> {
        self.script.lock().args.clone()
    }

    pub fn threads(&self) -> u32 {
        self.script.lock().threads
    }

    pub fn parent(&self) -> Option<Pid> {
        self.script.lock().parent
    }

    /// Static RAM allocation per thread
    pub fn ram_per_thread(&self) -> f64 {
        self.ram.lock().allocated()
    }

    /// RAM reserved on the host for all threads
    pub fn total_ram(&self) -> f64 {
        self.script.lock().total_ram()
    }

    pub fn dynamic_ram(&self) -> f64 {
        self.ram.lock().used()
    }

    /// Capabilities charged so far, in first-use order
    pub fn charged_capabilities(&self) -> Vec<String> {
        self.ram.lock().charged().to_vec()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Snapshot of the persistent record
    pub fn running_script(&self) -> RunningScript {
        self.script.lock().clone()
    }

    pub fn info(&self) -> ProcessInfo {
        self.script.lock().info()
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    pub fn state(&self) -> GuardState {
        self.guard.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.guard.is_stopped()
    }

    /// Append a line to the script log
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!(pid = %self.pid, hostname = %self.hostname, "{}", message);

        let line = if self.timestamp_logs {
            format!("{} {}", chrono::Local::now().format("[%H:%M:%S]"), message)
        } else {
            message.to_string()
        };
        self.script.lock().push_log(line);
    }

    pub fn logs(&self) -> Vec<String> {
        self.script.lock().logs.iter().cloned().collect()
    }

    pub fn record_earnings(&self, money: f64, exp: f64) {
        self.script.lock().record_earnings(money, exp);
    }

    /// Money and experience earned while online
    pub fn earnings(&self) -> (f64, f64) {
        let script = self.script.lock();
        (script.online_money_made, script.online_exp_gained)
    }

    pub(crate) fn charge(
        &self,
        path: &str,
        cost: f64,
        limits: RamLimits,
    ) -> std::result::Result<ChargeOutcome, RamOverrun> {
        self.ram.lock().charge(path, cost, limits)
    }

    pub(crate) fn resolved(&self, path: &str) -> Option<Arc<CapabilityDescriptor>> {
        self.resolved.lock().get(path).cloned()
    }

    pub(crate) fn remember_resolved(&self, path: &str, descriptor: Arc<CapabilityDescriptor>) {
        self.resolved.lock().insert(path.to_string(), descriptor);
    }

    /// Register a handler to run when the script exits. Re-using an id
    /// replaces the earlier handler in place.
    pub fn at_exit(&self, id: impl Into<String>, handler: ExitHandler) {
        let id = id.into();
        let mut handlers = self.exit_handlers.lock();
        match handlers.iter_mut().find(|(existing, _)| *existing == id) {
            Some(slot) => slot.1 = handler,
            None => handlers.push((id, handler)),
        }
    }

    pub(crate) fn take_exit_handlers(&self) -> Vec<(String, ExitHandler)> {
        std::mem::take(&mut *self.exit_handlers.lock())
    }

    pub(crate) fn set_task(&self, handle: JoinHandle<()>) {
        let mut task = self.task.lock();
        if self.guard.is_stopped() {
            // Killed before the task was stored
            handle.abort();
        } else {
            *task = Some(handle);
        }
    }

    /// Abort the script's task at its next yield point
    pub(crate) fn abort_task(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for WorkerScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerScript")
            .field("pid", &self.pid)
            .field("hostname", &self.hostname)
            .field("filename", &self.key.filename)
            .field("state", &self.guard.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::config::{BASE_SCRIPT_COST, MAX_DYNAMIC_RAM, RAM_TOLERANCE};
    use crate::utils::errors::EngineError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> WorkerScript {
        let script = RunningScript {
            pid: Pid::new(9),
            hostname: "home".into(),
            filename: "loop.js".into(),
            args: vec![],
            threads: 2,
            ram_usage: 1.7,
            online_money_made: 0.0,
            online_exp_gained: 0.0,
            offline_money_made: 0.0,
            offline_exp_gained: 0.0,
            logs: VecDeque::new(),
            max_log_lines: 2,
            parent: None,
            temporary: true,
        };
        WorkerScript::new(script, BASE_SCRIPT_COST, false)
    }

    #[test]
    fn test_accessors() {
        let ws = worker();
        assert_eq!(ws.pid(), Pid::new(9));
        assert_eq!(ws.threads(), 2);
        assert!((ws.total_ram() - 3.4).abs() < 1e-12);
        assert_eq!(ws.ram_per_thread(), 1.7);
        assert_eq!(ws.dynamic_ram(), BASE_SCRIPT_COST);
        assert_eq!(ws.state(), GuardState::Idle);
    }

    #[test]
    fn test_log_is_bounded() {
        let ws = worker();
        ws.log("a");
        ws.log("b");
        ws.log("c");
        assert_eq!(ws.logs(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_charge_is_memoized() {
        let ws = worker();
        let limits = RamLimits {
            tolerance: RAM_TOLERANCE,
            max_dynamic: MAX_DYNAMIC_RAM,
        };
        assert!(matches!(ws.charge("hack", 0.1, limits), Ok(ChargeOutcome::Charged(_))));
        assert_eq!(ws.charge("hack", 0.1, limits), Ok(ChargeOutcome::AlreadyCharged));
        assert_eq!(ws.charged_capabilities(), vec!["hack".to_string()]);
    }

    #[test]
    fn test_exit_handler_replacement_keeps_order() {
        let ws = worker();
        let calls = Arc::new(AtomicUsize::new(0));

        ws.at_exit("first", Box::new(|| Ok(())));
        ws.at_exit("second", Box::new(|| Err(EngineError::Script("boom".into()))));
        let counter = Arc::clone(&calls);
        ws.at_exit(
            "first",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let handlers = ws.take_exit_handlers();
        let ids: Vec<&str> = handlers.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);

        for (_, handler) in handlers {
            let _ = handler();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ws.take_exit_handlers().is_empty());
    }
}
