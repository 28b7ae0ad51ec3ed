// src/runtime/process_manager.rs
//! Script process manager
//!
//! Owns every server, the process table and the compiled-script cache behind
//! a single lock. The lock is held only for state transitions (creating or
//! tearing down a process) and never across a suspension.
//!
//! Process creation is all-or-nothing: a launch that fails for lack of RAM,
//! PIDs or because of a duplicate leaves every counter untouched.

use crate::capability::{CapabilityRegistry, ScriptContext};
use crate::ipc::PortRegistry;
use crate::runtime::process_table::{Pid, ProcessTable};
use crate::runtime::ram_accounting::{self, RamLimits};
use crate::runtime::running_script::{ProcessInfo, RunningScript};
use crate::runtime::script::{CompiledScript, ScriptArg, ScriptCompiler, ScriptKey};
use crate::runtime::server::Server;
use crate::runtime::target_ops::{FixedTimings, TargetOperations};
use crate::runtime::worker_script::WorkerScript;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Options accepted by run, exec and spawn
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub threads: u32,
    pub temporary: bool,

    /// Per-thread RAM to reserve instead of the computed cost
    pub ram_override: Option<f64>,

    /// Refuse to start if the same script key is already running
    pub prevent_duplicates: bool,

    /// Only used by spawn; falls back to the configured default
    pub spawn_delay_ms: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            temporary: false,
            ram_override: None,
            prevent_duplicates: false,
            spawn_delay_ms: None,
        }
    }
}

impl RunOptions {
    pub fn threads(threads: u32) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }
}

/// Everything needed to start one script
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub hostname: String,
    pub path: String,
    pub args: Vec<ScriptArg>,
    pub options: RunOptions,
    pub parent: Option<Pid>,
}

impl LaunchRequest {
    pub fn new(hostname: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            path: path.into(),
            args: Vec::new(),
            options: RunOptions::default(),
            parent: None,
        }
    }

    pub fn args(mut self, args: Vec<ScriptArg>) -> Self {
        self.args = args;
        self
    }

    pub fn threads(mut self, threads: u32) -> Self {
        self.options.threads = threads;
        self
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn parent(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// How a script is addressed by kill and friends
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptIdentifier {
    Pid(Pid),
    Script {
        path: String,
        hostname: String,
        args: Vec<ScriptArg>,
    },
}

impl From<Pid> for ScriptIdentifier {
    fn from(pid: Pid) -> Self {
        ScriptIdentifier::Pid(pid)
    }
}

/// Why a script stopped
#[derive(Debug, Clone, PartialEq)]
pub enum ExitReason {
    /// Entry point returned normally
    Completed,
    /// Entry point returned a non-fatal error
    Errored(String),
    /// Killed by another script or the embedder
    Killed,
    /// Replaced by a spawned successor
    Spawned,
    /// Terminated by a fatal runtime error
    Fatal(EngineError),
}

impl ExitReason {
    pub fn label(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::Errored(_) => "errored",
            ExitReason::Killed => "killed",
            ExitReason::Spawned => "spawned",
            ExitReason::Fatal(err) => err.kind(),
        }
    }
}

/// State guarded by the engine lock
struct EngineState {
    servers: HashMap<String, Server>,
    processes: ProcessTable<Arc<WorkerScript>>,

    /// Compiled entry points keyed by (hostname, path)
    compiled: HashMap<(String, String), CompiledScript>,
}

/// Compiled script plus its static per-thread RAM cost
struct Prepared {
    compiled: CompiledScript,
    ram_per_thread: f64,
}

/// Script execution engine
pub struct ScriptEngine {
    config: RuntimeConfig,
    state: Mutex<EngineState>,
    ports: PortRegistry,
    capabilities: Arc<CapabilityRegistry>,
    compiler: Arc<dyn ScriptCompiler>,
    target_ops: Arc<dyn TargetOperations>,
}

impl ScriptEngine {
    /// Create an engine with the built-in capability set. Fails if `config`
    /// does not validate.
    pub fn new(config: RuntimeConfig, compiler: Arc<dyn ScriptCompiler>) -> Result<Self> {
        config.validate()?;

        let ports = PortRegistry::new(config.max_ports, config.port_capacity);
        let state = EngineState {
            servers: HashMap::new(),
            processes: ProcessTable::new(config.max_pid),
            compiled: HashMap::new(),
        };

        Ok(Self {
            config,
            state: Mutex::new(state),
            ports,
            capabilities: Arc::new(CapabilityRegistry::builtin()),
            compiler,
            target_ops: Arc::new(FixedTimings::default()),
        })
    }

    /// Replace the capability registry. Must happen before any script runs.
    pub fn with_capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.capabilities = Arc::new(registry);
        self
    }

    pub fn with_target_operations(mut self, ops: Arc<dyn TargetOperations>) -> Self {
        self.target_ops = ops;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn target_operations(&self) -> Arc<dyn TargetOperations> {
        Arc::clone(&self.target_ops)
    }

    pub fn ram_limits(&self) -> RamLimits {
        RamLimits::from(&self.config)
    }

    // Servers -----------------------------------------------------------

    /// Add a server, replacing any idle server with the same hostname.
    /// A server with live processes cannot be replaced.
    pub fn add_server(&self, server: Server) -> Result<()> {
        let mut state = self.state.lock();
        let hostname = server.hostname.clone();

        if let Some(existing) = state.servers.get(&hostname) {
            let processes = existing.process_count();
            if processes > 0 {
                return Err(EngineError::ServerBusy { hostname, processes });
            }
        }

        state.compiled.retain(|(host, _), _| *host != hostname);
        state.servers.insert(hostname, server);
        Ok(())
    }

    pub fn has_server(&self, hostname: &str) -> bool {
        self.state.lock().servers.contains_key(hostname)
    }

    /// Create or overwrite a script file. Drops the cached compilation.
    pub fn write_script(&self, hostname: &str, path: &str, source: &str) -> Result<()> {
        let mut state = self.state.lock();
        let server = state
            .servers
            .get_mut(hostname)
            .ok_or_else(|| EngineError::ServerNotFound(hostname.to_string()))?;
        server.write_script(path, source);
        state
            .compiled
            .remove(&(hostname.to_string(), path.to_string()));
        Ok(())
    }

    /// `(max_ram, ram_used)` of a server
    pub fn server_ram(&self, hostname: &str) -> Option<(f64, f64)> {
        self.state
            .lock()
            .servers
            .get(hostname)
            .map(|server| (server.max_ram, server.ram_used))
    }

    /// Static per-thread RAM cost of a script file
    pub fn script_ram(&self, hostname: &str, path: &str) -> Result<f64> {
        let source = self.script_source(hostname, path)?;
        Ok(ram_accounting::static_cost(
            &source,
            &self.capabilities,
            self.config.base_script_cost,
        ))
    }

    // Launching ---------------------------------------------------------

    /// Start a script. Fails without side effects on any error.
    pub fn launch(self: &Arc<Self>, request: LaunchRequest) -> Result<Pid> {
        self.ensure_runtime()?;
        self.validate_options(&request.options)?;
        let prepared = self.prepare(&request)?;

        let worker = {
            let mut state = self.state.lock();
            self.create_locked(&mut state, &request, prepared.ram_per_thread)?
        };

        let pid = worker.pid();
        self.start(worker, prepared.compiled);
        Ok(pid)
    }

    /// Start a script on `hostname` on behalf of `parent`
    pub fn exec(
        self: &Arc<Self>,
        parent: &WorkerScript,
        hostname: &str,
        path: &str,
        args: Vec<ScriptArg>,
        options: RunOptions,
    ) -> Result<Pid> {
        let request = LaunchRequest {
            hostname: hostname.to_string(),
            path: path.to_string(),
            args,
            options,
            parent: Some(parent.pid()),
        };
        self.launch(request)
    }

    /// Start a script on the caller's own server
    pub fn run(
        self: &Arc<Self>,
        parent: &WorkerScript,
        path: &str,
        args: Vec<ScriptArg>,
        options: RunOptions,
    ) -> Result<Pid> {
        let hostname = parent.hostname().to_string();
        self.exec(parent, &hostname, path, args, options)
    }

    /// Kill `caller` and start `path` on its server after the spawn delay.
    ///
    /// With a zero delay the caller's teardown and the new process creation
    /// happen in one state transition, so the successor can reuse the RAM
    /// the caller held. Returns the new PID when it started immediately.
    pub fn spawn(
        self: &Arc<Self>,
        caller: &Arc<WorkerScript>,
        path: &str,
        args: Vec<ScriptArg>,
        options: RunOptions,
    ) -> Result<Option<Pid>> {
        self.ensure_runtime()?;
        self.validate_options(&options)?;

        let delay = options
            .spawn_delay_ms
            .unwrap_or(self.config.default_spawn_delay_ms);
        let request = LaunchRequest {
            hostname: caller.hostname().to_string(),
            path: path.to_string(),
            args,
            options,
            parent: Some(caller.pid()),
        };

        if delay > 0 {
            self.kill_worker(caller, ExitReason::Spawned);
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                if let Err(e) = engine.launch(request.clone()) {
                    warn!(path = %request.path, hostname = %request.hostname, "spawn failed: {}", e);
                }
            });
            return Ok(None);
        }

        let prepared = self.prepare(&request);

        if !caller.guard().stop() {
            return Err(EngineError::Cancelled { pid: caller.pid() });
        }

        let (parent, created) = {
            let mut state = self.state.lock();
            let parent = self.detach_locked(&mut state, caller);
            let created = prepared.and_then(|prepared| {
                self.create_locked(&mut state, &request, prepared.ram_per_thread)
                    .map(|worker| (worker, prepared.compiled))
            });
            (parent, created)
        };

        self.finish(caller, parent, ExitReason::Spawned);

        match created {
            Ok((worker, compiled)) => {
                let pid = worker.pid();
                self.start(worker, compiled);
                Ok(Some(pid))
            }
            Err(e) => {
                warn!(path = %request.path, hostname = %request.hostname, "spawn failed: {}", e);
                Ok(None)
            }
        }
    }

    fn ensure_runtime(&self) -> Result<()> {
        tokio::runtime::Handle::try_current()
            .map(|_| ())
            .map_err(|_| EngineError::RuntimeError("scripts must be launched from a tokio runtime".into()))
    }

    fn validate_options(&self, options: &RunOptions) -> Result<()> {
        if options.threads == 0 {
            return Err(EngineError::Validation(
                "threads must be a positive integer".into(),
            ));
        }
        if let Some(ram) = options.ram_override {
            if !ram.is_finite() || ram < self.config.base_script_cost {
                return Err(EngineError::Validation(format!(
                    "ramOverride must be at least {}GB, got {}",
                    self.config.base_script_cost, ram
                )));
            }
        }
        Ok(())
    }

    fn script_source(&self, hostname: &str, path: &str) -> Result<String> {
        let state = self.state.lock();
        let server = state
            .servers
            .get(hostname)
            .ok_or_else(|| EngineError::ServerNotFound(hostname.to_string()))?;
        server
            .script_source(path)
            .map(str::to_string)
            .ok_or_else(|| EngineError::ScriptNotFound {
                path: path.to_string(),
                hostname: hostname.to_string(),
            })
    }

    /// Compile (or fetch from cache) and compute the static cost
    fn prepare(&self, request: &LaunchRequest) -> Result<Prepared> {
        let source = self.script_source(&request.hostname, &request.path)?;
        let cache_key = (request.hostname.clone(), request.path.clone());

        let cached = self.state.lock().compiled.get(&cache_key).cloned();
        let compiled = match cached {
            Some(compiled) => compiled,
            None => {
                // Compilation runs outside the lock
                let compiled = self.compiler.compile(&request.path, &source)?;
                self.state
                    .lock()
                    .compiled
                    .insert(cache_key, compiled.clone());
                compiled
            }
        };

        let ram_per_thread = request.options.ram_override.unwrap_or_else(|| {
            ram_accounting::static_cost(&source, &self.capabilities, self.config.base_script_cost)
        });

        Ok(Prepared {
            compiled,
            ram_per_thread,
        })
    }

    /// Create the process record. Every check happens before any mutation.
    fn create_locked(
        &self,
        state: &mut EngineState,
        request: &LaunchRequest,
        ram_per_thread: f64,
    ) -> Result<Arc<WorkerScript>> {
        let EngineState {
            servers, processes, ..
        } = state;

        let server = servers
            .get_mut(&request.hostname)
            .ok_or_else(|| EngineError::ServerNotFound(request.hostname.clone()))?;

        let key = ScriptKey::new(&request.path, &request.hostname, &request.args);
        if request.options.prevent_duplicates && server.is_running(&key) {
            return Err(EngineError::DuplicateProcess {
                path: request.path.clone(),
                hostname: request.hostname.clone(),
            });
        }

        let total_ram = ram_per_thread * request.options.threads as f64;
        ram_accounting::check_available(server, total_ram, self.config.ram_tolerance)?;

        let pid = processes.allocate().ok_or(EngineError::PidExhausted)?;
        if let Err(e) = ram_accounting::reserve(server, total_ram, self.config.ram_tolerance) {
            processes.release(pid);
            return Err(e);
        }

        let script = RunningScript {
            pid,
            hostname: request.hostname.clone(),
            filename: request.path.clone(),
            args: request.args.clone(),
            threads: request.options.threads,
            ram_usage: ram_per_thread,
            online_money_made: 0.0,
            online_exp_gained: 0.0,
            offline_money_made: 0.0,
            offline_exp_gained: 0.0,
            logs: VecDeque::new(),
            max_log_lines: self.config.max_log_lines,
            parent: request.parent,
            temporary: request.options.temporary,
        };
        let worker = Arc::new(WorkerScript::new(
            script,
            self.config.base_script_cost,
            self.config.timestamp_logs,
        ));

        processes.attach(pid, Arc::clone(&worker));
        server.register_process(key, pid);

        info!(
            pid = %pid,
            hostname = %request.hostname,
            path = %request.path,
            threads = request.options.threads,
            ram = total_ram,
            "started script"
        );
        metrics::counter!("netscript_processes_started_total").increment(1);
        metrics::gauge!("netscript_live_processes").increment(1.0);

        Ok(worker)
    }

    fn start(self: &Arc<Self>, worker: Arc<WorkerScript>, compiled: CompiledScript) {
        let ctx = ScriptContext::new(Arc::clone(self), Arc::clone(&worker));
        let engine = Arc::clone(self);
        let task_worker = Arc::clone(&worker);

        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(compiled.entry.run(ctx))
                .catch_unwind()
                .await;
            let reason = match outcome {
                Ok(Ok(())) => ExitReason::Completed,
                Ok(Err(e)) if e.is_fatal() => ExitReason::Fatal(e),
                Ok(Err(e)) => {
                    task_worker.log(format!("script error: {}", e));
                    ExitReason::Errored(e.to_string())
                }
                Err(_) => {
                    error!(pid = %task_worker.pid(), "script panicked");
                    task_worker.log("script error: panicked");
                    ExitReason::Errored("panicked".to_string())
                }
            };
            engine.kill_worker(&task_worker, reason);
        });

        worker.set_task(handle);
    }

    // Termination -------------------------------------------------------

    /// Terminate a worker. Idempotent: returns `false` if it was already
    /// stopped, in which case nothing is released twice.
    pub fn kill_worker(&self, worker: &Arc<WorkerScript>, reason: ExitReason) -> bool {
        if !worker.guard().stop() {
            return false;
        }

        let parent = {
            let mut state = self.state.lock();
            self.detach_locked(&mut state, worker)
        };

        self.finish(worker, parent, reason);
        true
    }

    /// Remove a stopped worker from the tables and free its RAM. Returns the
    /// parent if it is still alive.
    fn detach_locked(
        &self,
        state: &mut EngineState,
        worker: &WorkerScript,
    ) -> Option<Arc<WorkerScript>> {
        state.processes.release(worker.pid());

        if let Some(server) = state.servers.get_mut(worker.hostname()) {
            server.unregister_process(worker.key(), worker.pid());
            ram_accounting::release(server, worker.total_ram());
        }

        worker
            .parent()
            .and_then(|pid| state.processes.lookup(pid).cloned())
    }

    /// Work done after the lock is released
    fn finish(&self, worker: &WorkerScript, parent: Option<Arc<WorkerScript>>, reason: ExitReason) {
        if self.config.transfer_earnings_to_parent {
            if let Some(parent) = parent.filter(|p| !p.is_stopped()) {
                let (money, exp) = worker.earnings();
                if money != 0.0 || exp != 0.0 {
                    parent.record_earnings(money, exp);
                    debug!(pid = %worker.pid(), parent = %parent.pid(), money, exp, "transferred earnings");
                }
            }
        }

        for (id, handler) in worker.take_exit_handlers() {
            match std::panic::catch_unwind(AssertUnwindSafe(handler)) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(pid = %worker.pid(), handler = %id, "exit handler failed: {}", e);
                    worker.log(format!("exit handler '{}' failed: {}", id, e));
                }
                Err(_) => {
                    warn!(pid = %worker.pid(), handler = %id, "exit handler panicked");
                }
            }
        }

        worker.log(format!("Script finished ({})", reason.label()));
        worker.abort_task();

        info!(
            pid = %worker.pid(),
            hostname = %worker.hostname(),
            reason = reason.label(),
            "script terminated"
        );
        metrics::counter!("netscript_processes_terminated_total", "reason" => reason.label())
            .increment(1);
        metrics::gauge!("netscript_live_processes").decrement(1.0);
    }

    /// Kill every process matching `ident`
    pub fn kill(&self, ident: &ScriptIdentifier) -> bool {
        let targets = self.matching(ident);
        targets
            .iter()
            .fold(false, |killed, worker| {
                self.kill_worker(worker, ExitReason::Killed) || killed
            })
    }

    /// Kill every process on a server, optionally sparing one
    pub fn killall(&self, hostname: &str, exclude: Option<Pid>) -> Result<bool> {
        let targets: Vec<Arc<WorkerScript>> = {
            let state = self.state.lock();
            if !state.servers.contains_key(hostname) {
                return Err(EngineError::ServerNotFound(hostname.to_string()));
            }
            state
                .processes
                .iter()
                .filter(|(pid, worker)| worker.hostname() == hostname && Some(*pid) != exclude)
                .map(|(_, worker)| Arc::clone(worker))
                .collect()
        };

        Ok(targets.iter().fold(false, |killed, worker| {
            self.kill_worker(worker, ExitReason::Killed) || killed
        }))
    }

    fn matching(&self, ident: &ScriptIdentifier) -> Vec<Arc<WorkerScript>> {
        let state = self.state.lock();
        match ident {
            ScriptIdentifier::Pid(pid) => state.processes.lookup(*pid).cloned().into_iter().collect(),
            ScriptIdentifier::Script {
                path,
                hostname,
                args,
            } => {
                let key = ScriptKey::new(path, hostname, args);
                state
                    .servers
                    .get(hostname)
                    .map(|server| {
                        server
                            .running_pids(&key)
                            .into_iter()
                            .filter_map(|pid| state.processes.lookup(pid).cloned())
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    }

    // Queries -----------------------------------------------------------

    pub fn worker(&self, pid: Pid) -> Option<Arc<WorkerScript>> {
        self.state.lock().processes.lookup(pid).cloned()
    }

    /// Context for driving a live script from outside its task
    pub fn context(self: &Arc<Self>, pid: Pid) -> Option<ScriptContext> {
        self.worker(pid)
            .map(|worker| ScriptContext::new(Arc::clone(self), worker))
    }

    pub fn running_script(&self, pid: Pid) -> Option<RunningScript> {
        self.worker(pid).map(|worker| worker.running_script())
    }

    /// First live process matching `ident`
    pub fn find(&self, ident: &ScriptIdentifier) -> Option<Arc<WorkerScript>> {
        self.matching(ident).into_iter().next()
    }

    pub fn is_running(&self, ident: &ScriptIdentifier) -> bool {
        !self.matching(ident).is_empty()
    }

    /// Processes on a server, ordered by PID
    pub fn ps(&self, hostname: &str) -> Result<Vec<ProcessInfo>> {
        let state = self.state.lock();
        if !state.servers.contains_key(hostname) {
            return Err(EngineError::ServerNotFound(hostname.to_string()));
        }

        let mut infos: Vec<ProcessInfo> = state
            .processes
            .iter()
            .filter(|(_, worker)| worker.hostname() == hostname)
            .map(|(_, worker)| worker.info())
            .collect();
        infos.sort_by_key(|info| info.pid);
        Ok(infos)
    }

    /// Non-temporary scripts of a server, the ones a save would keep
    pub fn persistent_scripts(&self, hostname: &str) -> Result<Vec<RunningScript>> {
        let state = self.state.lock();
        if !state.servers.contains_key(hostname) {
            return Err(EngineError::ServerNotFound(hostname.to_string()));
        }

        let mut scripts: Vec<RunningScript> = state
            .processes
            .iter()
            .filter(|(_, worker)| worker.hostname() == hostname)
            .map(|(_, worker)| worker.running_script())
            .filter(|script| !script.temporary)
            .collect();
        scripts.sort_by_key(|script| script.pid);
        Ok(scripts)
    }

    pub fn process_count(&self) -> usize {
        self.state.lock().processes.len()
    }

    /// Wait until a process terminates and return its final record.
    /// Returns `None` if no such process is running.
    pub async fn join(&self, pid: Pid) -> Option<RunningScript> {
        let worker = self.worker(pid)?;
        worker.guard().cancellation_token().cancelled().await;
        Some(worker.running_script())
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("config", &self.config)
            .field("processes", &self.process_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::script::NativeCompiler;
    use crate::utils::config::BASE_SCRIPT_COST;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn idle(ctx: ScriptContext) -> Result<()> {
        ctx.worker().guard().stopped().await;
        Ok(())
    }

    async fn quick(_ctx: ScriptContext) -> Result<()> {
        Ok(())
    }

    async fn failing(_ctx: ScriptContext) -> Result<()> {
        Err(EngineError::Script("boom".into()))
    }

    async fn panicking(ctx: ScriptContext) -> Result<()> {
        ctx.log("about to panic");
        panic!("script bug");
    }

    fn engine(max_ram: f64) -> Arc<ScriptEngine> {
        let compiler = NativeCompiler::new()
            .register("idle.js", idle)
            .register("quick.js", quick)
            .register("failing.js", failing)
            .register("panicking.js", panicking)
            .register("hacker.js", idle);
        let engine = Arc::new(
            ScriptEngine::new(RuntimeConfig::default(), Arc::new(compiler)).unwrap(),
        );
        engine
            .add_server(
                Server::new("home", max_ram)
                    .with_script("idle.js", "")
                    .with_script("quick.js", "")
                    .with_script("failing.js", "")
                    .with_script("panicking.js", "")
                    .with_script("hacker.js", "ns.hack(); ns.grow();"),
            )
            .unwrap();
        engine
    }

    fn ram_used(engine: &ScriptEngine) -> f64 {
        engine.server_ram("home").map(|(_, used)| used).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_reserves_ram() {
        let engine = engine(32.0);
        let pid = engine
            .launch(LaunchRequest::new("home", "idle.js").threads(3))
            .unwrap();

        assert!((ram_used(&engine) - 3.0 * BASE_SCRIPT_COST).abs() < 1e-9);
        let info = engine.ps("home").unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].pid, pid);
        assert_eq!(info[0].threads, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors() {
        let engine = engine(32.0);

        let err = engine
            .launch(LaunchRequest::new("home", "idle.js").threads(0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let low_override = RunOptions {
            ram_override: Some(1.0),
            ..RunOptions::default()
        };
        let err = engine
            .launch(LaunchRequest::new("home", "idle.js").options(low_override))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = engine
            .launch(LaunchRequest::new("home", "missing.js"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ScriptNotFound { .. }));

        let err = engine
            .launch(LaunchRequest::new("nowhere", "idle.js"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ServerNotFound(_)));

        assert_eq!(engine.process_count(), 0);
        assert_eq!(ram_used(&engine), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_failure_has_no_effect() {
        let engine = engine(32.0);
        engine.write_script("home", "other.js", "").unwrap();

        let err = engine
            .launch(LaunchRequest::new("home", "other.js"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Compile { .. }));
        assert_eq!(engine.process_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_cost_from_source() {
        let engine = engine(32.0);
        let pid = engine.launch(LaunchRequest::new("home", "hacker.js")).unwrap();
        let script = engine.running_script(pid).unwrap();
        assert!((script.ram_usage - (BASE_SCRIPT_COST + 0.1 + 0.15)).abs() < 1e-12);
        assert_eq!(engine.script_ram("home", "hacker.js").unwrap(), script.ram_usage);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_script_is_cleaned_up() {
        let engine = engine(32.0);
        let pid = engine.launch(LaunchRequest::new("home", "quick.js")).unwrap();

        let record = engine.join(pid).await.unwrap();
        assert_eq!(record.pid, pid);
        assert!(record.logs.iter().any(|line| line.contains("completed")));
        assert!(engine.worker(pid).is_none());
        assert_eq!(ram_used(&engine), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_script_is_cleaned_up() {
        let engine = engine(32.0);
        let pid = engine.launch(LaunchRequest::new("home", "failing.js")).unwrap();

        let record = engine.join(pid).await.unwrap();
        assert!(record.logs.iter().any(|line| line.contains("boom")));
        assert_eq!(engine.process_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_script_is_cleaned_up() {
        let engine = engine(32.0);
        let pid = engine.launch(LaunchRequest::new("home", "panicking.js")).unwrap();
        let worker = engine.worker(pid).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        worker.at_exit(
            "cleanup",
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let record = engine.join(pid).await.unwrap();
        tokio::task::yield_now().await;

        assert!(worker.is_stopped());
        assert!(record.logs.iter().any(|line| line.contains("panicked")));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(engine.process_count(), 0);
        assert!(engine.worker(pid).is_none());
        assert_eq!(ram_used(&engine), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_server_cannot_be_replaced() {
        let engine = engine(4.0);
        let pid = engine.launch(LaunchRequest::new("home", "idle.js")).unwrap();

        let err = engine
            .add_server(Server::new("home", 4.0).with_script("idle.js", ""))
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::ServerBusy {
                hostname: "home".into(),
                processes: 1,
            }
        );
        assert_eq!(engine.server_ram("home"), Some((4.0, BASE_SCRIPT_COST)));
        assert!(engine.is_running(&ScriptIdentifier::Pid(pid)));

        engine.kill(&pid.into());
        engine
            .add_server(Server::new("home", 8.0).with_script("idle.js", ""))
            .unwrap();
        assert_eq!(engine.server_ram("home"), Some((8.0, 0.0)));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = RuntimeConfig {
            port_capacity: 0,
            ..RuntimeConfig::default()
        };
        let err = ScriptEngine::new(config, Arc::new(NativeCompiler::new())).unwrap_err();
        assert!(matches!(err, EngineError::ConfigError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_by_key_matches_args_exactly() {
        let engine = engine(32.0);
        let with_number = engine
            .launch(LaunchRequest::new("home", "idle.js").args(vec![ScriptArg::Number(1.0)]))
            .unwrap();
        let with_string = engine
            .launch(LaunchRequest::new("home", "idle.js").args(vec!["1".into()]))
            .unwrap();

        let ident = ScriptIdentifier::Script {
            path: "idle.js".into(),
            hostname: "home".into(),
            args: vec!["1".into()],
        };
        assert!(engine.kill(&ident));
        assert!(!engine.kill(&ident));
        assert!(engine.worker(with_string).is_none());
        assert!(engine.worker(with_number).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_killall_spares_excluded() {
        let engine = engine(32.0);
        let keep = engine.launch(LaunchRequest::new("home", "idle.js")).unwrap();
        engine
            .launch(LaunchRequest::new("home", "idle.js").args(vec!["a".into()]))
            .unwrap();
        engine
            .launch(LaunchRequest::new("home", "idle.js").args(vec!["b".into()]))
            .unwrap();

        assert!(engine.killall("home", Some(keep)).unwrap());
        let remaining: Vec<Pid> = engine.ps("home").unwrap().iter().map(|i| i.pid).collect();
        assert_eq!(remaining, vec![keep]);
        assert!(!engine.killall("home", Some(keep)).unwrap());
        assert!(engine.killall("nowhere", None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_handlers_run_once_in_order() {
        let engine = engine(32.0);
        let pid = engine.launch(LaunchRequest::new("home", "idle.js")).unwrap();
        let ctx = engine.context(pid).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for id in ["a", "b", "c", "d"] {
            let order = Arc::clone(&order);
            ctx.at_exit(id, move || {
                order.lock().push(id);
                match id {
                    "b" => Err(EngineError::Script("handler error".into())),
                    "c" => panic!("handler panic"),
                    _ => Ok(()),
                }
            });
        }

        assert!(engine.kill(&pid.into()));
        assert!(!engine.kill_worker(ctx.worker(), ExitReason::Killed));
        assert_eq!(*order.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(engine.process_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earnings_transfer_to_live_parent() {
        let engine = engine(32.0);
        let parent = engine.launch(LaunchRequest::new("home", "idle.js")).unwrap();
        let child = engine
            .launch(LaunchRequest::new("home", "idle.js").args(vec!["child".into()]).parent(parent))
            .unwrap();

        engine.worker(child).unwrap().record_earnings(500.0, 2.0);
        engine.kill(&child.into());

        let record = engine.running_script(parent).unwrap();
        assert_eq!(record.online_money_made, 500.0);
        assert_eq!(record.online_exp_gained, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_scripts_skip_temporary() {
        let engine = engine(32.0);
        let kept = engine.launch(LaunchRequest::new("home", "idle.js")).unwrap();
        let temporary = RunOptions {
            temporary: true,
            ..RunOptions::default()
        };
        engine
            .launch(
                LaunchRequest::new("home", "idle.js")
                    .args(vec!["tmp".into()])
                    .options(temporary),
            )
            .unwrap();

        let saved = engine.persistent_scripts("home").unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].pid, kept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_invalidates_compiled_cache() {
        let compiled = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);
        impl ScriptCompiler for Counting {
            fn compile(&self, _path: &str, _source: &str) -> Result<CompiledScript> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(CompiledScript {
                    entry: Arc::new(quick),
                })
            }
        }

        let engine = Arc::new(
            ScriptEngine::new(
                RuntimeConfig::default(),
                Arc::new(Counting(Arc::clone(&compiled))),
            )
            .unwrap(),
        );
        engine
            .add_server(Server::new("home", 32.0).with_script("a.js", ""))
            .unwrap();

        engine.launch(LaunchRequest::new("home", "a.js")).unwrap();
        engine.launch(LaunchRequest::new("home", "a.js")).unwrap();
        assert_eq!(compiled.load(Ordering::SeqCst), 1);

        engine.write_script("home", "a.js", "ns.print()").unwrap();
        engine.launch(LaunchRequest::new("home", "a.js")).unwrap();
        assert_eq!(compiled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_launch_requires_runtime() {
        let engine = engine(32.0);
        let err = engine
            .launch(LaunchRequest::new("home", "idle.js"))
            .unwrap_err();
        assert!(matches!(err, EngineError::RuntimeError(_)));
    }
}
