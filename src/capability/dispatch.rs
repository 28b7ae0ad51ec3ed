// src/capability/dispatch.rs
//! Metered access from a running script to the capability tree
//!
//! The first time a script resolves a function path, its RAM cost is charged
//! to the script's dynamic counter and the descriptor is memoized on the
//! worker. Every later resolution of the same path is a cache hit and costs
//! nothing. Every invocation goes through the concurrency guard first.

use crate::capability::registry::{CapabilityDescriptor, CapabilityNode};
use crate::runtime::process_manager::{ExitReason, ScriptEngine};
use crate::runtime::process_table::Pid;
use crate::runtime::ram_accounting::ChargeOutcome;
use crate::runtime::script::ScriptArg;
use crate::runtime::worker_script::WorkerScript;
use crate::utils::errors::{EngineError, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Handle a script uses to reach the runtime
#[derive(Clone)]
pub struct ScriptContext {
    engine: Arc<ScriptEngine>,
    worker: Arc<WorkerScript>,
}

impl ScriptContext {
    pub(crate) fn new(engine: Arc<ScriptEngine>, worker: Arc<WorkerScript>) -> Self {
        Self { engine, worker }
    }

    pub fn pid(&self) -> Pid {
        self.worker.pid()
    }

    pub fn hostname(&self) -> &str {
        self.worker.hostname()
    }

    pub fn args(&self) -> Vec<ScriptArg> {
        self.worker.args()
    }

    pub fn threads(&self) -> u32 {
        self.worker.threads()
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn worker(&self) -> &Arc<WorkerScript> {
        &self.worker
    }

    /// Write a line to the script log
    pub fn log(&self, message: impl AsRef<str>) {
        self.worker.log(message);
    }

    /// Register a handler run once when this script exits
    pub fn at_exit<F>(&self, id: impl Into<String>, handler: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.worker.at_exit(id, Box::new(handler));
    }

    /// Resolve a dotted path against the capability tree.
    ///
    /// Resolving a function for the first time charges its RAM cost. If that
    /// pushes dynamic usage over the static allocation the script is killed
    /// before this returns.
    pub fn resolve(&self, path: &str) -> Result<Resolved> {
        self.worker.guard().ensure_alive()?;

        if let Some(descriptor) = self.worker.resolved(path) {
            return Ok(Resolved::Function(self.bind(path, descriptor)));
        }

        match self.engine.capabilities().node(path) {
            None => Err(EngineError::UnknownCapability(path.to_string())),
            Some(CapabilityNode::Namespace(children)) => Ok(Resolved::Namespace(NamespaceView {
                path: path.to_string(),
                children: children.iter().cloned().collect(),
            })),
            Some(CapabilityNode::Function(descriptor)) => {
                let descriptor = Arc::clone(descriptor);
                self.charge(path, &descriptor)?;
                self.worker.remember_resolved(path, Arc::clone(&descriptor));
                Ok(Resolved::Function(self.bind(path, descriptor)))
            }
        }
    }

    /// Resolve and invoke a function in one step
    pub async fn call(&self, path: &str, args: Vec<Value>) -> Result<Value> {
        match self.resolve(path)? {
            Resolved::Function(handle) => handle.call(args).await,
            Resolved::Namespace(_) => Err(EngineError::Validation(format!(
                "'{}' is a namespace, not a function",
                path
            ))),
        }
    }

    /// Scripts may not replace capabilities. Always kills the script.
    pub fn assign(&self, path: &str, _value: Value) -> Result<()> {
        Err(self.read_only_violation("assign", path))
    }

    /// Scripts may not remove capabilities. Always kills the script.
    pub fn delete(&self, path: &str) -> Result<()> {
        Err(self.read_only_violation("delete", path))
    }

    fn charge(&self, path: &str, descriptor: &CapabilityDescriptor) -> Result<()> {
        let cost = descriptor.cost.evaluate();
        match self.worker.charge(path, cost, self.engine.ram_limits()) {
            Ok(ChargeOutcome::Charged(total)) => {
                trace!(pid = %self.pid(), path, cost, total, "charged capability");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(overrun) => {
                let err = EngineError::RamViolation {
                    pid: self.pid(),
                    used: overrun.used,
                    allocated: overrun.allocated,
                    capabilities: overrun.capabilities,
                };
                error!(pid = %self.pid(), hostname = %self.hostname(), path, "{}", err);
                self.worker.log(err.to_string());
                metrics::counter!("netscript_ram_violations_total").increment(1);
                self.engine.kill_worker(&self.worker, ExitReason::Fatal(err.clone()));
                Err(err)
            }
        }
    }

    /// Log, count and kill for a concurrency violation
    fn concurrency_violation(&self, err: &EngineError) {
        error!(pid = %self.pid(), hostname = %self.hostname(), "{}", err);
        self.worker.log(err.to_string());
        metrics::counter!("netscript_concurrency_violations_total").increment(1);
        self.engine
            .kill_worker(&self.worker, ExitReason::Fatal(err.clone()));
    }

    fn read_only_violation(&self, action: &'static str, path: &str) -> EngineError {
        let err = EngineError::ReadOnlySurface {
            action,
            path: path.to_string(),
        };
        warn!(pid = %self.pid(), "{}", err);
        self.worker.log(err.to_string());
        self.engine.kill_worker(&self.worker, ExitReason::Fatal(err.clone()));
        err
    }

    fn bind(&self, path: &str, descriptor: Arc<CapabilityDescriptor>) -> CapabilityHandle {
        CapabilityHandle {
            script: self.clone(),
            path: Arc::from(path),
            descriptor,
        }
    }
}

impl std::fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptContext")
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving a path
#[derive(Debug)]
pub enum Resolved {
    Function(CapabilityHandle),
    Namespace(NamespaceView),
}

/// Read-only listing of a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceView {
    pub path: String,
    pub children: Vec<String>,
}

impl NamespaceView {
    /// Full path of a direct child
    pub fn child(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.path, name)
        }
    }
}

/// A function bound to one script. Cloning is cheap.
#[derive(Clone)]
pub struct CapabilityHandle {
    script: ScriptContext,
    path: Arc<str>,
    descriptor: Arc<CapabilityDescriptor>,
}

impl CapabilityHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Run the pre-call guard, then the capability body
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let guard = self.script.worker.guard();

        if let Err(err) = guard.check(&self.path, self.descriptor.concurrent_ok) {
            if matches!(err, EngineError::ConcurrencyViolation { .. }) {
                self.script.concurrency_violation(&err);
            }
            return Err(err);
        }

        let _call = guard.enter_call();
        let cx = CallContext {
            script: self.script.clone(),
            path: Arc::clone(&self.path),
            descriptor: Arc::clone(&self.descriptor),
        };
        (self.descriptor.handler)(cx, args).await
    }
}

impl std::fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("path", &self.path)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// What a capability body sees of its caller
#[derive(Clone)]
pub struct CallContext {
    script: ScriptContext,
    path: Arc<str>,
    descriptor: Arc<CapabilityDescriptor>,
}

impl CallContext {
    pub fn script(&self) -> &ScriptContext {
        &self.script
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.script.engine
    }

    pub fn worker(&self) -> &Arc<WorkerScript> {
        &self.script.worker
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pid(&self) -> Pid {
        self.script.pid()
    }

    pub fn hostname(&self) -> &str {
        self.script.hostname()
    }

    pub fn threads(&self) -> u32 {
        self.script.threads()
    }

    pub fn log(&self, message: impl AsRef<str>) {
        self.script.worker.log(format!("{}: {}", self.path, message.as_ref()));
    }

    /// Suspend as the script's single long-running call. Only capabilities
    /// registered as suspending may do this. Finding another call already
    /// in flight kills the script.
    pub async fn suspend<F: Future>(&self, fut: F) -> Result<F::Output> {
        if !self.descriptor.suspends {
            return Err(EngineError::RuntimeError(format!(
                "capability '{}' is not registered as suspending",
                self.path
            )));
        }

        let result = self.script.worker.guard().suspend(&self.path, fut).await;
        if let Err(err @ EngineError::ConcurrencyViolation { .. }) = &result {
            self.script.concurrency_violation(err);
        }
        result
    }

    /// Wait without blocking other calls; still cancelled on kill
    pub async fn wait<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.script.worker.guard().wait(fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityDescriptor, CapabilityRegistry};
    use crate::runtime::process_manager::{LaunchRequest, RunOptions, ScriptIdentifier};
    use crate::runtime::script::NativeCompiler;
    use crate::runtime::server::Server;
    use crate::utils::config::{RuntimeConfig, BASE_SCRIPT_COST};
    use serde_json::json;
    use std::time::Duration;

    async fn idle(ctx: ScriptContext) -> Result<()> {
        ctx.worker().guard().stopped().await;
        Ok(())
    }

    fn engine_with(source: &str) -> Arc<ScriptEngine> {
        let compiler = NativeCompiler::new().register("idle.js", idle);
        let engine = Arc::new(
            ScriptEngine::new(RuntimeConfig::default(), Arc::new(compiler)).unwrap(),
        );
        engine
            .add_server(Server::new("home", 64.0).with_script("idle.js", source))
            .unwrap();
        engine
    }

    fn launch(engine: &Arc<ScriptEngine>) -> ScriptContext {
        let pid = engine
            .launch(LaunchRequest::new("home", "idle.js"))
            .unwrap();
        engine.context(pid).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_charges_once() {
        let engine = engine_with("ns.hack(); ns.grow();");
        let ctx = launch(&engine);

        for _ in 0..5 {
            assert!(matches!(ctx.resolve("hack").unwrap(), Resolved::Function(_)));
        }
        let expected = BASE_SCRIPT_COST + 0.1;
        assert!((ctx.worker().dynamic_ram() - expected).abs() < 1e-12);
        assert_eq!(ctx.worker().charged_capabilities(), vec!["hack".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_namespace_and_unknown() {
        let engine = engine_with("ns.server.maxRam()");
        let ctx = launch(&engine);

        match ctx.resolve("server").unwrap() {
            Resolved::Namespace(view) => {
                assert!(view.children.contains(&"maxRam".to_string()));
                assert_eq!(view.child("maxRam"), "server.maxRam");
            }
            other => panic!("expected namespace, got {:?}", other),
        }

        let err = ctx.resolve("doesNotExist").unwrap_err();
        assert!(matches!(err, EngineError::UnknownCapability(_)));
        assert!(!err.is_fatal());
        assert!(!ctx.worker().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreferenced_capability_is_ram_violation() {
        let engine = engine_with("ns.hack()");
        let ctx = launch(&engine);

        let err = ctx.resolve("grow").unwrap_err();
        match &err {
            EngineError::RamViolation { capabilities, .. } => {
                assert_eq!(capabilities, &vec!["grow".to_string()]);
            }
            other => panic!("expected RAM violation, got {:?}", other),
        }
        assert!(ctx.worker().is_stopped());
        assert!(engine.worker(ctx.pid()).is_none());
        assert_eq!(engine.server_ram("home"), Some((64.0, 0.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_surface_kills() {
        let engine = engine_with("");
        let ctx = launch(&engine);

        let err = ctx.assign("hack", json!(null)).unwrap_err();
        assert!(err.is_fatal());
        assert!(ctx.worker().is_stopped());

        let ctx = launch(&engine);
        assert!(matches!(
            ctx.delete("sleep"),
            Err(EngineError::ReadOnlySurface { action: "delete", .. })
        ));
        assert!(ctx.worker().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_kill_script() {
        let engine = engine_with("ns.sleep(); ns.hack();");
        let ctx = launch(&engine);

        let (slept, hacked) = tokio::join!(
            ctx.call("sleep", vec![json!(1000)]),
            ctx.call("hack", vec![json!("home")]),
        );

        assert!(matches!(hacked, Err(EngineError::ConcurrencyViolation { .. })));
        assert!(matches!(slept, Err(EngineError::Cancelled { .. })));
        assert!(ctx.worker().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_asleep_may_run_concurrently() {
        let engine = engine_with("ns.sleep(); ns.asleep();");
        let ctx = launch(&engine);

        let (a, b) = tokio::join!(
            ctx.call("sleep", vec![json!(50)]),
            ctx.call("asleep", vec![json!(20)]),
        );
        assert_eq!(a.unwrap(), json!(true));
        assert_eq!(b.unwrap(), json!(true));
        assert!(!ctx.worker().is_stopped());
    }

    fn engine_with_registry(registry: CapabilityRegistry, source: &str) -> Arc<ScriptEngine> {
        let compiler = NativeCompiler::new().register("idle.js", idle);
        let engine = Arc::new(
            ScriptEngine::new(RuntimeConfig::default(), Arc::new(compiler))
                .unwrap()
                .with_capabilities(registry),
        );
        engine
            .add_server(Server::new("home", 64.0).with_script("idle.js", source))
            .unwrap();
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_while_in_flight_kills_script() {
        let mut registry = CapabilityRegistry::builtin();
        registry
            .register(
                "custom.waitThenSleep",
                CapabilityDescriptor::new(0.0, |cx: CallContext, _args| async move {
                    cx.suspend(tokio::time::sleep(Duration::from_millis(10)))
                        .await?;
                    Ok::<_, EngineError>(json!(true))
                })
                .concurrent()
                .suspending(),
            )
            .unwrap();
        let engine = engine_with_registry(registry, "ns.sleep(); ns.custom.waitThenSleep();");
        let ctx = launch(&engine);

        let (slept, second) = tokio::join!(
            ctx.call("sleep", vec![json!(100)]),
            async {
                tokio::task::yield_now().await;
                ctx.call("custom.waitThenSleep", vec![]).await
            },
        );

        assert!(matches!(second, Err(EngineError::ConcurrencyViolation { .. })));
        assert!(matches!(slept, Err(EngineError::Cancelled { .. })));
        assert!(ctx.worker().is_stopped());
        assert!(engine.worker(ctx.pid()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_requires_suspending_capability() {
        let mut registry = CapabilityRegistry::builtin();
        registry
            .register(
                "custom.sneaky",
                CapabilityDescriptor::new(0.0, |cx: CallContext, _args| async move {
                    cx.suspend(tokio::time::sleep(Duration::from_millis(10)))
                        .await?;
                    Ok::<_, EngineError>(json!(true))
                }),
            )
            .unwrap();
        let engine = engine_with_registry(registry, "ns.custom.sneaky();");
        let ctx = launch(&engine);

        let err = ctx.call("custom.sneaky", vec![]).await.unwrap_err();
        assert!(matches!(err, EngineError::RuntimeError(_)));
        assert_eq!(ctx.worker().guard().running_fn(), None);
        assert!(!ctx.worker().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_capability_gets_call_context() {
        let mut registry = CapabilityRegistry::builtin();
        registry
            .register(
                "custom.whoami",
                CapabilityDescriptor::new(0.5, |cx: CallContext, _args| async move {
                    Ok::<_, EngineError>(json!(format!("{}@{}", cx.pid(), cx.hostname())))
                }),
            )
            .unwrap();

        let compiler = NativeCompiler::new().register("idle.js", idle);
        let engine = Arc::new(
            ScriptEngine::new(RuntimeConfig::default(), Arc::new(compiler))
                .unwrap()
                .with_capabilities(registry),
        );
        engine
            .add_server(Server::new("home", 8.0).with_script("idle.js", "ns.custom.whoami()"))
            .unwrap();

        let pid = engine
            .launch(LaunchRequest::new("home", "idle.js").options(RunOptions::default()))
            .unwrap();
        let ctx = engine.context(pid).unwrap();

        let value = ctx.call("custom.whoami", vec![]).await.unwrap();
        assert_eq!(value, json!(format!("{}@home", pid)));

        assert!(engine.kill(&ScriptIdentifier::Pid(pid)));
        let err = ctx.call("custom.whoami", vec![]).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled { pid });
    }
}
