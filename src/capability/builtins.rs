// src/capability/builtins.rs
//! Built-in capability set
//!
//! Costs are per thread, in GB. Argument conventions follow the script API:
//! a thread count may be given as a bare number or as an options object.

use crate::capability::dispatch::CallContext;
use crate::capability::registry::{CapabilityDescriptor, CapabilityRegistry};
use crate::ipc::EMPTY_PORT_DATA;
use crate::runtime::process_manager::{RunOptions, ScriptIdentifier};
use crate::runtime::process_table::Pid;
use crate::runtime::script::ScriptArg;
use crate::runtime::target_ops::TargetOp;
use crate::utils::errors::{EngineError, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// Register every built-in capability
pub fn register_all(registry: &mut CapabilityRegistry) {
    let builtins = [
        ("sleep", CapabilityDescriptor::new(0.0, sleep).suspending()),
        ("asleep", CapabilityDescriptor::new(0.0, asleep).concurrent()),
        ("hack", CapabilityDescriptor::new(0.1, hack).suspending()),
        ("grow", CapabilityDescriptor::new(0.15, grow).suspending()),
        ("weaken", CapabilityDescriptor::new(0.15, weaken).suspending()),
        ("print", CapabilityDescriptor::new(0.0, print)),
        ("tprint", CapabilityDescriptor::new(0.0, tprint)),
        ("run", CapabilityDescriptor::new(1.0, run)),
        ("exec", CapabilityDescriptor::new(1.3, exec)),
        ("spawn", CapabilityDescriptor::new(2.0, spawn)),
        ("kill", CapabilityDescriptor::new(0.5, kill)),
        ("killall", CapabilityDescriptor::new(0.5, killall)),
        ("ps", CapabilityDescriptor::new(0.2, ps)),
        ("exit", CapabilityDescriptor::new(0.0, exit)),
        ("isRunning", CapabilityDescriptor::new(0.1, is_running)),
        ("getRunningScript", CapabilityDescriptor::new(0.3, get_running_script)),
        ("writePort", CapabilityDescriptor::new(0.0, write_port)),
        ("tryWritePort", CapabilityDescriptor::new(0.0, try_write_port)),
        ("readPort", CapabilityDescriptor::new(0.0, read_port)),
        ("peek", CapabilityDescriptor::new(0.0, peek)),
        ("clearPort", CapabilityDescriptor::new(0.0, clear_port)),
        ("nextPortWrite", CapabilityDescriptor::new(0.0, next_port_write).suspending()),
        ("server.maxRam", CapabilityDescriptor::new(0.05, server_max_ram)),
        ("server.usedRam", CapabilityDescriptor::new(0.05, server_used_ram)),
        ("server.scriptRam", CapabilityDescriptor::new(0.1, server_script_ram)),
    ];

    for (path, descriptor) in builtins {
        if let Err(e) = registry.register(path, descriptor) {
            // Only possible if an embedder pre-registered the same path
            warn!(path, "skipping built-in capability: {}", e);
        }
    }
}

// Argument helpers ------------------------------------------------------

fn number_arg(args: &[Value], index: usize, name: &str) -> Result<f64> {
    args.get(index)
        .and_then(Value::as_f64)
        .filter(|n| n.is_finite())
        .ok_or_else(|| EngineError::Validation(format!("'{}' must be a number", name)))
}

fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(EngineError::Validation(format!("'{}' must be a non-empty string", name))),
    }
}

/// Optional hostname argument, defaulting to the caller's server
fn host_arg(cx: &CallContext, args: &[Value], index: usize) -> Result<String> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(cx.hostname().to_string()),
        Some(Value::String(s)) if s.is_empty() => Ok(cx.hostname().to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(EngineError::Validation(format!(
            "hostname must be a string, got {}",
            other
        ))),
    }
}

fn delay_arg(args: &[Value], index: usize) -> Result<Duration> {
    let ms = number_arg(args, index, "milliseconds")?;
    if ms < 0.0 {
        return Err(EngineError::Validation(format!(
            "delay must be non-negative, got {}",
            ms
        )));
    }
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|_| EngineError::Validation(format!("delay of {}ms is out of range", ms)))
}

fn script_args(args: &[Value]) -> Result<Vec<ScriptArg>> {
    args.iter().map(ScriptArg::from_value).collect()
}

fn positive_integer(value: &Value, name: &str) -> Result<u32> {
    value
        .as_f64()
        .filter(|n| n.fract() == 0.0 && *n >= 1.0 && *n <= u32::MAX as f64)
        .map(|n| n as u32)
        .ok_or_else(|| {
            EngineError::Validation(format!("{} must be a positive integer, got {}", name, value))
        })
}

/// Parse a thread count or an options object
fn run_options(value: Option<&Value>) -> Result<RunOptions> {
    let mut options = RunOptions::default();
    match value {
        None | Some(Value::Null) => {}
        Some(n @ Value::Number(_)) => options.threads = positive_integer(n, "threads")?,
        Some(Value::Object(map)) => {
            if let Some(threads) = map.get("threads").filter(|v| !v.is_null()) {
                options.threads = positive_integer(threads, "threads")?;
            }
            if let Some(temporary) = map.get("temporary") {
                options.temporary = temporary.as_bool().unwrap_or(false);
            }
            if let Some(ram) = map.get("ramOverride").filter(|v| !v.is_null()) {
                options.ram_override = Some(ram.as_f64().ok_or_else(|| {
                    EngineError::Validation(format!("ramOverride must be a number, got {}", ram))
                })?);
            }
            if let Some(prevent) = map.get("preventDuplicates") {
                options.prevent_duplicates = prevent.as_bool().unwrap_or(false);
            }
            if let Some(delay) = map.get("spawnDelay").filter(|v| !v.is_null()) {
                let ms = delay
                    .as_f64()
                    .filter(|ms| ms.is_finite() && *ms >= 0.0)
                    .ok_or_else(|| {
                        EngineError::Validation(format!(
                            "spawnDelay must be a non-negative number, got {}",
                            delay
                        ))
                    })?;
                options.spawn_delay_ms = Some(ms.round() as u64);
            }
        }
        Some(other) => {
            return Err(EngineError::Validation(format!(
                "expected a thread count or options object, got {}",
                other
            )))
        }
    }
    Ok(options)
}

/// Script identifier from `(pid)` or `(path, host?, ...args)` starting at `index`
fn identifier(cx: &CallContext, args: &[Value], index: usize) -> Result<ScriptIdentifier> {
    match args.get(index) {
        Some(Value::Number(n)) => n
            .as_f64()
            .and_then(Pid::from_number)
            .map(ScriptIdentifier::Pid)
            .ok_or_else(|| EngineError::Validation(format!("invalid pid {}", n))),
        Some(Value::String(path)) if !path.is_empty() => Ok(ScriptIdentifier::Script {
            path: path.clone(),
            hostname: host_arg(cx, args, index + 1)?,
            args: script_args(args.get(index + 2..).unwrap_or(&[]))?,
        }),
        other => Err(EngineError::Validation(format!(
            "expected a pid or script path, got {}",
            other.cloned().unwrap_or(Value::Null)
        ))),
    }
}

/// Resource exhaustion is reported to the script as pid 0
fn launch_result(cx: &CallContext, result: Result<Pid>) -> Result<Value> {
    match result {
        Ok(pid) => Ok(json!(pid.get())),
        Err(e)
            if e.is_resource_exhaustion()
                || matches!(e, EngineError::ScriptNotFound { .. } | EngineError::Compile { .. }) =>
        {
            cx.log(format!("failed to start script: {}", e));
            Ok(json!(0))
        }
        Err(e) => Err(e),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// Timing ----------------------------------------------------------------

async fn sleep(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let delay = delay_arg(&args, 0)?;
    cx.suspend(tokio::time::sleep(delay)).await?;
    Ok(json!(true))
}

async fn asleep(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let delay = delay_arg(&args, 0)?;
    cx.wait(tokio::time::sleep(delay)).await?;
    Ok(json!(true))
}

// Target operations -----------------------------------------------------

async fn target_op(cx: CallContext, args: Vec<Value>, op: TargetOp) -> Result<Value> {
    let target = string_arg(&args, 0, "hostname")?;
    if !cx.engine().has_server(&target) {
        return Err(EngineError::ServerNotFound(target));
    }

    let ops = cx.engine().target_operations();
    let threads = cx.threads();
    let duration = ops.duration(op, &target, threads);
    cx.log(format!(
        "Executing on '{}' in {:.3} seconds (t={})",
        target,
        duration.as_secs_f64(),
        threads
    ));

    cx.suspend(tokio::time::sleep(duration)).await?;

    let outcome = ops.outcome(op, &target, threads);
    cx.worker().record_earnings(outcome.money, outcome.exp);
    cx.log(format!(
        "{} finished on '{}': value {}, {} exp",
        op.name(),
        target,
        outcome.value,
        outcome.exp
    ));
    Ok(json!(outcome.value))
}

async fn hack(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    target_op(cx, args, TargetOp::Hack).await
}

async fn grow(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    target_op(cx, args, TargetOp::Grow).await
}

async fn weaken(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    target_op(cx, args, TargetOp::Weaken).await
}

// Output ----------------------------------------------------------------

async fn print(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let line: Vec<String> = args.iter().map(display).collect();
    cx.script().log(line.join(" "));
    Ok(Value::Null)
}

async fn tprint(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let line: Vec<String> = args.iter().map(display).collect();
    let line = line.join(" ");
    info!(target: "terminal", pid = %cx.pid(), "{}", line);
    cx.script().log(line);
    Ok(Value::Null)
}

// Processes -------------------------------------------------------------

async fn run(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let path = string_arg(&args, 0, "script")?;
    let options = run_options(args.get(1))?;
    let script_args = script_args(args.get(2..).unwrap_or(&[]))?;

    let result = cx.engine().run(cx.worker(), &path, script_args, options);
    launch_result(&cx, result)
}

async fn exec(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let path = string_arg(&args, 0, "script")?;
    let hostname = string_arg(&args, 1, "hostname")?;
    let options = run_options(args.get(2))?;
    let script_args = script_args(args.get(3..).unwrap_or(&[]))?;

    let result = cx
        .engine()
        .exec(cx.worker(), &hostname, &path, script_args, options);
    launch_result(&cx, result)
}

async fn spawn(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let path = string_arg(&args, 0, "script")?;
    let options = run_options(args.get(1))?;
    let script_args = script_args(args.get(2..).unwrap_or(&[]))?;

    cx.log(format!("spawning '{}'", path));
    cx.engine().spawn(cx.worker(), &path, script_args, options)?;

    // The caller no longer exists
    Err(EngineError::Cancelled { pid: cx.pid() })
}

async fn kill(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let ident = identifier(&cx, &args, 0)?;
    let killed = cx.engine().kill(&ident);
    if !killed {
        cx.log(format!("no script matching {:?}", ident));
    }
    Ok(json!(killed))
}

async fn killall(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let hostname = host_arg(&cx, &args, 0)?;
    let safety_guard = args.get(1).and_then(Value::as_bool).unwrap_or(true);
    let exclude = (safety_guard && hostname == cx.hostname()).then(|| cx.pid());

    Ok(json!(cx.engine().killall(&hostname, exclude)?))
}

async fn ps(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let hostname = host_arg(&cx, &args, 0)?;
    let infos = cx.engine().ps(&hostname)?;
    serde_json::to_value(infos).map_err(|e| EngineError::RuntimeError(e.to_string()))
}

async fn exit(cx: CallContext, _args: Vec<Value>) -> Result<Value> {
    cx.log("exit() called");
    cx.engine().kill(&ScriptIdentifier::Pid(cx.pid()));
    Err(EngineError::Cancelled { pid: cx.pid() })
}

async fn is_running(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let ident = identifier(&cx, &args, 0)?;
    Ok(json!(cx.engine().is_running(&ident)))
}

async fn get_running_script(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let script = match args.first() {
        None | Some(Value::Null) => Some(cx.worker().running_script()),
        Some(_) => {
            let ident = identifier(&cx, &args, 0)?;
            cx.engine().find(&ident).map(|worker| worker.running_script())
        }
    };

    match script {
        Some(script) => {
            serde_json::to_value(script).map_err(|e| EngineError::RuntimeError(e.to_string()))
        }
        None => Ok(Value::Null),
    }
}

// Ports -----------------------------------------------------------------

fn port_data(args: &[Value]) -> Result<Value> {
    match args.get(1) {
        None | Some(Value::Null) => Err(EngineError::Validation(
            "cannot write an empty value to a port".into(),
        )),
        Some(value) => Ok(value.clone()),
    }
}

async fn write_port(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let port = cx.engine().ports().port_for_value(args.first().unwrap_or(&Value::Null))?;
    let data = port_data(&args)?;
    Ok(port.write(data).unwrap_or(Value::Null))
}

async fn try_write_port(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let port = cx.engine().ports().port_for_value(args.first().unwrap_or(&Value::Null))?;
    let data = port_data(&args)?;
    Ok(json!(port.try_write(data)))
}

async fn read_port(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let port = cx.engine().ports().port_for_value(args.first().unwrap_or(&Value::Null))?;
    Ok(port.read().unwrap_or_else(|| json!(EMPTY_PORT_DATA)))
}

async fn peek(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let port = cx.engine().ports().port_for_value(args.first().unwrap_or(&Value::Null))?;
    Ok(port.peek().unwrap_or_else(|| json!(EMPTY_PORT_DATA)))
}

async fn clear_port(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let port = cx.engine().ports().port_for_value(args.first().unwrap_or(&Value::Null))?;
    port.clear();
    Ok(Value::Null)
}

async fn next_port_write(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let port = cx.engine().ports().port_for_value(args.first().unwrap_or(&Value::Null))?;
    cx.suspend(port.next_write()).await?;
    Ok(Value::Null)
}

// Server queries --------------------------------------------------------

async fn server_max_ram(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let hostname = host_arg(&cx, &args, 0)?;
    let (max, _) = cx
        .engine()
        .server_ram(&hostname)
        .ok_or(EngineError::ServerNotFound(hostname))?;
    Ok(json!(max))
}

async fn server_used_ram(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let hostname = host_arg(&cx, &args, 0)?;
    let (_, used) = cx
        .engine()
        .server_ram(&hostname)
        .ok_or(EngineError::ServerNotFound(hostname))?;
    Ok(json!(used))
}

async fn server_script_ram(cx: CallContext, args: Vec<Value>) -> Result<Value> {
    let path = string_arg(&args, 0, "script")?;
    let hostname = host_arg(&cx, &args, 1)?;
    match cx.engine().script_ram(&hostname, &path) {
        Ok(ram) => Ok(json!(ram)),
        Err(EngineError::ScriptNotFound { .. }) => Ok(json!(0)),
        Err(e) => Err(e),
    }
}
