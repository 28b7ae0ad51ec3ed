// src/main.rs
//! Netscript Runtime demo
//!
//! Boots a small network, runs a handful of native scripts that talk over
//! ports and hack a target, then prints the boot script's log.

use anyhow::Result;
use netscript_runtime::ipc::EMPTY_PORT_DATA;
use netscript_runtime::observability::{init_metrics, init_tracing};
use netscript_runtime::runtime::{LaunchRequest, NativeCompiler, ScriptArg, ScriptEngine, Server};
use netscript_runtime::utils::config::EngineConfig;
use netscript_runtime::ScriptContext;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

const BOOT_SOURCE: &str = r#"
export async function main(ns) {
    const pong = ns.run("pong.js");
    const ping = ns.run("ping.js", 1, 3);
    const harvest = ns.exec("harvest.js", "home", 2, "n00dles");
    for (const pid of [ping, harvest]) {
        while (ns.isRunning(pid)) await ns.sleep(200);
    }
    ns.kill(pong);
    ns.print("all done");
}"#;

const PING_SOURCE: &str = r#"
export async function main(ns) {
    for (let i = 0; i < ns.args[0]; i++) {
        ns.writePort(1, `ping ${i}`);
        let reply = ns.readPort(2);
        while (reply === "NULL PORT DATA") {
            await ns.nextPortWrite(2);
            reply = ns.readPort(2);
        }
        ns.print(reply);
    }
}"#;

const PONG_SOURCE: &str = r#"
export async function main(ns) {
    while (true) {
        const msg = ns.readPort(1);
        if (msg === "NULL PORT DATA") { await ns.nextPortWrite(1); continue; }
        ns.writePort(2, `pong for ${msg}`);
    }
}"#;

const HARVEST_SOURCE: &str = r#"
export async function main(ns) {
    await ns.hack(ns.args[0]);
    await ns.weaken(ns.args[0]);
    await ns.hack(ns.args[0]);
}"#;

async fn boot(ctx: ScriptContext) -> netscript_runtime::Result<()> {
    let pong = ctx.call("run", vec![json!("pong.js")]).await?;
    let ping = ctx.call("run", vec![json!("ping.js"), json!(1), json!(3)]).await?;
    let harvest = ctx
        .call("exec", vec![json!("harvest.js"), json!("home"), json!(2), json!("n00dles")])
        .await?;

    for pid in [ping, harvest] {
        if pid == json!(0) {
            continue;
        }
        while ctx.call("isRunning", vec![pid.clone()]).await? == json!(true) {
            ctx.call("sleep", vec![json!(200)]).await?;
        }
    }

    ctx.call("kill", vec![pong]).await?;
    ctx.call("print", vec![json!("all done")]).await?;
    Ok(())
}

async fn ping(ctx: ScriptContext) -> netscript_runtime::Result<()> {
    let rounds = match ctx.args().first() {
        Some(ScriptArg::Number(n)) => *n as u32,
        _ => 1,
    };

    for i in 0..rounds {
        ctx.call("writePort", vec![json!(1), json!(format!("ping {}", i))])
            .await?;

        let mut reply = ctx.call("readPort", vec![json!(2)]).await?;
        while reply == json!(EMPTY_PORT_DATA) {
            ctx.call("nextPortWrite", vec![json!(2)]).await?;
            reply = ctx.call("readPort", vec![json!(2)]).await?;
        }
        ctx.call("print", vec![reply]).await?;
    }
    Ok(())
}

async fn pong(ctx: ScriptContext) -> netscript_runtime::Result<()> {
    loop {
        let message = ctx.call("readPort", vec![json!(1)]).await?;
        if message == json!(EMPTY_PORT_DATA) {
            ctx.call("nextPortWrite", vec![json!(1)]).await?;
            continue;
        }
        let text = match &message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ctx.call("writePort", vec![json!(2), json!(format!("pong for {}", text))])
            .await?;
    }
}

async fn harvest(ctx: ScriptContext) -> netscript_runtime::Result<()> {
    let target = ctx
        .args()
        .first()
        .map(ScriptArg::to_value)
        .unwrap_or(Value::Null);

    ctx.call("hack", vec![target.clone()]).await?;
    ctx.call("weaken", vec![target.clone()]).await?;
    ctx.call("hack", vec![target]).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    let metrics = init_metrics(&config.metrics)?;

    info!("Starting Netscript Runtime v{}", netscript_runtime::VERSION);
    info!("Configuration loaded: {:?}", config);

    let compiler = NativeCompiler::new()
        .register("boot.js", boot)
        .register("ping.js", ping)
        .register("pong.js", pong)
        .register("harvest.js", harvest);

    let engine = Arc::new(ScriptEngine::new(config.runtime.clone(), Arc::new(compiler))?);
    engine.add_server(
        Server::new("home", 32.0)
            .with_script("boot.js", BOOT_SOURCE)
            .with_script("ping.js", PING_SOURCE)
            .with_script("pong.js", PONG_SOURCE)
            .with_script("harvest.js", HARVEST_SOURCE),
    )?;
    engine.add_server(Server::new("n00dles", 4.0))?;

    let pid = engine.launch(LaunchRequest::new("home", "boot.js"))?;
    info!(pid = %pid, "boot script started");

    match engine.join(pid).await {
        Some(record) => {
            for line in &record.logs {
                info!(pid = %pid, "{}", line);
            }
            info!(
                money = record.online_money_made,
                exp = record.online_exp_gained,
                "boot script finished"
            );
        }
        None => warn!(pid = %pid, "boot script exited before it could be joined"),
    }

    // Stop anything still running
    engine.killall("home", None)?;

    if let Some(handle) = metrics {
        println!("{}", handle.render());
    }

    Ok(())
}
