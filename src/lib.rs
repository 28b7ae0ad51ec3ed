// src/lib.rs
//! Netscript Runtime Library
//!
//! This library runs user scripts concurrently inside a simulated network of
//! servers. Every script is metered, sandboxed behind a capability surface
//! and scheduled independently on a tokio runtime.
//!
//! # Architecture
//!
//! The runtime is structured into several key modules:
//!
//! - **runtime**: Process table, RAM accounting, worker scripts, process manager
//! - **capability**: Capability registry, metered dispatch, built-in capabilities
//! - **ipc**: Numbered ports for script-to-script messaging
//! - **observability**: Tracing and metrics setup
//! - **utils**: Configuration and error types
//!
//! # Example
//!
//! ```no_run
//! use netscript_runtime::runtime::{LaunchRequest, NativeCompiler, ScriptEngine, Server};
//! use netscript_runtime::{EngineError, RuntimeConfig, ScriptContext};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> netscript_runtime::Result<()> {
//! let compiler = NativeCompiler::new().register("hello.js", |ctx: ScriptContext| async move {
//!     ctx.call("print", vec![json!("hello")]).await?;
//!     Ok::<(), EngineError>(())
//! });
//!
//! let engine = Arc::new(ScriptEngine::new(RuntimeConfig::default(), Arc::new(compiler))?);
//! engine.add_server(Server::new("home", 8.0).with_script("hello.js", "ns.print('hello')"))?;
//!
//! let pid = engine.launch(LaunchRequest::new("home", "hello.js"))?;
//! engine.join(pid).await;
//! # Ok(())
//! # }
//! ```

// Public module exports
pub mod capability;
pub mod ipc;
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use capability::{CapabilityRegistry, ScriptContext};
pub use runtime::process_manager::ScriptEngine;
pub use utils::config::{EngineConfig, RuntimeConfig};
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
