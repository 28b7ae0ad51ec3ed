// src/runtime/mod.rs
//! Script execution runtime
//!
//! This module provides the process model scripts run in:
//!
//! - **Process Table**: PID allocation and lookup
//! - **RAM Accounting**: static and dynamic RAM budgets
//! - **Concurrency Guard**: single in-flight call and cancellation
//! - **Worker Script**: live context of one running script
//! - **Process Manager**: run, exec, spawn, kill and queries
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     ScriptEngine                        │
//! │   Mutex<servers + process table + compiled cache>       │
//! │                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │  │ WorkerScript │  │ WorkerScript │  │ WorkerScript │   │
//! │  │  guard, RAM  │  │  guard, RAM  │  │  guard, RAM  │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘   │
//! │         │ tokio task      │                 │           │
//! │         └─────────────────┴─────────────────┘           │
//! │                           │                             │
//! │            capability dispatch + ports                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod concurrency_guard;
pub mod process_manager;
pub mod process_table;
pub mod ram_accounting;
pub mod running_script;
pub mod script;
pub mod server;
pub mod target_ops;
pub mod worker_script;

// Re-export commonly used types
pub use concurrency_guard::{ConcurrencyGuard, GuardState};
pub use process_manager::{ExitReason, LaunchRequest, RunOptions, ScriptEngine, ScriptIdentifier};
pub use process_table::{Pid, ProcessTable};
pub use ram_accounting::{RamAccount, RamLimits};
pub use running_script::{ProcessInfo, RunningScript};
pub use script::{CompiledScript, NativeCompiler, ScriptArg, ScriptCompiler, ScriptEntry, ScriptKey};
pub use server::Server;
pub use target_ops::{FixedTimings, OpOutcome, TargetOp, TargetOperations};
pub use worker_script::{ExitHandler, WorkerScript};
