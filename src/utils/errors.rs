// src/utils/errors.rs
//! Error types for the script runtime
//!
//! Errors fall into two families:
//!
//! - **Fatal**: cancellation, concurrency violations, RAM violations and
//!   attempts to mutate the capability surface. The owning script is always
//!   terminated and cannot recover.
//! - **Local**: validation errors, port index errors and resource exhaustion.
//!   These are reported to the caller, which may handle them.

use crate::runtime::process_table::Pid;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The script was killed while (or before) executing a call
    #[error("script {pid} was killed")]
    Cancelled { pid: Pid },

    #[error(
        "concurrent calls to Netscript functions are not allowed: \
         script {pid} called '{attempted}' while '{running}' was still in flight"
    )]
    ConcurrencyViolation {
        pid: Pid,
        running: String,
        attempted: String,
    },

    #[error(
        "dynamic RAM usage of script {pid} ({used:.2}GB) exceeds its allocation ({allocated:.2}GB); \
         capabilities used: [{}]", .capabilities.join(", ")
    )]
    RamViolation {
        pid: Pid,
        used: f64,
        allocated: f64,
        capabilities: Vec<String>,
    },

    #[error("capability surface is read-only: cannot {action} '{path}'")]
    ReadOnlySurface { action: &'static str, path: String },

    #[error("not enough RAM on '{hostname}': need {required:.2}GB, {available:.2}GB available")]
    InsufficientRam {
        hostname: String,
        required: f64,
        available: f64,
    },

    #[error("no free process identifiers")]
    PidExhausted,

    #[error("'{path}' with the same arguments is already running on '{hostname}'")]
    DuplicateProcess { path: String, hostname: String },

    #[error("script '{path}' does not exist on '{hostname}'")]
    ScriptNotFound { path: String, hostname: String },

    #[error("server '{0}' does not exist")]
    ServerNotFound(String),

    #[error("server '{hostname}' still has {processes} running script(s)")]
    ServerBusy { hostname: String, processes: usize },

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("invalid argument: {0}")]
    Validation(String),

    #[error("invalid port number {port}: ports are numbered 1 to {max}")]
    PortIndex { port: String, max: u32 },

    #[error("failed to compile '{path}': {reason}")]
    Compile { path: String, reason: String },

    /// Error raised by script logic itself
    #[error("{0}")]
    Script(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    /// Whether this error always terminates the owning script
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Cancelled { .. }
                | EngineError::ConcurrencyViolation { .. }
                | EngineError::RamViolation { .. }
                | EngineError::ReadOnlySurface { .. }
        )
    }

    /// Whether this error is a process-creation failure caused by lack of resources
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientRam { .. }
                | EngineError::PidExhausted
                | EngineError::DuplicateProcess { .. }
        )
    }

    /// Short label used for metrics and exit reasons
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::ConcurrencyViolation { .. } => "concurrency_violation",
            EngineError::RamViolation { .. } => "ram_violation",
            EngineError::ReadOnlySurface { .. } => "read_only_surface",
            EngineError::InsufficientRam { .. } => "insufficient_ram",
            EngineError::PidExhausted => "pid_exhausted",
            EngineError::DuplicateProcess { .. } => "duplicate_process",
            EngineError::ScriptNotFound { .. } => "script_not_found",
            EngineError::ServerNotFound(_) => "server_not_found",
            EngineError::ServerBusy { .. } => "server_busy",
            EngineError::UnknownCapability(_) => "unknown_capability",
            EngineError::Validation(_) => "validation",
            EngineError::PortIndex { .. } => "port_index",
            EngineError::Compile { .. } => "compile",
            EngineError::Script(_) => "script",
            EngineError::RuntimeError(_) => "runtime",
            EngineError::ConfigError(_) => "config",
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let pid = Pid::new(1);
        assert!(EngineError::Cancelled { pid }.is_fatal());
        assert!(EngineError::RamViolation {
            pid,
            used: 2.0,
            allocated: 1.6,
            capabilities: vec!["hack".into()],
        }
        .is_fatal());
        assert!(!EngineError::Validation("bad".into()).is_fatal());
        assert!(!EngineError::PortIndex { port: "0".into(), max: 20 }.is_fatal());
    }

    #[test]
    fn test_resource_exhaustion_classification() {
        let err = EngineError::InsufficientRam {
            hostname: "home".into(),
            required: 10.0,
            available: 8.0,
        };
        assert!(err.is_resource_exhaustion());
        assert!(!err.is_fatal());
        assert!(EngineError::PidExhausted.is_resource_exhaustion());
    }

    #[test]
    fn test_ram_violation_message_lists_capabilities() {
        let err = EngineError::RamViolation {
            pid: Pid::new(3),
            used: 1.75,
            allocated: 1.7,
            capabilities: vec!["hack".into(), "grow".into()],
        };
        let message = err.to_string();
        assert!(message.contains("hack, grow"));
        assert!(message.contains("1.75GB"));
    }
}
