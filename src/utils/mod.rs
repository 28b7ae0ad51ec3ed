// src/utils/mod.rs
//! Common utilities: configuration and error types

pub mod config;
pub mod errors;

pub use self::config::{EngineConfig, LoggingConfig, MetricsConfig, RuntimeConfig};
pub use self::errors::{EngineError, Result};
