// src/utils/config.rs
//! Engine configuration
//!
//! Configuration is layered: built-in defaults, then an optional
//! `config/engine.{toml,yaml,json}` file, then `NETSCRIPT__*` environment
//! variables (e.g. `NETSCRIPT__RUNTIME__MAX_PORTS=40`).

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of addressable ports
pub const DEFAULT_MAX_PORTS: u32 = 20;

/// Default capacity of a single port queue
pub const DEFAULT_PORT_CAPACITY: usize = 50;

/// Default number of log lines kept per script
pub const DEFAULT_MAX_LOG_LINES: usize = 50;

/// Base RAM cost every script pays, in GB
pub const BASE_SCRIPT_COST: f64 = 1.6;

/// Hard ceiling on a script's dynamic RAM counter, in GB
pub const MAX_DYNAMIC_RAM: f64 = 1024.0;

/// Relative tolerance applied to RAM comparisons. A handful of ULPs: it
/// absorbs rounding in summed costs and nothing more.
pub const RAM_TOLERANCE: f64 = f64::EPSILON * 8.0;

/// Default delay before a spawned script is launched, in milliseconds
pub const DEFAULT_SPAWN_DELAY_MS: u64 = 10_000;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Script runtime limits and policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Highest valid port number (ports are numbered from 1)
    pub max_ports: u32,

    /// Values held by one port before the oldest is evicted
    pub port_capacity: usize,

    /// Log lines kept per running script
    pub max_log_lines: usize,

    /// Largest PID handed out before the allocator wraps
    pub max_pid: u32,

    /// Relative tolerance for RAM comparisons
    pub ram_tolerance: f64,

    /// Ceiling for dynamic RAM counters
    pub max_dynamic_ram: f64,

    /// RAM cost paid by every script before any capability
    pub base_script_cost: f64,

    /// Delay applied by `spawn` when none is given
    pub default_spawn_delay_ms: u64,

    /// Move money/experience earned by an exiting script to its live parent
    pub transfer_earnings_to_parent: bool,

    /// Prefix script log lines with a wall-clock timestamp
    pub timestamp_logs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_ports: DEFAULT_MAX_PORTS,
            port_capacity: DEFAULT_PORT_CAPACITY,
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            max_pid: i32::MAX as u32,
            ram_tolerance: RAM_TOLERANCE,
            max_dynamic_ram: MAX_DYNAMIC_RAM,
            base_script_cost: BASE_SCRIPT_COST,
            default_spawn_delay_ms: DEFAULT_SPAWN_DELAY_MS,
            transfer_earnings_to_parent: true,
            timestamp_logs: false,
        }
    }
}

impl RuntimeConfig {
    /// Validate runtime settings
    pub fn validate(&self) -> Result<()> {
        if self.max_ports == 0 {
            return Err(EngineError::ConfigError("max_ports cannot be 0".into()));
        }
        if self.port_capacity == 0 {
            return Err(EngineError::ConfigError("port_capacity cannot be 0".into()));
        }
        if self.max_log_lines == 0 {
            return Err(EngineError::ConfigError("max_log_lines cannot be 0".into()));
        }
        if self.max_pid == 0 {
            return Err(EngineError::ConfigError("max_pid cannot be 0".into()));
        }
        if !(self.ram_tolerance >= 0.0) {
            return Err(EngineError::ConfigError(
                "ram_tolerance must be a non-negative number".into(),
            ));
        }
        if !(self.base_script_cost > 0.0) {
            return Err(EngineError::ConfigError(
                "base_script_cost must be positive".into(),
            ));
        }
        if !(self.max_dynamic_ram >= self.base_script_cost) {
            return Err(EngineError::ConfigError(
                "max_dynamic_ram cannot be below base_script_cost".into(),
            ));
        }
        Ok(())
    }
}

/// Logging output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Metrics exporter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl EngineConfig {
    /// Load configuration from `config/engine.*` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from("config/engine")
    }

    /// Load configuration from a specific file stem (extension optional)
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let name = path.as_ref().to_string_lossy().into_owned();

        let config: EngineConfig = config::Config::builder()
            .add_source(config::File::with_name(&name).required(false))
            .add_source(
                config::Environment::with_prefix("NETSCRIPT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.runtime.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_ports, 20);
        assert_eq!(config.port_capacity, 50);
        assert_eq!(config.default_spawn_delay_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let invalid_ports = RuntimeConfig {
            max_ports: 0,
            ..Default::default()
        };
        assert!(invalid_ports.validate().is_err());

        let invalid_tolerance = RuntimeConfig {
            ram_tolerance: -1.0,
            ..Default::default()
        };
        assert!(invalid_tolerance.validate().is_err());

        let invalid_base = RuntimeConfig {
            base_script_cost: 0.0,
            ..Default::default()
        };
        assert!(invalid_base.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[runtime]\nmax_ports = 8\nport_capacity = 4\n\n[logging]\njson = true").unwrap();

        let config = EngineConfig::load_from(dir.path().join("engine")).unwrap();
        assert_eq!(config.runtime.max_ports, 8);
        assert_eq!(config.runtime.port_capacity, 4);
        assert_eq!(config.runtime.max_log_lines, DEFAULT_MAX_LOG_LINES);
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(dir.path().join("absent")).unwrap();
        assert_eq!(config.runtime.max_ports, DEFAULT_MAX_PORTS);
        assert_eq!(config.logging.level, "info");
    }
}
