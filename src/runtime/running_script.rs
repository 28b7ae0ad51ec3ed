// src/runtime/running_script.rs
//! Persistent record of one script invocation

use crate::runtime::process_table::Pid;
use crate::runtime::script::{ScriptArg, ScriptKey};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Identity, arguments and accumulated statistics of a script instance.
///
/// Outlives its [`WorkerScript`](crate::runtime::WorkerScript) only when it
/// is non-temporary and the host saves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningScript {
    pub pid: Pid,
    pub hostname: String,
    pub filename: String,
    pub args: Vec<ScriptArg>,
    pub threads: u32,

    /// RAM cost per thread, in GB
    pub ram_usage: f64,

    pub online_money_made: f64,
    pub online_exp_gained: f64,
    pub offline_money_made: f64,
    pub offline_exp_gained: f64,

    /// Most recent log lines, oldest first
    pub logs: VecDeque<String>,
    pub max_log_lines: usize,

    pub parent: Option<Pid>,

    /// Temporary scripts are never persisted
    pub temporary: bool,
}

impl RunningScript {
    pub fn key(&self) -> ScriptKey {
        ScriptKey::new(&self.filename, &self.hostname, &self.args)
    }

    /// Total RAM held on the host
    pub fn total_ram(&self) -> f64 {
        self.ram_usage * self.threads as f64
    }

    /// Append a log line, dropping the oldest once full
    pub fn push_log(&mut self, line: String) {
        while self.logs.len() >= self.max_log_lines.max(1) {
            self.logs.pop_front();
        }
        self.logs.push_back(line);
    }

    pub fn record_earnings(&mut self, money: f64, exp: f64) {
        self.online_money_made += money;
        self.online_exp_gained += exp;
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            filename: self.filename.clone(),
            threads: self.threads,
            args: self.args.clone(),
            pid: self.pid,
            temporary: self.temporary,
        }
    }
}

/// Entry returned by process listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub filename: String,
    pub threads: u32,
    pub args: Vec<ScriptArg>,
    pub pid: Pid,
    pub temporary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script() -> RunningScript {
        RunningScript {
            pid: Pid::new(4),
            hostname: "home".into(),
            filename: "hack.js".into(),
            args: vec!["n00dles".into()],
            threads: 3,
            ram_usage: 1.75,
            online_money_made: 0.0,
            online_exp_gained: 0.0,
            offline_money_made: 0.0,
            offline_exp_gained: 0.0,
            logs: VecDeque::new(),
            max_log_lines: 3,
            parent: None,
            temporary: false,
        }
    }

    #[test]
    fn test_log_buffer_drops_oldest() {
        let mut rs = script();
        for i in 0..5 {
            rs.push_log(format!("line {}", i));
        }
        assert_eq!(rs.logs.len(), 3);
        assert_eq!(rs.logs.front().map(String::as_str), Some("line 2"));
        assert_eq!(rs.logs.back().map(String::as_str), Some("line 4"));
    }

    #[test]
    fn test_total_ram() {
        assert_eq!(script().total_ram(), 5.25);
    }

    #[test]
    fn test_info() {
        let info = script().info();
        assert_eq!(info.filename, "hack.js");
        assert_eq!(info.threads, 3);
        assert_eq!(info.pid, Pid::new(4));
        assert!(!info.temporary);
    }
}
