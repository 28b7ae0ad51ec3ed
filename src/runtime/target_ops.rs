// src/runtime/target_ops.rs
//! Timing and outcome of operations aimed at another server
//!
//! The game formulas live outside the runtime. The engine only needs to know
//! how long an operation takes and what it yields once it completes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOp {
    Hack,
    Grow,
    Weaken,
}

impl TargetOp {
    pub fn name(&self) -> &'static str {
        match self {
            TargetOp::Hack => "hack",
            TargetOp::Grow => "grow",
            TargetOp::Weaken => "weaken",
        }
    }
}

/// What an operation produced
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OpOutcome {
    /// Money credited to the script
    pub money: f64,

    /// Experience credited to the script
    pub exp: f64,

    /// Value returned to the script: money stolen, growth multiplier or
    /// security reduction
    pub value: f64,
}

/// Collaborator supplying durations and results of target operations
pub trait TargetOperations: Send + Sync {
    fn duration(&self, op: TargetOp, target: &str, threads: u32) -> Duration;

    fn outcome(&self, op: TargetOp, target: &str, threads: u32) -> OpOutcome;
}

/// Deterministic timings with per-thread linear yields
#[derive(Debug, Clone)]
pub struct FixedTimings {
    pub hack_time: Duration,
    pub money_per_thread: f64,
    pub exp_per_thread: f64,
}

impl Default for FixedTimings {
    fn default() -> Self {
        Self {
            hack_time: Duration::from_secs(1),
            money_per_thread: 1_000.0,
            exp_per_thread: 1.0,
        }
    }
}

impl TargetOperations for FixedTimings {
    fn duration(&self, op: TargetOp, _target: &str, _threads: u32) -> Duration {
        // Grow and weaken take a fixed multiple of the hack time
        match op {
            TargetOp::Hack => self.hack_time,
            TargetOp::Grow => self.hack_time.mul_f64(3.2),
            TargetOp::Weaken => self.hack_time.mul_f64(4.0),
        }
    }

    fn outcome(&self, op: TargetOp, _target: &str, threads: u32) -> OpOutcome {
        let threads = threads as f64;
        let exp = self.exp_per_thread * threads;
        match op {
            TargetOp::Hack => {
                let money = self.money_per_thread * threads;
                OpOutcome {
                    money,
                    exp,
                    value: money,
                }
            }
            TargetOp::Grow => OpOutcome {
                money: 0.0,
                exp,
                value: 1.0 + 0.01 * threads,
            },
            TargetOp::Weaken => OpOutcome {
                money: 0.0,
                exp,
                value: 0.05 * threads,
            },
        }
    }
}
