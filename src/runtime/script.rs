// src/runtime/script.rs
//! Script arguments, identity keys and the compiler collaborator
//!
//! Turning source text into something runnable is the job of an external
//! [`ScriptCompiler`]. The runtime only needs an entry point it can invoke
//! with a [`ScriptContext`](crate::capability::ScriptContext).

use crate::capability::ScriptContext;
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A single script argument. Scripts may only receive strings, numbers and
/// booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptArg {
    String(String),
    Number(f64),
    Bool(bool),
}

impl ScriptArg {
    /// Convert a dynamic value, rejecting anything but strings/numbers/booleans
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(ScriptArg::String(s.clone())),
            Value::Bool(b) => Ok(ScriptArg::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(ScriptArg::Number)
                .ok_or_else(|| EngineError::Validation(format!("unsupported number {}", n))),
            other => Err(EngineError::Validation(format!(
                "script arguments must be strings, numbers or booleans, got {}",
                other
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            ScriptArg::String(s) => Value::String(s.clone()),
            ScriptArg::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ScriptArg::Bool(b) => Value::Bool(*b),
        }
    }
}

impl From<&str> for ScriptArg {
    fn from(s: &str) -> Self {
        ScriptArg::String(s.to_string())
    }
}

impl From<String> for ScriptArg {
    fn from(s: String) -> Self {
        ScriptArg::String(s)
    }
}

impl From<f64> for ScriptArg {
    fn from(n: f64) -> Self {
        ScriptArg::Number(n)
    }
}

impl From<i32> for ScriptArg {
    fn from(n: i32) -> Self {
        ScriptArg::Number(n as f64)
    }
}

impl From<bool> for ScriptArg {
    fn from(b: bool) -> Self {
        ScriptArg::Bool(b)
    }
}

impl fmt::Display for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptArg::String(s) => write!(f, "{}", s),
            ScriptArg::Number(n) => write!(f, "{}", n),
            ScriptArg::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Identity of a script invocation on a server: filename, hostname and the
/// canonical form of its arguments.
///
/// Argument equality is order-sensitive and type-sensitive: `["1"]` and `[1]`
/// are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub filename: String,
    pub hostname: String,
    args: String,
}

impl ScriptKey {
    pub fn new(filename: &str, hostname: &str, args: &[ScriptArg]) -> Self {
        Self {
            filename: filename.to_string(),
            hostname: hostname.to_string(),
            args: canonical_args(args),
        }
    }
}

fn canonical_args(args: &[ScriptArg]) -> String {
    let values: Vec<Value> = args.iter().map(ScriptArg::to_value).collect();
    Value::Array(values).to_string()
}

/// Invocable entry point of a compiled script
pub trait ScriptEntry: Send + Sync {
    fn run(&self, ctx: ScriptContext) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> ScriptEntry for F
where
    F: Fn(ScriptContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn run(&self, ctx: ScriptContext) -> BoxFuture<'static, Result<()>> {
        (self)(ctx).boxed()
    }
}

/// Output of the compiler collaborator
#[derive(Clone)]
pub struct CompiledScript {
    pub entry: Arc<dyn ScriptEntry>,
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript").finish_non_exhaustive()
    }
}

/// Turns script source into an entry point
pub trait ScriptCompiler: Send + Sync {
    fn compile(&self, path: &str, source: &str) -> Result<CompiledScript>;
}

/// Compiler backed by Rust closures registered per script path
#[derive(Default)]
pub struct NativeCompiler {
    entries: HashMap<String, Arc<dyn ScriptEntry>>,
}

impl NativeCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the entry point used for every file named `path`
    pub fn register<E>(mut self, path: impl Into<String>, entry: E) -> Self
    where
        E: ScriptEntry + 'static,
    {
        self.entries.insert(path.into(), Arc::new(entry));
        self
    }
}

impl ScriptCompiler for NativeCompiler {
    fn compile(&self, path: &str, _source: &str) -> Result<CompiledScript> {
        self.entries
            .get(path)
            .map(|entry| CompiledScript {
                entry: Arc::clone(entry),
            })
            .ok_or_else(|| EngineError::Compile {
                path: path.to_string(),
                reason: "no native entry point registered".to_string(),
            })
    }
}
