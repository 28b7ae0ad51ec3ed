// src/capability/registry.rs
//! Static capability tree and RAM cost registry
//!
//! Capabilities are registered under dotted paths (`hack`, `server.maxRam`).
//! Every proper prefix of a registered path becomes a namespace node.

use crate::capability::dispatch::CallContext;
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Handler invoked when a script calls a capability
pub type CapabilityFn =
    Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// RAM cost of a capability, in GB per thread
#[derive(Clone)]
pub enum RamCost {
    Constant(f64),
    /// Pure function of immutable inputs, evaluated once per script
    Computed(Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl RamCost {
    pub fn evaluate(&self) -> f64 {
        match self {
            RamCost::Constant(cost) => *cost,
            RamCost::Computed(f) => f(),
        }
    }
}

impl fmt::Debug for RamCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamCost::Constant(cost) => write!(f, "Constant({})", cost),
            RamCost::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

impl From<f64> for RamCost {
    fn from(cost: f64) -> Self {
        RamCost::Constant(cost)
    }
}

/// Description of one exposed operation
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub cost: RamCost,

    /// The one primitive allowed to run while another call is in flight
    pub concurrent_ok: bool,

    /// Whether the body may suspend as the script's long-running call
    pub suspends: bool,

    pub handler: CapabilityFn,
}

impl CapabilityDescriptor {
    pub fn new<F, Fut>(cost: impl Into<RamCost>, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            cost: cost.into(),
            concurrent_ok: false,
            suspends: false,
            handler: Arc::new(move |ctx, args| handler(ctx, args).boxed()),
        }
    }

    pub fn suspending(mut self) -> Self {
        self.suspends = true;
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent_ok = true;
        self
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("cost", &self.cost)
            .field("concurrent_ok", &self.concurrent_ok)
            .field("suspends", &self.suspends)
            .finish_non_exhaustive()
    }
}

/// Node of the capability tree
#[derive(Debug, Clone)]
pub enum CapabilityNode {
    Namespace(BTreeSet<String>),
    Function(Arc<CapabilityDescriptor>),
}

/// Registry of every capability scripts may reach
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    nodes: BTreeMap<String, CapabilityNode>,
}

impl CapabilityRegistry {
    /// Empty registry with only the root namespace
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), CapabilityNode::Namespace(BTreeSet::new()));
        Self { nodes }
    }

    /// Registry pre-populated with the built-in capability set
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::capability::builtins::register_all(&mut registry);
        registry
    }

    /// Register a capability under a dotted path
    pub fn register(&mut self, path: &str, descriptor: CapabilityDescriptor) -> Result<()> {
        validate_path(path)?;

        if self.nodes.contains_key(path) {
            return Err(EngineError::ConfigError(format!(
                "capability '{}' is already registered",
                path
            )));
        }

        // Every prefix must be (or become) a namespace
        let segments: Vec<&str> = path.split('.').collect();
        for depth in 0..segments.len() {
            let parent = segments[..depth].join(".");
            if let Some(CapabilityNode::Function(_)) = self.nodes.get(&parent) {
                return Err(EngineError::ConfigError(format!(
                    "cannot register '{}': '{}' is a function",
                    path, parent
                )));
            }
        }

        for depth in 0..segments.len() {
            let parent = segments[..depth].join(".");
            let child = segments[depth].to_string();
            match self
                .nodes
                .entry(parent)
                .or_insert_with(|| CapabilityNode::Namespace(BTreeSet::new()))
            {
                CapabilityNode::Namespace(children) => {
                    children.insert(child);
                }
                CapabilityNode::Function(_) => unreachable!("checked above"),
            }
        }

        self.nodes
            .insert(path.to_string(), CapabilityNode::Function(Arc::new(descriptor)));
        Ok(())
    }

    pub fn node(&self, path: &str) -> Option<&CapabilityNode> {
        self.nodes.get(path)
    }

    pub fn descriptor(&self, path: &str) -> Option<Arc<CapabilityDescriptor>> {
        match self.nodes.get(path) {
            Some(CapabilityNode::Function(descriptor)) => Some(Arc::clone(descriptor)),
            _ => None,
        }
    }

    /// RAM cost of a function path
    pub fn cost(&self, path: &str) -> Option<f64> {
        self.descriptor(path).map(|d| d.cost.evaluate())
    }

    /// Longest registered function path that `reference` starts with.
    /// `server.maxRam.length` resolves to `server.maxRam`.
    pub fn leaf_for_reference(&self, reference: &str) -> Option<String> {
        let segments: Vec<&str> = reference.split('.').collect();
        (1..=segments.len())
            .rev()
            .map(|depth| segments[..depth].join("."))
            .find(|candidate| matches!(self.nodes.get(candidate), Some(CapabilityNode::Function(_))))
    }

    /// All function paths, sorted
    pub fn function_paths(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| matches!(node, CapabilityNode::Function(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(EngineError::ConfigError(format!(
            "invalid capability path '{}'",
            path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(cost: f64) -> CapabilityDescriptor {
        CapabilityDescriptor::new(cost, |_ctx, _args| async { Ok::<_, EngineError>(Value::Null) })
    }

    #[test]
    fn test_register_builds_namespaces() {
        let mut registry = CapabilityRegistry::new();
        registry.register("stock.buy", noop(2.5)).unwrap();
        registry.register("stock.sell", noop(2.5)).unwrap();

        match registry.node("stock") {
            Some(CapabilityNode::Namespace(children)) => {
                assert_eq!(children.iter().cloned().collect::<Vec<_>>(), vec!["buy", "sell"]);
            }
            other => panic!("expected namespace, got {:?}", other),
        }
        assert_eq!(registry.cost("stock.buy"), Some(2.5));
        assert_eq!(registry.cost("stock"), None);
    }

    #[test]
    fn test_register_conflicts() {
        let mut registry = CapabilityRegistry::new();
        registry.register("hack", noop(0.1)).unwrap();

        assert!(registry.register("hack", noop(0.1)).is_err());
        assert!(registry.register("hack.deep", noop(0.1)).is_err());
        assert!(registry.register("bad..path", noop(0.1)).is_err());
        assert!(registry.register("", noop(0.1)).is_err());
    }

    #[test]
    fn test_computed_cost() {
        let mut registry = CapabilityRegistry::new();
        let descriptor = CapabilityDescriptor::new(
            RamCost::Computed(Arc::new(|| 16.0 / 4.0)),
            |_ctx, _args| async { Ok::<_, EngineError>(Value::Null) },
        );
        registry.register("formulas.calc", descriptor).unwrap();
        assert_eq!(registry.cost("formulas.calc"), Some(4.0));
    }

    #[test]
    fn test_leaf_for_reference() {
        let registry = CapabilityRegistry::builtin();
        assert_eq!(registry.leaf_for_reference("hack"), Some("hack".to_string()));
        assert_eq!(
            registry.leaf_for_reference("server.maxRam"),
            Some("server.maxRam".to_string())
        );
        assert_eq!(
            registry.leaf_for_reference("hack.name"),
            Some("hack".to_string())
        );
        assert_eq!(registry.leaf_for_reference("server"), None);
        assert_eq!(registry.leaf_for_reference("args"), None);
    }

    #[test]
    fn test_builtin_costs() {
        let registry = CapabilityRegistry::builtin();
        assert_eq!(registry.cost("hack"), Some(0.1));
        assert_eq!(registry.cost("exec"), Some(1.3));
        assert_eq!(registry.cost("spawn"), Some(2.0));
        assert_eq!(registry.cost("sleep"), Some(0.0));
        assert!(registry.descriptor("asleep").unwrap().concurrent_ok);
        assert!(registry.descriptor("sleep").unwrap().suspends);
    }
}
