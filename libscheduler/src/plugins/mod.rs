//! Scheduling plugins.
//!
//! A reduced form of the usual filter/score pipeline: filter plugins decide
//! whether a node can hold the pod, score plugins rank the survivors.

use std::sync::Arc;

use common::{Node, Pod};

pub mod node_selector;
pub mod resources_fit;
pub mod runtime_fit;
pub mod taint_toleration;

use crate::plugins::node_selector::NodeSelector;
use crate::plugins::resources_fit::ResourcesFit;
use crate::plugins::runtime_fit::RuntimeFit;
use crate::plugins::taint_toleration::TaintToleration;

/// Pod-side inputs for one scheduling cycle.
pub struct PodContext<'a> {
    pub pod: &'a Pod,
    /// Runtime tag of the pod's pack.
    pub runtime_tag: &'a str,
}

pub trait Plugin {
    fn name(&self) -> &'static str;
}

/// Decides whether a node can run a pod.
pub trait FilterPlugin: Plugin + Send + Sync {
    fn filter(&self, ctx: &PodContext<'_>, node: &Node) -> Status;
}

/// Ranks a node that passed filtering; higher is better.
pub trait ScorePlugin: Plugin + Send + Sync {
    fn score(&self, ctx: &PodContext<'_>, node: &Node) -> i64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Code {
    Success,
    /// The node cannot hold the pod now, but preemption might change that.
    Unschedulable,
    /// The node can never hold the pod; preemption would not help.
    UnschedulableAndUnresolvable,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub code: Code,
    pub reasons: Vec<String>,
    pub plugin: &'static str,
}

impl Status {
    pub fn success(plugin: &'static str) -> Self {
        Status {
            code: Code::Success,
            reasons: vec![],
            plugin,
        }
    }

    pub fn unschedulable(plugin: &'static str, reason: String) -> Self {
        Status {
            code: Code::Unschedulable,
            reasons: vec![reason],
            plugin,
        }
    }

    pub fn unresolvable(plugin: &'static str, reason: String) -> Self {
        Status {
            code: Code::UnschedulableAndUnresolvable,
            reasons: vec![reason],
            plugin,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

/// Registry of enabled plugins. Taint preferences outweigh packing in the
/// default score weights.
#[derive(Clone)]
pub struct Registry {
    pub filter: Vec<Arc<dyn FilterPlugin>>,
    pub score: Vec<(Arc<dyn ScorePlugin>, i64)>,
}

impl Default for Registry {
    fn default() -> Self {
        let node_selector = Arc::new(NodeSelector);
        let runtime_fit = Arc::new(RuntimeFit);
        let fit = Arc::new(ResourcesFit);
        let taint_toleration = Arc::new(TaintToleration);

        Self {
            filter: vec![
                node_selector,
                runtime_fit,
                taint_toleration.clone(),
                fit.clone(),
            ],
            score: vec![(fit, 1), (taint_toleration, 3)],
        }
    }
}
