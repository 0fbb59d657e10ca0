use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeStatus {
    Online,
    Offline,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// `None` tolerates taints of any key (operator must be `Exists`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: String,
    /// `None` matches every effect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect != taint.effect
        {
            return false;
        }
        match &self.key {
            None => self.operator == TolerationOperator::Exists,
            Some(key) => {
                key == &taint.key
                    && match self.operator {
                        TolerationOperator::Exists => true,
                        TolerationOperator::Equal => self.value == taint.value,
                    }
            }
        }
    }
}

/// A runtime host registered with the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    /// Unique per owner.
    pub name: String,
    /// User that registered the node.
    pub owner: String,
    /// Runtime kind advertised by the agent, e.g. `node` or `universal`.
    pub runtime_type: String,
    pub allocatable: Resources,
    #[serde(default)]
    pub allocated: Resources,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Node {
    /// Headroom left on the node: `allocatable − allocated`.
    pub fn available(&self) -> Resources {
        self.allocatable.saturating_sub(&self.allocated)
    }

    /// A pack runtime tag is compatible when it matches the node runtime or
    /// is `universal`.
    pub fn accepts_runtime(&self, runtime_tag: &str) -> bool {
        runtime_tag == "universal" || runtime_tag == self.runtime_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: &str, effect: TaintEffect) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.to_string(),
            effect,
        }
    }

    #[test]
    fn equal_toleration_requires_matching_value() {
        let tol = Toleration {
            key: Some("disk".to_string()),
            operator: TolerationOperator::Equal,
            value: "ssd".to_string(),
            effect: Some(TaintEffect::NoSchedule),
        };
        assert!(tol.tolerates(&taint("disk", "ssd", TaintEffect::NoSchedule)));
        assert!(!tol.tolerates(&taint("disk", "hdd", TaintEffect::NoSchedule)));
        assert!(!tol.tolerates(&taint("disk", "ssd", TaintEffect::NoExecute)));
    }

    #[test]
    fn exists_toleration_ignores_value() {
        let tol = Toleration {
            key: Some("disk".to_string()),
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(tol.tolerates(&taint("disk", "hdd", TaintEffect::NoExecute)));
        assert!(!tol.tolerates(&taint("gpu", "", TaintEffect::NoSchedule)));
    }

    #[test]
    fn empty_key_tolerates_everything_with_exists() {
        let tol = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: String::new(),
            effect: None,
        };
        assert!(tol.tolerates(&taint("anything", "at-all", TaintEffect::NoExecute)));
    }

    #[test]
    fn universal_runtime_is_accepted_anywhere() {
        let node = Node {
            id: "n1".to_string(),
            name: "worker".to_string(),
            owner: "admin".to_string(),
            runtime_type: "node".to_string(),
            allocatable: Resources::new(100, 256),
            allocated: Resources::default(),
            labels: HashMap::new(),
            taints: vec![],
            status: NodeStatus::Online,
            last_heartbeat: None,
        };
        assert!(node.accepts_runtime("universal"));
        assert!(node.accepts_runtime("node"));
        assert!(!node.accepts_runtime("browser"));
    }
}
