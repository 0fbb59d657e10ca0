use serde::{Deserialize, Serialize};

use crate::pod::PreemptionPolicy;

/// Reserved class names. Pods referencing them may only be preempted by a
/// strictly higher system-critical priority.
pub const SYSTEM_CLUSTER_CRITICAL: &str = "system-cluster-critical";
pub const SYSTEM_NODE_CRITICAL: &str = "system-node-critical";

/// Values at or above this are reserved for the system classes.
pub const SYSTEM_CRITICAL_FLOOR: i64 = 2_000_000_000;

pub fn is_system_critical_name(name: &str) -> bool {
    name == SYSTEM_CLUSTER_CRITICAL || name == SYSTEM_NODE_CRITICAL
}

/// A named priority value pods reference by `priorityClassName`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityClass {
    pub name: String,
    /// Higher means more important.
    pub value: i64,
    #[serde(default)]
    pub preemption_policy: PreemptionPolicy,
    /// At most one class may be the global default.
    #[serde(default)]
    pub global_default: bool,
}

impl PriorityClass {
    pub fn is_system_critical(&self) -> bool {
        is_system_critical_name(&self.name)
    }

    pub fn system_cluster_critical() -> Self {
        PriorityClass {
            name: SYSTEM_CLUSTER_CRITICAL.to_string(),
            value: SYSTEM_CRITICAL_FLOOR + 1_000_000,
            preemption_policy: PreemptionPolicy::PreemptLowerPriority,
            global_default: false,
        }
    }

    pub fn system_node_critical() -> Self {
        PriorityClass {
            name: SYSTEM_NODE_CRITICAL.to_string(),
            value: SYSTEM_CRITICAL_FLOOR + 2_000_000,
            preemption_policy: PreemptionPolicy::PreemptLowerPriority,
            global_default: false,
        }
    }
}
