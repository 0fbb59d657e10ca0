use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::Toleration;
use crate::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PodStatus {
    Pending,
    Scheduled,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Evicted,
}

impl PodStatus {
    /// Statuses during which the pod occupies a node and counts against its
    /// allocation.
    pub fn holds_node(&self) -> bool {
        matches!(
            self,
            PodStatus::Scheduled | PodStatus::Starting | PodStatus::Running | PodStatus::Stopping
        )
    }

    /// Statuses eligible as preemption victims.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PodStatus::Scheduled | PodStatus::Starting | PodStatus::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PodStatus::Stopped | PodStatus::Failed | PodStatus::Evicted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreemptionPolicy {
    #[default]
    PreemptLowerPriority,
    Never,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodScheduling {
    /// Labels a node must carry for the pod to land on it.
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Additional required node labels.
    #[serde(default)]
    pub affinity: HashMap<String, String>,
    /// Node labels that bar placement.
    #[serde(default)]
    pub anti_affinity: HashMap<String, String>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
}

/// A scheduled instance of a pack. The scheduler owns transitions between
/// `pending`, `scheduled` and `evicted`; the node agent owns the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub id: String,
    pub pack_id: String,
    pub pack_version: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Resolved at admission and frozen afterwards.
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    #[serde(default)]
    pub preemption_policy: PreemptionPolicy,
    #[serde(default)]
    pub resource_requests: Resources,
    #[serde(default)]
    pub resource_limits: Resources,
    #[serde(default)]
    pub scheduling: PodScheduling,
    pub status: PodStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Pod {
    /// Checks the `nodeId iff status holds a node` record invariant.
    pub fn placement_consistent(&self) -> bool {
        self.node_id.is_some() == self.status.holds_node()
    }
}
