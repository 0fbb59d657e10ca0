use std::collections::HashMap;

use common::{ErrorCode, PodScheduling, PreemptionPolicy, Resources};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub enable_preemption: bool,
    pub default_priority: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            enable_preemption: false,
            default_priority: 0,
        }
    }
}

/// Admission input for a new pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInput {
    pub pack_id: String,
    pub pack_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Overrides the class policy when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preemption_policy: Option<PreemptionPolicy>,
    #[serde(default)]
    pub resource_requests: Resources,
    #[serde(default)]
    pub resource_limits: Resources,
    #[serde(default)]
    pub scheduling: PodScheduling,
}

/// Why admission left a pod pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScheduleFailure {
    AlreadyScheduled,
    NoFeasibleNode,
    PreemptionBlocked,
    InsufficientCapacityEvenWithPreemption,
    RuntimeIncompatible,
}

impl ScheduleFailure {
    pub fn code(&self) -> ErrorCode {
        match self {
            ScheduleFailure::AlreadyScheduled => ErrorCode::Conflict,
            ScheduleFailure::NoFeasibleNode => ErrorCode::InsufficientCapacity,
            ScheduleFailure::PreemptionBlocked => ErrorCode::PreemptionBlocked,
            ScheduleFailure::InsufficientCapacityEvenWithPreemption => {
                ErrorCode::InsufficientCapacity
            }
            ScheduleFailure::RuntimeIncompatible => ErrorCode::RuntimeIncompatible,
        }
    }
}

/// Admission result reported back to the caller. A failed admission keeps the
/// pod `pending`; it is retried on cluster change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingOutcome {
    pub scheduled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ScheduleFailure>,
    /// Victims evicted to make room.
    #[serde(default)]
    pub evicted: Vec<String>,
}

impl SchedulingOutcome {
    pub fn placed(node_id: String, evicted: Vec<String>) -> Self {
        SchedulingOutcome {
            scheduled: true,
            node_id: Some(node_id),
            reason: None,
            evicted,
        }
    }

    pub fn unplaced(reason: ScheduleFailure) -> Self {
        SchedulingOutcome {
            scheduled: false,
            node_id: None,
            reason: Some(reason),
            evicted: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub pod_id: String,
    pub node_id: String,
}

/// Placement decisions surfaced to the control-plane driver, which turns them
/// into `pod:deploy` / `pod:stop` commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingEvent {
    Assigned {
        pod_id: String,
        node_id: String,
    },
    Evicted {
        pod_id: String,
        node_id: String,
        reason: String,
    },
}
