use std::collections::HashMap;

use chrono::{Duration, Utc};
use common::{
    Node, OrchestratorError, OrchestratorResult, Pack, Pod, PodStatus, PreemptionPolicy,
    PriorityClass, Resources, is_system_critical_name,
};

/// Outcome of priority-class resolution at admission. Frozen on the pod.
#[derive(Debug, Clone)]
pub struct ResolvedPriority {
    pub value: i64,
    pub class_name: Option<String>,
    pub class_policy: PreemptionPolicy,
}

/// The authoritative in-memory record of nodes, pods, packs and priority
/// classes. All mutation goes through the scheduler and the node manager;
/// everything else reads snapshots.
#[derive(Default)]
pub struct ClusterState {
    nodes: HashMap<String, Node>,
    /// Insertion order, the final scheduling tie-break.
    node_order: Vec<String>,
    pods: HashMap<String, Pod>,
    packs: HashMap<String, Pack>,
    priority_classes: HashMap<String, PriorityClass>,
}

/// Lifecycle edges. The scheduler owns `pending ↔ scheduled ↔ evicted`; the
/// node agent reports the rest. `evicted`, `stopped` and `failed` are
/// terminal.
pub fn valid_transition(from: PodStatus, to: PodStatus) -> bool {
    use PodStatus::*;
    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Scheduled, Starting)
            | (Scheduled, Stopping)
            | (Scheduled, Failed)
            | (Scheduled, Evicted)
            | (Scheduled, Pending)
            | (Starting, Running)
            | (Starting, Stopping)
            | (Starting, Failed)
            | (Starting, Evicted)
            | (Starting, Pending)
            | (Running, Stopping)
            | (Running, Stopped)
            | (Running, Failed)
            | (Running, Evicted)
            | (Running, Pending)
            | (Stopping, Stopped)
            | (Stopping, Failed)
            | (Stopping, Pending)
    )
}

/// Requests charged against a node: every pod occupies at least one slot in
/// the `pods` dimension.
pub fn effective_requests(pod: &Pod) -> Resources {
    let mut requests = pod.resource_requests;
    requests.pods = requests.pods.max(1);
    requests
}

impl ClusterState {
    pub fn new() -> Self {
        ClusterState::default()
    }

    // ---- nodes ----

    pub fn upsert_node(&mut self, node: Node) {
        if !self.nodes.contains_key(&node.id) {
            self.node_order.push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove_node(&mut self, node_id: &str) -> Option<Node> {
        self.node_order.retain(|id| id != node_id);
        self.nodes.remove(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    pub fn node_by_name(&self, owner: &str, name: &str) -> Option<&Node> {
        self.nodes
            .values()
            .find(|n| n.owner == owner && n.name == name)
    }

    /// Nodes in registration order.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ---- packs ----

    /// Packs are immutable once registered: re-registering an identical
    /// document is a no-op, anything else is a conflict.
    pub fn register_pack(&mut self, pack: Pack) -> OrchestratorResult<()> {
        if let Some(existing) = self.packs.get(&pack.id) {
            if *existing == pack {
                return Ok(());
            }
            return Err(OrchestratorError::conflict(format!(
                "pack {} is immutable",
                pack.id
            )));
        }
        self.packs.insert(pack.id.clone(), pack);
        Ok(())
    }

    pub fn pack(&self, pack_id: &str) -> Option<&Pack> {
        self.packs.get(pack_id)
    }

    pub fn packs(&self) -> impl Iterator<Item = &Pack> {
        self.packs.values()
    }

    // ---- priority classes ----

    pub fn add_priority_class(&mut self, class: PriorityClass) -> OrchestratorResult<()> {
        if self.priority_classes.contains_key(&class.name) {
            return Err(OrchestratorError::conflict(format!(
                "priority class {} already exists",
                class.name
            )));
        }
        if class.global_default
            && self.priority_classes.values().any(|c| c.global_default)
        {
            return Err(OrchestratorError::validation(
                "at most one priority class may be the global default",
            ));
        }
        self.priority_classes.insert(class.name.clone(), class);
        Ok(())
    }

    pub fn priority_class(&self, name: &str) -> Option<&PriorityClass> {
        self.priority_classes.get(name)
    }

    /// Resolve a pod's priority at admission: a known class wins, otherwise
    /// the global default class, otherwise `default_priority`.
    pub fn resolve_priority(
        &self,
        class_name: Option<&str>,
        default_priority: i64,
    ) -> ResolvedPriority {
        if let Some(name) = class_name
            && let Some(class) = self.priority_classes.get(name)
        {
            return ResolvedPriority {
                value: class.value,
                class_name: Some(class.name.clone()),
                class_policy: class.preemption_policy,
            };
        }
        if let Some(class) = self.priority_classes.values().find(|c| c.global_default) {
            return ResolvedPriority {
                value: class.value,
                class_name: Some(class.name.clone()),
                class_policy: class.preemption_policy,
            };
        }
        ResolvedPriority {
            value: default_priority,
            class_name: None,
            class_policy: PreemptionPolicy::default(),
        }
    }

    // ---- pods ----

    pub fn insert_pod(&mut self, pod: Pod) {
        self.pods.insert(pod.id.clone(), pod);
    }

    pub fn pod(&self, pod_id: &str) -> Option<&Pod> {
        self.pods.get(pod_id)
    }

    pub fn remove_pod(&mut self, pod_id: &str) -> Option<Pod> {
        self.pods.remove(pod_id)
    }

    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn pods_on_node(&self, node_id: &str) -> Vec<&Pod> {
        self.pods
            .values()
            .filter(|p| p.node_id.as_deref() == Some(node_id) && p.status.holds_node())
            .collect()
    }

    pub fn pod_is_system_critical(&self, pod: &Pod) -> bool {
        pod.priority_class_name
            .as_deref()
            .is_some_and(is_system_critical_name)
    }

    /// Bump `updated_at` strictly forward so transitions linearize.
    fn touch(pod: &mut Pod) {
        let now = Utc::now();
        pod.updated_at = if now > pod.updated_at {
            now
        } else {
            pod.updated_at + Duration::milliseconds(1)
        };
    }

    /// Record a lifecycle edge without placement side effects.
    pub fn set_pod_status(&mut self, pod_id: &str, to: PodStatus) -> OrchestratorResult<()> {
        let pod = self
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("pod {pod_id} not found")))?;
        if !valid_transition(pod.status, to) {
            return Err(OrchestratorError::internal(format!(
                "invalid pod transition {:?} -> {to:?} for {pod_id}",
                pod.status
            )));
        }
        pod.status = to;
        Self::touch(pod);
        Ok(())
    }

    /// Place a pending pod on a node and charge its allocation.
    pub fn bind_pod(&mut self, pod_id: &str, node_id: &str) -> OrchestratorResult<()> {
        let requests = {
            let pod = self
                .pods
                .get(pod_id)
                .ok_or_else(|| OrchestratorError::not_found(format!("pod {pod_id} not found")))?;
            if pod.status != PodStatus::Pending {
                return Err(OrchestratorError::internal(format!(
                    "cannot bind pod {pod_id} in status {:?}",
                    pod.status
                )));
            }
            effective_requests(pod)
        };
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("node {node_id} not found")))?;
        if !requests.fits(&node.available()) {
            return Err(OrchestratorError::new(
                common::ErrorCode::InsufficientCapacity,
                format!("node {node_id} cannot hold pod {pod_id}"),
            ));
        }
        node.allocated = node.allocated.saturating_add(&requests);
        let pod = self.pods.get_mut(pod_id).unwrap();
        pod.node_id = Some(node_id.to_string());
        pod.status = PodStatus::Scheduled;
        Self::touch(pod);
        Ok(())
    }

    /// Take a pod off its node, release the allocation, and move it to a
    /// node-less status (`pending`, `evicted`, `stopped` or `failed`).
    pub fn unbind_pod(&mut self, pod_id: &str, to: PodStatus) -> OrchestratorResult<()> {
        if to.holds_node() {
            return Err(OrchestratorError::internal(format!(
                "unbind target {to:?} still holds a node"
            )));
        }
        let (requests, node_id) = {
            let pod = self
                .pods
                .get(pod_id)
                .ok_or_else(|| OrchestratorError::not_found(format!("pod {pod_id} not found")))?;
            if !valid_transition(pod.status, to) {
                return Err(OrchestratorError::internal(format!(
                    "invalid pod transition {:?} -> {to:?} for {pod_id}",
                    pod.status
                )));
            }
            (effective_requests(pod), pod.node_id.clone())
        };
        if let Some(node_id) = node_id
            && let Some(node) = self.nodes.get_mut(&node_id)
        {
            node.allocated = node.allocated.saturating_sub(&requests);
        }
        let pod = self.pods.get_mut(pod_id).unwrap();
        pod.node_id = None;
        pod.status = to;
        Self::touch(pod);
        Ok(())
    }

    /// Test hook for the capacity invariant: the sum of requests of pods
    /// holding the node never exceeds its allocatable vector.
    pub fn node_accounting_consistent(&self, node_id: &str) -> bool {
        let Some(node) = self.nodes.get(node_id) else {
            return false;
        };
        let mut sum = Resources::default();
        for pod in self.pods_on_node(node_id) {
            sum = sum.saturating_add(&effective_requests(pod));
        }
        sum.fits(&node.allocatable) && sum == node.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{NodeStatus, PodScheduling};
    use std::collections::HashMap;

    fn node(id: &str, cpu: u64, memory: u64) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            owner: "admin".to_string(),
            runtime_type: "node".to_string(),
            allocatable: Resources {
                cpu,
                memory,
                pods: 100,
                storage: 0,
            },
            allocated: Resources::default(),
            labels: HashMap::new(),
            taints: vec![],
            status: NodeStatus::Online,
            last_heartbeat: None,
        }
    }

    fn pod(id: &str, cpu: u64, memory: u64) -> Pod {
        let now = Utc::now();
        Pod {
            id: id.to_string(),
            pack_id: "pack".to_string(),
            pack_version: "1.0.0".to_string(),
            namespace: "default".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            priority: 0,
            priority_class_name: None,
            preemption_policy: Default::default(),
            resource_requests: Resources::new(cpu, memory),
            resource_limits: Resources::default(),
            scheduling: PodScheduling::default(),
            status: PodStatus::Pending,
            node_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn bind_charges_and_unbind_releases() {
        let mut state = ClusterState::new();
        state.upsert_node(node("n1", 100, 256));
        state.insert_pod(pod("p1", 80, 200));

        state.bind_pod("p1", "n1").unwrap();
        assert_eq!(state.node("n1").unwrap().allocated.cpu, 80);
        assert!(state.node_accounting_consistent("n1"));

        state.unbind_pod("p1", PodStatus::Evicted).unwrap();
        assert!(state.node("n1").unwrap().allocated.is_zero());
        let p = state.pod("p1").unwrap();
        assert!(p.node_id.is_none());
        assert_eq!(p.status, PodStatus::Evicted);
    }

    #[test]
    fn bind_rejects_overcommit() {
        let mut state = ClusterState::new();
        state.upsert_node(node("n1", 100, 256));
        state.insert_pod(pod("p1", 80, 200));
        state.insert_pod(pod("p2", 80, 200));

        state.bind_pod("p1", "n1").unwrap();
        let err = state.bind_pod("p2", "n1").unwrap_err();
        assert_eq!(err.code, common::ErrorCode::InsufficientCapacity);
    }

    #[test]
    fn evicted_is_terminal() {
        let mut state = ClusterState::new();
        state.upsert_node(node("n1", 100, 256));
        state.insert_pod(pod("p1", 10, 10));
        state.bind_pod("p1", "n1").unwrap();
        state.unbind_pod("p1", PodStatus::Evicted).unwrap();

        let err = state.set_pod_status("p1", PodStatus::Running).unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Internal);
        let err = state.set_pod_status("p1", PodStatus::Pending).unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Internal);
    }

    #[test]
    fn updated_at_is_strictly_monotonic() {
        let mut state = ClusterState::new();
        state.upsert_node(node("n1", 100, 256));
        state.insert_pod(pod("p1", 1, 1));
        let t0 = state.pod("p1").unwrap().updated_at;

        state.bind_pod("p1", "n1").unwrap();
        let t1 = state.pod("p1").unwrap().updated_at;
        state.set_pod_status("p1", PodStatus::Starting).unwrap();
        let t2 = state.pod("p1").unwrap().updated_at;
        assert!(t1 > t0);
        assert!(t2 > t1);
    }

    #[test]
    fn duplicate_global_default_rejected() {
        let mut state = ClusterState::new();
        state
            .add_priority_class(PriorityClass {
                name: "default".to_string(),
                value: 100,
                preemption_policy: Default::default(),
                global_default: true,
            })
            .unwrap();
        let err = state
            .add_priority_class(PriorityClass {
                name: "default-2".to_string(),
                value: 200,
                preemption_policy: Default::default(),
                global_default: true,
            })
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Validation);
    }

    #[test]
    fn priority_resolution_order() {
        let mut state = ClusterState::new();
        state
            .add_priority_class(PriorityClass {
                name: "high".to_string(),
                value: 1000,
                preemption_policy: Default::default(),
                global_default: false,
            })
            .unwrap();
        state
            .add_priority_class(PriorityClass {
                name: "standard".to_string(),
                value: 100,
                preemption_policy: common::PreemptionPolicy::Never,
                global_default: true,
            })
            .unwrap();

        let known = state.resolve_priority(Some("high"), 0);
        assert_eq!(known.value, 1000);
        assert_eq!(known.class_name.as_deref(), Some("high"));

        let unknown = state.resolve_priority(Some("no-such-class"), 0);
        assert_eq!(unknown.value, 100);
        assert_eq!(unknown.class_name.as_deref(), Some("standard"));
        assert_eq!(unknown.class_policy, common::PreemptionPolicy::Never);

        let empty = ClusterState::new();
        let fallback = empty.resolve_priority(None, 7);
        assert_eq!(fallback.value, 7);
        assert!(fallback.class_name.is_none());
    }

    #[test]
    fn packs_are_immutable() {
        let mut state = ClusterState::new();
        let pack = Pack {
            id: "pk1".to_string(),
            name: "svc".to_string(),
            version: "1.0.0".to_string(),
            runtime_tag: "node".to_string(),
            bundle_path: "bundle.js".to_string(),
            bundle_content: None,
            metadata: Default::default(),
            granted_capabilities: Default::default(),
        };
        state.register_pack(pack.clone()).unwrap();
        // Idempotent re-register of the identical document.
        state.register_pack(pack.clone()).unwrap();

        let mut changed = pack;
        changed.bundle_path = "other.js".to_string();
        let err = state.register_pack(changed).unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Conflict);
    }
}
