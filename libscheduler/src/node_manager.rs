use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    Node, NodeStatus, OrchestratorError, OrchestratorResult, Resources, Taint,
};
use log::{debug, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, RwLock};

use crate::state::ClusterState;

#[derive(Debug, Clone, Copy)]
pub struct NodeManagerConfig {
    /// Heartbeat cadence expected from agents.
    pub heartbeat_interval: Duration,
    /// How long an offline node keeps its pods before they return to
    /// `pending`.
    pub offline_grace: Duration,
    pub scan_interval: Duration,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        NodeManagerConfig {
            heartbeat_interval: Duration::from_secs(15),
            offline_grace: Duration::from_secs(30),
            scan_interval: Duration::from_secs(5),
        }
    }
}

/// A node is declared dead after missing this many expected heartbeats.
const LIVENESS_FACTOR: f64 = 2.5;

#[derive(Debug, Clone, Default)]
pub struct NodeRegistration {
    pub name: String,
    pub runtime_type: String,
    pub capabilities: Vec<String>,
    pub allocatable: Resources,
    pub labels: HashMap<String, String>,
    pub taints: Vec<Taint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Missed heartbeats; pods are released after the grace period.
    Offline { node_id: String },
    Removed { node_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub owner: Option<String>,
    pub status: Option<NodeStatus>,
}

/// Registration, heartbeat bookkeeping and liveness for the node pool.
pub struct NodeManager {
    state: Arc<RwLock<ClusterState>>,
    config: NodeManagerConfig,
    events_tx: UnboundedSender<NodeEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<NodeEvent>>>,
}

impl NodeManager {
    pub fn new(config: NodeManagerConfig, state: Arc<RwLock<ClusterState>>) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        NodeManager {
            state,
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn config(&self) -> NodeManagerConfig {
        self.config
    }

    /// Liveness event stream for the control-plane driver. Can be taken once.
    pub async fn take_events(&self) -> Option<UnboundedReceiver<NodeEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Register a new node for `actor`. `(owner, name)` must be unique.
    pub async fn register(
        &self,
        input: NodeRegistration,
        actor: &str,
    ) -> OrchestratorResult<Node> {
        if input.name.is_empty() {
            return Err(OrchestratorError::validation("node name must not be empty"));
        }
        let mut state = self.state.write().await;
        if state.node_by_name(actor, &input.name).is_some() {
            return Err(OrchestratorError::conflict(format!(
                "node name {} is already registered for {actor}",
                input.name
            )));
        }
        let node = Node {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name,
            owner: actor.to_string(),
            runtime_type: input.runtime_type,
            allocatable: input.allocatable,
            allocated: Resources::default(),
            labels: input.labels,
            taints: input.taints,
            status: NodeStatus::Online,
            last_heartbeat: Some(Utc::now()),
        };
        state.upsert_node(node.clone());
        info!("registered node {} ({}) for {actor}", node.name, node.id);
        Ok(node)
    }

    /// Re-attach a known node after a connection loss. Allocations are
    /// retained across the gap.
    pub async fn reconnect(&self, node_id: &str) -> OrchestratorResult<Node> {
        let mut state = self.state.write().await;
        let node = state
            .node_mut(node_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("node {node_id} not found")))?;
        node.status = NodeStatus::Online;
        node.last_heartbeat = Some(Utc::now());
        info!("node {} ({node_id}) reconnected", node.name);
        Ok(node.clone())
    }

    /// Record a heartbeat. Offline nodes must reconnect first.
    pub async fn heartbeat(
        &self,
        node_id: &str,
        reported_allocated: Resources,
        ts: chrono::DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        let node = state
            .node_mut(node_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("node {node_id} not found")))?;
        if node.status == NodeStatus::Offline {
            return Err(OrchestratorError::conflict(format!(
                "node {node_id} is offline; reconnect required"
            )));
        }
        if reported_allocated != node.allocated {
            // The scheduler's accounting is authoritative; the agent view is
            // informational.
            debug!(
                "node {node_id} reports allocated {reported_allocated:?}, record says {:?}",
                node.allocated
            );
        }
        node.last_heartbeat = Some(ts);
        Ok(())
    }

    /// Stop placing new pods on the node; running pods keep going.
    pub async fn drain(&self, node_id: &str) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        let node = state
            .node_mut(node_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("node {node_id} not found")))?;
        node.status = NodeStatus::Draining;
        info!("node {node_id} draining");
        Ok(())
    }

    pub async fn remove(&self, node_id: &str) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        state
            .remove_node(node_id)
            .ok_or_else(|| OrchestratorError::not_found(format!("node {node_id} not found")))?;
        drop(state);
        let _ = self.events_tx.send(NodeEvent::Removed {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    pub async fn list(&self, filter: NodeFilter) -> Vec<Node> {
        let state = self.state.read().await;
        state
            .nodes_in_order()
            .filter(|n| filter.owner.as_deref().is_none_or(|o| n.owner == o))
            .filter(|n| filter.status.is_none_or(|s| n.status == s))
            .cloned()
            .collect()
    }

    /// One liveness sweep: flip nodes that missed heartbeats to offline.
    pub async fn scan_once(&self) {
        let deadline =
            self.config.heartbeat_interval.as_secs_f64() * LIVENESS_FACTOR;
        let now = Utc::now();
        let mut flipped = Vec::new();
        {
            let mut state = self.state.write().await;
            let stale: Vec<String> = state
                .nodes_in_order()
                .filter(|n| n.status == NodeStatus::Online)
                .filter(|n| {
                    n.last_heartbeat.is_none_or(|hb| {
                        (now - hb).num_milliseconds() as f64 / 1000.0 > deadline
                    })
                })
                .map(|n| n.id.clone())
                .collect();
            for node_id in stale {
                if let Some(node) = state.node_mut(&node_id) {
                    warn!("node {} ({node_id}) missed heartbeats, marking offline", node.name);
                    node.status = NodeStatus::Offline;
                    flipped.push(node_id);
                }
            }
        }
        for node_id in flipped {
            let _ = self.events_tx.send(NodeEvent::Offline { node_id });
        }
    }

    /// Spawn the periodic liveness scanner.
    pub fn run(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(manager.config.scan_interval);
            loop {
                timer.tick().await;
                manager.scan_once().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn manager() -> (Arc<NodeManager>, Arc<RwLock<ClusterState>>) {
        let state = Arc::new(RwLock::new(ClusterState::new()));
        let manager = Arc::new(NodeManager::new(NodeManagerConfig::default(), state.clone()));
        (manager, state)
    }

    fn registration(name: &str) -> NodeRegistration {
        NodeRegistration {
            name: name.to_string(),
            runtime_type: "node".to_string(),
            capabilities: vec![],
            allocatable: Resources {
                cpu: 100,
                memory: 256,
                pods: 10,
                storage: 0,
            },
            labels: HashMap::new(),
            taints: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_name_per_owner_conflicts() {
        let (manager, _) = manager();
        manager.register(registration("w1"), "alice").await.unwrap();
        let err = manager
            .register(registration("w1"), "alice")
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Conflict);
        // A different owner may reuse the name.
        manager.register(registration("w1"), "bob").await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_updates_only_last_heartbeat() {
        let (manager, state) = manager();
        let node = manager.register(registration("w1"), "alice").await.unwrap();

        let ts = Utc::now() + ChronoDuration::seconds(1);
        manager
            .heartbeat(&node.id, Resources::default(), ts)
            .await
            .unwrap();
        let after = state.read().await.node(&node.id).cloned().unwrap();
        assert_eq!(after.last_heartbeat, Some(ts));
        assert_eq!(after.allocated, node.allocated);
        assert_eq!(after.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn offline_nodes_reject_heartbeats_until_reconnect() {
        let (manager, state) = manager();
        let node = manager.register(registration("w1"), "alice").await.unwrap();
        state.write().await.node_mut(&node.id).unwrap().status = NodeStatus::Offline;

        let err = manager
            .heartbeat(&node.id, Resources::default(), Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Conflict);

        let back = manager.reconnect(&node.id).await.unwrap();
        assert_eq!(back.status, NodeStatus::Online);
        manager
            .heartbeat(&node.id, Resources::default(), Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconnect_retains_allocations() {
        let (manager, state) = manager();
        let node = manager.register(registration("w1"), "alice").await.unwrap();
        {
            let mut guard = state.write().await;
            guard.node_mut(&node.id).unwrap().allocated = Resources::new(40, 80);
            guard.node_mut(&node.id).unwrap().status = NodeStatus::Offline;
        }
        let back = manager.reconnect(&node.id).await.unwrap();
        assert_eq!(back.allocated, Resources::new(40, 80));
    }

    #[tokio::test]
    async fn liveness_scan_flips_stale_nodes_and_emits() {
        let (manager, state) = manager();
        let node = manager.register(registration("w1"), "alice").await.unwrap();
        let mut events = manager.take_events().await.unwrap();

        // Fresh heartbeat: stays online.
        manager.scan_once().await;
        assert_eq!(
            state.read().await.node(&node.id).unwrap().status,
            NodeStatus::Online
        );

        state.write().await.node_mut(&node.id).unwrap().last_heartbeat =
            Some(Utc::now() - ChronoDuration::seconds(60));
        manager.scan_once().await;
        assert_eq!(
            state.read().await.node(&node.id).unwrap().status,
            NodeStatus::Offline
        );
        assert_eq!(
            events.recv().await,
            Some(NodeEvent::Offline {
                node_id: node.id.clone()
            })
        );
    }

    #[tokio::test]
    async fn draining_nodes_stay_in_the_pool() {
        let (manager, _) = manager();
        let node = manager.register(registration("w1"), "alice").await.unwrap();
        manager.drain(&node.id).await.unwrap();

        let draining = manager
            .list(NodeFilter {
                status: Some(NodeStatus::Draining),
                ..Default::default()
            })
            .await;
        assert_eq!(draining.len(), 1);

        manager.remove(&node.id).await.unwrap();
        assert!(manager.list(NodeFilter::default()).await.is_empty());
    }
}
