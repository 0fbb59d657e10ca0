use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use common::Request;
use libstore::{DocumentStore, StoreError, StoreEvent, keys, put_json};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::docs::{RouterNodeDoc, ServiceDoc};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub user: String,
    /// How many routers share this user's request stream.
    pub num_routers: u32,
    pub router_index: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            user: "default".to_string(),
            num_routers: 1,
            router_index: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RoundRobin {
    num_pods: u32,
    cur_pod: u32,
}

#[derive(Debug, Default)]
struct ServiceState {
    /// Last seen service document, kept so late-arriving nodes can seed.
    node_pods: HashMap<String, u32>,
    per_node: HashMap<String, RoundRobin>,
    /// Stable node scan order; the cursor continues across dispatches.
    order: Vec<String>,
    next_node: usize,
}

impl ServiceState {
    /// Pick the next `(node, pod)` slot round-robin, or `None` when no node
    /// can accept.
    fn pick(&mut self) -> Option<(String, u32)> {
        if self.order.is_empty() {
            return None;
        }
        for i in 0..self.order.len() {
            let idx = (self.next_node + i) % self.order.len();
            let node = self.order[idx].clone();
            if let Some(rr) = self.per_node.get_mut(&node)
                && rr.num_pods > 0
            {
                let pod = rr.cur_pod % rr.num_pods;
                rr.cur_pod = (rr.cur_pod + 1) % rr.num_pods;
                self.next_node = (idx + 1) % self.order.len();
                return Some((node, pod));
            }
        }
        None
    }
}

/// One router of a user's routing tier. Watches the node, service and
/// request feeds and assigns new requests to pod instances round-robin.
pub struct Router {
    store: Arc<dyn DocumentStore>,
    config: RouterConfig,
    node_dbs: HashMap<String, RouterNodeDoc>,
    services: HashMap<String, ServiceState>,
}

impl Router {
    pub fn new(store: Arc<dyn DocumentStore>, config: RouterConfig) -> Self {
        Router {
            store,
            config,
            node_dbs: HashMap::new(),
            services: HashMap::new(),
        }
    }

    /// Deterministic admission stripe: the request's birth millisecond picks
    /// exactly one router, with no coordination.
    fn handles(&self, request: &Request) -> bool {
        if self.config.num_routers <= 1 {
            return self.config.router_index == 0;
        }
        let millis = request
            .time_new
            .map(|t| t.timestamp_millis().rem_euclid(500))
            .unwrap_or(0);
        let stripe = (millis as f64 * (self.config.num_routers - 1) as f64 / 500.0).round() as u32;
        stripe == self.config.router_index
    }

    fn apply_node(&mut self, doc: RouterNodeDoc) {
        let name = doc.name.clone();
        let fresh = !self.node_dbs.contains_key(&name);
        self.node_dbs.insert(name.clone(), doc);
        if !fresh {
            return;
        }
        // Pre-seed counters at zero for services already naming this node.
        for state in self.services.values_mut() {
            if let Some(num_pods) = state.node_pods.get(&name).copied()
                && !state.per_node.contains_key(&name)
            {
                state.per_node.insert(
                    name.clone(),
                    RoundRobin {
                        num_pods,
                        cur_pod: 0,
                    },
                );
                state.order.push(name.clone());
            }
        }
    }

    fn remove_node(&mut self, name: &str) {
        self.node_dbs.remove(name);
        for state in self.services.values_mut() {
            state.per_node.remove(name);
            state.order.retain(|n| n != name);
            if !state.order.is_empty() {
                state.next_node %= state.order.len();
            } else {
                state.next_node = 0;
            }
        }
    }

    /// Refresh a service's pod counts without losing in-flight cursors,
    /// unless the node disappeared from the service.
    fn apply_service(&mut self, doc: ServiceDoc) {
        let state = self.services.entry(doc.name.clone()).or_default();
        let mut per_node = HashMap::new();
        let mut order = Vec::new();
        for (node, num_pods) in &doc.node_pods {
            if !self.node_dbs.contains_key(node) {
                continue;
            }
            let cur_pod = state
                .per_node
                .get(node)
                .map(|rr| rr.cur_pod % (*num_pods).max(1))
                .unwrap_or(0);
            per_node.insert(
                node.clone(),
                RoundRobin {
                    num_pods: *num_pods,
                    cur_pod,
                },
            );
            order.push(node.clone());
        }
        order.sort();
        state.node_pods = doc.node_pods;
        state.per_node = per_node;
        if state.order != order {
            state.order = order;
            state.next_node = 0;
        }
    }

    fn remove_service(&mut self, name: &str) {
        self.services.remove(name);
    }

    /// Route one new request, if this router owns it and a slot exists.
    /// Requests that cannot be placed stay untouched for a later retry.
    async fn maybe_dispatch(&mut self, mut request: Request) {
        if !request.is_new || request.target.is_some() || request.is_deleted {
            return;
        }
        if !self.handles(&request) {
            return;
        }
        let Some(state) = self.services.get_mut(&request.service) else {
            debug!("service {} not known yet, leaving request {}", request.service, request.id);
            return;
        };
        let Some((node, pod)) = state.pick() else {
            debug!("no capacity for request {} yet", request.id);
            return;
        };
        let inbox = self
            .node_dbs
            .get(&node)
            .map(|doc| doc.inbox().to_string())
            .unwrap_or_else(|| node.clone());

        request.target = Some(inbox);
        request.target_pod = Some(pod);
        request.is_new = false;
        request.time_route = Some(Utc::now());

        let key = keys::user_request_key(&self.config.user, &request.id);
        // A lost race with another router just rewrites the same decision.
        if let Err(e) = put_json(self.store.as_ref(), &key, &request).await {
            warn!("routing write for {} failed: {e}", request.id);
        } else {
            debug!(
                "routed request {} to {}:{}",
                request.id,
                request.target.as_deref().unwrap_or(""),
                pod
            );
        }
    }

    async fn seed(&mut self) -> Result<(), StoreError> {
        let nodes = self
            .store
            .list(&keys::user_nodes_prefix(&self.config.user))
            .await?;
        for (_, raw) in nodes {
            if let Ok(doc) = serde_json::from_str::<RouterNodeDoc>(&raw) {
                self.apply_node(doc);
            }
        }
        let services = self
            .store
            .list(&keys::user_services_prefix(&self.config.user))
            .await?;
        for (_, raw) in services {
            if let Ok(doc) = serde_json::from_str::<ServiceDoc>(&raw) {
                self.apply_service(doc);
            }
        }
        Ok(())
    }

    /// Run until cancelled. Consumes the node, service and request feeds.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), StoreError> {
        let user = self.config.user.clone();
        let mut node_feed = self.store.watch(&keys::user_nodes_prefix(&user)).await?;
        let mut service_feed = self.store.watch(&keys::user_services_prefix(&user)).await?;
        let mut request_feed = self.store.watch(&keys::user_requests_prefix(&user)).await?;

        self.seed().await?;

        // Anything already enqueued before this router came up.
        let backlog = self
            .store
            .list(&keys::user_requests_prefix(&user))
            .await?;
        for (_, raw) in backlog {
            if let Ok(request) = serde_json::from_str::<Request>(&raw) {
                self.maybe_dispatch(request).await;
            }
        }

        info!(
            "router {}/{} for user {user} started",
            self.config.router_index, self.config.num_routers
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = node_feed.next() => match event {
                    Some(StoreEvent::Put { value, .. }) => {
                        if let Ok(doc) = serde_json::from_str::<RouterNodeDoc>(&value) {
                            self.apply_node(doc);
                        }
                    }
                    Some(StoreEvent::Delete { key, .. }) => {
                        if let Some(name) = keys::last_segment(&key) {
                            self.remove_node(name);
                        }
                    }
                    None => return Err(StoreError::FeedClosed),
                },
                event = service_feed.next() => match event {
                    Some(StoreEvent::Put { value, .. }) => {
                        if let Ok(doc) = serde_json::from_str::<ServiceDoc>(&value) {
                            self.apply_service(doc);
                        }
                    }
                    Some(StoreEvent::Delete { key, .. }) => {
                        if let Some(name) = keys::last_segment(&key) {
                            self.remove_service(name);
                        }
                    }
                    None => return Err(StoreError::FeedClosed),
                },
                event = request_feed.next() => match event {
                    Some(StoreEvent::Put { value, .. }) => {
                        if let Ok(request) = serde_json::from_str::<Request>(&value) {
                            self.maybe_dispatch(request).await;
                        }
                    }
                    Some(StoreEvent::Delete { .. }) => {}
                    None => return Err(StoreError::FeedClosed),
                },
            }
        }
    }
}
