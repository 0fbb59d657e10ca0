use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use common::{ErrorCode, Request, RequestMode, Response};
use libstore::{DocumentStore, StoreError, StoreEvent, get_json, keys, put_json};
use log::{debug, warn};
use rand::Rng;
use tokio::sync::{Mutex, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::retry::{RetryPolicy, retry_until_cancelled};

#[derive(Debug, thiserror::Error)]
pub enum RequesterError {
    #[error("request timed out")]
    Timeout,
    #[error("requester stopped")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RequesterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequesterError::Timeout => ErrorCode::Timeout,
            RequesterError::Cancelled => ErrorCode::Cancelled,
            RequesterError::Store(_) => ErrorCode::TransientIo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequesterConfig {
    pub user: String,
    /// Node name of the pod this requester belongs to.
    pub node: String,
    pub pod_index: u32,
    pub request_timeout: Duration,
    /// Services hosted on this pod's own node, with their instance counts.
    /// Eligible for the router-bypassing local shortcut.
    pub local_services: HashMap<String, u32>,
    /// Balanced services never use sticky routes.
    pub balanced_services: HashSet<String>,
}

impl Default for RequesterConfig {
    fn default() -> Self {
        RequesterConfig {
            user: "default".to_string(),
            node: String::new(),
            pod_index: 0,
            request_timeout: Duration::from_secs(10),
            local_services: HashMap::new(),
            balanced_services: HashSet::new(),
        }
    }
}

/// Sticky destination for an unbalanced service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRoute {
    pub target: String,
    pub target_pod: u32,
    pub is_remote: bool,
}

struct Pending {
    resolve: oneshot::Sender<Response>,
    timeout: JoinHandle<()>,
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    config: RequesterConfig,
    current_requests: Mutex<HashMap<String, Pending>>,
    current_service_routes: Mutex<HashMap<String, ServiceRoute>>,
    broadcast_tx: broadcast::Sender<Response>,
    cancel: CancellationToken,
}

/// Per-pod outbound client: writes request documents for the router tier,
/// matches the response feed back to callers, and times out the rest.
pub struct Requester {
    shared: Arc<Shared>,
}

impl Requester {
    pub fn new(store: Arc<dyn DocumentStore>, config: RequesterConfig) -> Self {
        let (broadcast_tx, _) = broadcast::channel(64);
        Requester {
            shared: Arc::new(Shared {
                store,
                config,
                current_requests: Mutex::new(HashMap::new()),
                current_service_routes: Mutex::new(HashMap::new()),
                broadcast_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start consuming the response feed. Must be called once before
    /// issuing requests.
    pub async fn run(&self) -> Result<(), StoreError> {
        let mut feed = self
            .shared
            .store
            .watch(&keys::user_responses_prefix(&self.shared.config.user))
            .await?;
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    event = feed.next() => match event {
                        Some(StoreEvent::Put { value, .. }) => {
                            if let Ok(response) = serde_json::from_str::<Response>(&value) {
                                Self::response_add(&shared, response).await;
                            }
                        }
                        Some(StoreEvent::Delete { .. }) => {}
                        None => return,
                    },
                }
            }
        });
        Ok(())
    }

    /// Resolve the matching pending request, or surface the response as a
    /// broadcast event. Stale and misaddressed responses are swallowed.
    async fn response_add(shared: &Arc<Shared>, response: Response) {
        if response.target != shared.config.node
            || response.target_pod != shared.config.pod_index
        {
            return;
        }
        let pending = shared
            .current_requests
            .lock()
            .await
            .remove(&response.request_id);
        match pending {
            Some(pending) => {
                pending.timeout.abort();
                Self::record_route_and_delete(shared, &response.request_id).await;
                let _ = pending.resolve.send(response);
            }
            None => {
                debug!("response for {} has no pending request", response.request_id);
                let _ = shared.broadcast_tx.send(response);
            }
        }
    }

    /// Remember where the service answered from (sticky routing for
    /// unbalanced services) and delete the request document.
    async fn record_route_and_delete(shared: &Arc<Shared>, request_id: &str) {
        let key = keys::user_request_key(&shared.config.user, request_id);
        if let Ok(Some(request)) = get_json::<Request>(shared.store.as_ref(), &key).await {
            if request.mode == RequestMode::Single
                && !shared.config.balanced_services.contains(&request.service)
                && let (Some(target), Some(target_pod)) =
                    (request.target.clone(), request.target_pod)
            {
                shared.current_service_routes.lock().await.insert(
                    request.service.clone(),
                    ServiceRoute {
                        target,
                        target_pod,
                        is_remote: request.is_remote,
                    },
                );
            }
        }
        if let Err(e) = delete_request(shared.store.as_ref(), &shared.config.user, request_id).await
        {
            warn!("deleting request {request_id} failed: {e}");
        }
    }

    /// Issue a single-mode request and wait for its one response.
    pub async fn request(
        &self,
        service: &str,
        payload: serde_json::Value,
    ) -> Result<Response, RequesterError> {
        self.request_opts(service, payload, false).await
    }

    /// As `request`, but force the router path even when the service is
    /// hosted locally.
    pub async fn request_opts(
        &self,
        service: &str,
        payload: serde_json::Value,
        remote: bool,
    ) -> Result<Response, RequesterError> {
        let config = &self.shared.config;
        let sticky = self
            .shared
            .current_service_routes
            .lock()
            .await
            .get(service)
            .cloned();

        let direct = if remote {
            None
        } else if let Some(route) = sticky {
            Some((route.target, route.target_pod))
        } else if let Some(&num_pods) = config.local_services.get(service) {
            // Local shortcut: bypass the router, pick any local instance.
            let pod = rand::rng().random_range(0..num_pods.max(1));
            Some((config.node.clone(), pod))
        } else {
            None
        };
        let was_direct = direct.is_some();

        match self.issue(service, payload.clone(), direct, remote, false).await {
            Ok(response) => Ok(response),
            Err(RequesterError::Timeout) if was_direct => {
                // Local (or stale sticky) attempt timed out: clear the route
                // and retry through the router.
                self.shared
                    .current_service_routes
                    .lock()
                    .await
                    .remove(service);
                self.issue(service, payload, None, true, true).await
            }
            Err(e) => {
                self.shared
                    .current_service_routes
                    .lock()
                    .await
                    .remove(service);
                Err(e)
            }
        }
    }

    /// Retry the request with backoff until it succeeds or the requester is
    /// stopped.
    pub async fn request_with_retry(
        &self,
        service: &str,
        payload: serde_json::Value,
    ) -> Result<Response, RequesterError> {
        let cancel = self.shared.cancel.clone();
        retry_until_cancelled(RetryPolicy::default(), &cancel, || {
            self.request(service, payload.clone())
        })
        .await
        .ok_or(RequesterError::Cancelled)
    }

    /// Fire-and-observe: write a broadcast request and surface every
    /// response as an event on `broadcast_events`.
    pub async fn send_broadcast(
        &self,
        service: &str,
        payload: serde_json::Value,
    ) -> Result<String, RequesterError> {
        let config = &self.shared.config;
        let mut request = Request::new(service, &config.node, config.pod_index);
        request.mode = RequestMode::Broadcast;
        request.payload = Some(payload);
        let key = keys::user_request_key(&config.user, &request.id);
        put_json(self.shared.store.as_ref(), &key, &request).await?;
        Ok(request.id)
    }

    pub fn broadcast_events(&self) -> broadcast::Receiver<Response> {
        self.shared.broadcast_tx.subscribe()
    }

    async fn issue(
        &self,
        service: &str,
        payload: serde_json::Value,
        direct: Option<(String, u32)>,
        remote: bool,
        local_timeout: bool,
    ) -> Result<Response, RequesterError> {
        if self.shared.cancel.is_cancelled() {
            return Err(RequesterError::Cancelled);
        }
        let config = &self.shared.config;
        let mut request = Request::new(service, &config.node, config.pod_index);
        request.payload = Some(payload);
        request.is_remote = remote;
        request.is_local_timeout = local_timeout;
        if let Some((target, target_pod)) = direct {
            request.target = Some(target);
            request.target_pod = Some(target_pod);
            request.is_new = false;
        }

        let id = request.id.clone();
        let (resolve, resolved) = oneshot::channel();
        let shared = self.shared.clone();
        let timeout_id = id.clone();
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(shared.config.request_timeout).await;
            if let Some(pending) = shared.current_requests.lock().await.remove(&timeout_id) {
                // Reject the promise and delete the request document.
                drop(pending.resolve);
                if let Err(e) =
                    delete_request(shared.store.as_ref(), &shared.config.user, &timeout_id).await
                {
                    warn!("deleting timed-out request {timeout_id} failed: {e}");
                }
            }
        });
        self.shared
            .current_requests
            .lock()
            .await
            .insert(id.clone(), Pending { resolve, timeout });

        let key = keys::user_request_key(&config.user, &id);
        put_json(self.shared.store.as_ref(), &key, &request).await?;

        match resolved.await {
            Ok(response) => Ok(response),
            Err(_) if self.shared.cancel.is_cancelled() => Err(RequesterError::Cancelled),
            Err(_) => Err(RequesterError::Timeout),
        }
    }

    /// Stop the feed consumer and reject everything in flight.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let mut pending = self.shared.current_requests.lock().await;
        for (_, entry) in pending.drain() {
            entry.timeout.abort();
            drop(entry.resolve);
        }
    }
}

async fn delete_request(
    store: &dyn DocumentStore,
    user: &str,
    request_id: &str,
) -> Result<(), StoreError> {
    let key = keys::user_request_key(user, request_id);
    // Mark deleted, save, then remove the document.
    if let Some(mut request) = get_json::<Request>(store, &key).await? {
        request.is_deleted = true;
        put_json(store, &key, &request).await?;
    }
    store.delete(&key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::{RouterNodeDoc, ServiceDoc};
    use crate::router::{Router, RouterConfig};
    use chrono::Utc;
    use libstore::MemStore;
    use serde_json::json;

    const USER: &str = "alice";

    async fn seed_topology(store: &Arc<MemStore>, services: &[(&str, &str, u32)]) {
        let mut nodes: HashSet<&str> = HashSet::new();
        for (_, node, _) in services {
            nodes.insert(node);
        }
        for node in nodes {
            put_json(
                store.as_ref(),
                &keys::user_node_key(USER, node),
                &RouterNodeDoc {
                    name: node.to_string(),
                    inbox: None,
                },
            )
            .await
            .unwrap();
        }
        let mut docs: HashMap<&str, ServiceDoc> = HashMap::new();
        for (service, node, pods) in services {
            docs.entry(service)
                .or_insert_with(|| ServiceDoc {
                    name: service.to_string(),
                    node_pods: HashMap::new(),
                })
                .node_pods
                .insert(node.to_string(), *pods);
        }
        for (service, doc) in docs {
            put_json(store.as_ref(), &keys::user_service_key(USER, service), &doc)
                .await
                .unwrap();
        }
    }

    fn spawn_router(store: &Arc<MemStore>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let router = Router::new(store.clone(), RouterConfig {
            user: USER.to_string(),
            num_routers: 1,
            router_index: 0,
        });
        let token = cancel.clone();
        tokio::spawn(async move {
            let _ = router.run(token).await;
        });
        cancel
    }

    /// A fake service instance: answers requests addressed to its node and
    /// records the `(target, targetPod)` slots it served.
    fn spawn_responder(
        store: Arc<MemStore>,
        node: &'static str,
        seen: Arc<Mutex<Vec<(String, u32, bool)>>>,
    ) {
        tokio::spawn(async move {
            let mut feed = store
                .watch(&keys::user_requests_prefix(USER))
                .await
                .unwrap();
            while let Some(event) = feed.next().await {
                let StoreEvent::Put { value, .. } = event else {
                    continue;
                };
                let Ok(request) = serde_json::from_str::<Request>(&value) else {
                    continue;
                };
                if request.is_deleted || request.target.as_deref() != Some(node) {
                    continue;
                }
                let Some(target_pod) = request.target_pod else {
                    continue;
                };
                seen.lock()
                    .await
                    .push((node.to_string(), target_pod, request.is_local_timeout));
                let response = Response {
                    request_id: request.id.clone(),
                    target: request.source.clone(),
                    target_pod: request.source_pod,
                    result: Some(json!({ "served_by": target_pod })),
                    is_deleted: false,
                    time: Utc::now(),
                };
                put_json(
                    store.as_ref(),
                    &keys::user_response_key(USER, &request.id),
                    &response,
                )
                .await
                .unwrap();
            }
        });
    }

    fn requester(store: &Arc<MemStore>, node: &str, timeout: Duration) -> Requester {
        Requester::new(
            store.clone(),
            RequesterConfig {
                user: USER.to_string(),
                node: node.to_string(),
                pod_index: 0,
                request_timeout: timeout,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn routed_request_resolves_and_deletes_the_doc() {
        let store = Arc::new(MemStore::new());
        seed_topology(&store, &[("svc", "worker-b", 1)]).await;
        let _router = spawn_router(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        spawn_responder(store.clone(), "worker-b", seen.clone());

        let requester = requester(&store, "worker-a", Duration::from_secs(5));
        requester.run().await.unwrap();

        let response = requester.request("svc", json!({"q": 1})).await.unwrap();
        assert_eq!(response.result, Some(json!({ "served_by": 0 })));

        // Delete-then-save leaves no request document behind.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let leftover = store.list(&keys::user_requests_prefix(USER)).await.unwrap();
        assert!(leftover.is_empty(), "{leftover:?}");
    }

    #[tokio::test]
    async fn local_shortcut_bypasses_the_router() {
        let store = Arc::new(MemStore::new());
        // No router running at all: only the local shortcut can succeed.
        let seen = Arc::new(Mutex::new(Vec::new()));
        spawn_responder(store.clone(), "worker-a", seen.clone());

        let requester = Requester::new(
            store.clone(),
            RequesterConfig {
                user: USER.to_string(),
                node: "worker-a".to_string(),
                pod_index: 0,
                request_timeout: Duration::from_secs(5),
                local_services: HashMap::from([("svc".to_string(), 2)]),
                ..Default::default()
            },
        );
        requester.run().await.unwrap();

        let response = requester.request("svc", json!(null)).await.unwrap();
        assert!(response.result.is_some());
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "worker-a");
        assert!(seen[0].1 < 2);
    }

    #[tokio::test]
    async fn timeout_rejects_and_deletes_the_request() {
        let store = Arc::new(MemStore::new());
        let requester = requester(&store, "worker-a", Duration::from_millis(200));
        requester.run().await.unwrap();

        let err = requester.request("nobody", json!(1)).await.unwrap_err();
        assert!(matches!(err, RequesterError::Timeout));
        assert_eq!(err.code(), ErrorCode::Timeout);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let leftover = store.list(&keys::user_requests_prefix(USER)).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn sticky_routing_pins_the_slot_until_cleared() {
        let store = Arc::new(MemStore::new());
        seed_topology(&store, &[("svc", "worker-b", 3)]).await;
        let _router = spawn_router(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        spawn_responder(store.clone(), "worker-b", seen.clone());

        let requester = requester(&store, "worker-a", Duration::from_secs(5));
        requester.run().await.unwrap();

        for _ in 0..3 {
            requester.request("svc", json!(null)).await.unwrap();
        }
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 3);
        // Round-robin would rotate pods; the sticky route pins the first one.
        assert!(seen.iter().all(|(node, pod, _)| node == "worker-b" && *pod == seen[0].1));
    }

    #[tokio::test]
    async fn local_timeout_falls_back_to_the_router() {
        let store = Arc::new(MemStore::new());
        seed_topology(&store, &[("svc", "worker-b", 1)]).await;
        let _router = spawn_router(&store);
        let seen = Arc::new(Mutex::new(Vec::new()));
        spawn_responder(store.clone(), "worker-b", seen.clone());

        // The config claims the service is local, but nothing answers there.
        let requester = Requester::new(
            store.clone(),
            RequesterConfig {
                user: USER.to_string(),
                node: "worker-a".to_string(),
                pod_index: 0,
                request_timeout: Duration::from_millis(300),
                local_services: HashMap::from([("svc".to_string(), 1)]),
                ..Default::default()
            },
        );
        requester.run().await.unwrap();

        let response = requester.request("svc", json!(null)).await.unwrap();
        assert!(response.result.is_some());
        let seen = seen.lock().await;
        // The served request is the remote fallback, flagged as such.
        assert_eq!(seen.len(), 1);
        assert!(seen[0].2, "fallback request should carry isLocalTimeout");
    }

    #[tokio::test]
    async fn broadcast_responses_surface_as_events() {
        let store = Arc::new(MemStore::new());
        let requester = requester(&store, "worker-a", Duration::from_secs(5));
        requester.run().await.unwrap();
        let mut events = requester.broadcast_events();

        let request_id = requester.send_broadcast("svc", json!("hello")).await.unwrap();
        // A broadcast response is not matched against pending requests.
        let response = Response {
            request_id: request_id.clone(),
            target: "worker-a".to_string(),
            target_pod: 0,
            result: Some(json!("pong")),
            is_deleted: false,
            time: Utc::now(),
        };
        put_json(
            store.as_ref(),
            &keys::user_response_key(USER, &request_id),
            &response,
        )
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.request_id, request_id);
        assert_eq!(event.result, Some(json!("pong")));
    }

    #[tokio::test]
    async fn stop_rejects_in_flight_requests() {
        let store = Arc::new(MemStore::new());
        let requester = Arc::new(requester(&store, "worker-a", Duration::from_secs(30)));
        requester.run().await.unwrap();

        let issuer = requester.clone();
        let pending = tokio::spawn(async move { issuer.request("svc", json!(null)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        requester.stop().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RequesterError::Cancelled)));
    }
}
