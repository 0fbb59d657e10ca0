use std::sync::Arc;

use common::message::{DeployPayload, StopPayload};
use common::{Frame, NodeStatus, frame_type};
use libscheduler::{NodeEvent, NodeManager, Scheduler, SchedulingEvent};
use libstore::{DocumentStore, keys, put_json};
use log::{debug, error, info, warn};

use crate::session::{RPC_TIMEOUT, SessionRegistry};

/// Bridge scheduler and node-manager decisions onto agent connections:
/// assignments become `pod:deploy` RPCs, evictions become `pod:stop`, dead
/// nodes give their pods back to the queue after the grace period.
pub async fn spawn(
    scheduler: Arc<Scheduler>,
    node_manager: Arc<NodeManager>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn DocumentStore>,
) {
    let mut scheduling_events = scheduler
        .take_events()
        .await
        .expect("scheduler event stream already taken");
    let mut node_events = node_manager
        .take_events()
        .await
        .expect("node manager event stream already taken");

    {
        let scheduler = scheduler.clone();
        let sessions = sessions.clone();
        let store = store.clone();
        tokio::spawn(async move {
            while let Some(event) = scheduling_events.recv().await {
                match event {
                    SchedulingEvent::Assigned { pod_id, node_id } => {
                        deploy_pod(&scheduler, &sessions, &store, &pod_id, &node_id).await;
                    }
                    SchedulingEvent::Evicted {
                        pod_id,
                        node_id,
                        reason,
                    } => {
                        stop_pod(&sessions, &store, &scheduler, &pod_id, &node_id, &reason).await;
                    }
                }
            }
        });
    }

    let grace = node_manager.config().offline_grace;
    tokio::spawn(async move {
        while let Some(event) = node_events.recv().await {
            match event {
                NodeEvent::Offline { node_id } => {
                    // Pods survive the grace window in case the agent
                    // reconnects with its state intact.
                    let scheduler = scheduler.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        let still_offline = scheduler
                            .state()
                            .read()
                            .await
                            .node(&node_id)
                            .map(|n| n.status == NodeStatus::Offline)
                            .unwrap_or(false);
                        if !still_offline {
                            return;
                        }
                        let released = scheduler.release_node_pods(&node_id).await;
                        if !released.is_empty() {
                            info!(
                                "released {} pod(s) from offline node {node_id}",
                                released.len()
                            );
                        }
                        scheduler.on_cluster_change().await;
                    });
                }
                NodeEvent::Removed { node_id } => {
                    let released = scheduler.release_node_pods(&node_id).await;
                    info!(
                        "node {node_id} removed, released {} pod(s)",
                        released.len()
                    );
                    scheduler.on_cluster_change().await;
                }
            }
        }
    });
}

async fn deploy_pod(
    scheduler: &Arc<Scheduler>,
    sessions: &Arc<SessionRegistry>,
    store: &Arc<dyn DocumentStore>,
    pod_id: &str,
    node_id: &str,
) {
    let state = scheduler.state();
    let (pod, pack) = {
        let guard = state.read().await;
        let Some(pod) = guard.pod(pod_id).cloned() else {
            warn!("assigned pod {pod_id} vanished before deploy");
            return;
        };
        let Some(pack) = guard.pack(&pod.pack_id).cloned() else {
            error!("pack {} for pod {pod_id} is missing", pod.pack_id);
            return;
        };
        (pod, pack)
    };
    persist_pod(store, scheduler, pod_id).await;

    let Some(session) = sessions.get(node_id).await else {
        warn!("no live session for node {node_id}; requeueing pod {pod_id}");
        if let Err(e) = scheduler.deploy_failed(pod_id).await {
            error!("requeue of {pod_id} failed: {e}");
        }
        return;
    };

    let frame = match Frame::new(
        frame_type::POD_DEPLOY,
        &DeployPayload {
            pod_id: pod_id.to_string(),
            pack,
            pod,
        },
    ) {
        Ok(frame) => frame,
        Err(e) => {
            error!("building deploy frame for {pod_id} failed: {e}");
            return;
        }
    };

    match session.send_request(frame, RPC_TIMEOUT).await {
        Ok(_) => {
            // The agent's status updates walk the pod through
            // starting/running from here.
            debug!("pod {pod_id} accepted by node {node_id}");
        }
        Err(e) => {
            warn!("deploy of {pod_id} to {node_id} failed: {e}");
            if let Err(e) = scheduler.deploy_failed(pod_id).await {
                error!("requeue of {pod_id} failed: {e}");
            }
        }
    }
    persist_pod(store, scheduler, pod_id).await;
}

async fn stop_pod(
    sessions: &Arc<SessionRegistry>,
    store: &Arc<dyn DocumentStore>,
    scheduler: &Arc<Scheduler>,
    pod_id: &str,
    node_id: &str,
    reason: &str,
) {
    persist_pod(store, scheduler, pod_id).await;
    let Some(session) = sessions.get(node_id).await else {
        debug!("no session for node {node_id}; eviction of {pod_id} is record-only");
        return;
    };
    let frame = match Frame::new(
        frame_type::POD_STOP,
        &StopPayload {
            pod_id: pod_id.to_string(),
            reason: Some(reason.to_string()),
        },
    ) {
        Ok(frame) => frame,
        Err(e) => {
            error!("building stop frame for {pod_id} failed: {e}");
            return;
        }
    };
    if let Err(e) = session.send_request(frame, RPC_TIMEOUT).await {
        // The record already moved on; the agent cleans up on reconnect.
        warn!("stop of {pod_id} on {node_id} failed: {e}");
    }
}

async fn persist_pod(store: &Arc<dyn DocumentStore>, scheduler: &Arc<Scheduler>, pod_id: &str) {
    let state = scheduler.state();
    let pod = state.read().await.pod(pod_id).cloned();
    if let Some(pod) = pod
        && let Err(e) = put_json(store.as_ref(), &keys::pod_key(pod_id), &pod).await
    {
        warn!("persisting pod {pod_id} failed: {e}");
    }
}
