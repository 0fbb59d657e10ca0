use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use common::{
    Node, OrchestratorError, OrchestratorResult, Pod, PodStatus, PreemptionPolicy,
    is_system_critical_name,
};
use log::{debug, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, RwLock};

use crate::models::{
    PodInput, ScheduleFailure, SchedulerConfig, SchedulingEvent, SchedulingOutcome,
};
use crate::plugins::{Code, PodContext, Registry};
use crate::preemption::plan_victims;
use crate::queue::SchedulingQueue;
use crate::state::ClusterState;

/// Annotation recording who admitted the pod.
const CREATED_BY_ANNOTATION: &str = "stark.io/created-by";

pub struct Scheduler {
    config: SchedulerConfig,
    state: Arc<RwLock<ClusterState>>,
    queue: Arc<SchedulingQueue>,
    registry: Registry,
    /// Failed attempts per pending pod, for backoff.
    attempts: Mutex<HashMap<String, usize>>,
    events_tx: UnboundedSender<SchedulingEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<SchedulingEvent>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, state: Arc<RwLock<ClusterState>>) -> Self {
        Self::with_registry(config, state, Registry::default())
    }

    pub fn with_registry(
        config: SchedulerConfig,
        state: Arc<RwLock<ClusterState>>,
        registry: Registry,
    ) -> Self {
        let (events_tx, events_rx) = unbounded_channel();
        Scheduler {
            config,
            state,
            queue: Arc::new(SchedulingQueue::new()),
            registry,
            attempts: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn state(&self) -> Arc<RwLock<ClusterState>> {
        self.state.clone()
    }

    /// Placement event stream for the control-plane driver. Can be taken once.
    pub async fn take_events(&self) -> Option<UnboundedReceiver<SchedulingEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Admit a pod: resolve its priority, record it, and try to place it
    /// immediately. On failure the pod stays `pending` and is retried with
    /// backoff and on cluster changes.
    pub async fn create_and_schedule(
        &self,
        input: PodInput,
        actor: &str,
    ) -> OrchestratorResult<(Pod, SchedulingOutcome)> {
        let mut state = self.state.write().await;

        let pack = state
            .pack(&input.pack_id)
            .ok_or_else(|| {
                OrchestratorError::not_found(format!("pack {} not registered", input.pack_id))
            })?
            .clone();
        if pack.version != input.pack_version {
            return Err(OrchestratorError::not_found(format!(
                "pack {} has version {}, not {}",
                pack.id, pack.version, input.pack_version
            )));
        }

        let resolved =
            state.resolve_priority(input.priority_class_name.as_deref(), self.config.default_priority);
        let now = Utc::now();
        let mut annotations = input.annotations;
        annotations.insert(CREATED_BY_ANNOTATION.to_string(), actor.to_string());
        let pod = Pod {
            id: uuid::Uuid::new_v4().to_string(),
            pack_id: input.pack_id,
            pack_version: input.pack_version,
            namespace: input.namespace.unwrap_or_else(|| "default".to_string()),
            labels: input.labels,
            annotations,
            priority: resolved.value,
            priority_class_name: resolved.class_name,
            preemption_policy: input.preemption_policy.unwrap_or(resolved.class_policy),
            resource_requests: input.resource_requests,
            resource_limits: input.resource_limits,
            scheduling: input.scheduling,
            status: PodStatus::Pending,
            node_id: None,
            created_at: now,
            updated_at: now,
        };
        let pod_id = pod.id.clone();
        state.insert_pod(pod);

        let outcome = match self.attempt_locked(&mut state, &pod_id) {
            Ok((node_id, evicted)) => {
                self.publish_placement(&pod_id, &node_id, &evicted);
                SchedulingOutcome::placed(node_id, evicted)
            }
            Err(failure) => {
                debug!("pod {pod_id} not admissible: {failure:?}");
                let priority = state.pod(&pod_id).map(|p| p.priority).unwrap_or_default();
                self.attempts.lock().await.insert(pod_id.clone(), 1);
                self.queue.push_backoff(pod_id.clone(), priority, 1).await;
                SchedulingOutcome::unplaced(failure)
            }
        };

        let pod = state
            .pod(&pod_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::internal("admitted pod vanished"))?;
        Ok((pod, outcome))
    }

    fn publish_placement(&self, pod_id: &str, node_id: &str, evicted: &[String]) {
        for victim in evicted {
            let _ = self.events_tx.send(SchedulingEvent::Evicted {
                pod_id: victim.clone(),
                node_id: node_id.to_string(),
                reason: format!("preempted by pod {pod_id}"),
            });
        }
        let _ = self.events_tx.send(SchedulingEvent::Assigned {
            pod_id: pod_id.to_string(),
            node_id: node_id.to_string(),
        });
    }

    /// One admission attempt under the state write lock:
    /// filter → score → (preempt) → allocate → transition.
    fn attempt_locked(
        &self,
        state: &mut ClusterState,
        pod_id: &str,
    ) -> Result<(String, Vec<String>), ScheduleFailure> {
        let pod = match state.pod(pod_id) {
            Some(p) => p.clone(),
            None => return Err(ScheduleFailure::NoFeasibleNode),
        };
        if pod.status != PodStatus::Pending {
            return Err(ScheduleFailure::AlreadyScheduled);
        }
        let runtime_tag = state
            .pack(&pod.pack_id)
            .map(|p| p.runtime_tag.clone())
            .unwrap_or_else(|| "node".to_string());
        let ctx = PodContext {
            pod: &pod,
            runtime_tag: &runtime_tag,
        };

        let mut feasible: Vec<(String, i64)> = Vec::new();
        // Nodes that failed only on resources; preemption could free them.
        let mut resource_blocked: Vec<String> = Vec::new();
        let mut online_nodes = 0usize;
        let mut runtime_rejected = 0usize;

        for node in state.nodes_in_order() {
            if node.status != common::NodeStatus::Online {
                continue;
            }
            online_nodes += 1;
            match self.run_filters(&ctx, node) {
                FilterOutcome::Feasible => {
                    feasible.push((node.id.clone(), self.run_scorers(&ctx, node)));
                }
                FilterOutcome::ResourceBlocked => resource_blocked.push(node.id.clone()),
                FilterOutcome::RuntimeRejected => runtime_rejected += 1,
                FilterOutcome::Rejected => {}
            }
        }

        // Prefer any non-preemption path first. Ties resolve to the earliest
        // registered node, so placement is stable.
        let mut best: Option<&(String, i64)> = None;
        for entry in &feasible {
            if best.is_none_or(|(_, score)| entry.1 > *score) {
                best = Some(entry);
            }
        }
        if let Some((node_id, _)) = best.cloned() {
            state
                .bind_pod(pod_id, &node_id)
                .map_err(|_| ScheduleFailure::NoFeasibleNode)?;
            return Ok((node_id, vec![]));
        }

        if online_nodes == 0 {
            return Err(ScheduleFailure::NoFeasibleNode);
        }
        if runtime_rejected == online_nodes {
            return Err(ScheduleFailure::RuntimeIncompatible);
        }
        if resource_blocked.is_empty() {
            return Err(ScheduleFailure::NoFeasibleNode);
        }

        // Preemption needs both the cluster-wide flag and a willing pod.
        if !self.config.enable_preemption {
            return Err(ScheduleFailure::NoFeasibleNode);
        }
        if pod.preemption_policy == PreemptionPolicy::Never {
            return Err(ScheduleFailure::PreemptionBlocked);
        }

        let system_critical = pod
            .priority_class_name
            .as_deref()
            .is_some_and(is_system_critical_name);
        for node_id in resource_blocked {
            let Some(victims) = plan_victims(state, &pod, system_critical, &node_id) else {
                continue;
            };
            // Evictions release capacity before the new allocation lands.
            for victim in &victims {
                if let Err(e) = state.unbind_pod(victim, PodStatus::Evicted) {
                    warn!("failed to evict {victim} on {node_id}: {e}");
                    return Err(ScheduleFailure::InsufficientCapacityEvenWithPreemption);
                }
            }
            state
                .bind_pod(pod_id, &node_id)
                .map_err(|_| ScheduleFailure::InsufficientCapacityEvenWithPreemption)?;
            info!(
                "pod {pod_id} preempted {} pod(s) on node {node_id}",
                victims.len()
            );
            return Ok((node_id, victims));
        }
        Err(ScheduleFailure::InsufficientCapacityEvenWithPreemption)
    }

    fn run_filters(&self, ctx: &PodContext<'_>, node: &Node) -> FilterOutcome {
        let mut resource_only = true;
        let mut rejected = false;
        let mut runtime = false;
        for plugin in &self.registry.filter {
            let status = plugin.filter(ctx, node);
            match status.code {
                Code::Success => {}
                Code::Unschedulable => {
                    rejected = true;
                }
                Code::UnschedulableAndUnresolvable => {
                    rejected = true;
                    resource_only = false;
                    if plugin.name() == "RuntimeFit" {
                        runtime = true;
                    }
                }
            }
        }
        if !rejected {
            FilterOutcome::Feasible
        } else if runtime {
            FilterOutcome::RuntimeRejected
        } else if resource_only {
            FilterOutcome::ResourceBlocked
        } else {
            FilterOutcome::Rejected
        }
    }

    fn run_scorers(&self, ctx: &PodContext<'_>, node: &Node) -> i64 {
        self.registry
            .score
            .iter()
            .map(|(plugin, weight)| plugin.score(ctx, node) * weight)
            .sum()
    }

    // ---- lifecycle operations ----

    /// `scheduled → starting`; the node agent has accepted the deploy.
    pub async fn start(&self, pod_id: &str) -> OrchestratorResult<()> {
        self.state
            .write()
            .await
            .set_pod_status(pod_id, PodStatus::Starting)
    }

    /// `starting → running`.
    pub async fn set_running(&self, pod_id: &str) -> OrchestratorResult<()> {
        self.state
            .write()
            .await
            .set_pod_status(pod_id, PodStatus::Running)
    }

    /// Request a stop; the terminal transition arrives from the agent.
    pub async fn stop(&self, pod_id: &str) -> OrchestratorResult<()> {
        self.state
            .write()
            .await
            .set_pod_status(pod_id, PodStatus::Stopping)
    }

    /// Evict a pod and free its allocation. Terminal.
    pub async fn evict(&self, pod_id: &str, reason: &str) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        let node_id = state
            .pod(pod_id)
            .and_then(|p| p.node_id.clone())
            .unwrap_or_default();
        state.unbind_pod(pod_id, PodStatus::Evicted)?;
        drop(state);
        let _ = self.events_tx.send(SchedulingEvent::Evicted {
            pod_id: pod_id.to_string(),
            node_id,
            reason: reason.to_string(),
        });
        self.on_cluster_change().await;
        Ok(())
    }

    /// Apply a node-agent status report to the cluster record.
    pub async fn record_agent_status(
        &self,
        pod_id: &str,
        status: PodStatus,
    ) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        match status {
            PodStatus::Starting | PodStatus::Running | PodStatus::Stopping => {
                state.set_pod_status(pod_id, status)
            }
            PodStatus::Stopped | PodStatus::Failed => {
                state.unbind_pod(pod_id, status)?;
                drop(state);
                // Freed capacity may unblock parked pods.
                self.on_cluster_change().await;
                Ok(())
            }
            other => Err(OrchestratorError::validation(format!(
                "agents cannot report status {other:?}"
            ))),
        }
    }

    /// The deploy command never reached a healthy agent; give the pod back
    /// to the queue.
    pub async fn deploy_failed(&self, pod_id: &str) -> OrchestratorResult<()> {
        let mut state = self.state.write().await;
        let priority = state.pod(pod_id).map(|p| p.priority).unwrap_or_default();
        state.unbind_pod(pod_id, PodStatus::Pending)?;
        drop(state);
        self.queue.push(pod_id.to_string(), priority).await;
        Ok(())
    }

    /// Move every pod held by a node back to `pending` (node offline or
    /// removed) and requeue them.
    pub async fn release_node_pods(&self, node_id: &str) -> Vec<String> {
        let mut state = self.state.write().await;
        let held: Vec<(String, i64)> = state
            .pods_on_node(node_id)
            .into_iter()
            .map(|p| (p.id.clone(), p.priority))
            .collect();
        let mut released = Vec::new();
        for (pod_id, priority) in held {
            match state.unbind_pod(&pod_id, PodStatus::Pending) {
                Ok(()) => {
                    released.push(pod_id.clone());
                    self.queue.push(pod_id, priority).await;
                }
                Err(e) => warn!("could not release pod {pod_id} from {node_id}: {e}"),
            }
        }
        drop(state);
        self.attempts.lock().await.retain(|k, _| !released.contains(k));
        released
    }

    /// Wake parked pods after any cluster topology or capacity change.
    pub async fn on_cluster_change(&self) {
        self.queue.move_all_to_active().await;
    }

    /// Run the retry loop. Queued pending pods are re-attempted; successes
    /// surface on the event stream exactly like synchronous admissions.
    pub fn run(self: &Arc<Self>) {
        self.queue.run();
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                scheduler.schedule_one().await;
            }
        });
    }

    async fn schedule_one(&self) {
        let queued = self.queue.next_pod().await;
        let mut state = self.state.write().await;
        let Some(pod) = state.pod(&queued.pod_id) else {
            return;
        };
        if pod.status != PodStatus::Pending {
            return;
        }
        if pod.priority != queued.priority {
            // The queue entry is stale; a fresher one exists.
            return;
        }
        match self.attempt_locked(&mut state, &queued.pod_id) {
            Ok((node_id, evicted)) => {
                drop(state);
                self.attempts.lock().await.remove(&queued.pod_id);
                self.publish_placement(&queued.pod_id, &node_id, &evicted);
            }
            Err(failure) => {
                drop(state);
                let mut attempts = self.attempts.lock().await;
                let count = attempts.entry(queued.pod_id.clone()).or_insert(0);
                *count += 1;
                let count = *count;
                drop(attempts);
                debug!(
                    "retry {count} for pod {} failed: {failure:?}",
                    queued.pod_id
                );
                self.queue
                    .push_backoff(queued.pod_id, queued.priority, count)
                    .await;
            }
        }
    }
}

enum FilterOutcome {
    Feasible,
    /// Only the resource fit failed; preemption may help.
    ResourceBlocked,
    RuntimeRejected,
    Rejected,
}
