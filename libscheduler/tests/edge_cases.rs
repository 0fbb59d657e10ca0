//! Boundary behaviors: disabled preemption, runtime mismatches, terminal
//! states and retry-on-cluster-change.

use std::sync::Arc;
use std::time::Duration;

use common::{
    Node, NodeStatus, Pack, PodStatus, PriorityClass, PreemptionPolicy, Resources,
    SYSTEM_CLUSTER_CRITICAL, SYSTEM_CRITICAL_FLOOR,
};
use libscheduler::models::{PodInput, ScheduleFailure, SchedulerConfig, SchedulingEvent};
use libscheduler::state::ClusterState;
use libscheduler::Scheduler;
use tokio::sync::RwLock;
use tokio::time::timeout;

const PACK_ID: &str = "pk-1";
const PACK_VERSION: &str = "1.0.0";

fn pack(runtime_tag: &str) -> Pack {
    Pack {
        id: PACK_ID.to_string(),
        name: "service".to_string(),
        version: PACK_VERSION.to_string(),
        runtime_tag: runtime_tag.to_string(),
        bundle_path: "bundle.js".to_string(),
        bundle_content: None,
        metadata: Default::default(),
        granted_capabilities: Default::default(),
    }
}

fn node(id: &str, cpu: u64, memory: u64) -> Node {
    Node {
        id: id.to_string(),
        name: id.to_string(),
        owner: "admin".to_string(),
        runtime_type: "node".to_string(),
        allocatable: Resources {
            cpu,
            memory,
            pods: 16,
            storage: 0,
        },
        allocated: Resources::default(),
        labels: Default::default(),
        taints: vec![],
        status: NodeStatus::Online,
        last_heartbeat: None,
    }
}

fn input(cpu: u64, memory: u64) -> PodInput {
    PodInput {
        pack_id: PACK_ID.to_string(),
        pack_version: PACK_VERSION.to_string(),
        resource_requests: Resources::new(cpu, memory),
        ..Default::default()
    }
}

async fn setup(runtime_tag: &str, enable_preemption: bool) -> (Arc<Scheduler>, Arc<RwLock<ClusterState>>) {
    let state = Arc::new(RwLock::new(ClusterState::new()));
    state.write().await.register_pack(pack(runtime_tag)).unwrap();
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            enable_preemption,
            default_priority: 0,
        },
        state.clone(),
    ));
    (scheduler, state)
}

#[tokio::test]
async fn disabled_preemption_never_evicts() {
    let (scheduler, state) = setup("node", false).await;
    state.write().await.upsert_node(node("n1", 100, 256));
    state
        .write()
        .await
        .add_priority_class(PriorityClass {
            name: "high".to_string(),
            value: 1000,
            preemption_policy: PreemptionPolicy::PreemptLowerPriority,
            global_default: false,
        })
        .unwrap();

    let (victim, outcome) = scheduler
        .create_and_schedule(input(100, 256), "admin")
        .await
        .unwrap();
    assert!(outcome.scheduled);

    let mut high = input(50, 128);
    high.priority_class_name = Some("high".to_string());
    let (_, outcome) = scheduler.create_and_schedule(high, "admin").await.unwrap();
    assert!(!outcome.scheduled);
    assert_eq!(outcome.reason, Some(ScheduleFailure::NoFeasibleNode));
    assert_eq!(
        state.read().await.pod(&victim.id).unwrap().status,
        PodStatus::Scheduled
    );
}

#[tokio::test]
async fn runtime_mismatch_reports_runtime_incompatible() {
    let (scheduler, state) = setup("browser", true).await;
    state.write().await.upsert_node(node("n1", 100, 256));

    let (pod, outcome) = scheduler
        .create_and_schedule(input(10, 10), "admin")
        .await
        .unwrap();
    assert!(!outcome.scheduled);
    assert_eq!(outcome.reason, Some(ScheduleFailure::RuntimeIncompatible));
    assert_eq!(pod.status, PodStatus::Pending);
    assert!(pod.node_id.is_none());
}

#[tokio::test]
async fn no_nodes_means_no_feasible_node() {
    let (scheduler, _) = setup("node", true).await;
    let (_, outcome) = scheduler
        .create_and_schedule(input(10, 10), "admin")
        .await
        .unwrap();
    assert!(!outcome.scheduled);
    assert_eq!(outcome.reason, Some(ScheduleFailure::NoFeasibleNode));
}

#[tokio::test]
async fn system_critical_resists_max_user_priority() {
    let (scheduler, state) = setup("node", true).await;
    state.write().await.upsert_node(node("n1", 100, 256));
    {
        let mut guard = state.write().await;
        guard
            .add_priority_class(PriorityClass::system_cluster_critical())
            .unwrap();
        guard
            .add_priority_class(PriorityClass {
                name: "max-user".to_string(),
                value: SYSTEM_CRITICAL_FLOOR - 1,
                preemption_policy: PreemptionPolicy::PreemptLowerPriority,
                global_default: false,
            })
            .unwrap();
    }

    let mut critical = input(100, 256);
    critical.priority_class_name = Some(SYSTEM_CLUSTER_CRITICAL.to_string());
    let (critical_pod, outcome) = scheduler
        .create_and_schedule(critical, "admin")
        .await
        .unwrap();
    assert!(outcome.scheduled);

    let mut user = input(50, 128);
    user.priority_class_name = Some("max-user".to_string());
    let (_, outcome) = scheduler.create_and_schedule(user, "admin").await.unwrap();
    assert!(!outcome.scheduled);
    assert_eq!(
        outcome.reason,
        Some(ScheduleFailure::InsufficientCapacityEvenWithPreemption)
    );
    assert_eq!(
        state.read().await.pod(&critical_pod.id).unwrap().status,
        PodStatus::Scheduled
    );
}

#[tokio::test]
async fn terminal_pods_reject_agent_reports() {
    let (scheduler, state) = setup("node", true).await;
    state.write().await.upsert_node(node("n1", 100, 256));

    let (pod, outcome) = scheduler
        .create_and_schedule(input(10, 10), "admin")
        .await
        .unwrap();
    assert!(outcome.scheduled);
    scheduler.evict(&pod.id, "drained").await.unwrap();

    let err = scheduler
        .record_agent_status(&pod.id, PodStatus::Running)
        .await
        .unwrap_err();
    assert_eq!(err.code, common::ErrorCode::Internal);
    assert!(state.read().await.pod(&pod.id).unwrap().node_id.is_none());
}

#[tokio::test]
async fn stopped_pods_free_capacity_for_the_next_pod() {
    let (scheduler, state) = setup("node", true).await;
    state.write().await.upsert_node(node("n1", 100, 256));

    let (first, outcome) = scheduler
        .create_and_schedule(input(100, 256), "admin")
        .await
        .unwrap();
    assert!(outcome.scheduled);
    scheduler.start(&first.id).await.unwrap();
    scheduler.set_running(&first.id).await.unwrap();
    scheduler
        .record_agent_status(&first.id, PodStatus::Stopped)
        .await
        .unwrap();

    let (_, outcome) = scheduler
        .create_and_schedule(input(100, 256), "admin")
        .await
        .unwrap();
    assert!(outcome.scheduled);
    assert!(state.read().await.node_accounting_consistent("n1"));
}

#[tokio::test]
async fn pending_pod_schedules_after_a_node_arrives() {
    let (scheduler, state) = setup("node", true).await;
    let mut events = scheduler.take_events().await.unwrap();
    scheduler.run();

    let (pod, outcome) = scheduler
        .create_and_schedule(input(10, 10), "admin")
        .await
        .unwrap();
    assert!(!outcome.scheduled);

    state.write().await.upsert_node(node("n1", 100, 256));
    scheduler.on_cluster_change().await;

    let event = timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("pending pod was not retried")
        .unwrap();
    assert_eq!(
        event,
        SchedulingEvent::Assigned {
            pod_id: pod.id.clone(),
            node_id: "n1".to_string(),
        }
    );
    assert_eq!(
        state.read().await.pod(&pod.id).unwrap().status,
        PodStatus::Scheduled
    );
}

#[tokio::test]
async fn released_node_pods_return_to_pending() {
    let (scheduler, state) = setup("node", true).await;
    state.write().await.upsert_node(node("n1", 100, 256));

    let (pod, outcome) = scheduler
        .create_and_schedule(input(50, 128), "admin")
        .await
        .unwrap();
    assert!(outcome.scheduled);
    scheduler.start(&pod.id).await.unwrap();
    scheduler.set_running(&pod.id).await.unwrap();

    let released = scheduler.release_node_pods("n1").await;
    assert_eq!(released, vec![pod.id.clone()]);
    let guard = state.read().await;
    let record = guard.pod(&pod.id).unwrap();
    assert_eq!(record.status, PodStatus::Pending);
    assert!(record.node_id.is_none());
    assert!(guard.node("n1").unwrap().allocated.is_zero());
}
