use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use common::message::{DeployPayload, StatusUpdatePayload, StopPayload};
use common::{OrchestratorError, OrchestratorResult, PodStatus};
use libexecutor::{ExecuteOptions, ExecutionHandle, PackExecutor};
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

struct LocalPod {
    status: PodStatus,
    handle: Option<Arc<ExecutionHandle>>,
}

/// Bridges agent commands to the executor. Holds the execution handles; the
/// agent only sees status updates flowing back through the channel.
pub struct PodHandler {
    executor: Arc<PackExecutor>,
    local: Arc<Mutex<HashMap<String, LocalPod>>>,
    status_tx: UnboundedSender<StatusUpdatePayload>,
    /// Pods currently counted against the node's allocation.
    active_pods: Arc<AtomicI64>,
}

impl PodHandler {
    pub fn new(executor: Arc<PackExecutor>, status_tx: UnboundedSender<StatusUpdatePayload>) -> Self {
        PodHandler {
            executor,
            local: Arc::new(Mutex::new(HashMap::new())),
            status_tx,
            active_pods: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn active_pods(&self) -> u64 {
        self.active_pods.load(Ordering::SeqCst).max(0) as u64
    }

    pub async fn status_of(&self, pod_id: &str) -> Option<PodStatus> {
        self.local.lock().await.get(pod_id).map(|p| p.status)
    }

    fn report(
        status_tx: &UnboundedSender<StatusUpdatePayload>,
        pod_id: &str,
        status: PodStatus,
        error: Option<String>,
    ) {
        let _ = status_tx.send(StatusUpdatePayload {
            pod_id: pod_id.to_string(),
            status,
            error,
            timestamp: Utc::now(),
        });
    }

    /// Run a deploy command: start the execution and follow it to a terminal
    /// status in the background.
    pub async fn handle_deploy(&self, payload: DeployPayload) -> OrchestratorResult<()> {
        let DeployPayload { pod_id, pack, pod } = payload;
        {
            let mut local = self.local.lock().await;
            if let Some(existing) = local.get(&pod_id)
                && matches!(existing.status, PodStatus::Running | PodStatus::Starting)
            {
                return Err(OrchestratorError::new(
                    common::ErrorCode::AlreadyRunning,
                    format!("pod {pod_id} is already {:?}", existing.status),
                ));
            }
            local.insert(
                pod_id.clone(),
                LocalPod {
                    status: PodStatus::Starting,
                    handle: None,
                },
            );
        }
        Self::report(&self.status_tx, &pod_id, PodStatus::Starting, None);

        let options = ExecuteOptions {
            timeout_ms: pack.metadata.timeout,
            ..Default::default()
        };
        let handle = match self.executor.execute(&pack, &pod, options).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(entry) = self.local.lock().await.get_mut(&pod_id) {
                    entry.status = PodStatus::Failed;
                }
                Self::report(&self.status_tx, &pod_id, PodStatus::Failed, Some(e.to_string()));
                return Err(OrchestratorError::new(e.code(), e.to_string()));
            }
        };

        {
            let mut local = self.local.lock().await;
            if let Some(entry) = local.get_mut(&pod_id) {
                entry.status = PodStatus::Running;
                entry.handle = Some(handle.clone());
            }
        }
        self.active_pods.fetch_add(1, Ordering::SeqCst);
        Self::report(&self.status_tx, &pod_id, PodStatus::Running, None);
        info!("pod {pod_id} running (execution {})", handle.execution_id);

        // Follow the execution to its end.
        let local = self.local.clone();
        let status_tx = self.status_tx.clone();
        let active_pods = self.active_pods.clone();
        let watched_pod = pod_id.clone();
        tokio::spawn(async move {
            let result = handle.wait().await;
            let mut guard = local.lock().await;
            let was_stopping = guard
                .get(&watched_pod)
                .is_some_and(|p| p.status == PodStatus::Stopping);
            let final_status = if result.success || was_stopping {
                PodStatus::Stopped
            } else {
                PodStatus::Failed
            };
            if let Some(entry) = guard.get_mut(&watched_pod) {
                entry.status = final_status;
                entry.handle = None;
            }
            drop(guard);
            if active_pods.fetch_sub(1, Ordering::SeqCst) < 1 {
                active_pods.store(0, Ordering::SeqCst);
            }
            let error = if final_status == PodStatus::Failed {
                result.error.clone()
            } else {
                None
            };
            Self::report(&status_tx, &watched_pod, final_status, error);
        });
        Ok(())
    }

    /// Run a stop command: graceful when the execution supports it.
    pub async fn handle_stop(&self, payload: StopPayload) -> OrchestratorResult<()> {
        let StopPayload { pod_id, reason } = payload;
        let handle = {
            let mut local = self.local.lock().await;
            let Some(entry) = local.get_mut(&pod_id) else {
                return Err(OrchestratorError::not_found(format!(
                    "pod {pod_id} is not on this node"
                )));
            };
            if entry.status != PodStatus::Running {
                return Err(OrchestratorError::validation(format!(
                    "pod {pod_id} is {:?}, not running",
                    entry.status
                )));
            }
            entry.status = PodStatus::Stopping;
            entry.handle.clone()
        };
        Self::report(&self.status_tx, &pod_id, PodStatus::Stopping, None);

        match handle {
            Some(handle) => handle.graceful_stop(reason.as_deref()).await,
            None => {
                warn!("pod {pod_id} has no live execution handle, marking stopped");
                if let Some(entry) = self.local.lock().await.get_mut(&pod_id) {
                    entry.status = PodStatus::Stopped;
                }
                Self::report(&self.status_tx, &pod_id, PodStatus::Stopped, None);
            }
        }
        Ok(())
    }

    /// Best-effort graceful stop of every running pod; used on shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, Arc<ExecutionHandle>)> = {
            let mut local = self.local.lock().await;
            local
                .iter_mut()
                .filter(|(_, p)| p.status == PodStatus::Running)
                .filter_map(|(id, p)| {
                    p.status = PodStatus::Stopping;
                    p.handle.clone().map(|h| (id.clone(), h))
                })
                .collect()
        };
        for (pod_id, handle) in handles {
            info!("stopping pod {pod_id} for shutdown");
            handle.graceful_stop(Some("agent shutdown")).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Pack, Pod};
    use libexecutor::ExecutorConfig;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::{Duration, sleep, timeout};

    fn deploy_payload(pod_id: &str, script: &str) -> DeployPayload {
        let now = Utc::now();
        DeployPayload {
            pod_id: pod_id.to_string(),
            pack: Pack {
                id: "pk".to_string(),
                name: "svc".to_string(),
                version: "1.0.0".to_string(),
                runtime_tag: "universal".to_string(),
                bundle_path: "unused.js".to_string(),
                bundle_content: Some(script.to_string()),
                metadata: Default::default(),
                granted_capabilities: Default::default(),
            },
            pod: Pod {
                id: pod_id.to_string(),
                pack_id: "pk".to_string(),
                pack_version: "1.0.0".to_string(),
                namespace: "default".to_string(),
                labels: Default::default(),
                annotations: Default::default(),
                priority: 0,
                priority_class_name: None,
                preemption_policy: Default::default(),
                resource_requests: Default::default(),
                resource_limits: Default::default(),
                scheduling: Default::default(),
                status: PodStatus::Scheduled,
                node_id: Some("n1".to_string()),
                created_at: now,
                updated_at: now,
            },
        }
    }

    fn handler(dir: &std::path::Path) -> (PodHandler, tokio::sync::mpsc::UnboundedReceiver<StatusUpdatePayload>) {
        let executor = Arc::new(PackExecutor::new(ExecutorConfig {
            bundle_dir: dir.to_path_buf(),
            runtime_command: "sh".to_string(),
            ..Default::default()
        }));
        let (tx, rx) = unbounded_channel();
        (PodHandler::new(executor, tx), rx)
    }

    async fn next_status(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<StatusUpdatePayload>,
    ) -> StatusUpdatePayload {
        timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("status update expected")
            .unwrap()
    }

    #[tokio::test]
    async fn deploy_reports_starting_running_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, mut rx) = handler(dir.path());

        handler
            .handle_deploy(deploy_payload("p1", "echo done\n"))
            .await
            .unwrap();

        assert_eq!(next_status(&mut rx).await.status, PodStatus::Starting);
        assert_eq!(next_status(&mut rx).await.status, PodStatus::Running);
        let terminal = next_status(&mut rx).await;
        assert_eq!(terminal.status, PodStatus::Stopped);
        assert!(terminal.error.is_none());
        assert_eq!(handler.active_pods(), 0);
    }

    #[tokio::test]
    async fn failed_executions_report_failed_with_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, mut rx) = handler(dir.path());

        handler
            .handle_deploy(deploy_payload("p1", "exit 7\n"))
            .await
            .unwrap();

        assert_eq!(next_status(&mut rx).await.status, PodStatus::Starting);
        assert_eq!(next_status(&mut rx).await.status, PodStatus::Running);
        let terminal = next_status(&mut rx).await;
        assert_eq!(terminal.status, PodStatus::Failed);
        assert!(terminal.error.unwrap().contains("7"));
    }

    #[tokio::test]
    async fn duplicate_deploys_are_rejected_while_live() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, mut _rx) = handler(dir.path());

        handler
            .handle_deploy(deploy_payload("p1", "sleep 30\n"))
            .await
            .unwrap();
        let err = handler
            .handle_deploy(deploy_payload("p1", "echo again\n"))
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::AlreadyRunning);

        handler.stop_all().await;
    }

    #[tokio::test]
    async fn stop_walks_running_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, mut rx) = handler(dir.path());

        handler
            .handle_deploy(deploy_payload("p1", "sleep 30\n"))
            .await
            .unwrap();
        assert_eq!(next_status(&mut rx).await.status, PodStatus::Starting);
        assert_eq!(next_status(&mut rx).await.status, PodStatus::Running);

        handler
            .handle_stop(StopPayload {
                pod_id: "p1".to_string(),
                reason: Some("redeploy".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(next_status(&mut rx).await.status, PodStatus::Stopping);
        // Stopping a cancelled execution counts as a clean stop.
        assert_eq!(next_status(&mut rx).await.status, PodStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_of_unknown_or_idle_pods_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, mut rx) = handler(dir.path());

        let err = handler
            .handle_stop(StopPayload {
                pod_id: "ghost".to_string(),
                reason: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::NotFound);

        // A finished pod is no longer stoppable.
        handler
            .handle_deploy(deploy_payload("p1", "echo done\n"))
            .await
            .unwrap();
        loop {
            let update = next_status(&mut rx).await;
            if update.status == PodStatus::Stopped {
                break;
            }
        }
        let err = handler
            .handle_stop(StopPayload {
                pod_id: "p1".to_string(),
                reason: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Validation);
    }

    #[tokio::test]
    async fn active_pod_count_tracks_running_executions() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, mut _rx) = handler(dir.path());

        handler
            .handle_deploy(deploy_payload("p1", "sleep 30\n"))
            .await
            .unwrap();
        handler
            .handle_deploy(deploy_payload("p2", "sleep 30\n"))
            .await
            .unwrap();
        assert_eq!(handler.active_pods(), 2);

        handler.stop_all().await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(handler.active_pods(), 0);
    }
}
