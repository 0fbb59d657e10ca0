use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use common::{CAP_ROOT, Pack, Pod};
use log::{debug, info};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::bundle::BundleFetcher;
use crate::config::ExecutorConfig;
use crate::context::{
    ExecutionContext, Lifecycle, LifecyclePhase, WorkerContext, merged_env,
};
use crate::entrypoint::EntrypointRegistry;
use crate::ephemeral::EphemeralPlane;
use crate::error::ExecutorError;
use crate::handle::{ExecutionHandle, ExecutionResult};
use crate::logsink::LogSink;
use crate::runner::{SubprocessSpec, run_subprocess};

/// Runtime tags this executor can host.
const SUPPORTED_RUNTIMES: [&str; 2] = ["node", "universal"];

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub env: HashMap<String, String>,
    pub args: serde_json::Value,
    pub timeout_ms: Option<u64>,
    pub service_id: Option<String>,
    pub auth_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Worker pool running pack bundles with bounded concurrency. Normal packs
/// run as isolated subprocesses; packs granted the `root` capability run
/// in-process through the entrypoint table.
pub struct PackExecutor {
    config: ExecutorConfig,
    fetcher: Arc<BundleFetcher>,
    entrypoints: Arc<EntrypointRegistry>,
    active: Arc<Mutex<HashMap<String, Arc<ExecutionHandle>>>>,
    workers: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl PackExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let fetcher = Arc::new(BundleFetcher::new(&config));
        let workers = Arc::new(Semaphore::new(config.max_concurrent));
        PackExecutor {
            fetcher,
            workers,
            entrypoints: Arc::new(EntrypointRegistry::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            queued: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// In-place bearer update after a token refresh.
    pub fn set_auth_token(&self, token: Option<String>) {
        self.fetcher.set_auth_token(token);
    }

    pub fn register_entrypoint<F, Fut>(&self, pack_name: &str, entrypoint: &str, f: F)
    where
        F: Fn(ExecutionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.entrypoints.register(pack_name, entrypoint, f);
    }

    pub async fn is_running(&self, pod_id: &str) -> bool {
        self.active.lock().await.contains_key(pod_id)
    }

    pub async fn handle_for(&self, pod_id: &str) -> Option<Arc<ExecutionHandle>> {
        self.active.lock().await.get(pod_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Start one execution for the pod. At most one non-terminal execution
    /// may exist per pod id.
    pub async fn execute(
        &self,
        pack: &Pack,
        pod: &Pod,
        options: ExecuteOptions,
    ) -> Result<Arc<ExecutionHandle>, ExecutorError> {
        // Runtime compatibility fails before any work begins.
        if !SUPPORTED_RUNTIMES.contains(&pack.runtime_tag.as_str()) {
            return Err(ExecutorError::RuntimeIncompatible(pack.runtime_tag.clone()));
        }

        let mut active = self.active.lock().await;
        if active.contains_key(&pod.id) {
            return Err(ExecutorError::AlreadyRunning(pod.id.clone()));
        }
        if self.queued.load(Ordering::SeqCst) >= self.config.queue_limit() {
            return Err(ExecutorError::QueueFull);
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let lifecycle = Arc::new(Lifecycle::new(self.config.graceful_shutdown_timeout));
        let cancel = CancellationToken::new();
        let kill = CancellationToken::new();
        let (result_tx, result_rx) = watch::channel(None);
        let ephemeral = pack
            .metadata
            .enable_ephemeral
            .then(|| Arc::new(EphemeralPlane::new()));
        let timeout_ms = options
            .timeout_ms
            .or(pack.metadata.timeout)
            .unwrap_or(self.config.default_timeout_ms);
        let sink = Arc::new(LogSink::new(
            &pod.id,
            Some(&self.config.bundle_dir.join("logs")),
        ));

        let context = ExecutionContext {
            execution_id: execution_id.clone(),
            pod_id: pod.id.clone(),
            pack_id: pack.id.clone(),
            pack_version: pack.version.clone(),
            pack_name: pack.name.clone(),
            runtime_tag: pack.runtime_tag.clone(),
            env: merged_env(pack, pod, &options.env, &execution_id),
            timeout_ms,
            metadata: pack.metadata.clone(),
            lifecycle: lifecycle.clone(),
            service_id: options.service_id.clone(),
            auth_token: options.auth_token.clone(),
            refresh_token: options.refresh_token.clone(),
            token_expires_at: options.token_expires_at,
            ephemeral: ephemeral.clone(),
        };

        let handle = Arc::new(ExecutionHandle {
            execution_id: execution_id.clone(),
            pod_id: pod.id.clone(),
            started_at: Utc::now(),
            lifecycle: lifecycle.clone(),
            cancel_token: cancel.clone(),
            kill_token: kill.clone(),
            result_rx,
            graceful_timeout: self.config.graceful_shutdown_timeout,
        });
        active.insert(pod.id.clone(), handle.clone());
        drop(active);

        debug!("queued execution {execution_id} for pod {}", pod.id);
        self.queued.fetch_add(1, Ordering::SeqCst);

        let config = self.config.clone();
        let fetcher = self.fetcher.clone();
        let entrypoints = self.entrypoints.clone();
        let active = self.active.clone();
        let workers = self.workers.clone();
        let queued = self.queued.clone();
        let pack = pack.clone();
        let pod_id = pod.id.clone();
        let args = options.args;

        tokio::spawn(async move {
            let permit = tokio::select! {
                permit = workers.clone().acquire_owned() => permit.ok(),
                _ = kill.cancelled() => None,
                _ = cancel.cancelled() => None,
            };
            queued.fetch_sub(1, Ordering::SeqCst);

            let result = match permit {
                Some(_permit) => {
                    Self::drive(&config, &fetcher, &entrypoints, pack, context, args, sink.clone(), &cancel, &kill)
                        .await
                }
                None => ExecutionResult::cancelled(0),
            };

            // Terminal cleanup, in order: status, sink, ephemeral, active map.
            lifecycle.set_phase(LifecyclePhase::Terminated);
            sink.close();
            if let Some(plane) = &ephemeral {
                plane.dispose();
            }
            active.lock().await.remove(&pod_id);
            info!(
                "execution {execution_id} for pod {pod_id} finished (success={})",
                result.success
            );
            let _ = result_tx.send(Some(result));
        });

        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        config: &ExecutorConfig,
        fetcher: &BundleFetcher,
        entrypoints: &EntrypointRegistry,
        pack: Pack,
        context: ExecutionContext,
        args: serde_json::Value,
        sink: Arc<LogSink>,
        cancel: &CancellationToken,
        kill: &CancellationToken,
    ) -> ExecutionResult {
        if cancel.is_cancelled() || kill.is_cancelled() {
            return ExecutionResult::cancelled(0);
        }

        if pack.has_capability(CAP_ROOT) {
            return Self::drive_in_process(entrypoints, &pack, context, args, cancel, kill).await;
        }

        let bundle_path = match fetcher.acquire(&pack).await {
            Ok(path) => path,
            Err(e) => {
                return ExecutionResult::failed(format!("start failed: {e}"), 1, 0);
            }
        };
        context.lifecycle.set_phase(LifecyclePhase::Running);
        let spec = SubprocessSpec {
            command: config.runtime_command.clone(),
            bundle_path,
            context: WorkerContext::from(&context),
            args,
            max_memory_mb: config.max_memory_mb,
        };
        run_subprocess(spec, sink, cancel.clone(), kill.clone()).await
    }

    /// Main-thread execution for root-capability packs. Yields to the event
    /// loop before starting work.
    async fn drive_in_process(
        entrypoints: &EntrypointRegistry,
        pack: &Pack,
        context: ExecutionContext,
        args: serde_json::Value,
        cancel: &CancellationToken,
        kill: &CancellationToken,
    ) -> ExecutionResult {
        tokio::task::yield_now().await;

        let Some(entry) = entrypoints.lookup(&pack.name, pack.entrypoint()) else {
            return ExecutionResult::failed(
                format!(
                    "start failed: no registered entrypoint {}/{}",
                    pack.name,
                    pack.entrypoint()
                ),
                1,
                0,
            );
        };

        let timeout_ms = context.timeout_ms;
        context.lifecycle.set_phase(LifecyclePhase::Running);
        let started = Instant::now();
        let deadline = async move {
            if timeout_ms > 0 {
                sleep(Duration::from_millis(timeout_ms)).await;
            } else {
                std::future::pending::<()>().await;
            }
        };
        let work = entry(context, args);

        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;
        tokio::select! {
            result = work => match result {
                Ok(value) => ExecutionResult::succeeded(Some(value), elapsed(started)),
                Err(e) => ExecutionResult::failed(e, 1, elapsed(started)),
            },
            _ = kill.cancelled() => ExecutionResult::cancelled(elapsed(started)),
            _ = cancel.cancelled() => ExecutionResult::cancelled(elapsed(started)),
            _ = deadline => ExecutionResult::failed(
                format!("execution exceeded {timeout_ms}ms"),
                1,
                elapsed(started),
            ),
        }
    }
}
