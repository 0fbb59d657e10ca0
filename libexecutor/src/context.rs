use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{Pack, PackMetadata, Pod};
use futures::future::join_all;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ephemeral::EphemeralPlane;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecyclePhase {
    Initializing,
    Running,
    Stopping,
    Terminated,
}

/// Read-only shutdown-aware view exposed to pack code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleFacts {
    pub phase: LifecyclePhase,
    pub is_shutting_down: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown_remaining_ms: Option<u64>,
}

type ShutdownHandler =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send>;

#[derive(Debug)]
struct LifecycleState {
    phase: LifecyclePhase,
    shutdown_reason: Option<String>,
    shutdown_requested_at: Option<DateTime<Utc>>,
    shutdown_deadline: Option<Instant>,
}

/// Shared lifecycle record for one execution. Pack code registers shutdown
/// handlers here; the executor drives the phases.
pub struct Lifecycle {
    state: RwLock<LifecycleState>,
    handlers: std::sync::Mutex<Vec<ShutdownHandler>>,
    graceful_timeout: Duration,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("state", &self.state)
            .field("graceful_timeout", &self.graceful_timeout)
            .finish()
    }
}

impl Lifecycle {
    pub fn new(graceful_timeout: Duration) -> Self {
        Lifecycle {
            state: RwLock::new(LifecycleState {
                phase: LifecyclePhase::Initializing,
                shutdown_reason: None,
                shutdown_requested_at: None,
                shutdown_deadline: None,
            }),
            handlers: std::sync::Mutex::new(Vec::new()),
            graceful_timeout,
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.state.read().unwrap().phase
    }

    pub fn set_phase(&self, phase: LifecyclePhase) {
        self.state.write().unwrap().phase = phase;
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.phase(),
            LifecyclePhase::Stopping | LifecyclePhase::Terminated
        )
    }

    pub fn facts(&self) -> LifecycleFacts {
        let state = self.state.read().unwrap();
        let remaining = state.shutdown_deadline.map(|deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64
        });
        LifecycleFacts {
            phase: state.phase,
            is_shutting_down: matches!(
                state.phase,
                LifecyclePhase::Stopping | LifecyclePhase::Terminated
            ),
            shutdown_reason: state.shutdown_reason.clone(),
            shutdown_requested_at: state.shutdown_requested_at,
            graceful_shutdown_remaining_ms: remaining,
        }
    }

    /// Register a handler to run during graceful shutdown. Handlers run
    /// concurrently; their errors are logged, never raised.
    pub fn on_shutdown<F, Fut>(&self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .push(Box::new(move || Box::pin(handler())));
    }

    /// Flip to `stopping` and stamp the shutdown deadline. Idempotent.
    pub fn begin_shutdown(&self, reason: Option<&str>) {
        let mut state = self.state.write().unwrap();
        if matches!(
            state.phase,
            LifecyclePhase::Stopping | LifecyclePhase::Terminated
        ) {
            return;
        }
        state.phase = LifecyclePhase::Stopping;
        state.shutdown_reason = reason.map(str::to_string);
        state.shutdown_requested_at = Some(Utc::now());
        state.shutdown_deadline = Some(Instant::now() + self.graceful_timeout);
    }

    /// Run every registered handler concurrently and wait for all of them.
    /// The caller races this against the graceful deadline.
    pub async fn run_shutdown_handlers(&self) {
        let handlers: Vec<ShutdownHandler> = self.handlers.lock().unwrap().drain(..).collect();
        if handlers.is_empty() {
            return;
        }
        let results = join_all(handlers.into_iter().map(|h| h())).await;
        for result in results {
            if let Err(e) = result {
                warn!("shutdown handler failed: {e}");
            }
        }
    }
}

/// Everything an executing pack sees.
pub struct ExecutionContext {
    pub execution_id: String,
    pub pod_id: String,
    pub pack_id: String,
    pub pack_version: String,
    pub pack_name: String,
    pub runtime_tag: String,
    /// Merged `pack.metadata.env ⊕ options.env ⊕ STARK_*` identifiers.
    pub env: HashMap<String, String>,
    /// 0 means unbounded.
    pub timeout_ms: u64,
    pub metadata: PackMetadata,
    pub lifecycle: Arc<Lifecycle>,
    pub service_id: Option<String>,
    pub auth_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub ephemeral: Option<Arc<EphemeralPlane>>,
}

impl ExecutionContext {
    pub fn on_shutdown<F, Fut>(&self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.lifecycle.on_shutdown(handler);
    }

    pub fn lifecycle_facts(&self) -> LifecycleFacts {
        self.lifecycle.facts()
    }
}

/// The serializable slice of the context that crosses the worker boundary.
/// Live objects (lifecycle, shutdown registrar, ephemeral plane) stay on the
/// control side and are reconstructed by the worker runtime if needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerContext {
    pub execution_id: String,
    pub pod_id: String,
    pub pack_id: String,
    pub pack_version: String,
    pub pack_name: String,
    pub runtime_tag: String,
    pub env: HashMap<String, String>,
    pub timeout_ms: u64,
    pub metadata: PackMetadata,
}

impl From<&ExecutionContext> for WorkerContext {
    fn from(ctx: &ExecutionContext) -> Self {
        WorkerContext {
            execution_id: ctx.execution_id.clone(),
            pod_id: ctx.pod_id.clone(),
            pack_id: ctx.pack_id.clone(),
            pack_version: ctx.pack_version.clone(),
            pack_name: ctx.pack_name.clone(),
            runtime_tag: ctx.runtime_tag.clone(),
            env: ctx.env.clone(),
            timeout_ms: ctx.timeout_ms,
            metadata: ctx.metadata.clone(),
        }
    }
}

/// Merge environment layers for one execution. Later layers win.
pub fn merged_env(
    pack: &Pack,
    pod: &Pod,
    options_env: &HashMap<String, String>,
    execution_id: &str,
) -> HashMap<String, String> {
    let mut env = pack.metadata.env.clone();
    env.extend(options_env.clone());
    env.insert("STARK_EXECUTION_ID".to_string(), execution_id.to_string());
    env.insert("STARK_POD_ID".to_string(), pod.id.clone());
    env.insert("STARK_PACK_ID".to_string(), pack.id.clone());
    env.insert("STARK_PACK_NAME".to_string(), pack.name.clone());
    env.insert("STARK_PACK_VERSION".to_string(), pack.version.clone());
    env.insert("STARK_NAMESPACE".to_string(), pod.namespace.clone());
    env
}
