use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::Lifecycle;

/// Exit code reported for cancelled executions.
pub const EXIT_CANCELLED: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    pub duration_ms: u64,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

impl ExecutionResult {
    pub fn succeeded(return_value: Option<serde_json::Value>, duration_ms: u64) -> Self {
        ExecutionResult {
            success: true,
            return_value,
            error: None,
            error_stack: None,
            duration_ms,
            exit_code: 0,
            memory_usage: None,
        }
    }

    pub fn failed(error: String, exit_code: i32, duration_ms: u64) -> Self {
        ExecutionResult {
            success: false,
            return_value: None,
            error: Some(error),
            error_stack: None,
            duration_ms,
            exit_code,
            memory_usage: None,
        }
    }

    pub fn cancelled(duration_ms: u64) -> Self {
        ExecutionResult {
            success: false,
            return_value: None,
            error: Some("execution cancelled".to_string()),
            error_stack: None,
            duration_ms,
            exit_code: EXIT_CANCELLED,
            memory_usage: None,
        }
    }
}

/// Live view of one execution. `wait()` is the promise; the three stop paths
/// escalate from cooperative to immediate.
#[derive(Debug)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub pod_id: String,
    pub started_at: DateTime<Utc>,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) kill_token: CancellationToken,
    pub(crate) result_rx: watch::Receiver<Option<ExecutionResult>>,
    pub(crate) graceful_timeout: Duration,
}

impl ExecutionHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.lifecycle.clone()
    }

    /// Signal a cooperative stop without waiting for shutdown handlers.
    pub fn cancel(&self) {
        self.lifecycle.begin_shutdown(Some("cancelled"));
        self.cancel_token.cancel();
    }

    /// Kill immediately.
    pub fn force_terminate(&self) {
        self.lifecycle.begin_shutdown(Some("force-terminated"));
        self.kill_token.cancel();
        self.cancel_token.cancel();
    }

    /// Drain shutdown handlers under the graceful deadline, then terminate.
    pub async fn graceful_stop(&self, reason: Option<&str>) {
        self.lifecycle.begin_shutdown(reason);
        let drained = tokio::time::timeout(
            self.graceful_timeout,
            self.lifecycle.run_shutdown_handlers(),
        )
        .await;
        if drained.is_err() {
            warn!(
                "graceful stop of pod {} hit the {}ms deadline",
                self.pod_id,
                self.graceful_timeout.as_millis()
            );
        }
        self.cancel_token.cancel();
        self.kill_token.cancel();
    }

    /// Resolve to the execution result. Multiple waiters see the same value.
    pub async fn wait(&self) -> ExecutionResult {
        let mut rx = self.result_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return ExecutionResult::failed(
                    "execution task dropped without a result".to_string(),
                    1,
                    0,
                );
            }
        }
    }
}
