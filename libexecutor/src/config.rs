use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Root for relative bundle paths, the download cache and staging files.
    pub bundle_dir: PathBuf,
    pub orchestrator_url: Option<String>,
    pub auth_token: Option<String>,
    /// Default execution timeout in milliseconds; 0 means unbounded.
    pub default_timeout_ms: u64,
    pub max_concurrent: usize,
    /// Optional per-worker memory cap.
    pub max_memory_mb: Option<u64>,
    pub graceful_shutdown_timeout: Duration,
    /// Command used to launch bundle workers, e.g. `node`.
    pub runtime_command: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            bundle_dir: PathBuf::from("."),
            orchestrator_url: None,
            auth_token: None,
            default_timeout_ms: 0,
            max_concurrent: 10,
            max_memory_mb: None,
            graceful_shutdown_timeout: Duration::from_millis(5000),
            runtime_command: "node".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Upper bound on executions waiting for a worker slot.
    pub fn queue_limit(&self) -> usize {
        self.max_concurrent * 2
    }
}
