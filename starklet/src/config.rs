use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use common::{Resources, Taint};
use gethostname::gethostname;
use serde::Deserialize;
use sysinfo::System;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// QUIC address of the orchestrator control plane, `host:port`.
    pub orchestrator_url: String,
    /// HTTP base for auth refresh, node lookup and storage bundles.
    #[serde(default)]
    pub api_url: Option<String>,
    /// Defaults to the hostname.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_runtime_type")]
    pub runtime_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Defaults to autodetected host resources.
    #[serde(default)]
    pub allocatable: Option<Resources>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// -1 keeps retrying forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i64,
    /// Defaults to the working directory.
    #[serde(default)]
    pub bundle_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub persist_state: bool,
    #[serde(default = "default_true")]
    pub resume_existing: bool,
    #[serde(default)]
    pub executor: ExecutorSection,
}

fn default_runtime_type() -> String {
    "node".to_string()
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> i64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// 0 means unbounded.
    #[serde(default)]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default = "default_graceful_shutdown_ms")]
    pub graceful_shutdown_timeout_ms: u64,
    #[serde(default = "default_runtime_command")]
    pub runtime_command: String,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_graceful_shutdown_ms() -> u64 {
    5000
}

fn default_runtime_command() -> String {
    "node".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        ExecutorSection {
            default_timeout_ms: 0,
            max_concurrent: default_max_concurrent(),
            max_memory_mb: None,
            graceful_shutdown_timeout_ms: default_graceful_shutdown_ms(),
            runtime_command: default_runtime_command(),
        }
    }
}

impl AgentConfig {
    pub fn node_name(&self) -> String {
        self.node_name
            .clone()
            .unwrap_or_else(|| gethostname().to_string_lossy().into_owned())
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.bundle_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Configured resources, or the host's own: all cores but one, total
    /// memory, a generous pod slot count.
    pub fn allocatable(&self) -> Resources {
        if let Some(allocatable) = self.allocatable {
            return allocatable;
        }
        let mut sys = System::new_all();
        sys.refresh_all();
        let cpus = sys.cpus().len().saturating_sub(1).max(1) as u64;
        Resources {
            cpu: cpus * 1000,
            memory: sys.total_memory() / (1024 * 1024),
            pods: 110,
            storage: 0,
        }
    }

    /// HTTP base for the orchestrator API, derived from the control-plane
    /// address when not configured.
    pub fn api_base(&self) -> String {
        if let Some(api_url) = &self.api_url {
            return api_url.trim_end_matches('/').to_string();
        }
        let host = self
            .orchestrator_url
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.orchestrator_url.as_str());
        format!("http://{host}")
    }
}

pub fn load_config(path: &str) -> Result<AgentConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: AgentConfig = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: AgentConfig = serde_yaml::from_str("orchestrator_url: \"127.0.0.1:7700\"\n").unwrap();
        assert_eq!(cfg.heartbeat_interval_secs, 15);
        assert_eq!(cfg.reconnect_delay_secs, 5);
        assert_eq!(cfg.max_reconnect_attempts, 10);
        assert!(cfg.persist_state);
        assert!(cfg.resume_existing);
        assert_eq!(cfg.runtime_type, "node");
        assert_eq!(cfg.executor.max_concurrent, 10);
        assert_eq!(cfg.executor.graceful_shutdown_timeout_ms, 5000);
        assert!(!cfg.node_name().is_empty());
        assert!(cfg.allocatable().cpu > 0);
    }

    #[test]
    fn api_base_derives_from_the_control_plane_host() {
        let cfg: AgentConfig = serde_yaml::from_str(
            "orchestrator_url: \"orchestrator.example.com:7700\"\n",
        )
        .unwrap();
        assert_eq!(cfg.api_base(), "http://orchestrator.example.com");

        let cfg: AgentConfig = serde_yaml::from_str(
            "orchestrator_url: \"127.0.0.1:7700\"\napi_url: \"https://api.example.com/\"\n",
        )
        .unwrap();
        assert_eq!(cfg.api_base(), "https://api.example.com");
    }
}
