use std::collections::HashMap;
use std::fs;

use anyhow::{Context, Result};
use common::{Pack, PriorityClass};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// ip:port the control plane listens on.
    pub addr: String,
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub nodes: NodeSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub routers: Vec<RouterSection>,
    #[serde(default)]
    pub seed: SeedSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub enable_preemption: bool,
    #[serde(default)]
    pub default_priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_offline_grace")]
    pub offline_grace_secs: u64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_offline_grace() -> u64 {
    30
}

fn default_scan_interval() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    30
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            heartbeat_interval_secs: default_heartbeat_interval(),
            offline_grace_secs: default_offline_grace(),
            scan_interval_secs: default_scan_interval(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Static token table; the credential vault behind it is an external
/// collaborator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub tokens: HashMap<String, AuthUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    pub user: String,
    #[serde(default = "default_num_routers")]
    pub num_routers: u32,
    #[serde(default)]
    pub router_index: u32,
}

fn default_num_routers() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeedSection {
    #[serde(default)]
    pub packs: Vec<Pack>,
    #[serde(default)]
    pub priority_classes: Vec<PriorityClass>,
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
