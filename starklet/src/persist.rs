use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

const CREDENTIALS_FILE: &str = "credentials.json";
const REGISTERED_NODES_FILE: &str = "registered-nodes.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredNodeEntry {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_by: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_started: DateTime<Utc>,
}

/// `orchestrator url → node name → entry`.
type RegisteredNodes = HashMap<String, HashMap<String, RegisteredNodeEntry>>;

/// Registered-node keys are normalized: lowercased, trailing slashes and a
/// `/ws` suffix removed.
pub fn normalize_url(url: &str) -> String {
    let mut url = url.to_lowercase();
    while url.ends_with('/') {
        url.pop();
    }
    if let Some(stripped) = url.strip_suffix("/ws") {
        url = stripped.to_string();
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Node credentials and registration state under the agent's secrets
/// directory (0700; files 0600, written atomically).
pub struct StatePersistence {
    dir: PathBuf,
}

impl StatePersistence {
    /// `$HOME/.stark/nodes`.
    pub fn new() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(Self::with_dir(Path::new(&home).join(".stark").join("nodes")))
    }

    pub fn with_dir(dir: PathBuf) -> Self {
        StatePersistence { dir }
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    /// Write+rename so readers never see a torn file.
    fn write_atomic(&self, file_name: &str, contents: &[u8]) -> Result<()> {
        self.ensure_dir()?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        tmp.persist(self.dir.join(file_name))
            .with_context(|| format!("replacing {file_name} failed"))?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, file_name: &str) -> Option<T> {
        let raw = fs::read_to_string(self.dir.join(file_name)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("{file_name} is unreadable, ignoring: {e}");
                None
            }
        }
    }

    pub fn load_credentials(&self) -> Option<NodeCredentials> {
        self.read_json(CREDENTIALS_FILE)
    }

    pub fn save_credentials(&self, credentials: &NodeCredentials) -> Result<()> {
        self.write_atomic(
            CREDENTIALS_FILE,
            serde_json::to_string_pretty(credentials)?.as_bytes(),
        )
    }

    pub fn clear_credentials(&self) {
        let _ = fs::remove_file(self.dir.join(CREDENTIALS_FILE));
    }

    fn load_registered(&self) -> RegisteredNodes {
        self.read_json(REGISTERED_NODES_FILE).unwrap_or_default()
    }

    fn save_registered(&self, nodes: &RegisteredNodes) -> Result<()> {
        self.write_atomic(
            REGISTERED_NODES_FILE,
            serde_json::to_string_pretty(nodes)?.as_bytes(),
        )
    }

    pub fn load_registered_node(&self, url: &str, name: &str) -> Option<RegisteredNodeEntry> {
        self.load_registered()
            .get(&normalize_url(url))?
            .get(name)
            .cloned()
    }

    pub fn save_registered_node(
        &self,
        url: &str,
        name: &str,
        entry: RegisteredNodeEntry,
    ) -> Result<()> {
        let mut nodes = self.load_registered();
        nodes
            .entry(normalize_url(url))
            .or_default()
            .insert(name.to_string(), entry);
        self.save_registered(&nodes)
    }

    pub fn remove_registered_node(&self, url: &str, name: &str) -> Result<()> {
        let mut nodes = self.load_registered();
        if let Some(per_url) = nodes.get_mut(&normalize_url(url)) {
            per_url.remove(name);
            if per_url.is_empty() {
                nodes.remove(&normalize_url(url));
            }
        }
        self.save_registered(&nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistence() -> (StatePersistence, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (
            StatePersistence::with_dir(dir.path().join("nodes")),
            dir,
        )
    }

    #[test]
    fn url_normalization() {
        assert_eq!(
            normalize_url("QUIC://Orchestrator.Example.com:7700/WS/"),
            "quic://orchestrator.example.com:7700"
        );
        assert_eq!(normalize_url("host:7700///"), "host:7700");
        assert_eq!(normalize_url("host:7700"), "host:7700");
    }

    #[test]
    fn credentials_round_trip_with_restrictive_permissions() {
        let (persistence, dir) = persistence();
        let credentials = NodeCredentials {
            access_token: "tok".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: None,
            user_id: Some("alice".to_string()),
            email: None,
            created_at: Utc::now(),
        };
        persistence.save_credentials(&credentials).unwrap();

        let loaded = persistence.load_credentials().unwrap();
        assert_eq!(loaded.access_token, "tok");
        assert_eq!(loaded.user_id.as_deref(), Some("alice"));

        let meta = fs::metadata(dir.path().join("nodes").join(CREDENTIALS_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        let dir_meta = fs::metadata(dir.path().join("nodes")).unwrap();
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);

        persistence.clear_credentials();
        assert!(persistence.load_credentials().is_none());
    }

    #[test]
    fn registered_nodes_key_by_normalized_url() {
        let (persistence, _dir) = persistence();
        let entry = RegisteredNodeEntry {
            node_id: "n-1".to_string(),
            registered_by: Some("alice".to_string()),
            registered_at: Utc::now(),
            last_started: Utc::now(),
        };
        persistence
            .save_registered_node("Orchestrator:7700/", "worker", entry)
            .unwrap();

        let loaded = persistence
            .load_registered_node("orchestrator:7700", "worker")
            .unwrap();
        assert_eq!(loaded.node_id, "n-1");
        assert!(
            persistence
                .load_registered_node("orchestrator:7700", "other")
                .is_none()
        );

        persistence
            .remove_registered_node("orchestrator:7700", "worker")
            .unwrap();
        assert!(
            persistence
                .load_registered_node("orchestrator:7700", "worker")
                .is_none()
        );
    }

    #[test]
    fn corrupt_files_are_ignored() {
        let (persistence, _dir) = persistence();
        persistence.ensure_dir().unwrap();
        fs::write(persistence.dir.join(CREDENTIALS_FILE), "not json").unwrap();
        assert!(persistence.load_credentials().is_none());
    }
}
