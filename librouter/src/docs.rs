use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A node participating in a user's routing tier. The inbox names the
/// target requesters on that node watch for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterNodeDoc {
    pub name: String,
    /// Defaults to the node name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
}

impl RouterNodeDoc {
    pub fn inbox(&self) -> &str {
        self.inbox.as_deref().unwrap_or(&self.name)
    }
}

/// A routable service: how many pod instances each node hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDoc {
    pub name: String,
    /// Node name → pod instance count.
    #[serde(default)]
    pub node_pods: HashMap<String, u32>,
}
