use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestMode {
    #[default]
    Single,
    Broadcast,
}

/// An inter-pod request document. Saved to the user's request stream where a
/// router picks it up, stamps a target, and forwards it to a node's inbound
/// queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub service: String,
    /// Node name of the issuing pod.
    pub source: String,
    pub source_pod: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_pod: Option<u32>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_remote: bool,
    /// Set when the local shortcut timed out and the request was re-issued
    /// through the router.
    #[serde(default)]
    pub is_local_timeout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_new: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_route: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: RequestMode,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Request {
    pub fn new(service: &str, source: &str, source_pod: u32) -> Self {
        Request {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.to_string(),
            source: source.to_string(),
            source_pod,
            target: None,
            target_pod: None,
            is_new: true,
            is_remote: false,
            is_local_timeout: false,
            time_new: Some(Utc::now()),
            time_route: None,
            mode: RequestMode::Single,
            is_deleted: false,
            retry: false,
            payload: None,
        }
    }
}

/// A response document keyed by the request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub request_id: String,
    /// Node name the response is addressed to.
    pub target: String,
    pub target_pod: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub is_deleted: bool,
    pub time: DateTime<Utc>,
}
