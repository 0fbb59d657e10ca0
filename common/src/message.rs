use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ErrorCode;
use crate::node::{NodeStatus, Taint};
use crate::pack::Pack;
use crate::pod::{Pod, PodStatus};
use crate::resources::Resources;

/// Control-plane frame types.
pub mod frame_type {
    // Server-initiated.
    pub const CONNECTED: &str = "connected";
    pub const PING: &str = "ping";
    pub const DISCONNECT: &str = "disconnect";
    pub const POD_DEPLOY: &str = "pod:deploy";
    pub const POD_STOP: &str = "pod:stop";

    // Client-initiated.
    pub const AUTHENTICATE: &str = "auth:authenticate";
    pub const NODE_REGISTER: &str = "node:register";
    pub const NODE_RECONNECT: &str = "node:reconnect";
    pub const NODE_HEARTBEAT: &str = "node:heartbeat";
    pub const POD_STATUS_UPDATE: &str = "pod:status:update";
    pub const PONG: &str = "pong";

    pub const SUCCESS_SUFFIX: &str = ":success";
    pub const ERROR_SUFFIX: &str = ":error";
}

/// A single control-plane frame: `{type, payload, correlationId?}` in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

impl Frame {
    pub fn new(kind: &str, payload: &impl Serialize) -> Result<Frame, serde_json::Error> {
        Ok(Frame {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
            correlation_id: None,
        })
    }

    pub fn bare(kind: &str) -> Frame {
        Frame {
            kind: kind.to_string(),
            payload: serde_json::Value::Null,
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, id: impl Into<String>) -> Frame {
        self.correlation_id = Some(id.into());
        self
    }

    /// `<type>:success` reply carrying the original correlation id.
    pub fn success_reply(
        request: &Frame,
        payload: &impl Serialize,
    ) -> Result<Frame, serde_json::Error> {
        let mut frame = Frame::new(
            &format!("{}{}", request.kind, frame_type::SUCCESS_SUFFIX),
            payload,
        )?;
        frame.correlation_id = request.correlation_id.clone();
        Ok(frame)
    }

    /// `<type>:error` reply carrying the original correlation id.
    pub fn error_reply(request: &Frame, code: ErrorCode, message: &str) -> Frame {
        let payload = ErrorPayload {
            code,
            message: message.to_string(),
        };
        Frame {
            kind: format!("{}{}", request.kind, frame_type::ERROR_SUFFIX),
            payload: serde_json::to_value(&payload).unwrap_or(serde_json::Value::Null),
            correlation_id: request.correlation_id.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind.ends_with(frame_type::ERROR_SUFFIX)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatePayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPayload {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub name: String,
    pub runtime_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub allocatable: Resources,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredPayload {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPayload {
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub status: NodeStatus,
    pub allocated: Resources,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    pub pod_id: String,
    pub pack: Pack,
    pub pod: Pod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    pub pod_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdatePayload {
    pub pod_id: String,
    pub status: PodStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_with_correlation() {
        let frame = Frame::new(
            frame_type::AUTHENTICATE,
            &AuthenticatePayload {
                token: "t0ken".to_string(),
            },
        )
        .unwrap()
        .with_correlation("c-1");

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"auth:authenticate\""));
        assert!(json.contains("\"correlationId\":\"c-1\""));

        let parsed: Frame = serde_json::from_str(&json).unwrap();
        let payload: AuthenticatePayload = parsed.payload_as().unwrap();
        assert_eq!(payload.token, "t0ken");
    }

    #[test]
    fn replies_carry_the_request_correlation() {
        let request = Frame::bare(frame_type::POD_DEPLOY).with_correlation("c-9");
        let ok = Frame::success_reply(&request, &serde_json::json!({})).unwrap();
        assert_eq!(ok.kind, "pod:deploy:success");
        assert_eq!(ok.correlation_id.as_deref(), Some("c-9"));

        let err = Frame::error_reply(&request, ErrorCode::AlreadyRunning, "busy");
        assert_eq!(err.kind, "pod:deploy:error");
        assert!(err.is_error());
        let payload: ErrorPayload = err.payload_as().unwrap();
        assert_eq!(payload.code, ErrorCode::AlreadyRunning);
    }

    #[test]
    fn missing_correlation_deserializes_to_none() {
        let parsed: Frame = serde_json::from_str(r#"{"type":"ping","payload":null}"#).unwrap();
        assert!(parsed.correlation_id.is_none());
    }
}
