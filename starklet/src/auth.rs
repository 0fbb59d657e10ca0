use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// HTTP client for the orchestrator's auth and node-lookup surface.
pub struct AuthClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<RefreshedUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshedUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeByName {
    pub node: NodeRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub id: String,
    #[serde(default)]
    pub registered_by: Option<String>,
}

impl AuthClient {
    pub fn new(base_url: String) -> Self {
        AuthClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// `POST /auth/refresh {refreshToken}`.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens> {
        let url = format!("{}/auth/refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        if !response.status().is_success() {
            bail!("POST {url} returned {}", response.status());
        }
        response.json().await.context("decoding refresh response")
    }

    /// `GET /api/nodes/name/{name}` with bearer auth; `None` when unknown.
    pub async fn node_by_name(&self, token: &str, name: &str) -> Result<Option<NodeByName>> {
        let url = format!("{}/api/nodes/name/{name}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("GET {url} returned {}", response.status());
        }
        Ok(Some(response.json().await.context("decoding node lookup")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_response_decodes_the_wire_shape() {
        let raw = r#"{
            "accessToken": "a1",
            "refreshToken": "r1",
            "expiresAt": "2026-08-01T10:00:00Z",
            "user": { "id": "u-1", "email": "a@example.com" }
        }"#;
        let tokens: RefreshedTokens = serde_json::from_str(raw).unwrap();
        assert_eq!(tokens.access_token, "a1");
        assert_eq!(tokens.user.unwrap().id, "u-1");
    }

    #[test]
    fn node_lookup_decodes() {
        let raw = r#"{ "node": { "id": "n-9", "registeredBy": "alice" } }"#;
        let lookup: NodeByName = serde_json::from_str(raw).unwrap();
        assert_eq!(lookup.node.id, "n-9");
        assert_eq!(lookup.node.registered_by.as_deref(), Some("alice"));
    }
}
