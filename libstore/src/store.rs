use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::selector::Selector;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("document decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("change feed closed")]
    FeedClosed,
}

/// A single change observed on a watched prefix.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Put {
        key: String,
        value: String,
        prev: Option<String>,
    },
    Delete {
        key: String,
        prev: Option<String>,
    },
}

impl StoreEvent {
    pub fn key(&self) -> &str {
        match self {
            StoreEvent::Put { key, .. } => key,
            StoreEvent::Delete { key, .. } => key,
        }
    }
}

/// Live change feed for a key prefix, starting from the moment of the watch
/// call. Dropping the feed cancels the watch.
pub struct WatchFeed {
    pub events: mpsc::Receiver<StoreEvent>,
}

impl WatchFeed {
    pub async fn next(&mut self) -> Option<StoreEvent> {
        self.events.recv().await
    }
}

/// The opaque document-store contract. Documents are JSON strings addressed
/// by key; feeds deliver every change under a prefix in commit order.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Key/value pairs currently under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn watch(&self, prefix: &str) -> Result<WatchFeed, StoreError>;
}

pub async fn put_json<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    key: &str,
    doc: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_string(doc)?;
    store.put(key, value).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Secondary-index find: list a prefix and keep documents matching the
/// selector. Documents that fail to decode are skipped.
pub async fn find_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    prefix: &str,
    selector: &Selector,
) -> Result<Vec<(String, T)>, StoreError> {
    let mut out = Vec::new();
    for (key, raw) in store.list(prefix).await? {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        if selector.matches(&value) {
            out.push((key, serde_json::from_value(value)?));
        }
    }
    Ok(out)
}
