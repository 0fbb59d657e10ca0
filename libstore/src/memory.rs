use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::store::{DocumentStore, StoreError, StoreEvent, WatchFeed};

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<StoreEvent>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, String>,
    watchers: Vec<Watcher>,
}

/// In-memory document store with the same feed semantics as the etcd
/// backend. Used by tests and by single-process deployments.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    async fn notify(inner: &mut Inner, event: StoreEvent) {
        let key = event.key().to_string();
        // Drop watchers whose feed was closed by the consumer.
        let mut kept = Vec::with_capacity(inner.watchers.len());
        for watcher in inner.watchers.drain(..) {
            if key.starts_with(&watcher.prefix) {
                if watcher.tx.send(event.clone()).await.is_err() {
                    continue;
                }
            }
            kept.push(watcher);
        }
        inner.watchers = kept;
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let prev = inner.docs.insert(key.to_string(), value.clone());
        Self::notify(
            &mut inner,
            StoreEvent::Put {
                key: key.to_string(),
                value,
                prev,
            },
        )
        .await;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.docs.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(prev) = inner.docs.remove(key) {
            Self::notify(
                &mut inner,
                StoreEvent::Delete {
                    key: key.to_string(),
                    prev: Some(prev),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchFeed, StoreError> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().await.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(WatchFeed { events: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{find_json, get_json, put_json};
    use crate::{Selector, keys};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        target: Option<String>,
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = MemStore::new();
        let doc = Doc {
            id: "r-1".to_string(),
            target: None,
        };
        put_json(&store, &keys::user_request_key("alice", "r-1"), &doc)
            .await
            .unwrap();
        let loaded: Option<Doc> = get_json(&store, &keys::user_request_key("alice", "r-1"))
            .await
            .unwrap();
        assert_eq!(loaded, Some(doc));

        store
            .delete(&keys::user_request_key("alice", "r-1"))
            .await
            .unwrap();
        let loaded: Option<Doc> = get_json(&store, &keys::user_request_key("alice", "r-1"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn watch_sees_puts_and_deletes_under_the_prefix() {
        let store = MemStore::new();
        let mut feed = store.watch("/users/alice/requests/").await.unwrap();

        store
            .put("/users/alice/requests/r-1", "{}".to_string())
            .await
            .unwrap();
        store
            .put("/users/bob/requests/r-2", "{}".to_string())
            .await
            .unwrap();
        store.delete("/users/alice/requests/r-1").await.unwrap();

        match feed.next().await.unwrap() {
            StoreEvent::Put { key, .. } => assert_eq!(key, "/users/alice/requests/r-1"),
            other => panic!("unexpected event {other:?}"),
        }
        // Bob's put must not leak into Alice's feed.
        match feed.next().await.unwrap() {
            StoreEvent::Delete { key, prev } => {
                assert_eq!(key, "/users/alice/requests/r-1");
                assert_eq!(prev.as_deref(), Some("{}"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_applies_selectors() {
        let store = MemStore::new();
        for (id, target) in [("a", Some("n1")), ("b", None), ("c", Some("n2"))] {
            let doc = Doc {
                id: id.to_string(),
                target: target.map(str::to_string),
            };
            put_json(&store, &format!("/docs/{id}"), &doc).await.unwrap();
        }
        let selector = Selector::new().field_eq("target", "n1");
        let found: Vec<(String, Doc)> = find_json(&store, "/docs/", &selector).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.id, "a");
    }
}
