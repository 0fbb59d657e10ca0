use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, WatchOptions};
use log::{error, warn};
use tokio::sync::{RwLock, mpsc};

use crate::store::{DocumentStore, StoreError, StoreEvent, WatchFeed};

/// Document store backed by an etcd/Xline-compatible endpoint.
#[derive(Clone)]
pub struct EtcdStore {
    client: Arc<RwLock<Client>>,
}

impl EtcdStore {
    pub async fn new(endpoints: &[&str]) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
        })
    }
}

fn backend_err(e: etcd_client::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl DocumentStore for EtcdStore {
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut client = self.client.write().await;
        client.put(key, value, None).await.map_err(backend_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await.map_err(backend_err)?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.write().await;
        client.delete(key, None).await.map_err(backend_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut client = self.client.write().await;
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend_err)?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    String::from_utf8_lossy(kv.value()).to_string(),
                )
            })
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchFeed, StoreError> {
        // Snapshot the current revision so the feed starts "now".
        let start_rev = {
            let mut client = self.client.write().await;
            let resp = client
                .get(prefix, Some(GetOptions::new().with_prefix().with_keys_only()))
                .await
                .map_err(backend_err)?;
            resp.header().map(|h| h.revision()).unwrap_or(0) + 1
        };

        let opts = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(start_rev);
        let (mut watcher, mut stream) = {
            let mut client = self.client.write().await;
            client.watch(prefix, Some(opts)).await.map_err(backend_err)?
        };

        let (tx, rx) = mpsc::channel(64);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let Some(kv) = event.kv() else { continue };
                            let key = String::from_utf8_lossy(kv.key()).to_string();
                            let prev = event
                                .prev_kv()
                                .map(|p| String::from_utf8_lossy(p.value()).to_string());
                            let store_event = match event.event_type() {
                                EventType::Put => StoreEvent::Put {
                                    key,
                                    value: String::from_utf8_lossy(kv.value()).to_string(),
                                    prev,
                                },
                                EventType::Delete => StoreEvent::Delete { key, prev },
                            };
                            if tx.send(store_event).await.is_err() {
                                // Feed dropped by the consumer.
                                let _ = watcher.cancel().await;
                                return;
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("[store] watch stream on {prefix} ended");
                        return;
                    }
                    Err(e) => {
                        error!("[store] watch error on {prefix}: {e}");
                        return;
                    }
                }
            }
        });

        Ok(WatchFeed { events: rx })
    }
}
