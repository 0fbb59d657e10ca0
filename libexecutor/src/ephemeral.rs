use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct EphemeralEvent {
    pub key: String,
    /// `None` on removal.
    pub value: Option<serde_json::Value>,
}

/// Opt-in in-pod group store with pub/sub. Lives exactly as long as the
/// execution; the executor disposes it on every terminal outcome.
pub struct EphemeralPlane {
    entries: RwLock<HashMap<String, serde_json::Value>>,
    events: broadcast::Sender<EphemeralEvent>,
    disposed: AtomicBool,
}

impl Default for EphemeralPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl EphemeralPlane {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        EphemeralPlane {
            entries: RwLock::new(HashMap::new()),
            events,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn set(&self, key: &str, value: serde_json::Value) -> Result<(), String> {
        if self.is_disposed() {
            return Err("ephemeral plane is disposed".to_string());
        }
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.clone());
        let _ = self.events.send(EphemeralEvent {
            key: key.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        let removed = self.entries.write().unwrap().remove(key);
        if removed.is_some() {
            let _ = self.events.send(EphemeralEvent {
                key: key.to_string(),
                value: None,
            });
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EphemeralEvent> {
        self.events.subscribe()
    }

    /// Drop all data and refuse further writes.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_and_subscribe() {
        let plane = EphemeralPlane::new();
        let mut sub = plane.subscribe();

        plane.set("leader", json!("pod-0")).unwrap();
        assert_eq!(plane.get("leader"), Some(json!("pod-0")));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.key, "leader");
        assert_eq!(event.value, Some(json!("pod-0")));

        plane.remove("leader");
        let event = sub.recv().await.unwrap();
        assert!(event.value.is_none());
    }

    #[test]
    fn dispose_clears_and_blocks_writes() {
        let plane = EphemeralPlane::new();
        plane.set("k", json!(1)).unwrap();
        plane.dispose();
        assert!(plane.get("k").is_none());
        assert!(plane.set("k", json!(2)).is_err());
        assert!(plane.is_disposed());
    }
}
