use std::sync::Arc;

use common::{BundleLocator, OrchestratorError, OrchestratorResult, Pack};
use libscheduler::ClusterState;
use libstore::{DocumentStore, StoreError, keys, put_json};
use log::{info, warn};
use tokio::sync::RwLock;

/// Pack metadata: registration, lookup and bundle location. Packs are
/// immutable; the registry mirrors them into the document store.
pub struct PackRegistry {
    state: Arc<RwLock<ClusterState>>,
    store: Arc<dyn DocumentStore>,
}

impl PackRegistry {
    pub fn new(state: Arc<RwLock<ClusterState>>, store: Arc<dyn DocumentStore>) -> Self {
        PackRegistry { state, store }
    }

    pub async fn register(&self, pack: Pack) -> OrchestratorResult<Pack> {
        if pack.id.is_empty() || pack.name.is_empty() || pack.version.is_empty() {
            return Err(OrchestratorError::validation(
                "pack id, name and version are required",
            ));
        }
        if pack.bundle_content.is_none() && pack.bundle_path.is_empty() {
            return Err(OrchestratorError::validation(
                "pack needs a bundle path or inline content",
            ));
        }
        self.state.write().await.register_pack(pack.clone())?;
        if let Err(e) = put_json(self.store.as_ref(), &keys::pack_key(&pack.id), &pack).await {
            warn!("persisting pack {} failed: {e}", pack.id);
        }
        info!("registered pack {} ({}@{})", pack.id, pack.name, pack.version);
        Ok(pack)
    }

    pub async fn get(&self, pack_id: &str) -> Option<Pack> {
        self.state.read().await.pack(pack_id).cloned()
    }

    pub async fn lookup(&self, name: &str, version: &str) -> Option<Pack> {
        // Id-keyed arena; name lookups scan.
        let state = self.state.read().await;
        state
            .packs()
            .find(|p| p.name == name && p.version == version)
            .cloned()
    }

    /// Where an agent should fetch the pack's bundle from.
    pub async fn locate(&self, pack_id: &str) -> Option<BundleLocator> {
        self.get(pack_id).await.map(|pack| pack.bundle_locator())
    }

    /// Rehydrate packs persisted by an earlier run.
    pub async fn load_existing(&self) -> Result<usize, StoreError> {
        let docs = self.store.list(keys::PACK_PREFIX).await?;
        let mut loaded = 0;
        let mut state = self.state.write().await;
        for (key, raw) in docs {
            match serde_json::from_str::<Pack>(&raw) {
                Ok(pack) => {
                    if state.register_pack(pack).is_ok() {
                        loaded += 1;
                    }
                }
                Err(e) => warn!("skipping undecodable pack at {key}: {e}"),
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libstore::MemStore;

    fn pack(id: &str, name: &str, version: &str) -> Pack {
        Pack {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            runtime_tag: "node".to_string(),
            bundle_path: "bundle.js".to_string(),
            bundle_content: None,
            metadata: Default::default(),
            granted_capabilities: Default::default(),
        }
    }

    fn registry() -> (PackRegistry, Arc<dyn DocumentStore>) {
        let store: Arc<dyn DocumentStore> = Arc::new(MemStore::new());
        let state = Arc::new(RwLock::new(ClusterState::new()));
        (PackRegistry::new(state, store.clone()), store)
    }

    #[tokio::test]
    async fn register_persists_and_lookup_finds() {
        let (registry, store) = registry();
        registry.register(pack("pk-1", "svc", "1.0.0")).await.unwrap();

        assert!(registry.get("pk-1").await.is_some());
        assert!(registry.lookup("svc", "1.0.0").await.is_some());
        assert!(registry.lookup("svc", "2.0.0").await.is_none());
        assert_eq!(
            registry.locate("pk-1").await,
            Some(BundleLocator::Relative("bundle.js".into()))
        );
        assert!(store.get(&keys::pack_key("pk-1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn changed_re_registration_conflicts() {
        let (registry, _) = registry();
        registry.register(pack("pk-1", "svc", "1.0.0")).await.unwrap();

        let mut changed = pack("pk-1", "svc", "1.0.0");
        changed.bundle_path = "other.js".to_string();
        let err = registry.register(changed).await.unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn empty_fields_fail_validation() {
        let (registry, _) = registry();
        let err = registry.register(pack("", "svc", "1.0.0")).await.unwrap_err();
        assert_eq!(err.code, common::ErrorCode::Validation);
    }

    #[tokio::test]
    async fn load_existing_rehydrates_from_the_store() {
        let (registry, store) = registry();
        registry.register(pack("pk-1", "svc", "1.0.0")).await.unwrap();

        let state = Arc::new(RwLock::new(ClusterState::new()));
        let fresh = PackRegistry::new(state, store);
        assert_eq!(fresh.load_existing().await.unwrap(), 1);
        assert!(fresh.get("pk-1").await.is_some());
    }
}
