use std::path::PathBuf;
use std::sync::RwLock;

use common::{BundleLocator, Pack};
use log::{debug, info};
use tokio::fs;

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;

/// Acquires pack bundles and stages them as files for the worker runtime.
/// Downloads are cached under `<bundle_dir>/downloads/` and reused.
pub struct BundleFetcher {
    bundle_dir: PathBuf,
    orchestrator_url: Option<String>,
    auth_token: RwLock<Option<String>>,
    client: reqwest::Client,
}

impl BundleFetcher {
    pub fn new(config: &ExecutorConfig) -> Self {
        BundleFetcher {
            bundle_dir: config.bundle_dir.clone(),
            orchestrator_url: config.orchestrator_url.clone(),
            auth_token: RwLock::new(config.auth_token.clone()),
            client: reqwest::Client::new(),
        }
    }

    /// Swap the bearer token in place after a refresh; no reconnection.
    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write().unwrap() = token;
    }

    fn cache_path(&self, pack: &Pack) -> PathBuf {
        self.bundle_dir.join("downloads").join(pack.cache_file_name())
    }

    /// Produce a bundle file on disk for the pack, fetching it if needed.
    pub async fn acquire(&self, pack: &Pack) -> Result<PathBuf, ExecutorError> {
        match pack.bundle_locator() {
            BundleLocator::Inline => {
                let staging = self.bundle_dir.join("staging");
                fs::create_dir_all(&staging).await?;
                let path = staging.join(pack.cache_file_name());
                fs::write(&path, pack.bundle_content.as_deref().unwrap_or_default()).await?;
                Ok(path)
            }
            BundleLocator::Absolute(path) => self.existing(path).await,
            BundleLocator::Relative(rel) => self.existing(self.bundle_dir.join(rel)).await,
            BundleLocator::Url(url) => self.download(pack, &url, false).await,
            BundleLocator::Storage(key) => {
                let base = self.orchestrator_url.as_deref().ok_or_else(|| {
                    ExecutorError::Bundle("storage bundle requires an orchestrator url".to_string())
                })?;
                let url = format!("{}/api/storage/{key}", base.trim_end_matches('/'));
                self.download(pack, &url, true).await
            }
        }
    }

    async fn existing(&self, path: PathBuf) -> Result<PathBuf, ExecutorError> {
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(ExecutorError::Bundle(format!(
                "bundle file {} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn download(
        &self,
        pack: &Pack,
        url: &str,
        with_bearer: bool,
    ) -> Result<PathBuf, ExecutorError> {
        let cache = self.cache_path(pack);
        if fs::try_exists(&cache).await.unwrap_or(false) {
            debug!("bundle cache hit for {}@{}", pack.id, pack.version);
            return Ok(cache);
        }

        let mut request = self.client.get(url);
        if with_bearer
            && let Some(token) = self.auth_token.read().unwrap().clone()
        {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ExecutorError::Bundle(format!("GET {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ExecutorError::Bundle(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ExecutorError::Bundle(format!("reading {url} failed: {e}")))?;

        fs::create_dir_all(cache.parent().unwrap()).await?;
        fs::write(&cache, &body).await?;
        info!("cached bundle {}@{} from {url}", pack.id, pack.version);
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_with_path(path: &str) -> Pack {
        Pack {
            id: "pk".to_string(),
            name: "svc".to_string(),
            version: "1.0.0".to_string(),
            runtime_tag: "node".to_string(),
            bundle_path: path.to_string(),
            bundle_content: None,
            metadata: Default::default(),
            granted_capabilities: Default::default(),
        }
    }

    #[tokio::test]
    async fn inline_bundles_are_staged_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecutorConfig {
            bundle_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fetcher = BundleFetcher::new(&config);

        let mut pack = pack_with_path("ignored.js");
        pack.bundle_content = Some("echo inline".to_string());
        let path = fetcher.acquire(&pack).await.unwrap();
        assert_eq!(fs::read_to_string(&path).await.unwrap(), "echo inline");
    }

    #[tokio::test]
    async fn relative_bundles_join_the_bundle_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.js"), "code").await.unwrap();
        let config = ExecutorConfig {
            bundle_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let fetcher = BundleFetcher::new(&config);

        let path = fetcher.acquire(&pack_with_path("b.js")).await.unwrap();
        assert_eq!(path, dir.path().join("b.js"));

        let missing = fetcher.acquire(&pack_with_path("missing.js")).await;
        assert!(matches!(missing, Err(ExecutorError::Bundle(_))));
    }

    #[tokio::test]
    async fn storage_bundles_need_an_orchestrator_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecutorConfig {
            bundle_dir: dir.path().to_path_buf(),
            orchestrator_url: None,
            ..Default::default()
        };
        let fetcher = BundleFetcher::new(&config);
        let err = fetcher
            .acquire(&pack_with_path("storage:bundles/b.js"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Bundle(_)));
    }
}
