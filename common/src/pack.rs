use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Capability that lets a pack run on the main thread instead of an isolated
/// worker.
pub const CAP_ROOT: &str = "root";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackMetadata {
    /// Exported entrypoint name; `default` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Execution timeout in milliseconds; absent or 0 means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub enable_ephemeral: bool,
}

/// An immutable, versioned code bundle. Once registered a pack never changes;
/// new behavior ships as a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pack {
    pub id: String,
    pub name: String,
    pub version: String,
    pub runtime_tag: String,
    /// Absolute path, URL, `storage:<key>` reference, or path relative to
    /// the executor's bundle directory.
    pub bundle_path: String,
    /// Inline bundle source; takes precedence over `bundle_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_content: Option<String>,
    #[serde(default)]
    pub metadata: PackMetadata,
    #[serde(default)]
    pub granted_capabilities: BTreeSet<String>,
}

/// Where a pack's bundle comes from, derived from its `bundle_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleLocator {
    Inline,
    Absolute(PathBuf),
    Url(String),
    /// Key into the orchestrator's storage API.
    Storage(String),
    /// Resolved against the executor's bundle directory.
    Relative(PathBuf),
}

impl Pack {
    pub fn has_capability(&self, cap: &str) -> bool {
        self.granted_capabilities.contains(cap)
    }

    pub fn entrypoint(&self) -> &str {
        self.metadata.entrypoint.as_deref().unwrap_or("default")
    }

    /// Cache file name for downloaded bundles.
    pub fn cache_file_name(&self) -> String {
        format!("{}-{}.js", self.id, self.version)
    }

    pub fn bundle_locator(&self) -> BundleLocator {
        if self.bundle_content.is_some() {
            return BundleLocator::Inline;
        }
        let path = self.bundle_path.as_str();
        if path.starts_with("http://") || path.starts_with("https://") {
            BundleLocator::Url(path.to_string())
        } else if let Some(key) = path.strip_prefix("storage:") {
            BundleLocator::Storage(key.to_string())
        } else if Path::new(path).is_absolute() {
            BundleLocator::Absolute(PathBuf::from(path))
        } else {
            BundleLocator::Relative(PathBuf::from(path))
        }
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

    #[test]
    fn locators_resolve_by_shape() {
        assert_eq!(
            pack_with_path("https://host/b.js").bundle_locator(),
            BundleLocator::Url("https://host/b.js".to_string())
        );
        assert_eq!(
            pack_with_path("storage:bundles/b.js").bundle_locator(),
            BundleLocator::Storage("bundles/b.js".to_string())
        );
        assert_eq!(
            pack_with_path("/opt/b.js").bundle_locator(),
            BundleLocator::Absolute(PathBuf::from("/opt/b.js"))
        );
        assert_eq!(
            pack_with_path("b.js").bundle_locator(),
            BundleLocator::Relative(PathBuf::from("b.js"))
        );

        let mut inline = pack_with_path("b.js");
        inline.bundle_content = Some("code".to_string());
        assert_eq!(inline.bundle_locator(), BundleLocator::Inline);
    }

    #[test]
    fn default_entrypoint_and_cache_name() {
        let pack = pack_with_path("b.js");
        assert_eq!(pack.entrypoint(), "default");
        assert_eq!(pack.cache_file_name(), "pk-1.0.0.js");
    }
}
