//! Source bundle lookup.

use crate::error::StoreError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use vatworks_core::{BundleId, CoreResult};

/// Resolves bundle ids to bundle contents
pub trait BundleHandler: Send + Sync {
    /// Ids of the bundles the kernel currently uses
    fn current_bundle_ids(&self) -> Vec<BundleId>;

    /// Fetch a bundle
    ///
    /// # Errors
    ///
    /// Returns error if the bundle is unknown or unreadable
    fn bundle(&self, id: &BundleId) -> CoreResult<Arc<Value>>;
}

/// In-memory bundle table
#[derive(Debug, Default)]
pub struct MemoryBundleHandler {
    bundles: RwLock<BTreeMap<BundleId, Arc<Value>>>,
}

impl MemoryBundleHandler {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a bundle
    pub fn insert(&self, id: BundleId, bundle: Value) {
        self.bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(bundle));
    }
}

impl BundleHandler for MemoryBundleHandler {
    fn current_bundle_ids(&self) -> Vec<BundleId> {
        self.bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn bundle(&self, id: &BundleId) -> CoreResult<Arc<Value>> {
        self.bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| {
                StoreError::UnknownBundle {
                    bundle_id: id.to_string(),
                }
                .into()
            })
    }
}

/// Bundles stored as `<dir>/<bundleID>.json`
#[derive(Debug, Clone)]
pub struct DirBundleHandler {
    dir: PathBuf,
}

impl DirBundleHandler {
    /// Read bundles from a directory
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl BundleHandler for DirBundleHandler {
    fn current_bundle_ids(&self) -> Vec<BundleId> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut ids: Vec<BundleId> = entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".json").map(BundleId::new)
            })
            .collect();
        ids.sort();
        ids
    }

    fn bundle(&self, id: &BundleId) -> CoreResult<Arc<Value>> {
        let path = self.dir.join(format!("{}.json", id));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::UnknownBundle {
                    bundle_id: id.to_string(),
                }
            } else {
                StoreError::Io {
                    reason: format!("{}: {}", path.display(), e),
                }
            }
        })?;
        Ok(Arc::new(serde_json::from_str(&text)?))
    }
}
