//! Version reconciliation against the model registry.
//!
//! The sync controller compares the persisted version cache with the
//! registry's reported latest version and decides whether a download is
//! needed. Downloads happen only after the user confirms; a confirmed
//! download writes the artifact atomically and records the new version
//! only once the artifact is safely in place.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::{CityKey, ModelRegistry, ModelStore, VersionCache};

/// Outcome of reconciling one city against the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    /// Local model is current (or the registry reported a regression,
    /// which is treated as already up to date, never as a downgrade).
    Ready { version: Option<u32> },
    /// No local model exists yet; the user must confirm a first download.
    DownloadRequired { remote: u32 },
    /// The registry has a newer version than the local one.
    UpdateAvailable { local: u32, remote: u32 },
    /// The registry could not be reached. When a local artifact exists,
    /// the caller may still proceed to detection with it.
    Unreachable {
        local_artifact: bool,
        local_version: Option<u32>,
    },
}

/// Decides download/update/ready status and performs confirmed downloads.
#[derive(Clone)]
pub struct SyncController {
    registry: Arc<dyn ModelRegistry>,
    cache: VersionCache,
    store: ModelStore,
}

impl SyncController {
    pub fn new(registry: Arc<dyn ModelRegistry>, cache: VersionCache, store: ModelStore) -> Self {
        Self {
            registry,
            cache,
            store,
        }
    }

    pub fn cache(&self) -> &VersionCache {
        &self.cache
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Compare the registry's latest version with the local cache.
    ///
    /// Reconciliation is idempotent: repeated calls with no remote change
    /// produce the same outcome and never mutate the cache.
    pub fn reconcile(&self, city: &CityKey) -> Result<SyncStatus> {
        let remote = self.registry.latest_version(city);
        let local = self.cache.get(city)?;

        let remote = match remote {
            Ok(remote) => remote,
            Err(err) => {
                log::warn!("registry unreachable while reconciling {}: {:#}", city, err);
                return Ok(SyncStatus::Unreachable {
                    local_artifact: self.store.exists(city),
                    local_version: local,
                });
            }
        };

        let status = match local {
            None => SyncStatus::DownloadRequired { remote },
            Some(local) if remote > local => SyncStatus::UpdateAvailable { local, remote },
            Some(local) => {
                if remote < local {
                    log::warn!(
                        "registry reports {} v{} below local v{}; keeping local",
                        city,
                        remote,
                        local
                    );
                }
                SyncStatus::Ready {
                    version: Some(local),
                }
            }
        };
        Ok(status)
    }

    /// Confirmed download of `version` for a city.
    ///
    /// Fetches the model binary, writes the artifact atomically, then
    /// records the version. Nothing is persisted when any step fails.
    pub fn download(&self, city: &CityKey, version: u32) -> Result<PathBuf> {
        let bytes = self
            .registry
            .fetch_model(city)?
            .ok_or_else(|| anyhow!("registry has no model binary for {city}"))?;
        let path = self.store.write(city, &bytes)?;
        self.cache.set(city, version)?;
        log::info!("downloaded {} model v{}", city, version);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRegistry;

    fn controller(dir: &std::path::Path) -> (SyncController, Arc<InMemoryRegistry>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = VersionCache::open(dir.join("versions.txt")).expect("open cache");
        let store = ModelStore::open(dir.join("weights")).expect("open store");
        (
            SyncController::new(registry.clone(), cache, store),
            registry,
        )
    }

    #[test]
    fn registry_regression_reports_ready_and_keeps_local_version() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (sync, registry) = controller(dir.path());
        let berlin = CityKey::new("berlin")?;

        registry.publish(&berlin, 5, Some(vec![1]));
        sync.download(&berlin, 5)?;
        registry.publish(&berlin, 3, None);

        assert_eq!(
            sync.reconcile(&berlin)?,
            SyncStatus::Ready { version: Some(5) }
        );
        assert_eq!(sync.cache().get(&berlin)?, Some(5));
        Ok(())
    }

    #[test]
    fn download_requires_model_binary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (sync, registry) = controller(dir.path());
        let berlin = CityKey::new("berlin")?;

        registry.publish(&berlin, 1, None);
        assert!(sync.download(&berlin, 1).is_err());
        assert_eq!(sync.cache().get(&berlin)?, None);
        assert!(!sync.store().exists(&berlin));
        Ok(())
    }
}
