//! Local model artifact storage.
//!
//! One binary weights file per city, named `<CITY_KEY>.pt`, under a fixed
//! directory. Writes go to a temp path in the same directory and are
//! renamed into place, so a partially written artifact is never visible.

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::CityKey;

const WEIGHTS_EXT: &str = "pt";

/// Filesystem store for downloaded model artifacts.
#[derive(Clone, Debug)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    /// Open the store rooted at `dir`, creating it when missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create weights directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a city's weights file (whether or not it exists yet).
    pub fn weights_path(&self, city: &CityKey) -> PathBuf {
        self.dir.join(format!("{}.{}", city.as_str(), WEIGHTS_EXT))
    }

    /// True when a usable artifact exists for the city.
    pub fn exists(&self, city: &CityKey) -> bool {
        self.weights_path(city).is_file()
    }

    /// Atomically replace the city's artifact with `bytes`.
    ///
    /// Returns the final artifact path. The SHA-256 of the written payload
    /// is logged so downloads can be audited against the registry.
    pub fn write(&self, city: &CityKey, bytes: &[u8]) -> Result<PathBuf> {
        if bytes.is_empty() {
            return Err(anyhow!("refusing to store empty model artifact for {city}"));
        }
        let final_path = self.weights_path(city);
        let tmp_path = self.dir.join(format!("{}.{}.tmp", city.as_str(), WEIGHTS_EXT));

        std::fs::write(&tmp_path, bytes)
            .with_context(|| format!("write model artifact {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "replace model artifact {} with {}",
                final_path.display(),
                tmp_path.display()
            )
        })?;

        let digest: [u8; 32] = Sha256::digest(bytes).into();
        log::info!(
            "stored model for {} ({} bytes, sha256={})",
            city,
            bytes.len(),
            hex::encode(digest)
        );
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CityKey {
        CityKey::new(name).expect("valid city key")
    }

    #[test]
    fn write_places_artifact_under_city_key() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ModelStore::open(dir.path())?;
        let berlin = key("berlin");

        let path = store.write(&berlin, b"weights-v1")?;

        assert_eq!(path, dir.path().join("BERLIN.pt"));
        assert!(store.exists(&berlin));
        assert_eq!(std::fs::read(path)?, b"weights-v1");
        Ok(())
    }

    #[test]
    fn write_leaves_no_temp_residue() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ModelStore::open(dir.path())?;
        store.write(&key("berlin"), b"weights")?;

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|extension| extension == "tmp")
            })
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn write_overwrites_previous_artifact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ModelStore::open(dir.path())?;
        let berlin = key("berlin");

        store.write(&berlin, b"old")?;
        store.write(&berlin, b"new")?;

        assert_eq!(std::fs::read(store.weights_path(&berlin))?, b"new");
        Ok(())
    }

    #[test]
    fn empty_payloads_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ModelStore::open(dir.path())?;
        assert!(store.write(&key("berlin"), b"").is_err());
        assert!(!store.exists(&key("berlin")));
        Ok(())
    }
}
