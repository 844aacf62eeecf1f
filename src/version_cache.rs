//! Persisted per-city model version records.
//!
//! The cache is a flat text file with one `CITY_KEY=VERSION` record per
//! line, keys upper-cased. Malformed lines are skipped with a warning and
//! never abort a load. There is no cross-process locking: two client
//! instances writing concurrently race and the last writer wins.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::CityKey;

/// One persisted city/version pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CityVersionRecord {
    pub city: CityKey,
    pub version: u32,
}

/// Parse cache file contents, skipping malformed lines with a warning.
///
/// Duplicate keys after normalization resolve last-write-wins, so a file
/// containing both `berlin=3` and `BERLIN=5` loads as exactly one record.
pub fn parse_entries(text: &str) -> Vec<CityVersionRecord> {
    let mut entries: Vec<CityVersionRecord> = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((raw_key, raw_version)) = line.split_once('=') else {
            log::warn!(
                "version cache line {}: missing '=', skipping: {:?}",
                line_no + 1,
                line
            );
            continue;
        };
        let city = match CityKey::new(raw_key) {
            Ok(city) => city,
            Err(err) => {
                log::warn!("version cache line {}: {}, skipping", line_no + 1, err);
                continue;
            }
        };
        let version: u32 = match raw_version.trim().parse() {
            Ok(version) => version,
            Err(_) => {
                log::warn!(
                    "version cache line {}: non-integer version {:?}, skipping",
                    line_no + 1,
                    raw_version.trim()
                );
                continue;
            }
        };
        if let Some(existing) = entries.iter_mut().find(|entry| entry.city == city) {
            existing.version = version;
        } else {
            entries.push(CityVersionRecord { city, version });
        }
    }
    entries
}

/// Render records back into the on-disk line format.
pub fn render_entries(entries: &[CityVersionRecord]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(entry.city.as_str());
        out.push('=');
        out.push_str(&entry.version.to_string());
        out.push('\n');
    }
    out
}

/// The persisted version cache store.
#[derive(Clone, Debug)]
pub struct VersionCache {
    path: PathBuf,
}

impl VersionCache {
    /// Open the cache at `path`, creating an empty backing file (and its
    /// parent directories) when none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create cache directory {}", parent.display()))?;
            }
            std::fs::write(&path, "")
                .with_context(|| format!("create version cache {}", path.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records currently persisted, normalized and deduplicated.
    pub fn entries(&self) -> Result<Vec<CityVersionRecord>> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read version cache {}", self.path.display()))?;
        Ok(parse_entries(&text))
    }

    /// Last-downloaded version for a city, or `None` when never downloaded.
    pub fn get(&self, city: &CityKey) -> Result<Option<u32>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| &entry.city == city)
            .map(|entry| entry.version))
    }

    /// Upsert one record and rewrite the whole store.
    ///
    /// The read-modify-write keeps the file free of interleaved partial
    /// updates within the process; cross-process writers are not
    /// coordinated (last writer wins).
    pub fn set(&self, city: &CityKey, version: u32) -> Result<()> {
        let mut entries = self.entries()?;
        match entries.iter_mut().find(|entry| &entry.city == city) {
            Some(entry) => entry.version = version,
            None => entries.push(CityVersionRecord {
                city: city.clone(),
                version,
            }),
        }
        std::fs::write(&self.path, render_entries(&entries))
            .with_context(|| format!("rewrite version cache {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CityKey {
        CityKey::new(name).expect("valid city key")
    }

    #[test]
    fn parse_skips_malformed_lines() {
        let entries = parse_entries("BERLIN=3\nno-separator\nHAMBURG=x\n=5\nMUNICH=2\n");
        assert_eq!(
            entries,
            vec![
                CityVersionRecord {
                    city: key("berlin"),
                    version: 3
                },
                CityVersionRecord {
                    city: key("munich"),
                    version: 2
                },
            ]
        );
    }

    #[test]
    fn duplicate_keys_resolve_last_write_wins() {
        let entries = parse_entries("berlin=3\nBERLIN=5\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].city, key("berlin"));
        assert_eq!(entries[0].version, 5);
    }

    #[test]
    fn render_round_trips_normalized_entries() {
        let entries = parse_entries("berlin=1\nhamburg=2\n");
        assert_eq!(render_entries(&entries), "BERLIN=1\nHAMBURG=2\n");
    }

    #[test]
    fn open_creates_missing_store_and_get_returns_absent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights").join("versions.txt");
        let cache = VersionCache::open(&path)?;

        assert!(path.exists());
        assert_eq!(cache.get(&key("berlin"))?, None);
        Ok(())
    }

    #[test]
    fn set_rewrites_whole_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = VersionCache::open(dir.path().join("versions.txt"))?;

        cache.set(&key("berlin"), 1)?;
        cache.set(&key("hamburg"), 4)?;
        cache.set(&key("Berlin"), 2)?;

        let text = std::fs::read_to_string(cache.path())?;
        assert_eq!(text, "BERLIN=2\nHAMBURG=4\n");
        Ok(())
    }
}
