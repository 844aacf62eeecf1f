use anyhow::Result;
use std::sync::Arc;

use sightscan::{CityKey, InMemoryRegistry, ModelStore, SyncController, SyncStatus, VersionCache};

fn harness(dir: &std::path::Path) -> (SyncController, Arc<InMemoryRegistry>) {
    let registry = Arc::new(InMemoryRegistry::new());
    let cache = VersionCache::open(dir.join("versions.txt")).expect("open cache");
    let store = ModelStore::open(dir.join("weights")).expect("open store");
    (
        SyncController::new(registry.clone(), cache, store),
        registry,
    )
}

fn berlin() -> CityKey {
    CityKey::new("berlin").expect("valid city key")
}

#[test]
fn empty_cache_requires_download_then_records_exactly_one_version() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.publish(&berlin(), 1, Some(b"model-v1".to_vec()));

    assert_eq!(
        sync.reconcile(&berlin())?,
        SyncStatus::DownloadRequired { remote: 1 }
    );

    let artifact = sync.download(&berlin(), 1)?;

    let cache_text = std::fs::read_to_string(sync.cache().path())?;
    assert_eq!(cache_text, "BERLIN=1\n");
    assert!(artifact.is_file());
    assert_eq!(std::fs::read(&artifact)?, b"model-v1");
    Ok(())
}

#[test]
fn current_cache_reports_ready_without_touching_anything() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.publish(&berlin(), 2, None);
    sync.cache().set(&berlin(), 2)?;

    let before = std::fs::read_to_string(sync.cache().path())?;
    assert_eq!(
        sync.reconcile(&berlin())?,
        SyncStatus::Ready { version: Some(2) }
    );
    let after = std::fs::read_to_string(sync.cache().path())?;

    assert_eq!(before, after);
    assert!(!sync.store().exists(&berlin()), "no download was requested");
    Ok(())
}

#[test]
fn newer_remote_reports_update_and_cancel_leaves_local_state_usable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.publish(&berlin(), 1, Some(b"model-v1".to_vec()));
    sync.download(&berlin(), 1)?;
    registry.publish(&berlin(), 3, Some(b"model-v3".to_vec()));

    assert_eq!(
        sync.reconcile(&berlin())?,
        SyncStatus::UpdateAvailable {
            local: 1,
            remote: 3
        }
    );

    // The user cancels: no download call is made, so the cache and the
    // previously downloaded artifact stay exactly as they were.
    assert_eq!(std::fs::read_to_string(sync.cache().path())?, "BERLIN=1\n");
    assert_eq!(
        std::fs::read(sync.store().weights_path(&berlin()))?,
        b"model-v1"
    );
    Ok(())
}

#[test]
fn reconcile_is_idempotent_with_no_remote_change() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.publish(&berlin(), 2, Some(b"model-v2".to_vec()));
    sync.download(&berlin(), 2)?;

    let before = std::fs::read_to_string(sync.cache().path())?;
    let first = sync.reconcile(&berlin())?;
    let second = sync.reconcile(&berlin())?;
    let after = std::fs::read_to_string(sync.cache().path())?;

    assert_eq!(first, second);
    assert_eq!(first, SyncStatus::Ready { version: Some(2) });
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn unreachable_registry_with_local_artifact_is_usable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.publish(&berlin(), 1, Some(b"model-v1".to_vec()));
    sync.download(&berlin(), 1)?;

    registry.set_offline(true);
    assert_eq!(
        sync.reconcile(&berlin())?,
        SyncStatus::Unreachable {
            local_artifact: true,
            local_version: Some(1),
        }
    );
    Ok(())
}

#[test]
fn unreachable_registry_without_artifact_has_nothing_to_offer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.set_offline(true);

    assert_eq!(
        sync.reconcile(&berlin())?,
        SyncStatus::Unreachable {
            local_artifact: false,
            local_version: None,
        }
    );
    Ok(())
}

#[test]
fn update_download_replaces_artifact_without_temp_residue() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (sync, registry) = harness(dir.path());
    registry.publish(&berlin(), 1, Some(b"model-v1".to_vec()));
    sync.download(&berlin(), 1)?;
    registry.publish(&berlin(), 3, Some(b"model-v3".to_vec()));

    sync.download(&berlin(), 3)?;

    assert_eq!(std::fs::read_to_string(sync.cache().path())?, "BERLIN=3\n");
    assert_eq!(
        std::fs::read(sync.store().weights_path(&berlin()))?,
        b"model-v3"
    );
    let leftovers: Vec<_> = std::fs::read_dir(sync.store().dir())?
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
