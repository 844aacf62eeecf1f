//! model_sync - non-interactive model maintenance.
//!
//! Reconciles every known city against the registry and downloads any
//! missing or outdated model, with no confirmation prompts. Intended for
//! provisioning and cron-style refreshes.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;

use sightscan::{
    CityKey, Config, HttpRegistry, ModelRegistry, ModelStore, SyncController, SyncStatus,
    VersionCache,
};

#[derive(Parser, Debug)]
#[command(name = "model_sync", about = "Sync per-city models to the registry's latest")]
struct Args {
    /// Cities to sync; defaults to every city the registry lists
    cities: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = Config::load()?;

    let registry = Arc::new(HttpRegistry::new(
        cfg.registry.base_url.clone(),
        cfg.registry.timeout,
    ));
    let cache = VersionCache::open(cfg.versions_path())?;
    let store = ModelStore::open(cfg.weights_dir())?;
    let sync = SyncController::new(registry.clone(), cache, store);

    let names = if args.cities.is_empty() {
        registry.list_cities()?
    } else {
        args.cities
    };

    let mut failures = 0usize;
    for name in &names {
        match sync_city(&sync, name) {
            Ok(summary) => println!("{name}: {summary}"),
            Err(err) => {
                failures += 1;
                log::error!("{name}: {err:#}");
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn sync_city(sync: &SyncController, name: &str) -> Result<String> {
    let city = CityKey::new(name)?;
    let summary = match sync.reconcile(&city)? {
        SyncStatus::Ready { version } => match version {
            Some(version) => format!("up to date (v{version})"),
            None => "up to date".to_string(),
        },
        SyncStatus::DownloadRequired { remote } => {
            sync.download(&city, remote)?;
            format!("downloaded v{remote}")
        }
        SyncStatus::UpdateAvailable { local, remote } => {
            sync.download(&city, remote)?;
            format!("updated v{local} -> v{remote}")
        }
        SyncStatus::Unreachable { local_artifact, .. } => {
            if local_artifact {
                "registry unreachable; keeping local model".to_string()
            } else {
                "registry unreachable; no local model".to_string()
            }
        }
    };
    Ok(summary)
}
