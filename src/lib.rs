//! SightScan client core.
//!
//! This crate implements the orchestration layer of the SightScan desktop
//! client: keeping per-city detection models in sync with the remote model
//! registry, and driving the detection lifecycle (static image vs. live
//! camera feed) without ever blocking the interactive thread.
//!
//! # Module Structure
//!
//! - `config`: client configuration (file + env overrides)
//! - `registry`: model registry client (HTTP + in-memory test double)
//! - `version_cache`: persisted per-city model version records
//! - `model_store`: atomic model artifact storage
//! - `sync`: version reconciliation and confirmed downloads
//! - `city_directory`: stale-tolerant supported-city list
//! - `camera`: camera enumeration and exclusive handle ownership
//! - `detect`: the opaque detector seam
//! - `executor`: background detection sessions with cooperative stop
//! - `lifecycle`: the detection lifecycle state machine
//!
//! Controller state and the camera handle are mutated only from the
//! interactive thread; background work reports back over channels.

use anyhow::{anyhow, Result};
use std::fmt;
use std::time::Duration;

pub mod camera;
pub mod city_directory;
pub mod config;
pub mod detect;
pub mod executor;
pub mod lifecycle;
pub mod model_store;
pub mod registry;
pub mod sync;
pub mod version_cache;

pub use camera::{CameraHandle, CameraInfo, CameraSessionManager};
pub use city_directory::{CityDirectory, CityRequestOutcome};
pub use config::Config;
pub use detect::{
    DetectionRequest, DetectionSession, DetectionSource, Detector, Modality, StubDetector,
};
pub use executor::{SessionEvent, SessionHandle};
pub use lifecycle::{Controller, Event, State};
pub use model_store::ModelStore;
pub use registry::{HttpRegistry, InMemoryRegistry, ModelRegistry};
pub use sync::{SyncController, SyncStatus};
pub use version_cache::{CityVersionRecord, VersionCache};

// -------------------- City Keys --------------------

/// Normalized city identifier.
///
/// Keys are trimmed and upper-cased before comparison and storage, so
/// `berlin` and `BERLIN` resolve to the same record in the version cache,
/// the artifact store, and the registry client.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CityKey(String);

impl CityKey {
    /// Normalize a user-supplied city name into a key.
    ///
    /// Empty names and names containing `=` are rejected; `=` is the
    /// record separator of the version cache file and is not escaped.
    pub fn new(name: &str) -> Result<Self> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("city name must not be empty"));
        }
        if trimmed.contains('=') {
            return Err(anyhow!("city name must not contain '='"));
        }
        Ok(Self(trimmed.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// -------------------- Notices --------------------

/// User-visible, non-fatal notifications emitted by the core.
///
/// Every error in the taxonomy short of a startup configuration failure is
/// converted into one of these at the component nearest its origin and
/// delivered on the controller's notice channel; none of them crash the
/// process. The UI layer decides how to render them.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// Registry unreachable or a transfer failed; cached/local behavior continues.
    NetworkUnavailable { detail: String },
    /// Camera acquisition failed; selection reverted to "no camera".
    DeviceError { detail: String },
    /// Detection was requested with no model selected.
    MissingModel,
    /// Start was requested with neither an image staged nor a camera bound.
    NothingToDetect,
    /// A video session failed to acknowledge cancellation within the grace period.
    StuckSession { grace: Duration },
    /// The selected city has no local model yet; the user must confirm the download.
    ConfirmDownload { city: CityKey, remote: u32 },
    /// A newer model is available for the selected city; the user may confirm.
    ConfirmUpdate { city: CityKey, local: u32, remote: u32 },
    /// The selected city's model is ready for detection.
    ModelReady { city: CityKey, version: Option<u32> },
    /// An image detection run finished (`error` carries a failure, if any).
    ImageFinished { error: Option<String> },
    /// A video session exited on its own rather than through a stop request.
    VideoAborted { detail: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::NetworkUnavailable { detail } => {
                write!(f, "registry unreachable: {detail}")
            }
            Notice::DeviceError { detail } => write!(f, "camera unavailable: {detail}"),
            Notice::MissingModel => {
                write!(f, "choose a city before starting detection")
            }
            Notice::NothingToDetect => write!(f, "drop a file or select a webcam"),
            Notice::StuckSession { grace } => write!(
                f,
                "detection session did not stop within {} ms; forcing camera back",
                grace.as_millis()
            ),
            Notice::ConfirmDownload { city, remote } => {
                write!(f, "download model v{remote} for {city}?")
            }
            Notice::ConfirmUpdate {
                city,
                local,
                remote,
            } => write!(f, "update {city} model v{local} -> v{remote}?"),
            Notice::ModelReady { city, version } => match version {
                Some(version) => write!(f, "{city} model v{version} ready for detection"),
                None => write!(f, "{city} model ready for detection"),
            },
            Notice::ImageFinished { error } => match error {
                Some(detail) => write!(f, "image detection failed: {detail}"),
                None => write!(f, "image detection finished"),
            },
            Notice::VideoAborted { detail } => {
                write!(f, "video detection aborted: {detail}")
            }
        }
    }
}
