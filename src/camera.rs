//! Camera enumeration and exclusive handle ownership.
//!
//! The session manager owns at most one open `CameraHandle` at a time.
//! Selecting index 0 releases any held handle; selecting index `n` binds
//! enumerated device `n-1`, releasing the previous handle strictly before
//! the new one is opened. Acquisition failures are non-fatal: the manager
//! reverts to "no camera" and the caller raises a `DeviceError` notice.
//!
//! Device backends:
//! - Synthetic `stub://camera/N` devices, always available (tests, demo).
//!   A URI ending in `/offline` refuses to open, for failure-path tests.
//! - V4L2 nodes behind the `camera-v4l2` feature.

use anyhow::{anyhow, Result};
#[cfg(feature = "camera-v4l2")]
use anyhow::Context;

use crate::config::CameraSettings;

/// Descriptor of an enumerable camera device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraInfo {
    /// Human-readable device name.
    pub name: String,
    /// Device URI: `stub://camera/N` or a `/dev/video*` node path.
    pub uri: String,
}

/// Enumerate available devices, synthetic devices first.
pub fn enumerate(settings: &CameraSettings) -> Vec<CameraInfo> {
    let mut devices: Vec<CameraInfo> = (0..settings.synthetic)
        .map(|n| CameraInfo {
            name: format!("Synthetic Camera {n}"),
            uri: format!("stub://camera/{n}"),
        })
        .collect();
    append_v4l2(&mut devices);
    devices
}

#[cfg(feature = "camera-v4l2")]
fn append_v4l2(devices: &mut Vec<CameraInfo>) {
    devices.extend(v4l::context::enum_devices().into_iter().map(|node| {
        CameraInfo {
            name: node
                .name()
                .unwrap_or_else(|| format!("V4L2 Device {}", node.index())),
            uri: node.path().display().to_string(),
        }
    }));
}

#[cfg(not(feature = "camera-v4l2"))]
fn append_v4l2(_devices: &mut Vec<CameraInfo>) {}

// ----------------------------------------------------------------------------
// Camera handles
// ----------------------------------------------------------------------------

/// An exclusively owned open camera.
///
/// Dropping the handle releases the device.
pub struct CameraHandle {
    info: CameraInfo,
    backend: CameraBackend,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "camera-v4l2")]
    V4l2(V4l2Camera),
}

impl CameraHandle {
    fn open(info: &CameraInfo) -> Result<Self> {
        let backend = Self::open_backend(&info.uri)?;
        log::info!("bound camera {} ({})", info.name, info.uri);
        Ok(Self {
            info: info.clone(),
            backend,
        })
    }

    fn open_backend(uri: &str) -> Result<CameraBackend> {
        if uri.starts_with("stub://") {
            return Ok(CameraBackend::Synthetic(SyntheticCamera::open(uri)?));
        }
        Self::open_native(uri)
    }

    #[cfg(feature = "camera-v4l2")]
    fn open_native(uri: &str) -> Result<CameraBackend> {
        Ok(CameraBackend::V4l2(V4l2Camera::open(uri)?))
    }

    #[cfg(not(feature = "camera-v4l2"))]
    fn open_native(uri: &str) -> Result<CameraBackend> {
        Err(anyhow!("device {uri} requires the camera-v4l2 feature"))
    }

    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    pub fn uri(&self) -> &str {
        &self.info.uri
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.close(),
            #[cfg(feature = "camera-v4l2")]
            CameraBackend::V4l2(camera) => camera.close(),
        }
    }
}

struct SyntheticCamera {
    uri: String,
}

impl SyntheticCamera {
    fn open(uri: &str) -> Result<Self> {
        if uri.ends_with("/offline") {
            return Err(anyhow!("device {} is not responding", uri));
        }
        log::debug!("synthetic camera {} opened", uri);
        Ok(Self {
            uri: uri.to_string(),
        })
    }

    fn close(&self) {
        log::debug!("synthetic camera {} released", self.uri);
    }
}

#[cfg(feature = "camera-v4l2")]
struct V4l2Camera {
    // Holding the open device node is the exclusive acquisition; frames are
    // pulled by the detector through the device URI, not through this handle.
    _device: v4l::Device,
    uri: String,
}

#[cfg(feature = "camera-v4l2")]
impl V4l2Camera {
    fn open(uri: &str) -> Result<Self> {
        use v4l::video::Capture;

        let device =
            v4l::Device::with_path(uri).with_context(|| format!("open v4l2 device {uri}"))?;
        let format = device
            .format()
            .with_context(|| format!("read v4l2 format of {uri}"))?;
        log::debug!(
            "v4l2 camera {} opened ({}x{} {})",
            uri,
            format.width,
            format.height,
            format.fourcc
        );
        Ok(Self {
            _device: device,
            uri: uri.to_string(),
        })
    }

    fn close(&self) {
        log::debug!("v4l2 camera {} released", self.uri);
    }
}

// ----------------------------------------------------------------------------
// Session manager
// ----------------------------------------------------------------------------

/// Owns camera hardware acquisition and the preview state.
///
/// Mutated only from the interactive thread. The selection survives a
/// hand-off to a video detection session: the handle closes while the
/// session owns the device and is reclaimed afterwards.
pub struct CameraSessionManager {
    devices: Vec<CameraInfo>,
    selected: Option<usize>,
    active: Option<CameraHandle>,
    preview_running: bool,
}

impl CameraSessionManager {
    pub fn new(devices: Vec<CameraInfo>) -> Self {
        Self {
            devices,
            selected: None,
            active: None,
            preview_running: false,
        }
    }

    pub fn from_settings(settings: &CameraSettings) -> Self {
        Self::new(enumerate(settings))
    }

    pub fn devices(&self) -> &[CameraInfo] {
        &self.devices
    }

    pub fn active(&self) -> Option<&CameraHandle> {
        self.active.as_ref()
    }

    pub fn preview_running(&self) -> bool {
        self.preview_running
    }

    /// Select a camera by UI index.
    ///
    /// Index 0 releases any held handle and stops the preview. Index `n>0`
    /// binds enumerated device `n-1`; any previously held handle is closed
    /// strictly before the new device is opened. On failure the manager
    /// holds no handle and no selection, and the error is returned for a
    /// `DeviceError` notice.
    pub fn select(&mut self, index: usize) -> Result<Option<&CameraInfo>> {
        // Old handle and selection go away first in every path.
        self.release();
        if index == 0 {
            return Ok(None);
        }

        let info = self
            .devices
            .get(index - 1)
            .cloned()
            .ok_or_else(|| anyhow!("no camera at index {index}"))?;
        let handle = CameraHandle::open(&info)?;
        self.selected = Some(index - 1);
        self.active = Some(handle);
        self.start_preview();
        Ok(self.active.as_ref().map(CameraHandle::info))
    }

    /// Close the handle so a video session can own the device, keeping
    /// the selection for the later `reclaim`.
    pub fn hand_off(&mut self) -> Option<CameraInfo> {
        self.suspend_preview();
        let info = self.active.take().map(|handle| handle.info().clone());
        if info.is_some() {
            log::info!("camera handed off to detection session");
        }
        info
    }

    /// Re-acquire the selected device after a video session released it,
    /// resuming the preview. A failure clears the selection, mirroring a
    /// failed `select`.
    pub fn reclaim(&mut self) -> Result<Option<&CameraInfo>> {
        let Some(device_index) = self.selected else {
            return Ok(None);
        };
        if self.active.is_none() {
            let info = self
                .devices
                .get(device_index)
                .cloned()
                .ok_or_else(|| anyhow!("selected camera disappeared"))?;
            match CameraHandle::open(&info) {
                Ok(handle) => self.active = Some(handle),
                Err(err) => {
                    self.selected = None;
                    return Err(err);
                }
            }
        }
        self.resume_preview();
        Ok(self.active.as_ref().map(CameraHandle::info))
    }

    /// Release any held handle, the selection, and the preview. Idempotent.
    pub fn release(&mut self) {
        self.selected = None;
        if self.active.take().is_some() {
            self.stop_preview();
        }
    }

    /// Idempotent; a preview needs a bound camera.
    pub fn start_preview(&mut self) {
        if self.preview_running || self.active.is_none() {
            return;
        }
        self.preview_running = true;
        log::info!("camera preview started");
    }

    /// Idempotent.
    pub fn stop_preview(&mut self) {
        if !self.preview_running {
            return;
        }
        self.preview_running = false;
        log::info!("camera preview stopped");
    }

    /// Suspend the preview while a video session owns the frames.
    pub fn suspend_preview(&mut self) {
        if self.preview_running {
            log::info!("camera preview suspended for detection");
        }
        self.stop_preview();
    }

    /// Resume the preview after a video session released the frames.
    pub fn resume_preview(&mut self) {
        self.start_preview();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_devices(count: usize) -> Vec<CameraInfo> {
        enumerate(&CameraSettings { synthetic: count })
    }

    #[test]
    fn select_zero_releases_handle_and_preview() -> Result<()> {
        let mut manager = CameraSessionManager::new(synthetic_devices(2));

        manager.select(1)?;
        assert!(manager.active().is_some());
        assert!(manager.preview_running());

        manager.select(0)?;
        assert!(manager.active().is_none());
        assert!(!manager.preview_running());
        Ok(())
    }

    #[test]
    fn select_binds_device_index_minus_one() -> Result<()> {
        let mut manager = CameraSessionManager::new(synthetic_devices(3));

        let info = manager.select(2)?.cloned();
        assert_eq!(info.map(|i| i.uri), Some("stub://camera/1".to_string()));
        Ok(())
    }

    #[test]
    fn switching_devices_leaves_exactly_one_handle() -> Result<()> {
        let mut manager = CameraSessionManager::new(synthetic_devices(3));

        manager.select(1)?;
        manager.select(3)?;

        let active = manager.active().expect("handle bound");
        assert_eq!(active.uri(), "stub://camera/2");
        Ok(())
    }

    #[test]
    fn failed_acquisition_reverts_to_no_camera() -> Result<()> {
        let mut devices = synthetic_devices(1);
        devices.push(CameraInfo {
            name: "Broken Camera".to_string(),
            uri: "stub://camera/offline".to_string(),
        });
        let mut manager = CameraSessionManager::new(devices);

        manager.select(1)?;
        assert!(manager.active().is_some());

        assert!(manager.select(2).is_err());
        assert!(manager.active().is_none(), "prior handle must not survive");
        assert!(!manager.preview_running());
        Ok(())
    }

    #[test]
    fn out_of_range_selection_is_an_error() {
        let mut manager = CameraSessionManager::new(synthetic_devices(1));
        assert!(manager.select(5).is_err());
        assert!(manager.active().is_none());
    }

    #[test]
    fn hand_off_keeps_selection_and_reclaim_reopens() -> Result<()> {
        let mut manager = CameraSessionManager::new(synthetic_devices(2));

        manager.select(2)?;
        let handed = manager.hand_off();
        assert_eq!(handed.map(|i| i.uri), Some("stub://camera/1".to_string()));
        assert!(manager.active().is_none());
        assert!(!manager.preview_running());

        let info = manager.reclaim()?.cloned();
        assert_eq!(info.map(|i| i.uri), Some("stub://camera/1".to_string()));
        assert!(manager.active().is_some());
        assert!(manager.preview_running());
        Ok(())
    }

    #[test]
    fn reclaim_without_selection_is_a_no_op() -> Result<()> {
        let mut manager = CameraSessionManager::new(synthetic_devices(1));
        assert!(manager.reclaim()?.is_none());
        assert!(manager.active().is_none());
        Ok(())
    }

    #[test]
    fn preview_calls_are_idempotent() -> Result<()> {
        let mut manager = CameraSessionManager::new(synthetic_devices(1));

        manager.start_preview();
        assert!(!manager.preview_running(), "preview needs a bound camera");

        manager.select(1)?;
        manager.start_preview();
        manager.start_preview();
        assert!(manager.preview_running());

        manager.suspend_preview();
        manager.suspend_preview();
        assert!(!manager.preview_running());

        manager.resume_preview();
        assert!(manager.preview_running());
        Ok(())
    }
}
