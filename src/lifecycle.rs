//! The detection lifecycle state machine.
//!
//! The controller consumes interactive events (city/camera selection,
//! start/stop, confirmation decisions) and background completions (sync
//! resolutions, downloads, session exits), consults the sync controller
//! and the camera session manager, and dispatches detection work to the
//! executor.
//!
//! Controller state, the session context, and the camera handle are
//! mutated only on the interactive thread. Background workers communicate
//! through channels drained by `pump()`; they never touch controller
//! state directly.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use crate::city_directory::CityRequestOutcome;
use crate::config::DetectionSettings;
use crate::executor::{self, SessionEvent, SessionHandle, StopWait};
use crate::{
    CameraSessionManager, CityDirectory, CityKey, DetectionSession, DetectionSource, Detector,
    Modality, ModelRegistry, Notice, SyncController, SyncStatus,
};

/// Controller states.
///
/// `ImageDetecting` and `VideoDetecting` are mutually exclusive by
/// construction: entering one while the pipeline is held by the other
/// forces a stop-and-release sequence first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    ImageReady,
    ImageDetecting,
    VideoReady,
    VideoDetecting,
    VideoStopping,
}

/// Everything that can enter the controller.
///
/// The first group is interactive input; the remaining variants arrive on
/// the controller's internal channel from background workers.
#[derive(Debug)]
pub enum Event {
    CitySelected(Option<String>),
    ImageDropped(PathBuf),
    ImageCleared,
    CameraSelected(usize),
    StartRequested,
    StopRequested,
    /// The user's answer to a pending download/update confirmation.
    DownloadDecision(bool),
    DebugToggled(bool),
    RefreshCities,
    Shutdown,
    SyncResolved {
        city: CityKey,
        status: SyncStatus,
    },
    DownloadFinished {
        city: CityKey,
        result: Result<u32, String>,
    },
    CitiesRefreshed(Result<Vec<String>, String>),
}

/// Read-only snapshot of the interactive session.
///
/// Exclusively owned and mutated by the controller; other components only
/// ever see it by reference.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    pub city: Option<CityKey>,
    pub model: Option<SelectedModel>,
    pub staged_image: Option<PathBuf>,
    pub debug: bool,
}

/// A model confirmed usable for the selected city.
#[derive(Clone, Debug)]
pub struct SelectedModel {
    pub city: CityKey,
    pub weights: PathBuf,
    pub version: Option<u32>,
}

#[derive(Debug)]
struct PendingDownload {
    city: CityKey,
    remote: u32,
}

/// The detection lifecycle controller.
pub struct Controller {
    state: State,
    ctx: SessionContext,
    pending_download: Option<PendingDownload>,
    sync: SyncController,
    cameras: CameraSessionManager,
    directory: CityDirectory,
    registry: Arc<dyn ModelRegistry>,
    detector: Arc<dyn Detector>,
    session: Option<SessionHandle>,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    session_tx: Sender<SessionEvent>,
    session_rx: Receiver<SessionEvent>,
    notices: Sender<Notice>,
    stop_grace: Duration,
    image_size: u32,
}

impl Controller {
    pub fn new(
        sync: SyncController,
        cameras: CameraSessionManager,
        registry: Arc<dyn ModelRegistry>,
        detector: Arc<dyn Detector>,
        settings: DetectionSettings,
        notices: Sender<Notice>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let (session_tx, session_rx) = mpsc::channel();
        Self {
            state: State::Idle,
            ctx: SessionContext::default(),
            pending_download: None,
            sync,
            cameras,
            directory: CityDirectory::new(),
            registry,
            detector,
            session: None,
            events_tx,
            events_rx,
            session_tx,
            session_rx,
            notices,
            stop_grace: settings.stop_grace,
            image_size: settings.image_size,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn cameras(&self) -> &CameraSessionManager {
        &self.cameras
    }

    pub fn directory(&self) -> &CityDirectory {
        &self.directory
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Validate and forward a free-text "add city" request.
    pub fn request_city(&self, name: &str) -> Result<CityRequestOutcome> {
        self.directory.request_city(self.registry.as_ref(), name)
    }

    /// Drain pending background messages. Call from the interactive loop.
    pub fn pump(&mut self) {
        loop {
            match self.session_rx.try_recv() {
                Ok(event) => self.apply_session(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        loop {
            match self.events_rx.try_recv() {
                Ok(event) => self.dispatch(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// The transition table: one entry per `(state, event)` pair, guards
    /// and actions included. Unknown pairs are ignored with a debug log,
    /// never a panic.
    pub fn dispatch(&mut self, event: Event) {
        log::debug!("event {:?} in state {:?}", event, self.state);
        match event {
            Event::CitySelected(None) => self.deselect_city(),
            Event::CitySelected(Some(name)) => self.select_city(&name),
            Event::ImageDropped(path) => self.stage_image(path),
            Event::ImageCleared => self.clear_image(),
            Event::CameraSelected(index) => self.select_camera(index),
            Event::StartRequested => self.start_detection(),
            Event::StopRequested => self.stop_requested(),
            Event::DownloadDecision(accepted) => self.resolve_download(accepted),
            Event::DebugToggled(debug) => self.ctx.debug = debug,
            Event::RefreshCities => self.refresh_cities(),
            Event::Shutdown => self.shutdown(),
            Event::SyncResolved { city, status } => self.apply_sync(city, status),
            Event::DownloadFinished { city, result } => self.apply_download(city, result),
            Event::CitiesRefreshed(result) => self.apply_cities(result),
        }
    }

    fn notify(&self, notice: Notice) {
        log::info!("notice: {notice}");
        let _ = self.notices.send(notice);
    }

    // ------------------------------------------------------------------
    // City selection and model sync
    // ------------------------------------------------------------------

    fn select_city(&mut self, name: &str) {
        let city = match CityKey::new(name) {
            Ok(city) => city,
            Err(err) => {
                log::warn!("ignoring invalid city selection: {err:#}");
                return;
            }
        };

        // Changing the city invalidates the current model mid-anything.
        match self.state {
            State::ImageDetecting => self.abandon_image_session(),
            State::VideoDetecting | State::VideoStopping => {
                self.halt_video_session();
                self.recover_camera();
            }
            _ => {}
        }
        if self.state == State::ImageReady {
            self.state = State::Idle;
        }
        self.ctx.city = Some(city.clone());
        self.ctx.model = None;
        self.pending_download = None;

        let sync = self.sync.clone();
        let tx = self.events_tx.clone();
        let notices = self.notices.clone();
        let spawned = std::thread::Builder::new()
            .name("sync-reconcile".to_string())
            .spawn(move || match sync.reconcile(&city) {
                Ok(status) => {
                    let _ = tx.send(Event::SyncResolved { city, status });
                }
                Err(err) => {
                    log::error!("reconcile failed for {city}: {err:#}");
                    let _ = notices.send(Notice::NetworkUnavailable {
                        detail: format!("{err:#}"),
                    });
                }
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn reconcile worker: {err}");
        }
    }

    fn deselect_city(&mut self) {
        match self.state {
            State::ImageDetecting => self.abandon_image_session(),
            State::VideoDetecting | State::VideoStopping => self.halt_video_session(),
            _ => {}
        }
        self.ctx.city = None;
        self.ctx.model = None;
        self.pending_download = None;
        // Deselection always lands in Idle with no camera held.
        self.cameras.release();
        self.state = State::Idle;
    }

    fn apply_sync(&mut self, city: CityKey, status: SyncStatus) {
        if self.ctx.city.as_ref() != Some(&city) {
            log::debug!("stale sync resolution for {city} ignored");
            return;
        }
        match status {
            SyncStatus::Ready { version } => self.install_model(city, version),
            SyncStatus::DownloadRequired { remote } => {
                self.pending_download = Some(PendingDownload {
                    city: city.clone(),
                    remote,
                });
                self.notify(Notice::ConfirmDownload { city, remote });
            }
            SyncStatus::UpdateAvailable { local, remote } => {
                self.pending_download = Some(PendingDownload {
                    city: city.clone(),
                    remote,
                });
                self.notify(Notice::ConfirmUpdate {
                    city,
                    local,
                    remote,
                });
            }
            SyncStatus::Unreachable {
                local_artifact,
                local_version,
            } => {
                self.notify(Notice::NetworkUnavailable {
                    detail: format!("could not check the model version for {city}"),
                });
                if local_artifact {
                    // Policy: a previously downloaded model stays usable
                    // while the registry is down.
                    self.install_model(city, local_version);
                }
            }
        }
    }

    fn install_model(&mut self, city: CityKey, version: Option<u32>) {
        let weights = self.sync.store().weights_path(&city);
        self.ctx.model = Some(SelectedModel {
            city: city.clone(),
            weights,
            version,
        });
        self.notify(Notice::ModelReady { city, version });
        self.rearm();
    }

    fn resolve_download(&mut self, accepted: bool) {
        let Some(pending) = self.pending_download.take() else {
            log::debug!("download decision with nothing pending");
            return;
        };
        if !accepted {
            // No side effects; the selection reverts to "no city chosen".
            log::info!(
                "download of {} v{} declined",
                pending.city,
                pending.remote
            );
            self.deselect_city();
            return;
        }

        let sync = self.sync.clone();
        let tx = self.events_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("model-download".to_string())
            .spawn(move || {
                let result = sync
                    .download(&pending.city, pending.remote)
                    .map(|_| pending.remote)
                    .map_err(|err| format!("{err:#}"));
                let _ = tx.send(Event::DownloadFinished {
                    city: pending.city,
                    result,
                });
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn download worker: {err}");
        }
    }

    fn apply_download(&mut self, city: CityKey, result: Result<u32, String>) {
        if self.ctx.city.as_ref() != Some(&city) {
            // The artifact (if any) is persisted either way; only the
            // selection moved on.
            log::debug!("stale download completion for {city} ignored");
            return;
        }
        match result {
            Ok(version) => self.install_model(city, Some(version)),
            Err(detail) => self.notify(Notice::NetworkUnavailable { detail }),
        }
    }

    // ------------------------------------------------------------------
    // Image staging
    // ------------------------------------------------------------------

    fn stage_image(&mut self, path: PathBuf) {
        match self.state {
            State::Idle | State::ImageReady => {
                self.ctx.staged_image = Some(path);
                self.rearm();
            }
            _ => log::debug!("image drop ignored in state {:?}", self.state),
        }
    }

    fn clear_image(&mut self) {
        self.ctx.staged_image = None;
        if self.state == State::ImageReady {
            self.state = State::Idle;
        }
    }

    /// `Idle -> ImageReady` is condition-triggered: it fires whenever an
    /// image is staged and a model is selected.
    fn rearm(&mut self) {
        if self.state == State::Idle
            && self.ctx.model.is_some()
            && self.ctx.staged_image.is_some()
        {
            self.state = State::ImageReady;
        }
    }

    // ------------------------------------------------------------------
    // Camera selection
    // ------------------------------------------------------------------

    fn select_camera(&mut self, index: usize) {
        // Whatever currently holds the pipeline is stopped first; the
        // subsequent select rebinds hardware itself, so no reclaim here.
        match self.state {
            State::ImageDetecting => self.abandon_image_session(),
            State::VideoDetecting | State::VideoStopping => self.halt_video_session(),
            _ => {}
        }

        if index == 0 {
            self.cameras.release();
            self.state = State::Idle;
            self.rearm();
            return;
        }

        match self.cameras.select(index) {
            Ok(Some(info)) => {
                log::info!("camera source: {} ({})", info.name, info.uri);
                self.state = State::VideoReady;
            }
            Ok(None) => {
                self.state = State::Idle;
                self.rearm();
            }
            Err(err) => {
                // Selection reverted to "no camera" by the manager.
                self.notify(Notice::DeviceError {
                    detail: format!("{err:#}"),
                });
                self.state = State::Idle;
                self.rearm();
            }
        }
    }

    // ------------------------------------------------------------------
    // Detection start/stop
    // ------------------------------------------------------------------

    fn start_detection(&mut self) {
        // Guard: never a state change without a selected model.
        if self.ctx.model.is_none() {
            self.notify(Notice::MissingModel);
            return;
        }

        match self.state {
            State::ImageReady => self.start_image_session(),
            State::VideoReady => self.start_video_session(),
            State::Idle => self.notify(Notice::NothingToDetect),
            State::ImageDetecting | State::VideoDetecting | State::VideoStopping => {
                log::debug!("start ignored in state {:?}", self.state);
            }
        }
    }

    fn start_image_session(&mut self) {
        let (Some(model), Some(image)) = (self.ctx.model.clone(), self.ctx.staged_image.clone())
        else {
            self.notify(Notice::NothingToDetect);
            return;
        };
        let session = DetectionSession {
            modality: Modality::Image,
            weights: model.weights,
            source: DetectionSource::ImageFile(image),
            image_size: None,
            debug: self.ctx.debug,
        };
        match executor::run(session, self.detector.clone(), self.session_tx.clone()) {
            Ok(handle) => {
                self.session = Some(handle);
                self.state = State::ImageDetecting;
            }
            Err(err) => {
                log::error!("failed to start image detection: {err:#}");
                self.notify(Notice::ImageFinished {
                    error: Some(format!("{err:#}")),
                });
            }
        }
    }

    fn start_video_session(&mut self) {
        let Some(model) = self.ctx.model.clone() else {
            self.notify(Notice::MissingModel);
            return;
        };
        // The session owns the device while detecting; the preview handle
        // closes here and is reclaimed after the session ends.
        let Some(camera) = self.cameras.hand_off() else {
            self.notify(Notice::DeviceError {
                detail: "no camera bound".to_string(),
            });
            self.state = State::Idle;
            self.rearm();
            return;
        };
        let session = DetectionSession {
            modality: Modality::Video,
            weights: model.weights,
            source: DetectionSource::Camera {
                uri: camera.uri.clone(),
            },
            image_size: Some(self.image_size),
            debug: self.ctx.debug,
        };
        match executor::run(session, self.detector.clone(), self.session_tx.clone()) {
            Ok(handle) => {
                self.session = Some(handle);
                self.state = State::VideoDetecting;
            }
            Err(err) => {
                log::error!("failed to start video detection: {err:#}");
                self.notify(Notice::VideoAborted {
                    detail: format!("{err:#}"),
                });
                self.recover_camera();
            }
        }
    }

    fn stop_requested(&mut self) {
        match self.state {
            State::VideoDetecting => {
                self.halt_video_session();
                self.recover_camera();
            }
            _ => log::debug!("stop ignored in state {:?}", self.state),
        }
    }

    /// Cancellation rendezvous for the running video session.
    ///
    /// Sends the stop signal, then waits up to the grace period for the
    /// worker's exit acknowledgement. On timeout a `StuckSessionError`
    /// notice is raised and the controller is forced on regardless, so a
    /// wedged worker cannot wedge the UI. The camera is touched only after
    /// the ack or after that notice, never silently; callers decide
    /// whether to reclaim or rebind it next.
    fn halt_video_session(&mut self) {
        let Some(mut handle) = self.session.take() else {
            return;
        };
        handle.stop();
        self.state = State::VideoStopping;
        match handle.wait_exit(self.stop_grace) {
            StopWait::Acknowledged => log::info!("video session stopped"),
            StopWait::TimedOut => {
                self.notify(Notice::StuckSession {
                    grace: self.stop_grace,
                });
            }
        }
    }

    /// Re-bind the selected camera for preview after a video session
    /// released (or was forced off) the device.
    fn recover_camera(&mut self) {
        match self.cameras.reclaim() {
            Ok(Some(_)) => self.state = State::VideoReady,
            Ok(None) => {
                self.state = State::Idle;
                self.rearm();
            }
            Err(err) => {
                self.notify(Notice::DeviceError {
                    detail: format!("{err:#}"),
                });
                self.state = State::Idle;
                self.rearm();
            }
        }
    }

    fn abandon_image_session(&mut self) {
        if let Some(handle) = self.session.take() {
            handle.stop();
            log::debug!("image session abandoned");
        }
        self.state = State::Idle;
    }

    fn apply_session(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ImageFinished { result } => {
                if self.state != State::ImageDetecting {
                    log::debug!("stale image completion ignored");
                    return;
                }
                self.session = None;
                // Completion returns to Idle and surfaces the result; the
                // condition-triggered image-ready transition then re-arms.
                self.state = State::Idle;
                self.notify(Notice::ImageFinished {
                    error: result.err().map(|err| format!("{err:#}")),
                });
                self.rearm();
            }
            SessionEvent::VideoExited {
                observed_stop,
                result,
            } => {
                if self.state != State::VideoDetecting {
                    log::debug!("video exit already handled (observed_stop={observed_stop})");
                    return;
                }
                // The loop died on its own; a requested stop is resolved
                // synchronously in halt_video_session.
                self.session = None;
                let detail = match result {
                    Err(err) => format!("{err:#}"),
                    Ok(()) => "video loop exited unexpectedly".to_string(),
                };
                self.notify(Notice::VideoAborted { detail });
                self.recover_camera();
            }
        }
    }

    // ------------------------------------------------------------------
    // City directory
    // ------------------------------------------------------------------

    fn refresh_cities(&mut self) {
        let registry = self.registry.clone();
        let tx = self.events_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("city-refresh".to_string())
            .spawn(move || {
                let result = registry.list_cities().map_err(|err| format!("{err:#}"));
                let _ = tx.send(Event::CitiesRefreshed(result));
            });
        if let Err(err) = spawned {
            log::error!("failed to spawn city refresh worker: {err}");
        }
    }

    fn apply_cities(&mut self, result: Result<Vec<String>, String>) {
        if let Err(detail) = self.directory.apply_refresh(result) {
            self.notify(Notice::NetworkUnavailable { detail });
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Forced release of everything the controller holds. The camera
    /// handle never survives shutdown.
    fn shutdown(&mut self) {
        log::info!("shutdown requested");
        match self.state {
            State::VideoDetecting | State::VideoStopping => self.halt_video_session(),
            State::ImageDetecting => self.abandon_image_session(),
            _ => {}
        }
        if let Some(handle) = self.session.take() {
            handle.stop();
        }
        self.cameras.release();
        self.state = State::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryRegistry, ModelStore, StubDetector, VersionCache};

    fn harness(dir: &std::path::Path) -> (Controller, Receiver<Notice>) {
        let registry: Arc<InMemoryRegistry> = Arc::new(InMemoryRegistry::new());
        let cache = VersionCache::open(dir.join("versions.txt")).expect("open cache");
        let store = ModelStore::open(dir.join("weights")).expect("open store");
        let sync = SyncController::new(registry.clone(), cache, store);
        let cameras = CameraSessionManager::new(crate::camera::enumerate(
            &crate::config::CameraSettings { synthetic: 2 },
        ));
        let (notices_tx, notices_rx) = mpsc::channel();
        let controller = Controller::new(
            sync,
            cameras,
            registry,
            Arc::new(StubDetector::new()),
            DetectionSettings {
                image_size: 640,
                stop_grace: Duration::from_millis(200),
            },
            notices_tx,
        );
        (controller, notices_rx)
    }

    fn drain(notices: &Receiver<Notice>) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            out.push(notice);
        }
        out
    }

    #[test]
    fn start_without_model_raises_missing_model_and_keeps_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut controller, notices) = harness(dir.path());

        controller.dispatch(Event::StartRequested);
        assert_eq!(controller.state(), State::Idle);

        controller.dispatch(Event::CameraSelected(1));
        assert_eq!(controller.state(), State::VideoReady);
        controller.dispatch(Event::StartRequested);
        assert_eq!(controller.state(), State::VideoReady);

        let raised = drain(&notices);
        assert_eq!(
            raised
                .iter()
                .filter(|notice| matches!(notice, Notice::MissingModel))
                .count(),
            2
        );
    }

    #[test]
    fn camera_deselection_returns_to_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut controller, _notices) = harness(dir.path());

        controller.dispatch(Event::CameraSelected(2));
        assert_eq!(controller.state(), State::VideoReady);
        assert!(controller.cameras().active().is_some());

        controller.dispatch(Event::CameraSelected(0));
        assert_eq!(controller.state(), State::Idle);
        assert!(controller.cameras().active().is_none());
    }

    #[test]
    fn debug_toggle_updates_context_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut controller, _notices) = harness(dir.path());

        controller.dispatch(Event::DebugToggled(true));
        assert!(controller.context().debug);
        assert_eq!(controller.state(), State::Idle);
    }
}
