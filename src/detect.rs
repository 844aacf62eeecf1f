//! The opaque detector seam.
//!
//! The neural detector is an external collaborator: a function over
//! weights + input with unspecified, possibly unbounded latency. The core
//! only ever calls it through the `Detector` trait, one opaque unit at a
//! time, so the stub below can stand in for it everywhere.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Detection modality. Image and video sessions are mutually exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Modality {
    Image,
    Video,
}

/// Input a detection session runs against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetectionSource {
    /// A dropped static image file.
    ImageFile(PathBuf),
    /// A camera stream addressed by its device URI.
    Camera { uri: String },
}

/// One logical detection run.
///
/// Created when detection starts and destroyed on completion or
/// cancellation; the lifecycle controller guarantees at most one exists
/// at any time.
#[derive(Clone, Debug)]
pub struct DetectionSession {
    pub modality: Modality,
    pub weights: PathBuf,
    pub source: DetectionSource,
    pub image_size: Option<u32>,
    pub debug: bool,
}

impl DetectionSession {
    pub fn request(&self) -> DetectionRequest<'_> {
        DetectionRequest {
            weights: &self.weights,
            source: &self.source,
            image_size: self.image_size,
            debug: self.debug,
        }
    }
}

/// Borrowed view of a session handed to the detector for one call.
#[derive(Clone, Debug)]
pub struct DetectionRequest<'a> {
    pub weights: &'a Path,
    pub source: &'a DetectionSource,
    pub image_size: Option<u32>,
    pub debug: bool,
}

/// The opaque detection function.
///
/// One call is one unit of work: the whole image for `Image` sessions,
/// a single streaming step for `Video` sessions. Implementations produce
/// their annotated output as a side effect.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, request: &DetectionRequest<'_>) -> Result<()>;
}

/// Stub detector for tests and the demo binary.
///
/// Sleeps a configurable per-call latency (to exercise stop-rendezvous
/// timing) and counts invocations.
pub struct StubDetector {
    step_latency: Duration,
    failing: bool,
    calls: AtomicU64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self {
            step_latency: Duration::ZERO,
            failing: false,
            calls: AtomicU64::new(0),
        }
    }

    /// Make every call take at least `latency`.
    pub fn with_step_latency(latency: Duration) -> Self {
        Self {
            step_latency: latency,
            ..Self::new()
        }
    }

    /// Make every call fail, as a crashed detector would.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, request: &DetectionRequest<'_>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !request.weights.is_file() {
            return Err(anyhow!(
                "weights not found at {}",
                request.weights.display()
            ));
        }
        if !self.step_latency.is_zero() {
            std::thread::sleep(self.step_latency);
        }
        if self.failing {
            return Err(anyhow!("stub detector configured to fail"));
        }
        log::debug!(
            "stub detect: weights={} source={:?} image_size={:?} debug={}",
            request.weights.display(),
            request.source,
            request.image_size,
            request.debug
        );
        Ok(())
    }
}
