//! Background detection sessions.
//!
//! Runs the opaque detector on a unit of concurrency distinct from the
//! interactive thread. Image sessions are one-shot; video sessions loop
//! until they observe a cooperative stop signal. Completion and
//! cancellation acknowledgements travel back as thread-safe messages.
//!
//! This component enforces no policy: single-flight and mutual exclusion
//! are the lifecycle controller's job. It is a pure executor plus a
//! cancellation-signal channel.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{DetectionSession, Detector, Modality};

/// Completion messages from background sessions.
#[derive(Debug)]
pub enum SessionEvent {
    /// An image session ran to completion.
    ImageFinished { result: Result<()> },
    /// A video session exited its loop. `observed_stop` is false when the
    /// loop exited on its own (detector failure) rather than through the
    /// stop signal.
    VideoExited {
        observed_stop: bool,
        result: Result<()>,
    },
}

/// Outcome of the bounded stop rendezvous.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopWait {
    Acknowledged,
    TimedOut,
}

/// Handle to one running detection session.
pub struct SessionHandle {
    modality: Modality,
    stop: Arc<AtomicBool>,
    exit_rx: Receiver<bool>,
    join: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn modality(&self) -> Modality {
        self.modality
    }

    /// Request cooperative cancellation. Idempotent; the session observes
    /// the flag between detector calls.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait up to `grace` for the session's exit acknowledgement.
    ///
    /// On acknowledgement the worker thread is reaped. On timeout the
    /// worker is left running; dropping the handle detaches it, since
    /// joining could block indefinitely on the opaque detector.
    pub fn wait_exit(&mut self, grace: Duration) -> StopWait {
        match self.exit_rx.recv_timeout(grace) {
            Ok(_) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        log::warn!("detection thread panicked");
                    }
                }
                StopWait::Acknowledged
            }
            Err(RecvTimeoutError::Timeout) => StopWait::TimedOut,
        }
    }
}

/// Run a detection session on a background thread.
///
/// Completion events are delivered on `events`; the returned handle owns
/// the stop flag and the exit-acknowledgement channel.
pub fn run(
    session: DetectionSession,
    detector: Arc<dyn Detector>,
    events: Sender<SessionEvent>,
) -> Result<SessionHandle> {
    let modality = session.modality;
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let (exit_tx, exit_rx) = mpsc::channel();

    let name = match modality {
        Modality::Image => "detect-image",
        Modality::Video => "detect-video",
    };
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match modality {
            Modality::Image => run_image(session, detector, events, exit_tx),
            Modality::Video => run_video(session, detector, stop_flag, events, exit_tx),
        })
        .context("spawn detection thread")?;

    Ok(SessionHandle {
        modality,
        stop,
        exit_rx,
        join: Some(join),
    })
}

fn run_image(
    session: DetectionSession,
    detector: Arc<dyn Detector>,
    events: Sender<SessionEvent>,
    exit_tx: Sender<bool>,
) {
    log::info!("image detection started ({:?})", session.source);
    let result = detector.detect(&session.request());
    let _ = exit_tx.send(true);
    if events.send(SessionEvent::ImageFinished { result }).is_err() {
        log::debug!("image completion dropped; controller already gone");
    }
}

fn run_video(
    session: DetectionSession,
    detector: Arc<dyn Detector>,
    stop: Arc<AtomicBool>,
    events: Sender<SessionEvent>,
    exit_tx: Sender<bool>,
) {
    log::info!("video detection started ({:?})", session.source);
    let mut observed_stop = false;
    let mut result = Ok(());
    loop {
        if stop.load(Ordering::SeqCst) {
            observed_stop = true;
            break;
        }
        if let Err(err) = detector.detect(&session.request()) {
            result = Err(err);
            break;
        }
    }
    log::info!(
        "video detection exited (observed_stop={observed_stop}, ok={})",
        result.is_ok()
    );
    let _ = exit_tx.send(observed_stop);
    if events
        .send(SessionEvent::VideoExited {
            observed_stop,
            result,
        })
        .is_err()
    {
        log::debug!("video exit dropped; controller already gone");
    }
}
