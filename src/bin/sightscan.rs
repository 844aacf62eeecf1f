//! sightscan - headless SightScan client.
//!
//! Drives the detection lifecycle the way the desktop shell would: pick a
//! city (confirming model downloads), drop an image or bind a camera,
//! start detection, stop on ctrl-c. The neural detector itself is an
//! external collaborator; the stub detector stands in for it here.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sightscan::camera;
use sightscan::lifecycle::{Controller, Event};
use sightscan::{
    CameraSessionManager, CityRequestOutcome, Config, HttpRegistry, ModelRegistry, ModelStore,
    Notice, State, StubDetector, SyncController, VersionCache,
};

const CITY_RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);
const PUMP_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "sightscan", about = "SightScan detection client (headless shell)")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List supported cities from the registry
    Cities,
    /// Ask the registry to add support for a new city
    RequestCity { name: String },
    /// List available camera devices
    Cameras,
    /// Reconcile and download the model for a city
    Sync {
        city: String,
        /// Answer yes to download confirmations
        #[arg(long)]
        yes: bool,
    },
    /// Run detection over a static image
    DetectImage {
        city: String,
        image: PathBuf,
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        yes: bool,
    },
    /// Run detection against a camera feed until ctrl-c
    DetectVideo {
        city: String,
        /// Camera selector as shown by `cameras` (1-based; 0 = none)
        #[arg(long, default_value_t = 1)]
        camera: usize,
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        yes: bool,
        /// Stop automatically after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = Config::load()?;

    match args.command {
        Command::Cities => cities(&cfg),
        Command::RequestCity { name } => request_city(&cfg, &name),
        Command::Cameras => cameras(&cfg),
        Command::Sync { city, yes } => {
            let (mut controller, notices) = build_controller(&cfg)?;
            resolve_city(&mut controller, &notices, &city, yes)
        }
        Command::DetectImage {
            city,
            image,
            debug,
            yes,
        } => detect_image(&cfg, &city, image, debug, yes),
        Command::DetectVideo {
            city,
            camera,
            debug,
            yes,
            duration,
        } => detect_video(&cfg, &city, camera, debug, yes, duration),
    }
}

fn build_controller(cfg: &Config) -> Result<(Controller, Receiver<Notice>)> {
    let registry = Arc::new(HttpRegistry::new(
        cfg.registry.base_url.clone(),
        cfg.registry.timeout,
    ));
    let cache = VersionCache::open(cfg.versions_path())?;
    let store = ModelStore::open(cfg.weights_dir())?;
    let sync = SyncController::new(registry.clone(), cache, store);
    let cameras = CameraSessionManager::from_settings(&cfg.cameras);
    let (notices_tx, notices_rx) = mpsc::channel();
    let controller = Controller::new(
        sync,
        cameras,
        registry,
        Arc::new(StubDetector::new()),
        cfg.detection.clone(),
        notices_tx,
    );
    Ok((controller, notices_rx))
}

fn cities(cfg: &Config) -> Result<()> {
    let registry = HttpRegistry::new(cfg.registry.base_url.clone(), cfg.registry.timeout);
    for city in registry.list_cities()? {
        println!("{city}");
    }
    Ok(())
}

fn request_city(cfg: &Config, name: &str) -> Result<()> {
    let (mut controller, _notices) = build_controller(cfg)?;
    controller.dispatch(Event::RefreshCities);
    // Give the refresh a moment so known cities are not re-requested.
    let deadline = Instant::now() + cfg.registry.timeout;
    while controller.directory().cities().is_empty() && Instant::now() < deadline {
        controller.pump();
        std::thread::sleep(PUMP_INTERVAL);
    }
    match controller.request_city(name)? {
        CityRequestOutcome::AlreadySupported(existing) => {
            println!("'{existing}' is already supported");
        }
        CityRequestOutcome::Submitted => {
            println!("city request for '{name}' submitted");
        }
    }
    Ok(())
}

fn cameras(cfg: &Config) -> Result<()> {
    for (n, info) in camera::enumerate(&cfg.cameras).iter().enumerate() {
        println!("{}: {} ({})", n + 1, info.name, info.uri);
    }
    Ok(())
}

/// Select a city and pump until its model is usable.
///
/// Download/update confirmations are answered from stdin (or `--yes`);
/// declining reverts the selection and fails the command.
fn resolve_city(
    controller: &mut Controller,
    notices: &Receiver<Notice>,
    city: &str,
    auto_yes: bool,
) -> Result<()> {
    controller.dispatch(Event::CitySelected(Some(city.to_string())));
    let deadline = Instant::now() + CITY_RESOLVE_TIMEOUT;
    let mut network_failed = false;

    loop {
        controller.pump();
        while let Ok(notice) = notices.try_recv() {
            match &notice {
                Notice::ConfirmDownload { .. } | Notice::ConfirmUpdate { .. } => {
                    let accept = auto_yes || prompt_yes(&format!("{notice} [y/N] "))?;
                    controller.dispatch(Event::DownloadDecision(accept));
                    if !accept {
                        return Err(anyhow!("download declined; no city selected"));
                    }
                }
                Notice::NetworkUnavailable { .. } => {
                    eprintln!("{notice}");
                    network_failed = true;
                }
                other => println!("{other}"),
            }
        }
        if controller.context().model.is_some() {
            return Ok(());
        }
        if network_failed {
            return Err(anyhow!("no usable model for {city} while registry is down"));
        }
        if Instant::now() > deadline {
            return Err(anyhow!("timed out waiting for a model for {city}"));
        }
        std::thread::sleep(PUMP_INTERVAL);
    }
}

fn detect_image(cfg: &Config, city: &str, image: PathBuf, debug: bool, yes: bool) -> Result<()> {
    let (mut controller, notices) = build_controller(cfg)?;
    resolve_city(&mut controller, &notices, city, yes)?;

    controller.dispatch(Event::DebugToggled(debug));
    controller.dispatch(Event::ImageDropped(image));
    controller.dispatch(Event::StartRequested);
    if controller.state() != State::ImageDetecting {
        return Err(anyhow!("image detection did not start"));
    }

    let deadline = Instant::now() + Duration::from_secs(600);
    loop {
        controller.pump();
        while let Ok(notice) = notices.try_recv() {
            if let Notice::ImageFinished { error } = &notice {
                return match error {
                    None => {
                        println!("{notice}");
                        Ok(())
                    }
                    Some(detail) => Err(anyhow!("image detection failed: {detail}")),
                };
            }
            println!("{notice}");
        }
        if Instant::now() > deadline {
            return Err(anyhow!("image detection did not finish"));
        }
        std::thread::sleep(PUMP_INTERVAL);
    }
}

fn detect_video(
    cfg: &Config,
    city: &str,
    camera: usize,
    debug: bool,
    yes: bool,
    duration: Option<u64>,
) -> Result<()> {
    let (mut controller, notices) = build_controller(cfg)?;
    resolve_city(&mut controller, &notices, city, yes)?;

    controller.dispatch(Event::DebugToggled(debug));
    controller.dispatch(Event::CameraSelected(camera));
    if controller.state() != State::VideoReady {
        drain_to_stderr(&notices);
        return Err(anyhow!("camera {camera} could not be bound"));
    }
    controller.dispatch(Event::StartRequested);
    if controller.state() != State::VideoDetecting {
        drain_to_stderr(&notices);
        return Err(anyhow!("video detection did not start"));
    }
    println!("video detection running; press ctrl-c to stop");

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;

    let stop_at = duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        controller.pump();
        while let Ok(notice) = notices.try_recv() {
            println!("{notice}");
        }
        if controller.state() != State::VideoDetecting {
            // The session aborted on its own; notices above explain why.
            break;
        }
        let timed_out = stop_at.is_some_and(|at| Instant::now() >= at);
        if interrupted.load(Ordering::SeqCst) || timed_out {
            controller.dispatch(Event::StopRequested);
            break;
        }
        std::thread::sleep(PUMP_INTERVAL);
    }

    controller.dispatch(Event::Shutdown);
    controller.pump();
    while let Ok(notice) = notices.try_recv() {
        println!("{notice}");
    }
    Ok(())
}

fn drain_to_stderr(notices: &Receiver<Notice>) {
    while let Ok(notice) = notices.try_recv() {
        eprintln!("{notice}");
    }
}

fn prompt_yes(question: &str) -> Result<bool> {
    print!("{question}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
