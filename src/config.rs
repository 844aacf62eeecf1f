use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_DATA_DIR: &str = "sightscan-data";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;
const DEFAULT_SYNTHETIC_CAMERAS: usize = 1;
const DEFAULT_IMAGE_SIZE: u32 = 640;

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    registry: Option<RegistryConfigFile>,
    data_dir: Option<String>,
    cameras: Option<CamerasConfigFile>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct RegistryConfigFile {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CamerasConfigFile {
    synthetic: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    image_size: Option<u32>,
    stop_grace_ms: Option<u64>,
}

/// Resolved client configuration.
///
/// A missing or unparsable registry base URL is the one fatal startup
/// error; everything else falls back to defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub registry: RegistrySettings,
    pub data_dir: PathBuf,
    pub cameras: CameraSettings,
    pub detection: DetectionSettings,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Number of synthetic `stub://camera/N` devices to enumerate.
    pub synthetic: usize,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub image_size: u32,
    /// Bounded wait for a video session to acknowledge cancellation.
    pub stop_grace: Duration,
}

impl Config {
    /// Load configuration from the file named by `SIGHTSCAN_CONFIG` (if
    /// set), apply env overrides, and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIGHTSCAN_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()
    }

    fn from_file(file: ClientConfigFile) -> PartialConfig {
        PartialConfig {
            base_url: file.registry.as_ref().and_then(|r| r.base_url.clone()),
            timeout_ms: file
                .registry
                .as_ref()
                .and_then(|r| r.timeout_ms)
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS),
            data_dir: file.data_dir.unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            synthetic: file
                .cameras
                .and_then(|c| c.synthetic)
                .unwrap_or(DEFAULT_SYNTHETIC_CAMERAS),
            image_size: file
                .detection
                .as_ref()
                .and_then(|d| d.image_size)
                .unwrap_or(DEFAULT_IMAGE_SIZE),
            stop_grace_ms: file
                .detection
                .and_then(|d| d.stop_grace_ms)
                .unwrap_or(DEFAULT_STOP_GRACE_MS),
        }
    }
}

/// Pre-validation configuration; the registry URL may still be absent here.
#[derive(Debug)]
struct PartialConfig {
    base_url: Option<String>,
    timeout_ms: u64,
    data_dir: String,
    synthetic: usize,
    image_size: u32,
    stop_grace_ms: u64,
}

impl PartialConfig {
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SIGHTSCAN_REGISTRY_URL") {
            if !url.trim().is_empty() {
                self.base_url = Some(url);
            }
        }
        if let Ok(dir) = std::env::var("SIGHTSCAN_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir;
            }
        }
        if let Ok(count) = std::env::var("SIGHTSCAN_SYNTHETIC_CAMERAS") {
            self.synthetic = count
                .parse()
                .map_err(|_| anyhow!("SIGHTSCAN_SYNTHETIC_CAMERAS must be an integer"))?;
        }
        if let Ok(ms) = std::env::var("SIGHTSCAN_HTTP_TIMEOUT_MS") {
            self.timeout_ms = ms
                .parse()
                .map_err(|_| anyhow!("SIGHTSCAN_HTTP_TIMEOUT_MS must be an integer"))?;
        }
        if let Ok(ms) = std::env::var("SIGHTSCAN_STOP_GRACE_MS") {
            self.stop_grace_ms = ms
                .parse()
                .map_err(|_| anyhow!("SIGHTSCAN_STOP_GRACE_MS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(self) -> Result<Config> {
        let raw_url = self.base_url.ok_or_else(|| {
            anyhow!("registry base url is required (set SIGHTSCAN_REGISTRY_URL or a config file)")
        })?;
        let base_url = Url::parse(&raw_url)
            .map_err(|e| anyhow!("invalid registry base url '{}': {}", raw_url, e))?;
        if self.stop_grace_ms == 0 {
            return Err(anyhow!("stop grace period must be greater than zero"));
        }
        if self.image_size == 0 {
            return Err(anyhow!("detection image size must be greater than zero"));
        }
        Ok(Config {
            registry: RegistrySettings {
                base_url,
                timeout: Duration::from_millis(self.timeout_ms),
            },
            data_dir: PathBuf::from(self.data_dir),
            cameras: CameraSettings {
                synthetic: self.synthetic,
            },
            detection: DetectionSettings {
                image_size: self.image_size,
                stop_grace: Duration::from_millis(self.stop_grace_ms),
            },
        })
    }
}

impl Config {
    /// Directory holding one model artifact per city.
    pub fn weights_dir(&self) -> PathBuf {
        self.data_dir.join("weights")
    }

    /// Path of the persisted `CITY_KEY=VERSION` cache.
    pub fn versions_path(&self) -> PathBuf {
        self.weights_dir().join("versions.txt")
    }
}

fn read_config_file(path: &Path) -> Result<ClientConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
