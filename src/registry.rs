//! Model registry client.
//!
//! The registry is the remote system of record for supported cities and
//! per-city model versions/binaries. The core consumes it through the
//! `ModelRegistry` trait; `HttpRegistry` talks to the real service and
//! `InMemoryRegistry` backs tests and the demo without a network.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::CityKey;

/// Hard ceiling on accepted model payloads (64 MiB).
const MAX_MODEL_BYTES: u64 = 64 * 1024 * 1024;

/// Remote model registry operations consumed by the core.
pub trait ModelRegistry: Send + Sync {
    /// Latest published model version for a city.
    fn latest_version(&self, city: &CityKey) -> Result<u32>;

    /// Model binary for a city, or `None` when the registry has none.
    fn fetch_model(&self, city: &CityKey) -> Result<Option<Vec<u8>>>;

    /// Ordered list of supported city names.
    fn list_cities(&self) -> Result<Vec<String>>;

    /// Ask the registry to add support for a new city.
    fn submit_city_request(&self, name: &str) -> Result<()>;
}

// ----------------------------------------------------------------------------
// HTTP implementation
// ----------------------------------------------------------------------------

/// Registry client over the service's JSON HTTP API.
pub struct HttpRegistry {
    agent: ureq::Agent,
    base: Url,
}

impl HttpRegistry {
    pub fn new(base: Url, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent, base }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("registry base url cannot be a base: {}", self.base))?
            .extend(segments);
        Ok(url)
    }
}

impl ModelRegistry for HttpRegistry {
    fn latest_version(&self, city: &CityKey) -> Result<u32> {
        let url = self.endpoint(&["cities", city.as_str(), "version"])?;
        let response = self
            .agent
            .request_url("GET", &url)
            .call()
            .with_context(|| format!("fetch latest version for {city}"))?;
        let version: u32 = response
            .into_json()
            .with_context(|| format!("parse version payload for {city}"))?;
        Ok(version)
    }

    fn fetch_model(&self, city: &CityKey) -> Result<Option<Vec<u8>>> {
        let url = self.endpoint(&["cities", city.as_str(), "model"])?;
        let response = match self.agent.request_url("GET", &url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(err) => {
                return Err(anyhow!(err)).with_context(|| format!("fetch model for {city}"))
            }
        };
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_MODEL_BYTES)
            .read_to_end(&mut bytes)
            .with_context(|| format!("read model payload for {city}"))?;
        Ok(Some(bytes))
    }

    fn list_cities(&self) -> Result<Vec<String>> {
        let url = self.endpoint(&["cities"])?;
        let cities: Vec<String> = self
            .agent
            .request_url("GET", &url)
            .call()
            .context("fetch supported city list")?
            .into_json()
            .context("parse supported city list")?;
        Ok(cities)
    }

    fn submit_city_request(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&["cities", "requests"])?;
        self.agent
            .request_url("POST", &url)
            .send_json(serde_json::json!({ "name": name }))
            .with_context(|| format!("submit city request for '{name}'"))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory implementation (tests, demo)
// ----------------------------------------------------------------------------

#[derive(Default)]
struct InMemoryState {
    versions: HashMap<String, u32>,
    models: HashMap<String, Vec<u8>>,
    cities: Vec<String>,
    requests: Vec<String>,
}

/// In-memory registry double with a switchable simulated outage.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<InMemoryState>,
    offline: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a model version (and optional binary) for a city.
    pub fn publish(&self, city: &CityKey, version: u32, model: Option<Vec<u8>>) {
        let mut state = self.state.lock().unwrap_or_else(|poison| poison.into_inner());
        state.versions.insert(city.as_str().to_string(), version);
        if let Some(bytes) = model {
            state.models.insert(city.as_str().to_string(), bytes);
        }
    }

    pub fn set_cities(&self, cities: Vec<String>) {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .cities = cities;
    }

    /// Simulate the registry becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// City requests received so far (test observability).
    pub fn requests(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .requests
            .clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused (simulated outage)"));
        }
        Ok(())
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("registry state lock poisoned"))
    }
}

impl ModelRegistry for InMemoryRegistry {
    fn latest_version(&self, city: &CityKey) -> Result<u32> {
        self.check_online()?;
        let state = self.locked()?;
        state
            .versions
            .get(city.as_str())
            .copied()
            .ok_or_else(|| anyhow!("unknown city {city}"))
    }

    fn fetch_model(&self, city: &CityKey) -> Result<Option<Vec<u8>>> {
        self.check_online()?;
        let state = self.locked()?;
        Ok(state.models.get(city.as_str()).cloned())
    }

    fn list_cities(&self) -> Result<Vec<String>> {
        self.check_online()?;
        Ok(self.locked()?.cities.clone())
    }

    fn submit_city_request(&self, name: &str) -> Result<()> {
        self.check_online()?;
        self.locked()?.requests.push(name.to_string());
        Ok(())
    }
}
