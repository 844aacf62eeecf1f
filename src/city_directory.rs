//! Stale-tolerant cache of the supported-city list.
//!
//! The list is refreshed in the background; a failed refresh never clobbers
//! the previously cached copy, so lookups keep working from stale data
//! during registry outages.

use anyhow::Result;

use crate::ModelRegistry;

/// Outcome of a free-text "add city" request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CityRequestOutcome {
    /// The name already matches a supported city; nothing was forwarded.
    AlreadySupported(String),
    /// The request was forwarded to the registry.
    Submitted,
}

/// Read-mostly cache of supported city names.
#[derive(Clone, Debug, Default)]
pub struct CityDirectory {
    cities: Vec<String>,
}

impl CityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cities(cities: Vec<String>) -> Self {
        Self { cities }
    }

    pub fn cities(&self) -> &[String] {
        &self.cities
    }

    /// Apply the outcome of a background refresh.
    ///
    /// On failure the previously cached list is left untouched and the
    /// error detail is handed back for user notification.
    pub fn apply_refresh(&mut self, fetched: Result<Vec<String>, String>) -> Result<(), String> {
        match fetched {
            Ok(cities) => {
                log::info!("city directory refreshed ({} cities)", cities.len());
                self.cities = cities;
                Ok(())
            }
            Err(detail) => {
                log::warn!(
                    "city directory refresh failed; keeping {} cached entries: {}",
                    self.cities.len(),
                    detail
                );
                Err(detail)
            }
        }
    }

    /// Case-insensitive exact matches against the cached list.
    pub fn filter(&self, query: &str) -> Vec<&str> {
        let query = query.trim();
        self.cities
            .iter()
            .filter(|city| city.eq_ignore_ascii_case(query))
            .map(String::as_str)
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        !self.filter(name).is_empty()
    }

    /// Validate a free-text city request and forward it to the registry.
    ///
    /// Names that already match a supported city are not forwarded.
    pub fn request_city(
        &self,
        registry: &dyn ModelRegistry,
        name: &str,
    ) -> Result<CityRequestOutcome> {
        if let Some(existing) = self.filter(name).first() {
            return Ok(CityRequestOutcome::AlreadySupported(existing.to_string()));
        }
        registry.submit_city_request(name.trim())?;
        log::info!("submitted city request for '{}'", name.trim());
        Ok(CityRequestOutcome::Submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryRegistry;

    #[test]
    fn filter_is_case_insensitive_exact_match() {
        let directory =
            CityDirectory::with_cities(vec!["Berlin".to_string(), "Hamburg".to_string()]);

        assert_eq!(directory.filter("berlin"), vec!["Berlin"]);
        assert_eq!(directory.filter(" BERLIN "), vec!["Berlin"]);
        assert!(directory.filter("berl").is_empty());
    }

    #[test]
    fn failed_refresh_keeps_stale_list() {
        let mut directory = CityDirectory::with_cities(vec!["Berlin".to_string()]);

        let result = directory.apply_refresh(Err("connection refused".to_string()));

        assert!(result.is_err());
        assert_eq!(directory.cities(), ["Berlin"]);
        assert_eq!(directory.filter("berlin"), vec!["Berlin"]);
    }

    #[test]
    fn successful_refresh_replaces_list() {
        let mut directory = CityDirectory::with_cities(vec!["Berlin".to_string()]);

        directory
            .apply_refresh(Ok(vec!["Berlin".to_string(), "Munich".to_string()]))
            .expect("refresh applies");

        assert_eq!(directory.cities().len(), 2);
    }

    #[test]
    fn known_cities_are_not_forwarded_as_requests() -> Result<()> {
        let registry = InMemoryRegistry::new();
        let directory = CityDirectory::with_cities(vec!["Berlin".to_string()]);

        let outcome = directory.request_city(&registry, "berlin")?;
        assert_eq!(
            outcome,
            CityRequestOutcome::AlreadySupported("Berlin".to_string())
        );
        assert!(registry.requests().is_empty());

        let outcome = directory.request_city(&registry, "Leipzig")?;
        assert_eq!(outcome, CityRequestOutcome::Submitted);
        assert_eq!(registry.requests(), ["Leipzig"]);
        Ok(())
    }
}
