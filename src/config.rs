//! Feed and departure-sensor configuration.
//!
//! Stored as a JSON file on disk:
//! ```json
//! {
//!   "trip_update_url": "https://api.example.com/gtfsr/trip-updates",
//!   "vehicle_position_url": "https://api.example.com/gtfsr/vehicles",
//!   "gtfs_url": "https://example.com/google_transit.zip",
//!   "x_api_key": "...",
//!   "route_delimiter": "-",
//!   "departures": [
//!     { "name": "Bus 42 to Airport", "stop_id": "8220DB000334", "route": "42", "direction_id": 0 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use reqwest::header::HeaderValue;
use serde::Deserialize;
use tracing::debug;

use crate::board::{Criteria, DEFAULT_LIMIT, Field, Query, UnknownField};
use crate::normalize::NormalizeOptions;

pub const API_KEY_ENV: &str = "GTFS_RT_API_KEY";
pub const X_API_KEY_ENV: &str = "GTFS_RT_X_API_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{key} must not be empty")]
    MissingUrl { key: &'static str },

    #[error("{key} is not a valid URL ({url}): {message}")]
    InvalidUrl {
        key: &'static str,
        url: String,
        message: String,
    },

    #[error("{key} is not a valid header value")]
    InvalidApiKey { key: &'static str },

    #[error("{key} must be greater than zero")]
    ZeroTimeout { key: &'static str },

    #[error("departure name must not be empty")]
    EmptyName,

    #[error("departure {0:?} is configured more than once")]
    DuplicateName(String),

    #[error("departure {departure:?}: limit must be greater than zero")]
    ZeroLimit { departure: String },

    #[error("departure {departure:?}: {source}")]
    UnknownField {
        departure: String,
        #[source]
        source: UnknownField,
    },
}

fn default_throttle_secs() -> u64 {
    60
}

fn default_live_timeout_secs() -> u64 {
    20
}

fn default_static_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_icon() -> String {
    "mdi:bus".to_string()
}

fn default_service_type() -> String {
    "Service".to_string()
}

fn default_order_by() -> String {
    "arrival_time".to_string()
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub trip_update_url: String,
    #[serde(default)]
    pub vehicle_position_url: Option<String>,
    pub gtfs_url: String,
    /// Sent as the `Authorisation` header.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sent as the `x-api-key` header when `api_key` is unset.
    #[serde(default)]
    pub x_api_key: Option<String>,
    #[serde(default)]
    pub route_delimiter: Option<String>,
    /// Zone for service-day midnights. Falls back to the agency's, then UTC.
    #[serde(default)]
    pub timezone: Option<Tz>,
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,
    #[serde(default = "default_live_timeout_secs")]
    pub live_timeout_secs: u64,
    #[serde(default = "default_static_timeout_secs")]
    pub static_timeout_secs: u64,
    #[serde(default)]
    pub start_date_correction_days: i64,
    #[serde(default = "default_true")]
    pub serve_stale_schedule: bool,
    #[serde(default)]
    pub departures: Vec<DepartureConfig>,
}

/// One departure sensor: a named query against the board.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DepartureConfig {
    pub name: String,
    #[serde(default)]
    pub stop_id: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub direction_id: Option<u32>,
    #[serde(default)]
    pub route_short_name: Option<String>,
    #[serde(default)]
    pub stop_code: Option<String>,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default = "default_order_by")]
    pub order_by: String,
    #[serde(default = "default_true")]
    pub ascending: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl DepartureConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stop_id: None,
            route: None,
            direction_id: None,
            route_short_name: None,
            stop_code: None,
            icon: default_icon(),
            service_type: default_service_type(),
            order_by: default_order_by(),
            ascending: true,
            limit: DEFAULT_LIMIT,
        }
    }

    /// The board query this sensor runs.
    pub fn query(&self) -> Result<Query, ConfigError> {
        let order_by = self
            .order_by
            .parse::<Field>()
            .map_err(|source| ConfigError::UnknownField {
                departure: self.name.clone(),
                source,
            })?;

        let mut criteria = Criteria::new();
        if let Some(stop_id) = &self.stop_id {
            criteria.insert(Field::StopId, stop_id.as_str());
        }
        if let Some(route) = &self.route {
            criteria.insert(Field::RouteId, route.as_str());
        }
        if let Some(direction_id) = self.direction_id {
            criteria.insert(Field::DirectionId, direction_id.to_string());
        }
        if let Some(short_name) = &self.route_short_name {
            criteria.insert(Field::RouteShortName, short_name.as_str());
        }
        if let Some(stop_code) = &self.stop_code {
            criteria.insert(Field::StopCode, stop_code.as_str());
        }

        Ok(Query {
            criteria,
            order_by,
            ascending: self.ascending,
            limit: self.limit,
        })
    }
}

impl Config {
    /// Reads, completes from the environment, and validates the config at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        debug!(path = %path.display(), departures = config.departures.len(), "Config loaded");
        Ok(config)
    }

    /// Fills unset API keys from [`API_KEY_ENV`] and [`X_API_KEY_ENV`].
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name| lookup(name).filter(|v: &String| !v.trim().is_empty());
        if self.api_key.is_none() {
            self.api_key = non_empty(API_KEY_ENV);
        }
        if self.x_api_key.is_none() {
            self.x_api_key = non_empty(X_API_KEY_ENV);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_location("trip_update_url", &self.trip_update_url)?;
        check_location("gtfs_url", &self.gtfs_url)?;
        if let Some(url) = &self.vehicle_position_url {
            check_location("vehicle_position_url", url)?;
        }

        for (key, value) in [("api_key", &self.api_key), ("x_api_key", &self.x_api_key)] {
            if let Some(value) = value {
                HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidApiKey { key })?;
            }
        }

        for (key, secs) in [
            ("live_timeout_secs", self.live_timeout_secs),
            ("static_timeout_secs", self.static_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout { key });
            }
        }

        let mut names = HashSet::new();
        for departure in &self.departures {
            if departure.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !names.insert(departure.name.as_str()) {
                return Err(ConfigError::DuplicateName(departure.name.clone()));
            }
            if departure.limit == 0 {
                return Err(ConfigError::ZeroLimit {
                    departure: departure.name.clone(),
                });
            }
            departure.query()?;
        }

        Ok(())
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }

    pub fn live_timeout(&self) -> Duration {
        Duration::from_secs(self.live_timeout_secs)
    }

    pub fn static_timeout(&self) -> Duration {
        Duration::from_secs(self.static_timeout_secs)
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            route_delimiter: self.route_delimiter.clone().filter(|d| !d.is_empty()),
            start_date_correction_days: self.start_date_correction_days,
        }
    }

    pub fn departure(&self, name: &str) -> Option<&DepartureConfig> {
        self.departures.iter().find(|d| d.name == name)
    }
}

/// Accepts an `http(s)://` URL or a local path.
fn check_location(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::MissingUrl { key });
    }
    if value.starts_with("http") {
        reqwest::Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
            key,
            url: value.to_string(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}
