use crate::heatmap::{HeatmapSettings, DEFAULT_RADIUS, DEFAULT_RESOLUTION};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const CONFIG_PATH: &str = "config.toml";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub weather: WeatherConfig,
    pub regions: RegionsConfig,
    pub heatmap: HeatmapConfig,
    pub logging: LoggingConfig,
    pub ui: UiConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    pub flights_url: String,
    pub flight_detail_url: String, // "{id}" is replaced with the flight id
    pub poll_interval_seconds: u64,
    pub staleness_threshold_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            flights_url: "http://localhost:8080/flights".to_string(),
            flight_detail_url: "http://localhost:8080/flights/{id}".to_string(),
            poll_interval_seconds: 15,
            staleness_threshold_seconds: 300,
            request_timeout_seconds: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct WeatherConfig {
    pub metar_url: String,
    pub min_refresh_interval_minutes: u64,
    pub retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    pub request_timeout_seconds: u64,
    pub max_attempts_per_region: Option<u32>, // unset retries until shutdown
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            metar_url: "https://aviationweather.gov/api/data/metar".to_string(),
            min_refresh_interval_minutes: 15,
            retry_delay_seconds: 10,
            max_retry_delay_seconds: 300,
            request_timeout_seconds: 10,
            max_attempts_per_region: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RegionsConfig {
    pub definitions_path: String,
}

impl Default for RegionsConfig {
    fn default() -> Self {
        Self {
            definitions_path: "data/regions.json".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct HeatmapConfig {
    pub resolution: usize, // cells per side
    pub radius: usize,     // kernel radius in cells
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            radius: DEFAULT_RADIUS,
        }
    }
}

impl From<HeatmapConfig> for HeatmapSettings {
    fn from(config: HeatmapConfig) -> Self {
        Self {
            resolution: config.resolution.max(1),
            radius: config.radius,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: String,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            file_prefix: "fleetwatch.log".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct UiConfig {
    pub tick_rate_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { tick_rate_ms: 250 }
    }
}

/// Where a loaded config came from. Logging may not be up while the config is
/// read, so `load` records what happened and `log` reports it later.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigOrigin {
    File,
    Defaults { problems: Vec<String> },
}

impl ConfigOrigin {
    pub fn log(&self, path: &Path) {
        match self {
            ConfigOrigin::File => info!("Loaded configuration from {}.", path.display()),
            ConfigOrigin::Defaults { problems } => {
                for problem in problems {
                    warn!("{}", problem);
                }
                info!("Loaded default configuration.");
            }
        }
    }
}

impl Config {
    /// Loads the config file at `path`.
    /// If it doesn't exist or can't be parsed, writes a default one in its place.
    pub fn load(path: impl AsRef<Path>) -> (Self, ConfigOrigin) {
        let path = path.as_ref();
        let mut problems = Vec::new();

        if let Ok(content) = fs::read_to_string(path) {
            match toml::from_str(&content) {
                Ok(config) => return (config, ConfigOrigin::File),
                Err(e) => problems.push(format!(
                    "Failed to parse {}: {}. Using defaults.",
                    path.display(),
                    e
                )),
            }
        }

        let default_config = Config::default();

        // Save default config to disk for the user to edit later
        match toml::to_string_pretty(&default_config) {
            Ok(toml_string) => {
                if fs::write(path, toml_string).is_err() {
                    problems.push(format!("Could not write default {} to disk.", path.display()));
                }
            }
            Err(e) => problems.push(format!("Could not serialize default config: {}", e)),
        }

        (default_config, ConfigOrigin::Defaults { problems })
    }
}
