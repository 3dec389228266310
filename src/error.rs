//! Error types for the feed, weather and region layers.
//!
//! None of these are fatal: the fleet cycle aborts, the weather loop retries
//! and catalog load reports back to `main`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("flight feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("flight feed returned HTTP {0}")]
    Status(u16),

    #[error("flight feed payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("flight feed payload is not a JSON array")]
    NotAnArray,
}

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("METAR request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("METAR source returned HTTP {0}")]
    Status(u16),

    #[error("METAR payload could not be decoded: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read region definitions: {0}")]
    Io(#[from] std::io::Error),

    #[error("region definitions are malformed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(
        "region '{name}' has inverted bounds \
         (lat {lat_min}..{lat_max}, lon {lon_min}..{lon_max})"
    )]
    InvalidBounds {
        name: String,
        lat_min: f64,
        lat_max: f64,
        lon_min: f64,
        lon_max: f64,
    },
}
