//! METAR observations and the source that fetches them per region.
//!
//! Any of position, direction, speed and gust may be missing from a report.
//! Aggregations ([`windiest`], heatmap weights) skip an observation when a
//! value they need is absent.

use crate::config::WeatherConfig;
use crate::error::WeatherError;
use crate::geo::{Bounds, LatLon};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Observations keyed by station id. Ordered, so scans are deterministic.
pub type WeatherMap = BTreeMap<String, Metar>;

#[derive(Debug, Clone, PartialEq)]
pub struct Metar {
    pub station_id: String,
    pub position: Option<LatLon>,
    /// Degrees true. Absent for variable or missing wind.
    pub wind_direction: Option<f64>,
    /// Knots.
    pub wind_speed: Option<f64>,
    /// Knots.
    pub wind_gust: Option<f64>,
    pub raw: Option<String>,
}

impl Metar {
    /// Heatmap weight: gust plus sustained speed.
    pub fn heat_weight(&self) -> Option<f32> {
        match (self.wind_gust, self.wind_speed) {
            (Some(gust), Some(speed)) => Some((gust + speed) as f32),
            _ => None,
        }
    }
}

pub trait WeatherSource: Send + Sync + 'static {
    fn fetch_in_bounds(
        &self,
        bounds: &Bounds,
    ) -> impl Future<Output = Result<WeatherMap, WeatherError>> + Send;
}

/// Picks the windiest station.
///
/// A candidate is only replaced when the newcomer's gust is not smaller AND its
/// speed is strictly greater. The order of the two checks matters on ties.
pub fn windiest<'a, I>(observations: I) -> Option<&'a Metar>
where
    I: IntoIterator<Item = &'a Metar>,
{
    let mut best: Option<(&'a Metar, f64, f64)> = None;

    for metar in observations {
        let (Some(gust), Some(speed)) = (metar.wind_gust, metar.wind_speed) else {
            continue;
        };
        let replace = match best {
            None => true,
            // negated `<` rather than `>=` so a NaN gust never blocks the speed check
            #[allow(clippy::neg_cmp_op_on_partial_ord)]
            Some((_, best_gust, best_speed)) => !(gust < best_gust) && speed > best_speed,
        };
        if replace {
            best = Some((metar, gust, speed));
        }
    }

    best.map(|(metar, _, _)| metar)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetarResponse {
    icao_id: String,
    lat: Option<f64>,
    lon: Option<f64>,
    wdir: Option<serde_json::Value>,
    wspd: Option<f64>,
    wgst: Option<f64>,
    raw_ob: Option<String>,
}

impl From<MetarResponse> for Metar {
    fn from(res: MetarResponse) -> Self {
        let position = match (res.lat, res.lon) {
            (Some(lat), Some(lon)) => Some(LatLon::new(lat, lon)),
            _ => None,
        };
        Self {
            station_id: res.icao_id.trim().to_string(),
            position,
            // "VRB" and friends come through as strings
            wind_direction: res.wdir.as_ref().and_then(serde_json::Value::as_f64),
            wind_speed: res.wspd,
            wind_gust: res.wgst,
            raw: res.raw_ob,
        }
    }
}

/// Decodes an aviationweather.gov style JSON METAR list.
pub fn parse_metars(body: &str) -> Result<WeatherMap, WeatherError> {
    if body.trim().is_empty() {
        return Ok(WeatherMap::new());
    }
    let reports: Vec<MetarResponse> = serde_json::from_str(body)?;
    Ok(reports
        .into_iter()
        .map(Metar::from)
        .map(|metar| (metar.station_id.clone(), metar))
        .collect())
}

pub struct MetarProvider {
    client: Client,
    url: String,
}

impl MetarProvider {
    pub fn new(config: &WeatherConfig) -> Result<Self, WeatherError> {
        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_seconds))
                .build()?,
            url: config.metar_url.clone(),
        })
    }
}

impl WeatherSource for MetarProvider {
    async fn fetch_in_bounds(&self, bounds: &Bounds) -> Result<WeatherMap, WeatherError> {
        let bbox = format!(
            "{},{},{},{}",
            bounds.south, bounds.west, bounds.north, bounds.east
        );
        let res = self
            .client
            .get(&self.url)
            .query(&[("bbox", bbox.as_str()), ("format", "json")])
            .send()
            .await?;

        match res.status() {
            StatusCode::NO_CONTENT => Ok(WeatherMap::new()),
            status if status.is_success() => parse_metars(&res.text().await?),
            status => Err(WeatherError::Status(status.as_u16())),
        }
    }
}
