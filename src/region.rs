//! Static regions, their occupancy counts and their weather.
//!
//! The catalog is loaded once from a JSON asset and never changes shape.
//! Occupancy is recounted from the whole fleet on every update. Weather is
//! refreshed by one background task at a time that walks the regions in order
//! and retries each one with a growing delay. [`RegionCatalog::shutdown`] stops
//! it at any point.

use crate::config::WeatherConfig;
use crate::error::CatalogError;
use crate::fleet::FlightStore;
use crate::geo::{Bounds, LatLon};
use crate::heatmap::{HeatmapGrid, HeatmapHandle, HeatmapSettings, HeatmapSlot};
use crate::weather::{windiest, Metar, WeatherMap, WeatherSource};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One entry of the region asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegionDefinition {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub name: String,
}

pub fn parse_definitions(json: &str) -> Result<Vec<RegionDefinition>, CatalogError> {
    Ok(serde_json::from_str(json)?)
}

#[derive(Debug)]
pub struct Region {
    name: String,
    bounds: Bounds,
    count: AtomicUsize,
    last_reported: Mutex<Option<usize>>,
    weather: RwLock<Option<Arc<WeatherMap>>>,
    heatmap: Mutex<HeatmapSlot>,
    heatmap_settings: HeatmapSettings,
}

impl Region {
    pub fn new(
        definition: RegionDefinition,
        heatmap_settings: HeatmapSettings,
    ) -> Result<Self, CatalogError> {
        let RegionDefinition {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
            name,
        } = definition;
        if lat_min > lat_max || lon_min > lon_max {
            return Err(CatalogError::InvalidBounds {
                name,
                lat_min,
                lat_max,
                lon_min,
                lon_max,
            });
        }

        Ok(Self {
            name,
            bounds: Bounds::new(lat_min, lon_min, lat_max, lon_max),
            count: AtomicUsize::new(0),
            last_reported: Mutex::new(None),
            weather: RwLock::new(None),
            heatmap: Mutex::new(HeatmapSlot::default()),
            heatmap_settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn top_left(&self) -> LatLon {
        self.bounds.corners()[0]
    }

    pub fn top_right(&self) -> LatLon {
        self.bounds.corners()[1]
    }

    pub fn bottom_right(&self) -> LatLon {
        self.bounds.corners()[2]
    }

    pub fn bottom_left(&self) -> LatLon {
        self.bounds.corners()[3]
    }

    pub fn contains(&self, point: LatLon) -> bool {
        self.bounds.contains(point)
    }

    /// Whether any part of the region is inside `viewport`.
    pub fn intersects(&self, viewport: &Bounds) -> bool {
        self.bounds.intersects(viewport)
    }

    /// Recounts the flights whose latest position is inside the region.
    pub fn update_count(&self, store: &FlightStore) -> usize {
        let count = store.count_matching(|record| self.bounds.contains(record.latest_position()));
        self.count.store(count, Ordering::Release);
        count
    }

    pub fn player_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// The current count if it differs from the one last taken, `None`
    /// otherwise. The first call always reports.
    pub fn take_count_change(&self) -> Option<usize> {
        let count = self.player_count();
        let mut last = lock(&self.last_reported);
        if *last == Some(count) {
            return None;
        }
        *last = Some(count);
        Some(count)
    }

    /// `None` until the first successful fetch.
    pub fn weather(&self) -> Option<Arc<WeatherMap>> {
        self.weather
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in a new weather map and repaints a live heatmap from it.
    pub fn set_weather(&self, observations: WeatherMap) {
        let observations = Arc::new(observations);
        *self.weather.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&observations));

        if let Some(handle) = lock(&self.heatmap).live() {
            let deposited = handle.write().populate(observations.values());
            debug!("Repainted {} heatmap with {} stations", self.name, deposited);
        }
    }

    pub fn get_windiest(&self) -> Option<Metar> {
        let weather = self.weather()?;
        windiest(weather.values()).cloned()
    }

    /// The region's heatmap, building it if nobody holds one right now.
    pub fn get_heatmap(&self) -> HeatmapHandle {
        let mut slot = lock(&self.heatmap);
        if let Some(handle) = slot.live() {
            return handle;
        }

        let mut grid = HeatmapGrid::for_bounds(&self.bounds, self.heatmap_settings);
        if let Some(weather) = self.weather() {
            grid.populate(weather.values());
        }
        let handle = slot.install(grid);
        debug!("Built heatmap generation {} for {}", handle.generation(), self.name);
        handle
    }

    pub fn has_heatmap(&self) -> bool {
        lock(&self.heatmap).live().is_some()
    }

    pub fn heatmap_generation(&self) -> u64 {
        lock(&self.heatmap).generation()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshSettings {
    /// A refresh request sooner than this after the last one is ignored.
    pub min_interval: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Attempts per region before moving on. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(15 * 60),
            retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(300),
            max_attempts: None,
        }
    }
}

impl From<&WeatherConfig> for RefreshSettings {
    fn from(config: &WeatherConfig) -> Self {
        Self {
            min_interval: Duration::from_secs(
                config.min_refresh_interval_minutes.saturating_mul(60),
            ),
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            max_retry_delay: Duration::from_secs(config.max_retry_delay_seconds),
            max_attempts: config.max_attempts_per_region,
        }
    }
}

enum RegionRefresh {
    Updated,
    GaveUp,
    Cancelled,
}

pub struct RegionCatalog<W> {
    regions: Vec<Arc<Region>>,
    source: Arc<W>,
    settings: RefreshSettings,
    last_refresh: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<W> std::fmt::Debug for RegionCatalog<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionCatalog")
            .field("regions", &self.regions.len())
            .field("settings", &self.settings)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<W: WeatherSource> RegionCatalog<W> {
    /// Builds the catalog in definition order. Does not fetch any weather.
    pub fn new(
        definitions: Vec<RegionDefinition>,
        source: Arc<W>,
        settings: RefreshSettings,
        heatmap: HeatmapSettings,
    ) -> Result<Self, CatalogError> {
        let regions = definitions
            .into_iter()
            .map(|definition| Region::new(definition, heatmap).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            regions,
            source,
            settings,
            last_refresh: Mutex::new(None),
            task: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_json(
        json: &str,
        source: Arc<W>,
        settings: RefreshSettings,
        heatmap: HeatmapSettings,
    ) -> Result<Self, CatalogError> {
        Self::new(parse_definitions(json)?, source, settings, heatmap)
    }

    pub fn load(
        path: impl AsRef<Path>,
        source: Arc<W>,
        settings: RefreshSettings,
        heatmap: HeatmapSettings,
    ) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let catalog = Self::from_json(&json, source, settings, heatmap)?;
        info!(
            "Loaded {} regions from {}",
            catalog.len(),
            path.as_ref().display()
        );
        Ok(catalog)
    }

    /// Loads the region asset and kicks off the first weather refresh. Must be
    /// called inside a Tokio runtime.
    pub fn open(
        path: impl AsRef<Path>,
        source: Arc<W>,
        settings: RefreshSettings,
        heatmap: HeatmapSettings,
    ) -> Result<Self, CatalogError> {
        let catalog = Self::load(path, source, settings, heatmap)?;
        catalog.refresh_weather();
        Ok(catalog)
    }

    pub fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Region>> {
        self.regions.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&Arc<Region>> {
        self.regions.iter().find(|region| region.name() == name)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn update_counts(&self, store: &FlightStore) {
        for region in &self.regions {
            region.update_count(store);
        }
    }

    /// First region, in catalog order, containing the point.
    pub fn region_containing(&self, point: LatLon) -> Option<&Arc<Region>> {
        self.regions.iter().find(|region| region.contains(point))
    }

    pub fn regions_intersecting(&self, viewport: &Bounds) -> Vec<&Arc<Region>> {
        self.regions
            .iter()
            .filter(|region| region.intersects(viewport))
            .collect()
    }

    /// Starts a background weather refresh over every region.
    ///
    /// Returns `false` without doing anything if the last refresh started
    /// less than `min_interval` ago, if that refresh is still running, or if
    /// the catalog has been shut down.
    pub fn refresh_weather(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        let mut last = lock(&self.last_refresh);
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.settings.min_interval {
                debug!("Weather refreshed {:?} ago, skipping", now.duration_since(previous));
                return false;
            }
        }

        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            warn!("Previous weather refresh is still running, skipping");
            return false;
        }

        *last = Some(now);
        *task = Some(tokio::spawn(run_refresh(
            self.regions.clone(),
            Arc::clone(&self.source),
            self.settings,
            self.cancel.clone(),
        )));
        true
    }

    pub fn is_refreshing(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|running| !running.is_finished())
    }

    /// Waits for the current refresh task, if any, to end.
    pub async fn join_refresh(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Weather refresh task failed: {}", e);
            }
        }
    }

    /// Stops the refresh loop, including any retry sleep in progress.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl<W> Drop for RegionCatalog<W> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_refresh<W: WeatherSource>(
    regions: Vec<Arc<Region>>,
    source: Arc<W>,
    settings: RefreshSettings,
    cancel: CancellationToken,
) {
    for region in &regions {
        match refresh_region(region, source.as_ref(), &settings, &cancel).await {
            RegionRefresh::Updated | RegionRefresh::GaveUp => {}
            RegionRefresh::Cancelled => {
                info!("Weather refresh cancelled before {}", region.name());
                return;
            }
        }
    }
    info!("Weather refresh finished for {} regions", regions.len());
}

async fn refresh_region<W: WeatherSource>(
    region: &Region,
    source: &W,
    settings: &RefreshSettings,
    cancel: &CancellationToken,
) -> RegionRefresh {
    info!("Retrieving METAR for {} ...", region.name());
    let mut delay = settings.retry_delay;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = tokio::select! {
            result = source.fetch_in_bounds(region.bounds()) => result,
            () = cancel.cancelled() => return RegionRefresh::Cancelled,
        };

        match result {
            Ok(observations) => {
                let found = observations.len();
                region.set_weather(observations);
                info!("Done retrieving METAR for {}! Found {} entries", region.name(), found);
                return RegionRefresh::Updated;
            }
            Err(e) if settings.max_attempts.is_some_and(|max| attempt >= max) => {
                warn!(
                    "Giving up on METAR for {} after {} attempts: {}",
                    region.name(),
                    attempt,
                    e
                );
                return RegionRefresh::GaveUp;
            }
            Err(e) => {
                warn!(
                    "Failed retrieving METAR for {} ({}), retrying in {}s",
                    region.name(),
                    e,
                    delay.as_secs()
                );
                tokio::select! {
                    () = sleep(delay) => {}
                    () = cancel.cancelled() => return RegionRefresh::Cancelled,
                }
                delay = next_retry_delay(delay, settings.max_retry_delay);
            }
        }
    }
}

fn next_retry_delay(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::WeatherError;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;

    const REGIONS: &str = r#"[
        {"LatMin": 30.0, "LatMax": 40.0, "LonMin": -125.0, "LonMax": -115.0, "Name": "West"},
        {"LatMin": 30.0, "LatMax": 40.0, "LonMin": -115.0, "LonMax": -100.0, "Name": "Mountain"},
        {"LatMin": 45.0, "LatMax": 55.0, "LonMin": -5.0, "LonMax": 10.0, "Name": "Europe"}
    ]"#;

    /// Answers fetches in call order from a script; empty script means failure.
    #[derive(Default)]
    struct ScriptedWeather {
        script: Mutex<VecDeque<Result<WeatherMap, WeatherError>>>,
        calls: Mutex<Vec<(f64, Instant)>>,
    }

    impl ScriptedWeather {
        fn with(script: Vec<Result<WeatherMap, WeatherError>>) -> Arc<Self> {
            let source = Self::default();
            source.script.lock().unwrap().extend(script);
            Arc::new(source)
        }

        fn called_wests(&self) -> Vec<f64> {
            self.calls.lock().unwrap().iter().map(|(west, _)| *west).collect()
        }
    }

    impl WeatherSource for ScriptedWeather {
        async fn fetch_in_bounds(&self, bounds: &Bounds) -> Result<WeatherMap, WeatherError> {
            self.calls.lock().unwrap().push((bounds.west, Instant::now()));
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(Err(WeatherError::Status(503)))
        }
    }

    /// Never answers; counts how many fetches were started.
    #[derive(Default)]
    struct StuckWeather {
        calls: AtomicUsize,
    }

    impl WeatherSource for StuckWeather {
        async fn fetch_in_bounds(&self, _bounds: &Bounds) -> Result<WeatherMap, WeatherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn station(id: &str, lat: f64, lon: f64, gust: f64, speed: f64) -> (String, Metar) {
        (
            id.to_string(),
            Metar {
                station_id: id.to_string(),
                position: Some(LatLon::new(lat, lon)),
                wind_direction: Some(250.0),
                wind_speed: Some(speed),
                wind_gust: Some(gust),
                raw: Some(format!("{id} 011200Z 25{speed:02}G{gust:02}KT")),
            },
        )
    }

    fn two_regions(
        source: Arc<ScriptedWeather>,
        settings: RefreshSettings,
    ) -> RegionCatalog<ScriptedWeather> {
        let json = r#"[
            {"LatMin": 30.0, "LatMax": 40.0, "LonMin": -125.0, "LonMax": -115.0, "Name": "West"},
            {"LatMin": 30.0, "LatMax": 40.0, "LonMin": -115.0, "LonMax": -100.0, "Name": "Mountain"}
        ]"#;
        RegionCatalog::from_json(json, source, settings, HeatmapSettings::default()).unwrap()
    }

    #[test]
    fn test_catalog_preserves_definition_order() {
        let catalog = RegionCatalog::from_json(
            REGIONS,
            ScriptedWeather::with(Vec::new()),
            RefreshSettings::default(),
            HeatmapSettings::default(),
        )
        .unwrap();

        let names: Vec<&str> = catalog.regions().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["West", "Mountain", "Europe"]);
        let west = catalog.find("West").unwrap();
        assert_eq!(west.top_left(), LatLon::new(40.0, -125.0));
        assert_eq!(west.bottom_right(), LatLon::new(30.0, -115.0));
        assert!(west.weather().is_none());
        assert!(west.get_windiest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_loads_asset_and_starts_refresh() {
        let source = ScriptedWeather::with(Vec::new());
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/regions.json");
        let catalog = RegionCatalog::open(
            path,
            Arc::clone(&source),
            RefreshSettings::default(),
            HeatmapSettings::default(),
        )
        .unwrap();

        assert!(!catalog.is_empty());
        assert!(catalog.is_refreshing());
        catalog.shutdown();
        catalog.join_refresh().await;

        let missing = RegionCatalog::load(
            "data/no-such-file.json",
            source,
            RefreshSettings::default(),
            HeatmapSettings::default(),
        );
        assert!(matches!(missing, Err(CatalogError::Io(_))));
    }

    #[test]
    fn test_inverted_bounds_are_rejected() {
        let json =
            r#"[{"LatMin": 40.0, "LatMax": 30.0, "LonMin": 0.0, "LonMax": 1.0, "Name": "Upside"}]"#;
        let err = RegionCatalog::from_json(
            json,
            ScriptedWeather::with(Vec::new()),
            RefreshSettings::default(),
            HeatmapSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::InvalidBounds { ref name, .. } if name == "Upside"));

        assert!(matches!(parse_definitions("[{\"Name\": 3}]"), Err(CatalogError::Parse(_))));
    }

    #[test]
    fn test_point_and_viewport_queries() {
        let catalog = RegionCatalog::from_json(
            REGIONS,
            ScriptedWeather::with(Vec::new()),
            RefreshSettings::default(),
            HeatmapSettings::default(),
        )
        .unwrap();

        // Shared edge goes to the first region in catalog order
        assert_eq!(catalog.region_containing(LatLon::new(35.0, -115.0)).unwrap().name(), "West");
        let mountain = catalog.region_containing(LatLon::new(35.0, -110.0)).unwrap();
        assert_eq!(mountain.name(), "Mountain");
        assert!(catalog.region_containing(LatLon::new(0.0, 0.0)).is_none());

        let viewport = Bounds::new(35.0, -120.0, 50.0, 0.0);
        let visible: Vec<&str> = catalog
            .regions_intersecting(&viewport)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(visible, vec!["West", "Mountain", "Europe"]);
        assert!(catalog.regions_intersecting(&Bounds::new(-10.0, -10.0, -5.0, -5.0)).is_empty());
    }

    #[test]
    fn test_update_count_recounts_from_scratch() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let store = FlightStore::with_clock(clock);
        let catalog = two_regions(ScriptedWeather::with(Vec::new()), RefreshSettings::default());
        let west = Arc::clone(&catalog.regions()[0]);
        let mountain = Arc::clone(&catalog.regions()[1]);

        store
            .merge_payload(
                r#"[
                {"FlightID":"A","Latitude":35,"Longitude":-120,"Altitude":0,"AgeSeconds":30},
                {"FlightID":"B","Latitude":36,"Longitude":-121,"Altitude":0,"AgeSeconds":30},
                {"FlightID":"C","Latitude":33,"Longitude":-105,"Altitude":0,"AgeSeconds":30},
                {"FlightID":"D","Latitude":10,"Longitude":10,"Altitude":0,"AgeSeconds":30}
            ]"#,
            )
            .unwrap();

        catalog.update_counts(&store);
        assert_eq!(west.player_count(), 2);
        assert_eq!(mountain.player_count(), 1);
        assert_eq!(west.take_count_change(), Some(2));
        assert_eq!(west.take_count_change(), None);

        // B flies east into the next region
        store
            .merge_payload(
                r#"[{"FlightID":"B","Latitude":36,"Longitude":-110,"Altitude":0,"AgeSeconds":5}]"#,
            )
            .unwrap();
        catalog.update_counts(&store);
        assert_eq!(west.player_count(), 1);
        assert_eq!(mountain.player_count(), 2);
        assert_eq!(west.take_count_change(), Some(1));

        catalog.update_counts(&store);
        assert_eq!(west.take_count_change(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_sequential_with_growing_delay() {
        let source = ScriptedWeather::with(vec![
            Err(WeatherError::Status(500)),
            Err(WeatherError::Status(500)),
            Ok([station("KSFO", 37.6, -122.4, 27.0, 18.0)].into_iter().collect()),
            Ok([
                station("KDEN", 39.8, -104.7, 30.0, 12.0),
                station("KSLC", 40.0, -111.9, 0.0, 4.0),
            ]
            .into_iter()
            .collect()),
        ]);
        let catalog = two_regions(Arc::clone(&source), RefreshSettings::default());

        let started = Instant::now();
        assert!(catalog.refresh_weather());
        catalog.join_refresh().await;

        assert_eq!(source.called_wests(), vec![-125.0, -125.0, -125.0, -115.0]);
        let offsets: Vec<u64> = source
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 10, 30, 30]);

        let west = &catalog.regions()[0];
        let mountain = &catalog.regions()[1];
        assert_eq!(west.weather().unwrap().len(), 1);
        assert_eq!(mountain.weather().unwrap().len(), 2);
        assert_eq!(mountain.get_windiest().unwrap().station_id, "KDEN");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_throttled() {
        let source = ScriptedWeather::with(vec![Ok(WeatherMap::new()), Ok(WeatherMap::new())]);
        let catalog = two_regions(Arc::clone(&source), RefreshSettings::default());

        assert!(catalog.refresh_weather());
        catalog.join_refresh().await;
        assert!(!catalog.refresh_weather());

        tokio::time::advance(Duration::from_secs(14 * 60)).await;
        assert!(!catalog.refresh_weather());
        assert_eq!(source.called_wests().len(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(catalog.refresh_weather());
        catalog.shutdown();
        catalog.join_refresh().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_moves_on_and_keeps_old_weather() {
        let source = ScriptedWeather::with(vec![
            Err(WeatherError::Status(500)),
            Err(WeatherError::Status(500)),
            Ok([station("KDEN", 39.8, -104.7, 30.0, 12.0)].into_iter().collect()),
        ]);
        let settings = RefreshSettings {
            max_attempts: Some(2),
            ..RefreshSettings::default()
        };
        let catalog = two_regions(Arc::clone(&source), settings);
        let west = Arc::clone(&catalog.regions()[0]);
        west.set_weather([station("KSFO", 37.6, -122.4, 27.0, 18.0)].into_iter().collect());

        assert!(catalog.refresh_weather());
        catalog.join_refresh().await;

        assert_eq!(source.called_wests(), vec![-125.0, -125.0, -115.0]);
        assert!(west.weather().unwrap().contains_key("KSFO"));
        assert!(catalog.regions()[1].weather().unwrap().contains_key("KDEN"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_endless_retry() {
        let source = ScriptedWeather::with(Vec::new());
        let catalog = two_regions(Arc::clone(&source), RefreshSettings::default());

        assert!(catalog.refresh_weather());
        sleep(Duration::from_secs(25)).await;
        assert!(catalog.is_refreshing());
        // Still on the first region: attempts at 0s and 10s so far
        assert_eq!(source.called_wests(), vec![-125.0, -125.0]);

        catalog.shutdown();
        catalog.join_refresh().await;
        assert!(!catalog.is_refreshing());
        assert!(!catalog.refresh_weather());
        assert!(source.called_wests().iter().all(|west| *west == -125.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_hanging_fetch() {
        let source = Arc::new(StuckWeather::default());
        let catalog = RegionCatalog::from_json(
            REGIONS,
            Arc::clone(&source),
            RefreshSettings::default(),
            HeatmapSettings::default(),
        )
        .unwrap();

        assert!(catalog.refresh_weather());
        sleep(Duration::from_secs(1)).await;
        assert!(catalog.is_refreshing());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        catalog.shutdown();
        catalog.join_refresh().await;
        assert!(!catalog.is_refreshing());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(catalog.regions().iter().all(|r| r.weather().is_none()));
    }

    #[test]
    fn test_retry_delay_saturates_at_cap() {
        let cap = Duration::from_secs(300);
        assert_eq!(next_retry_delay(Duration::from_secs(10), cap), Duration::from_secs(20));
        assert_eq!(next_retry_delay(Duration::from_secs(200), cap), cap);
        assert_eq!(next_retry_delay(Duration::MAX, Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_huge_refresh_interval_saturates() {
        let config = WeatherConfig {
            min_refresh_interval_minutes: u64::MAX,
            ..WeatherConfig::default()
        };
        let settings = RefreshSettings::from(&config);
        assert_eq!(settings.min_interval, Duration::from_secs(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_second_task_while_refresh_runs() {
        let source = ScriptedWeather::with(Vec::new());
        let settings = RefreshSettings {
            min_interval: Duration::ZERO,
            ..RefreshSettings::default()
        };
        let catalog = two_regions(Arc::clone(&source), settings);

        assert!(catalog.refresh_weather());
        sleep(Duration::from_secs(1)).await;
        assert!(!catalog.refresh_weather());

        catalog.shutdown();
        catalog.join_refresh().await;
    }

    #[test]
    fn test_heatmap_is_rebuilt_after_release() {
        let catalog = two_regions(ScriptedWeather::with(Vec::new()), RefreshSettings::default());
        let west = &catalog.regions()[0];
        assert!(!west.has_heatmap());

        let first = west.get_heatmap();
        let again = west.get_heatmap();
        assert!(first.same_grid(&again));
        assert!(west.has_heatmap());
        assert_eq!(west.heatmap_generation(), 1);

        drop(first);
        assert!(west.has_heatmap());
        drop(again);
        assert!(!west.has_heatmap());

        let rebuilt = west.get_heatmap();
        assert_eq!(rebuilt.generation(), 2);
        assert_eq!(west.heatmap_generation(), 2);
    }

    #[test]
    fn test_weather_update_repaints_live_heatmap() {
        let catalog = two_regions(ScriptedWeather::with(Vec::new()), RefreshSettings::default());
        let west = &catalog.regions()[0];

        west.set_weather([station("KSFO", 37.6, -122.4, 27.0, 18.0)].into_iter().collect());
        let heatmap = west.get_heatmap();
        let before = heatmap.read().revision();
        assert!(heatmap.read().max_intensity() > 0.0);

        west.set_weather(WeatherMap::new());
        assert_eq!(heatmap.read().revision(), before + 1);
        assert_eq!(heatmap.read().max_intensity(), 0.0);
        // Same grid, repainted in place
        assert!(heatmap.same_grid(&west.get_heatmap()));
    }
}
