use crate::config::Config;
use crate::fleet::{ArtifactHandle, ArtifactSink, DisposalBatch, FlightStore};
use crate::heatmap::HeatmapHandle;
use crate::region::RegionCatalog;
use crate::weather::WeatherSource;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Clone, Copy, Default)]
pub enum ViewMode {
    #[default]
    Dashboard,
    Heatmap,
    Settings,
}

/// What the dashboard shows for one region, copied out of the catalog so
/// rendering never takes a lock.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionRow {
    pub name: String,
    pub count: usize,
    /// Set when the count moved since the previous update.
    pub changed: bool,
    pub windiest: Option<String>,
    pub stations: usize,
}

#[derive(Default)]
pub struct App {
    pub view_mode: ViewMode,
    pub config: Config,
    pub regions: Vec<RegionRow>,
    pub selected_index: usize,
    pub tick_count: usize,
    pub should_quit: bool,

    // Map artifacts drawn for tracked flights, keyed by handle
    pub markers: HashMap<ArtifactHandle, String>,
    pub trail_lines: HashSet<ArtifactHandle>,
    next_handle: u64,

    // Region index and the strong handle that keeps its heatmap alive
    pub heatmap: Option<(usize, HeatmapHandle)>,

    // Fleet telemetry
    pub tracked: usize,
    pub active: usize,
    pub evicted_total: usize,
    pub last_update: Option<Instant>,
    pub last_update_success: bool,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn on_tick(&mut self) {
        self.tick_count += 1;
    }

    /// Applies the result of one fleet cycle on the rendering side.
    pub fn on_fleet_update<W: WeatherSource>(
        &mut self,
        disposal: Option<DisposalBatch>,
        timestamp: Instant,
        is_success: bool,
        store: &FlightStore,
        catalog: &RegionCatalog<W>,
    ) {
        self.last_update = Some(timestamp);
        self.last_update_success = is_success;

        if let Some(batch) = disposal {
            self.evicted_total += batch.evicted.len();
            batch.apply(self);
        }

        catalog.update_counts(store);
        catalog.refresh_weather();
        self.assign_markers(store);

        self.tracked = store.len();
        self.active = store.get_active_fleet_size();
        self.refresh_rows(catalog);
    }

    /// Draws a marker for every flight that has none yet, then one trail
    /// line per trail segment not drawn so far.
    pub fn assign_markers(&mut self, store: &FlightStore) {
        for id in store.unmarked_flights() {
            let marker = self.allocate_handle();
            match store.attach_marker(&id, marker) {
                Ok(replaced) => {
                    self.markers.insert(marker, id.clone());
                    if let Some(old) = replaced {
                        self.remove_marker(old);
                    }
                }
                // Evicted between the scan and the attach
                Err(_) => continue,
            }
        }

        for (id, missing) in store.missing_trail_lines() {
            for _ in 0..missing {
                let line = self.allocate_handle();
                if store.attach_trail_line(&id, line).is_err() {
                    break;
                }
                self.trail_lines.insert(line);
            }
        }
    }

    fn allocate_handle(&mut self) -> ArtifactHandle {
        self.next_handle += 1;
        ArtifactHandle::new(self.next_handle)
    }

    pub fn refresh_rows<W: WeatherSource>(&mut self, catalog: &RegionCatalog<W>) {
        self.regions = catalog
            .regions()
            .iter()
            .map(|region| RegionRow {
                name: region.name().to_string(),
                count: region.player_count(),
                changed: region.take_count_change().is_some(),
                windiest: region.get_windiest().map(|metar| metar.station_id),
                stations: region.weather().map_or(0, |weather| weather.len()),
            })
            .collect();

        if self.selected_index >= self.regions.len() {
            self.selected_index = self.regions.len().saturating_sub(1);
        }
    }

    /// Holds the selected region's heatmap while the heatmap view is open and
    /// lets go of it otherwise.
    pub fn sync_heatmap<W: WeatherSource>(&mut self, catalog: &RegionCatalog<W>) {
        if self.view_mode != ViewMode::Heatmap {
            if self.heatmap.take().is_some() {
                debug!("Released heatmap handle");
            }
            return;
        }

        if matches!(self.heatmap, Some((index, _)) if index == self.selected_index) {
            return;
        }
        self.heatmap = catalog
            .get(self.selected_index)
            .map(|region| (self.selected_index, region.get_heatmap()));
    }

    pub fn handle_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Char('q') => match self.view_mode {
                ViewMode::Dashboard => self.should_quit = true,
                _ => self.view_mode = ViewMode::Dashboard,
            },
            KeyCode::Char('1') => self.view_mode = ViewMode::Dashboard,
            KeyCode::Char('2') | KeyCode::Enter => self.view_mode = ViewMode::Heatmap,
            KeyCode::Char('3') => self.view_mode = ViewMode::Settings,
            KeyCode::Esc => self.view_mode = ViewMode::Dashboard,
            KeyCode::Down | KeyCode::Char('j') => {
                if !self.regions.is_empty() {
                    self.selected_index = (self.selected_index + 1) % self.regions.len();
                }
            }
            KeyCode::Up | KeyCode::Char('k') => {
                if !self.regions.is_empty() {
                    self.selected_index = self
                        .selected_index
                        .checked_sub(1)
                        .unwrap_or(self.regions.len() - 1);
                }
            }
            _ => {}
        }
    }

    pub fn selected_region(&self) -> Option<&RegionRow> {
        self.regions.get(self.selected_index)
    }
}

impl ArtifactSink for App {
    fn remove_marker(&mut self, handle: ArtifactHandle) {
        if self.markers.remove(&handle).is_none() {
            warn!("Asked to remove unknown marker {}", handle.raw());
        }
    }

    fn remove_line(&mut self, handle: ArtifactHandle) {
        if !self.trail_lines.remove(&handle) {
            warn!("Asked to remove unknown trail line {}", handle.raw());
        }
    }
}
