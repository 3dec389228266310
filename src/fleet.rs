//! The fleet store: fetch, merge, evict.
//!
//! [`FlightStore::update_fleet`] is the only writer. It is guarded so that at
//! most one cycle runs at a time; a call that arrives while another is in
//! flight returns `None` straight away and touches nothing. Eviction never
//! disposes of rendering artifacts itself. It hands them back in a
//! [`DisposalBatch`] for the rendering side to [`apply`](DisposalBatch::apply).

use crate::api::FlightSource;
use crate::clock::{Clock, SystemClock};
use crate::error::FeedError;
use crate::geo::LatLon;
use crate::models::{FeedFlight, FlightRecord};
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::{SeqAccess, Visitor};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// Feed entries older than this are ignored outright, whatever their id.
pub const FRESHNESS_WINDOW_SECS: f64 = 180.0;

/// Opaque reference to something the rendering layer drew for a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactHandle(u64);

impl ArtifactHandle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Implemented by whoever owns the drawn artifacts.
pub trait ArtifactSink {
    fn remove_marker(&mut self, handle: ArtifactHandle);
    fn remove_line(&mut self, handle: ArtifactHandle);
}

/// Everything the last eviction pass decided must go.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DisposalBatch {
    pub evicted: Vec<String>,
    pub markers: Vec<ArtifactHandle>,
    pub lines: Vec<ArtifactHandle>,
}

impl DisposalBatch {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.markers.is_empty() && self.lines.is_empty()
    }

    /// Disposes of exactly the artifacts in this batch. Call from the
    /// rendering context.
    pub fn apply<S: ArtifactSink + ?Sized>(self, sink: &mut S) {
        for line in self.lines {
            sink.remove_line(line);
        }
        for marker in self.markers {
            sink.remove_marker(marker);
        }
    }
}

/// Counters from one parse pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub inserted: usize,
    pub merged: usize,
    pub discarded: usize,
    /// Parsing stopped early on an undecodable element.
    pub aborted: bool,
}

/// Clears the in-progress flag on every exit path.
struct UpdateGuard<'a>(&'a AtomicBool);

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FlightStore {
    flights: RwLock<HashMap<String, FlightRecord>>,
    up_to_date: AtomicBool,
    updating: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FlightStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightStore")
            .field("flights", &self.len())
            .field("up_to_date", &self.is_up_to_date())
            .field("updating", &self.is_updating())
            .finish()
    }
}

impl Default for FlightStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            flights: RwLock::new(HashMap::new()),
            up_to_date: AtomicBool::new(false),
            updating: AtomicBool::new(false),
            clock,
        }
    }

    /// Runs one fetch → parse → merge → evict → detail cycle.
    ///
    /// Returns `None` when another cycle is already running or when the feed
    /// could not be fetched or was not a JSON array; the store is untouched in
    /// both cases. Otherwise returns the artifacts of every evicted record,
    /// which may be an empty batch.
    pub async fn update_fleet<S: FlightSource>(
        &self,
        source: &S,
        staleness_threshold_secs: u64,
    ) -> Option<DisposalBatch> {
        let Some(_guard) = self.try_begin_update() else {
            debug!("Fleet update already in progress, dropping this cycle");
            return None;
        };

        let payload = match source.fetch_flights().await {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to fetch flight list: {}", e);
                return None;
            }
        };

        match self.merge_payload(&payload) {
            Ok(stats) => debug!(
                "Parsed flight list: {} new, {} merged, {} too old{}",
                stats.inserted,
                stats.merged,
                stats.discarded,
                if stats.aborted { " (stopped early)" } else { "" }
            ),
            Err(e) => {
                error!("Discarding flight list: {}", e);
                return None;
            }
        }

        let batch = self.evict_stale(staleness_threshold_secs);
        self.complete_details(source).await;

        self.up_to_date.store(true, Ordering::Release);
        info!(
            "Fleet updated: {} tracked, {} active, {} evicted",
            self.len(),
            self.get_active_fleet_size(),
            batch.evicted.len()
        );
        Some(batch)
    }

    fn try_begin_update(&self) -> Option<UpdateGuard<'_>> {
        self.updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| UpdateGuard(&self.updating))
    }

    /// Streams the feed array element by element and folds each one into the
    /// store. The first undecodable element, or a stream that breaks off,
    /// stops parsing; whatever was merged before it stays. Only a payload
    /// that never opens an array is rejected.
    pub fn merge_payload(&self, payload: &str) -> Result<MergeStats, FeedError> {
        let fetched_at = self.clock.now();
        let mut stats = MergeStats::default();
        let mut started = false;
        let mut flights = self.write_flights();

        let visitor = FeedVisitor {
            flights: &mut *flights,
            fetched_at,
            stats: &mut stats,
            started: &mut started,
        };
        let mut deserializer = serde_json::Deserializer::from_str(payload);
        match serde::Deserializer::deserialize_seq(&mut deserializer, visitor) {
            Ok(()) => Ok(stats),
            Err(e) if started => {
                if !stats.aborted {
                    warn!("Flight list ended abruptly: {}", e);
                    stats.aborted = true;
                }
                Ok(stats)
            }
            Err(e) if e.is_data() => Err(FeedError::NotAnArray),
            Err(e) => Err(FeedError::Parse(e)),
        }
    }

    /// Removes every record older than the threshold. A record exactly at the
    /// threshold stays.
    pub fn evict_stale(&self, staleness_threshold_secs: u64) -> DisposalBatch {
        let now = self.clock.now();
        let threshold = i64::try_from(staleness_threshold_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or_else(TimeDelta::max_value);
        let mut batch = DisposalBatch::default();
        let mut flights = self.write_flights();

        let stale: Vec<String> = flights
            .iter()
            .filter(|(_, record)| record.age(now) > threshold)
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            if let Some(record) = flights.remove(&id) {
                debug!(
                    "Removing old flight ({} minutes old): {}",
                    record.age(now).num_minutes(),
                    record
                );
                batch.lines.extend(record.trail_lines);
                batch.markers.extend(record.marker);
                batch.evicted.push(id);
            }
        }

        batch
    }

    async fn complete_details<S: FlightSource>(&self, source: &S) {
        let pending: Vec<String> = self
            .read_flights()
            .values()
            .filter(|record| record.needs_detail)
            .map(|record| record.flight_id.clone())
            .collect();

        for id in pending {
            match source.fetch_detail(&id).await {
                Ok(detail) => {
                    let fetched_at = self.clock.now();
                    if let Some(record) = self.write_flights().get_mut(&id) {
                        record.complete_with_detail(detail, fetched_at);
                    }
                }
                Err(e) => warn!("Could not fetch details for flight {}: {}", id, e),
            }
        }
    }

    /// Number of flights with at least one position beyond their first sighting.
    pub fn get_active_fleet_size(&self) -> usize {
        self.count_matching(FlightRecord::is_active)
    }

    pub fn count_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&FlightRecord) -> bool,
    {
        self.read_flights().values().filter(|&record| predicate(record)).count()
    }

    pub fn positions(&self) -> Vec<(String, LatLon)> {
        self.read_flights()
            .values()
            .map(|record| (record.flight_id.clone(), record.latest_position()))
            .collect()
    }

    pub fn get(&self, flight_id: &str) -> Option<FlightRecord> {
        self.read_flights().get(flight_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_flights().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_flights().is_empty()
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::Acquire)
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    /// Flights the rendering side has not drawn a marker for yet.
    pub fn unmarked_flights(&self) -> Vec<String> {
        self.read_flights()
            .values()
            .filter(|record| record.marker.is_none())
            .map(|record| record.flight_id.clone())
            .collect()
    }

    /// Flights whose trail has more segments than drawn lines, with the
    /// number of lines each is missing.
    pub fn missing_trail_lines(&self) -> Vec<(String, usize)> {
        self.read_flights()
            .values()
            .filter_map(|record| {
                let missing = record.trail.len().saturating_sub(record.trail_lines.len());
                (missing > 0).then(|| (record.flight_id.clone(), missing))
            })
            .collect()
    }

    /// Records the marker drawn for a flight. Returns the handle it replaced,
    /// or `Err` with the given handle when the flight is gone.
    pub fn attach_marker(
        &self,
        flight_id: &str,
        handle: ArtifactHandle,
    ) -> Result<Option<ArtifactHandle>, ArtifactHandle> {
        match self.write_flights().get_mut(flight_id) {
            Some(record) => Ok(record.marker.replace(handle)),
            None => Err(handle),
        }
    }

    pub fn attach_trail_line(
        &self,
        flight_id: &str,
        handle: ArtifactHandle,
    ) -> Result<(), ArtifactHandle> {
        match self.write_flights().get_mut(flight_id) {
            Some(record) => {
                record.trail_lines.push(handle);
                Ok(())
            }
            None => Err(handle),
        }
    }

    fn read_flights(&self) -> RwLockReadGuard<'_, HashMap<String, FlightRecord>> {
        self.flights.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_flights(&self) -> RwLockWriteGuard<'_, HashMap<String, FlightRecord>> {
        self.flights.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Walks the top-level feed array, merging as it goes.
struct FeedVisitor<'a> {
    flights: &'a mut HashMap<String, FlightRecord>,
    fetched_at: DateTime<Utc>,
    stats: &'a mut MergeStats,
    started: &'a mut bool,
}

impl<'de> Visitor<'de> for FeedVisitor<'_> {
    type Value = ();

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("an array of flights")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<(), A::Error>
    where
        A: SeqAccess<'de>,
    {
        *self.started = true;
        let mut index = 0;
        loop {
            match seq.next_element::<FeedFlight>() {
                Ok(Some(feed)) => fold_flight(self.flights, feed, self.fetched_at, self.stats),
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("Stopping flight list parse at element {}: {}", index, e);
                    self.stats.aborted = true;
                    return Err(e);
                }
            }
            index += 1;
        }
    }
}

fn fold_flight(
    flights: &mut HashMap<String, FlightRecord>,
    feed: FeedFlight,
    fetched_at: DateTime<Utc>,
    stats: &mut MergeStats,
) {
    if !feed.age_seconds.is_finite() || feed.age_seconds > FRESHNESS_WINDOW_SECS {
        stats.discarded += 1;
        return;
    }

    let record = FlightRecord::from_feed(feed, fetched_at);
    match flights.entry(record.flight_id.clone()) {
        Entry::Vacant(slot) => {
            slot.insert(record);
            stats.inserted += 1;
        }
        Entry::Occupied(mut slot) => {
            slot.get_mut().merge(record);
            stats.merged += 1;
        }
    }
}
