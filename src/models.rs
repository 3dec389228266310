use crate::fleet::ArtifactHandle;
use crate::geo::LatLon;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One element of the flight feed array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedFlight {
    #[serde(rename = "FlightID")]
    pub flight_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Seconds since the server last heard from this aircraft.
    pub age_seconds: f64,
    pub call_sign: Option<String>,
    pub aircraft: Option<String>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    #[serde(default)]
    pub track: Vec<FeedPoint>,
}

/// A prior position as reported by the feed or the detail endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub age_seconds: f64,
}

/// Payload of the per-flight detail endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlightDetail {
    pub call_sign: Option<String>,
    pub aircraft: Option<String>,
    #[serde(default)]
    pub track: Vec<FeedPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSample {
    pub position: LatLon,
    pub altitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// History points reported older than this are dropped.
pub const MAX_SAMPLE_AGE_SECS: f64 = 7.0 * 24.0 * 3600.0;

impl FeedPoint {
    /// `None` when the reported age is not a usable number of seconds.
    pub fn to_sample(&self, fetched_at: DateTime<Utc>) -> Option<PositionSample> {
        Some(PositionSample {
            position: LatLon::new(self.latitude, self.longitude),
            altitude: self.altitude,
            timestamp: observed_at(fetched_at, self.age_seconds)?,
        })
    }
}

/// Clamped to `0..=MAX_SAMPLE_AGE_SECS`; anything non-finite counts as zero.
pub(crate) fn age_to_duration(seconds: f64) -> Duration {
    let seconds = if seconds.is_finite() {
        seconds.clamp(0.0, MAX_SAMPLE_AGE_SECS)
    } else {
        0.0
    };
    Duration::milliseconds((seconds * 1000.0).round() as i64)
}

fn observed_at(fetched_at: DateTime<Utc>, age_seconds: f64) -> Option<DateTime<Utc>> {
    if !age_seconds.is_finite() || age_seconds > MAX_SAMPLE_AGE_SECS {
        return None;
    }
    fetched_at.checked_sub_signed(age_to_duration(age_seconds))
}

/// Tracked state of a single aircraft: its latest sample plus the trail of
/// earlier ones, oldest first.
#[derive(Debug, Clone)]
pub struct FlightRecord {
    pub flight_id: String,
    pub call_sign: Option<String>,
    pub aircraft: Option<String>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub current: PositionSample,
    pub trail: Vec<PositionSample>,
    /// Set until the detail endpoint has filled in metadata and history.
    pub needs_detail: bool,
    pub(crate) marker: Option<ArtifactHandle>,
    pub(crate) trail_lines: Vec<ArtifactHandle>,
}

impl FlightRecord {
    pub fn from_feed(feed: FeedFlight, fetched_at: DateTime<Utc>) -> Self {
        let current = PositionSample {
            position: LatLon::new(feed.latitude, feed.longitude),
            altitude: feed.altitude,
            timestamp: fetched_at
                .checked_sub_signed(age_to_duration(feed.age_seconds))
                .unwrap_or(fetched_at),
        };
        let trail = chronological_before(&feed.track, fetched_at, current.timestamp);

        Self {
            flight_id: feed.flight_id,
            call_sign: feed.call_sign,
            aircraft: feed.aircraft,
            speed: feed.speed,
            heading: feed.heading,
            current,
            trail,
            needs_detail: true,
            marker: None,
            trail_lines: Vec::new(),
        }
    }

    pub fn latest_position(&self) -> LatLon {
        self.current.position
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.current.timestamp
    }

    /// Age relative to `now`, never negative.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.current.timestamp).max(Duration::zero())
    }

    /// Has moved at least once since it was first sighted.
    pub fn is_active(&self) -> bool {
        !self.trail.is_empty()
    }

    pub fn marker(&self) -> Option<ArtifactHandle> {
        self.marker
    }

    /// Folds a later sighting of the same aircraft into this record.
    ///
    /// Every incoming sample newer than the current position becomes the new
    /// current position and pushes the old one onto the trail. Anything not
    /// strictly newer is an overlapping resend and is dropped.
    pub fn merge(&mut self, incoming: FlightRecord) {
        let FlightRecord {
            call_sign,
            aircraft,
            speed,
            heading,
            current,
            trail,
            ..
        } = incoming;

        for sample in trail.into_iter().chain(std::iter::once(current)) {
            if sample.timestamp > self.current.timestamp {
                let previous = std::mem::replace(&mut self.current, sample);
                self.trail.push(previous);
            }
        }

        if call_sign.is_some() {
            self.call_sign = call_sign;
        }
        if aircraft.is_some() {
            self.aircraft = aircraft;
        }
        if speed.is_some() {
            self.speed = speed;
        }
        if heading.is_some() {
            self.heading = heading;
        }
    }

    /// Applies the detail payload: metadata plus any history older than what
    /// we already hold.
    pub fn complete_with_detail(&mut self, detail: FlightDetail, fetched_at: DateTime<Utc>) {
        let earliest = self
            .trail
            .first()
            .map_or(self.current.timestamp, |sample| sample.timestamp);
        let mut history = chronological_before(&detail.track, fetched_at, earliest);
        history.append(&mut self.trail);
        self.trail = history;

        if detail.call_sign.is_some() {
            self.call_sign = detail.call_sign;
        }
        if detail.aircraft.is_some() {
            self.aircraft = detail.aircraft;
        }
        self.needs_detail = false;
    }
}

impl std::fmt::Display for FlightRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) at {:.4},{:.4}",
            self.flight_id,
            self.call_sign.as_deref().unwrap_or("N/A"),
            self.current.position.lat,
            self.current.position.lon
        )
    }
}

/// Samples strictly older than `cutoff`, oldest first.
fn chronological_before(
    points: &[FeedPoint],
    fetched_at: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Vec<PositionSample> {
    let mut samples: Vec<PositionSample> = points
        .iter()
        .filter_map(|point| point.to_sample(fetched_at))
        .filter(|sample| sample.timestamp < cutoff)
        .collect();
    samples.sort_by_key(|sample| sample.timestamp);
    samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn feed(id: &str, age: f64, lat: f64, lon: f64) -> FeedFlight {
        FeedFlight {
            flight_id: id.to_string(),
            latitude: lat,
            longitude: lon,
            altitude: 35000.0,
            age_seconds: age,
            call_sign: None,
            aircraft: None,
            speed: None,
            heading: None,
            track: Vec::new(),
        }
    }

    fn point(age: f64, lat: f64) -> FeedPoint {
        FeedPoint {
            latitude: lat,
            longitude: 0.0,
            altitude: 1000.0,
            age_seconds: age,
        }
    }

    #[test]
    fn test_parse_feed_element() {
        let json = r#"{"FlightID":"A1","Latitude":10.0,"Longitude":11.0,"Altitude":31000,
            "AgeSeconds":4.5,"CallSign":"DAL12",
            "Track":[{"Latitude":9.9,"Longitude":10.9,"Altitude":30500,"AgeSeconds":60}]}"#;
        let parsed: FeedFlight = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.flight_id, "A1");
        assert_eq!(parsed.call_sign.as_deref(), Some("DAL12"));
        assert!(parsed.aircraft.is_none());
        assert_eq!(parsed.track.len(), 1);
    }

    #[test]
    fn test_new_record_has_no_trail() {
        let record = FlightRecord::from_feed(feed("A1", 10.0, 10.0, 10.0), t0());
        assert!(!record.is_active());
        assert!(record.needs_detail);
        assert_eq!(record.last_seen(), t0() - Duration::seconds(10));
        assert_eq!(record.age(t0()), Duration::seconds(10));
    }

    #[test]
    fn test_age_never_negative() {
        let record = FlightRecord::from_feed(feed("A1", 0.0, 10.0, 10.0), t0());
        assert_eq!(record.age(t0() - Duration::seconds(30)), Duration::zero());
    }

    #[test]
    fn test_feed_track_is_sorted_and_stops_before_current() {
        let mut raw = feed("A1", 5.0, 10.0, 10.0);
        raw.track = vec![point(30.0, 3.0), point(90.0, 1.0), point(60.0, 2.0), point(2.0, 9.0)];
        let record = FlightRecord::from_feed(raw, t0());
        let lats: Vec<f64> = record.trail.iter().map(|s| s.position.lat).collect();
        assert_eq!(lats, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_merge_appends_newer_sighting() {
        let mut record = FlightRecord::from_feed(feed("A1", 10.0, 10.0, 10.0), t0());
        record.merge(FlightRecord::from_feed(feed("A1", 5.0, 10.0, 11.0), t0()));

        assert_eq!(record.trail.len(), 1);
        assert_eq!(record.trail[0].position, LatLon::new(10.0, 10.0));
        assert_eq!(record.latest_position(), LatLon::new(10.0, 11.0));
    }

    #[test]
    fn test_merge_skips_overlapping_resend() {
        let mut record = FlightRecord::from_feed(feed("A1", 10.0, 10.0, 10.0), t0());
        record.merge(FlightRecord::from_feed(feed("A1", 10.0, 10.0, 10.0), t0()));
        record.merge(FlightRecord::from_feed(feed("A1", 40.0, 8.0, 8.0), t0()));

        assert!(record.trail.is_empty());
        assert_eq!(record.latest_position(), LatLon::new(10.0, 10.0));
    }

    #[test]
    fn test_merge_keeps_trail_chronological() {
        let mut record = FlightRecord::from_feed(feed("A1", 100.0, 1.0, 0.0), t0());
        let mut later = feed("A1", 10.0, 4.0, 0.0);
        later.track = vec![point(50.0, 3.0), point(120.0, 0.5), point(80.0, 2.0)];
        later.call_sign = Some("UAL9".to_string());
        record.merge(FlightRecord::from_feed(later, t0()));

        let lats: Vec<f64> = record.trail.iter().map(|s| s.position.lat).collect();
        assert_eq!(lats, vec![1.0, 2.0, 3.0]);
        assert_eq!(record.latest_position().lat, 4.0);
        assert!(record.trail.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(record.call_sign.as_deref(), Some("UAL9"));
    }

    #[test]
    fn test_absurd_history_ages_are_dropped() {
        let mut raw = feed("A1", 5.0, 10.0, 10.0);
        raw.track = vec![point(1e15, 1.0), point(f64::INFINITY, 2.0), point(60.0, 3.0)];
        let mut record = FlightRecord::from_feed(raw, t0());
        let lats: Vec<f64> = record.trail.iter().map(|s| s.position.lat).collect();
        assert_eq!(lats, vec![3.0]);

        let detail = FlightDetail {
            call_sign: None,
            aircraft: None,
            track: vec![
                point(9.9e18, 0.0),
                point(MAX_SAMPLE_AGE_SECS + 1.0, 0.5),
                point(120.0, 2.5),
            ],
        };
        record.complete_with_detail(detail, t0());
        let lats: Vec<f64> = record.trail.iter().map(|s| s.position.lat).collect();
        assert_eq!(lats, vec![2.5, 3.0]);
    }

    #[test]
    fn test_current_age_is_clamped() {
        let record = FlightRecord::from_feed(feed("A1", 1e15, 10.0, 10.0), t0());
        assert_eq!(record.age(t0()), Duration::seconds(MAX_SAMPLE_AGE_SECS as i64));
    }

    #[test]
    fn test_detail_prepends_older_history() {
        let mut record = FlightRecord::from_feed(feed("A1", 10.0, 5.0, 0.0), t0());
        record.merge(FlightRecord::from_feed(feed("A1", 5.0, 6.0, 0.0), t0()));

        let detail = FlightDetail {
            call_sign: Some("BAW1".to_string()),
            aircraft: Some("B789".to_string()),
            track: vec![point(300.0, 1.0), point(200.0, 2.0), point(7.0, 99.0)],
        };
        record.complete_with_detail(detail, t0());

        let lats: Vec<f64> = record.trail.iter().map(|s| s.position.lat).collect();
        assert_eq!(lats, vec![1.0, 2.0, 5.0]);
        assert!(!record.needs_detail);
        assert_eq!(record.aircraft.as_deref(), Some("B789"));
    }
}
