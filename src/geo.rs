//! Geographic primitives and the spherical-Mercator projection.
//!
//! Regions are axis-aligned in latitude/longitude, so a [`Bounds`] test is all
//! the occupancy counter needs. The heatmap works in projected space instead,
//! using [`x_from_longitude`] and [`y_from_latitude`] for both the grid extent
//! and every deposited observation.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Web Mercator stops being finite at the poles; clamp to the usual limit.
pub const MAX_LAT: f64 = 85.05112878;
pub const MIN_LAT: f64 = -85.05112878;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Inclusive latitude/longitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    pub fn contains(&self, point: LatLon) -> bool {
        (self.south..=self.north).contains(&point.lat)
            && (self.west..=self.east).contains(&point.lon)
    }

    /// True when the two rectangles share any area, including one inside the other.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.south <= other.north
            && other.south <= self.north
            && self.west <= other.east
            && other.west <= self.east
    }

    /// Corners in drawing order: top-left, top-right, bottom-right, bottom-left.
    pub fn corners(&self) -> [LatLon; 4] {
        [
            LatLon::new(self.north, self.west),
            LatLon::new(self.north, self.east),
            LatLon::new(self.south, self.east),
            LatLon::new(self.south, self.west),
        ]
    }

    pub fn center(&self) -> LatLon {
        LatLon::new((self.south + self.north) / 2.0, (self.west + self.east) / 2.0)
    }
}

pub fn x_from_longitude(lon: f64) -> f64 {
    lon
}

pub fn y_from_latitude(lat: f64) -> f64 {
    let lat_rad = lat.clamp(MIN_LAT, MAX_LAT).to_radians();
    (PI / 4.0 + lat_rad / 2.0).tan().ln().to_degrees()
}

pub fn longitude_from_x(x: f64) -> f64 {
    x
}

pub fn latitude_from_y(y: f64) -> f64 {
    (2.0 * y.to_radians().exp().atan() - PI / 2.0).to_degrees()
}

/// Projects a point into planar Mercator coordinates.
pub fn project(point: LatLon) -> (f64, f64) {
    (x_from_longitude(point.lon), y_from_latitude(point.lat))
}
