//! Live flight tracking over fixed geographic regions, with per-region
//! occupancy counts, METAR wind observations and wind heatmaps.

pub mod api;
pub mod app;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod geo;
pub mod heatmap;
pub mod logging;
pub mod models;
pub mod region;
pub mod ui;
pub mod weather;
