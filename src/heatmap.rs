//! Wind heatmaps over a region, in spherical-Mercator space.
//!
//! A region never owns its grid. It keeps a [`Weak`] reference and a
//! generation counter in a [`HeatmapSlot`]; consumers hold the strong
//! [`HeatmapHandle`]. Once the last handle is dropped the grid is freed and
//! the next request builds a fresh one under a new generation.

use crate::geo::{project, Bounds, LatLon};
use crate::weather::Metar;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

pub const DEFAULT_RESOLUTION: usize = 400;
pub const DEFAULT_RADIUS: usize = 20;

/// The grid extends past the region by this fraction of its projected size on
/// every side.
pub const MARGIN_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeatmapSettings {
    /// Cells along each axis.
    pub resolution: usize,
    /// Kernel radius, in cells.
    pub radius: usize,
}

impl Default for HeatmapSettings {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            radius: DEFAULT_RADIUS,
        }
    }
}

/// Fixed-resolution accumulation grid. Row 0 is the northern edge.
#[derive(Debug, Clone)]
pub struct HeatmapGrid {
    width: usize,
    height: usize,
    radius: usize,
    min_x: f64,
    min_y: f64,
    extent_x: f64,
    extent_y: f64,
    cells: Vec<f32>,
    revision: u64,
}

impl HeatmapGrid {
    pub fn new(
        width: usize,
        height: usize,
        radius: usize,
        min_x: f64,
        min_y: f64,
        extent_x: f64,
        extent_y: f64,
    ) -> Self {
        Self {
            width,
            height,
            radius,
            min_x,
            min_y,
            extent_x,
            extent_y,
            cells: vec![0.0; width * height],
            revision: 0,
        }
    }

    /// Grid over `bounds`: project the four corners, take their bounding
    /// rectangle and grow it by [`MARGIN_FRACTION`] on each side.
    pub fn for_bounds(bounds: &Bounds, settings: HeatmapSettings) -> Self {
        let projected = bounds.corners().map(project);
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in projected {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let margin_x = (max_x - min_x) * MARGIN_FRACTION;
        let margin_y = (max_y - min_y) * MARGIN_FRACTION;
        min_x -= margin_x;
        min_y -= margin_y;
        max_x += margin_x;
        max_y += margin_y;

        Self::new(
            settings.resolution,
            settings.resolution,
            settings.radius,
            min_x,
            min_y,
            max_x - min_x,
            max_y - min_y,
        )
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.min_x, self.min_y)
    }

    pub fn extent(&self) -> (f64, f64) {
        (self.extent_x, self.extent_y)
    }

    /// Bumped every time the grid is repopulated.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Fractional (column, row) of a projected point. May lie outside the grid.
    fn cell_position(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.min_x) / self.extent_x * self.width as f64;
        let row = (self.min_y + self.extent_y - y) / self.extent_y * self.height as f64;
        (col, row)
    }

    /// The cell a projected point falls in, if it falls in the grid at all.
    pub fn cell_for(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.cell_position(x, y);
        if col < 0.0 || row < 0.0 || col >= self.width as f64 || row >= self.height as f64 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    /// Projected coordinates of a cell's center.
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        let x = self.min_x + (col as f64 + 0.5) / self.width as f64 * self.extent_x;
        let y =
            self.min_y + self.extent_y - (row as f64 + 0.5) / self.height as f64 * self.extent_y;
        (x, y)
    }

    /// Spreads `weight` around a projected point with linear fall-off over the
    /// kernel radius. Points just outside the grid still reach edge cells.
    pub fn add_mercator_point(&mut self, x: f64, y: f64, weight: f32) {
        let (col, row) = self.cell_position(x, y);
        if !col.is_finite() || !row.is_finite() {
            return;
        }

        if self.radius == 0 {
            if let Some((c, r)) = self.cell_for(x, y) {
                self.cells[r * self.width + c] += weight;
            }
            return;
        }

        let radius = self.radius as f64;
        let col_lo = (col - radius).floor().max(0.0) as usize;
        let row_lo = (row - radius).floor().max(0.0) as usize;
        let col_hi = ((col + radius).ceil().max(0.0) as usize).min(self.width);
        let row_hi = ((row + radius).ceil().max(0.0) as usize).min(self.height);

        for r in row_lo..row_hi {
            for c in col_lo..col_hi {
                let dx = c as f64 + 0.5 - col;
                let dy = r as f64 + 0.5 - row;
                let distance = (dx * dx + dy * dy).sqrt();
                if distance < radius {
                    self.cells[r * self.width + c] += weight * (1.0 - distance / radius) as f32;
                }
            }
        }
    }

    pub fn add_point(&mut self, point: LatLon, weight: f32) {
        let (x, y) = project(point);
        self.add_mercator_point(x, y, weight);
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|cell| *cell = 0.0);
    }

    /// Replaces the grid contents with the given observations. Each one with a
    /// position and both gust and speed deposits `gust + speed`. Returns how
    /// many were deposited.
    pub fn populate<'a, I>(&mut self, observations: I) -> usize
    where
        I: IntoIterator<Item = &'a Metar>,
    {
        self.clear();
        let mut deposited = 0;
        for metar in observations {
            if let (Some(position), Some(weight)) = (metar.position, metar.heat_weight()) {
                self.add_point(position, weight);
                deposited += 1;
            }
        }
        self.revision += 1;
        deposited
    }

    pub fn value_at(&self, col: usize, row: usize) -> f32 {
        if col >= self.width || row >= self.height {
            return 0.0;
        }
        self.cells[row * self.width + col]
    }

    pub fn max_intensity(&self) -> f32 {
        self.cells.iter().copied().fold(0.0, f32::max)
    }

    pub fn total_intensity(&self) -> f32 {
        self.cells.iter().sum()
    }
}

/// Strong reference to a region's heatmap. Keep it as long as the heatmap is
/// on screen.
#[derive(Debug, Clone)]
pub struct HeatmapHandle {
    grid: Arc<RwLock<HeatmapGrid>>,
    generation: u64,
}

impl HeatmapHandle {
    /// Which build of the region's heatmap this handle points at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn read(&self) -> RwLockReadGuard<'_, HeatmapGrid> {
        self.grid.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, HeatmapGrid> {
        self.grid.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn same_grid(&self, other: &HeatmapHandle) -> bool {
        Arc::ptr_eq(&self.grid, &other.grid)
    }
}

/// Non-owning side of the heatmap, kept by the region.
#[derive(Debug, Default)]
pub struct HeatmapSlot {
    grid: Weak<RwLock<HeatmapGrid>>,
    generation: u64,
}

impl HeatmapSlot {
    /// The current grid, if anyone still holds it.
    pub fn live(&self) -> Option<HeatmapHandle> {
        self.grid.upgrade().map(|grid| HeatmapHandle {
            grid,
            generation: self.generation,
        })
    }

    /// Takes a freshly built grid and starts a new generation.
    pub fn install(&mut self, grid: HeatmapGrid) -> HeatmapHandle {
        let grid = Arc::new(RwLock::new(grid));
        self.generation += 1;
        self.grid = Arc::downgrade(&grid);
        HeatmapHandle {
            grid,
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
