//! Height grids: the unit of elevation data exchanged with sources and caches
//!
//! Samples are held as `Elevation` so that "no data" never travels through
//! arithmetic as a magic number. The `NO_DATA_VALUE` sentinel only appears at
//! the raw-float boundary (import, export, persisted encoding).

use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{ElevationError, ElevationResult};
use crate::geo::{GeoExtent, Srs};
use crate::terrain::normals::{surface_normal, NormalGrid};

/// Raw sentinel for "no valid elevation here"
pub const NO_DATA_VALUE: f32 = -f32::MAX;

/// Smallest legal grid dimension
pub const MIN_GRID_DIM: u32 = 2;

/// Largest legal grid dimension
pub const MAX_GRID_DIM: u32 = 1024;

/// One elevation sample
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Elevation {
    Valid(f32),
    #[default]
    NoData,
}

impl Elevation {
    /// Classify a raw float; NaN, infinities and the sentinel are no data
    pub fn from_raw(value: f32) -> Self {
        if value.is_finite() && value != NO_DATA_VALUE {
            Elevation::Valid(value)
        } else {
            Elevation::NoData
        }
    }

    pub fn to_raw(self) -> f32 {
        match self {
            Elevation::Valid(v) => v,
            Elevation::NoData => NO_DATA_VALUE,
        }
    }

    pub fn value(self) -> Option<f32> {
        match self {
            Elevation::Valid(v) => Some(v),
            Elevation::NoData => None,
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, Elevation::Valid(_))
    }
}

impl From<Option<f32>> for Elevation {
    fn from(value: Option<f32>) -> Self {
        value.map(Elevation::from_raw).unwrap_or(Elevation::NoData)
    }
}

/// Sampling method for reading a grid at arbitrary coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterInterpolation {
    Nearest,
    #[default]
    Bilinear,
}

/// Row-major 2D array of elevation samples; row 0 is the southern edge.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightGrid {
    width: u32,
    height: u32,
    samples: Vec<Elevation>,
}

impl HeightGrid {
    /// Grid with every sample set to no data
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            samples: vec![Elevation::NoData; (width as usize) * (height as usize)],
        }
    }

    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            samples: vec![Elevation::from_raw(value); (width as usize) * (height as usize)],
        }
    }

    /// Wrap raw floats. The sample count is not checked here; see `validate`.
    pub fn from_raw(width: u32, height: u32, raw: Vec<f32>) -> Self {
        Self {
            width,
            height,
            samples: raw.into_iter().map(Elevation::from_raw).collect(),
        }
    }

    pub fn from_samples(width: u32, height: u32, samples: Vec<Elevation>) -> Self {
        Self {
            width,
            height,
            samples,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> &[Elevation] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [Elevation] {
        &mut self.samples
    }

    fn index(&self, col: u32, row: u32) -> Option<usize> {
        if col < self.width && row < self.height {
            Some(row as usize * self.width as usize + col as usize)
        } else {
            None
        }
    }

    /// Sample at column/row; out-of-range reads are no data
    pub fn get(&self, col: u32, row: u32) -> Elevation {
        self.index(col, row)
            .and_then(|i| self.samples.get(i).copied())
            .unwrap_or(Elevation::NoData)
    }

    pub fn set(&mut self, col: u32, row: u32, value: Elevation) {
        if let Some(slot) = self.index(col, row).and_then(|i| self.samples.get_mut(i)) {
            *slot = value;
        }
    }

    pub fn set_height(&mut self, col: u32, row: u32, value: f32) {
        self.set(col, row, Elevation::from_raw(value));
    }

    /// Add relief to a sample; a no-data sample is treated as sea level.
    pub fn add_offset(&mut self, col: u32, row: u32, offset: f32) {
        let base = self.get(col, row).value().unwrap_or(0.0);
        self.set(col, row, Elevation::from_raw(base + offset));
    }

    /// Copy every sample from a grid of identical dimensions
    pub fn copy_from(&mut self, other: &HeightGrid) -> ElevationResult<()> {
        if other.width != self.width || other.height != self.height {
            return Err(ElevationError::invalid_grid(format!(
                "cannot copy {}x{} into {}x{}",
                other.width, other.height, self.width, self.height
            )));
        }
        self.samples.clone_from(&other.samples);
        Ok(())
    }

    /// Basic sanity check: dimensions within [2, 1024] and sample count matches.
    pub fn validate(&self) -> ElevationResult<()> {
        if self.height < MIN_GRID_DIM || self.height > MAX_GRID_DIM {
            return Err(ElevationError::invalid_grid(format!("row count = {}", self.height)));
        }
        if self.width < MIN_GRID_DIM || self.width > MAX_GRID_DIM {
            return Err(ElevationError::invalid_grid(format!("col count = {}", self.width)));
        }
        let expected = self.width as usize * self.height as usize;
        if self.samples.len() != expected {
            return Err(ElevationError::invalid_grid(format!(
                "mismatched data size: {} samples for {}x{}",
                self.samples.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    pub fn to_raw(&self) -> Vec<f32> {
        self.samples.iter().map(|e| e.to_raw()).collect()
    }

    pub fn valid_count(&self) -> usize {
        self.samples.iter().filter(|e| e.is_valid()).count()
    }

    pub fn is_all_no_data(&self) -> bool {
        self.valid_count() == 0
    }

    /// Host memory held by the samples, for cache budgeting
    pub fn memory_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<Elevation>()
    }

    /// Read at fractional column/row coordinates.
    ///
    /// Bilinear reads fall back to the nearest sample when any of the four
    /// surrounding samples is no data.
    pub fn sample(&self, u: f64, v: f64, interpolation: RasterInterpolation) -> Elevation {
        if self.width == 0 || self.height == 0 {
            return Elevation::NoData;
        }
        let max_u = (self.width - 1) as f64;
        let max_v = (self.height - 1) as f64;
        let u = u.clamp(0.0, max_u);
        let v = v.clamp(0.0, max_v);

        let nearest = || self.get(u.round() as u32, v.round() as u32);
        if interpolation == RasterInterpolation::Nearest {
            return nearest();
        }

        let c0 = u.floor() as u32;
        let r0 = v.floor() as u32;
        let c1 = (c0 + 1).min(self.width - 1);
        let r1 = (r0 + 1).min(self.height - 1);
        let fu = (u - c0 as f64) as f32;
        let fv = (v - r0 as f64) as f32;

        match (
            self.get(c0, r0).value(),
            self.get(c1, r0).value(),
            self.get(c0, r1).value(),
            self.get(c1, r1).value(),
        ) {
            (Some(sw), Some(se), Some(nw), Some(ne)) => {
                let s = sw + (se - sw) * fu;
                let n = nw + (ne - nw) * fu;
                Elevation::from_raw(s + (n - s) * fv)
            }
            _ => nearest(),
        }
    }
}

/// A height grid placed on the ground, optionally with precomputed normals
#[derive(Debug, Clone)]
pub struct GeoHeightGrid {
    grid: Arc<HeightGrid>,
    normals: Option<Arc<NormalGrid>>,
    extent: GeoExtent,
}

impl GeoHeightGrid {
    pub fn new(grid: Arc<HeightGrid>, extent: GeoExtent) -> Self {
        Self {
            grid,
            normals: None,
            extent,
        }
    }

    pub fn with_normals(mut self, normals: Arc<NormalGrid>) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn grid(&self) -> &Arc<HeightGrid> {
        &self.grid
    }

    pub fn normals(&self) -> Option<&Arc<NormalGrid>> {
        self.normals.as_ref()
    }

    pub fn extent(&self) -> &GeoExtent {
        &self.extent
    }

    /// Ground distance between adjacent columns, in SRS units
    pub fn x_resolution(&self) -> f64 {
        self.extent.width() / (self.grid.width().max(2) - 1) as f64
    }

    pub fn y_resolution(&self) -> f64 {
        self.extent.height() / (self.grid.height().max(2) - 1) as f64
    }

    /// Map a point in `srs` to fractional column/row, None when outside the extent
    fn locate(&self, srs: &Srs, x: f64, y: f64) -> Option<(f64, f64)> {
        let (lx, ly) = srs.transform_point(x, y, self.extent.srs())?;
        if !self.extent.contains(lx, ly) {
            return None;
        }
        let u = (lx - self.extent.x_min()) / self.x_resolution();
        let v = (ly - self.extent.y_min()) / self.y_resolution();
        Some((u, v))
    }

    /// Elevation at a point given in `srs`; None when outside or no data
    pub fn elevation(&self, srs: &Srs, x: f64, y: f64, interpolation: RasterInterpolation) -> Option<f32> {
        let (u, v) = self.locate(srs, x, y)?;
        self.grid.sample(u, v, interpolation).value()
    }

    /// Elevation plus the unit surface normal at the nearest texel
    pub fn elevation_and_normal(
        &self,
        srs: &Srs,
        x: f64,
        y: f64,
        interpolation: RasterInterpolation,
    ) -> Option<(f32, Vec3)> {
        let (u, v) = self.locate(srs, x, y)?;
        let elevation = self.grid.sample(u, v, interpolation).value()?;
        let col = (u.round() as u32).min(self.grid.width().saturating_sub(1));
        let row = (v.round() as u32).min(self.grid.height().saturating_sub(1));
        let normal = match &self.normals {
            Some(normals) => normals.get(col, row),
            None => surface_normal(&self.extent, &self.grid, col, row)
                .normalize_or_zero()
                .as_vec3(),
        };
        Some((elevation, normal))
    }
}
