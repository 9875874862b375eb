//! Surface normal maps derived from height grids
//!
//! Normals come from central differences over metric ground steps. When a
//! sample was drawn from a coarser level (a fallback), its normal is blended
//! from normals at the coarser anchor texels instead, which avoids faceting
//! along fallback boundaries.

use glam::{DVec3, Vec3};

use crate::error::{ElevationError, ElevationResult};
use crate::geo::GeoExtent;
use crate::terrain::grid::HeightGrid;

/// Largest resolution delta honoured when choosing anchor spacing
const MAX_DELTA_LOD: u16 = 15;

/// Per-texel unit normals plus an ambient term, same layout as a HeightGrid
#[derive(Debug, Clone, PartialEq)]
pub struct NormalGrid {
    width: u32,
    height: u32,
    normals: Vec<Vec3>,
    ambient: Vec<f32>,
}

impl NormalGrid {
    /// Grid of straight-up normals
    pub fn new(width: u32, height: u32) -> Self {
        let n = (width as usize) * (height as usize);
        Self {
            width,
            height,
            normals: vec![Vec3::Z; n],
            ambient: vec![0.0; n],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn normals(&self) -> &[Vec3] {
        &self.normals
    }

    fn index(&self, s: u32, t: u32) -> Option<usize> {
        if s < self.width && t < self.height {
            Some(t as usize * self.width as usize + s as usize)
        } else {
            None
        }
    }

    pub fn set(&mut self, s: u32, t: u32, normal: Vec3, ambient: f32) {
        if let Some(i) = self.index(s, t) {
            self.normals[i] = normal;
            self.ambient[i] = ambient;
        }
    }

    pub fn get(&self, s: u32, t: u32) -> Vec3 {
        self.index(s, t).map(|i| self.normals[i]).unwrap_or(Vec3::Z)
    }

    pub fn ambient(&self, s: u32, t: u32) -> f32 {
        self.index(s, t).map(|i| self.ambient[i]).unwrap_or(0.0)
    }

    /// Build a normal grid for `grid` covering `extent`
    pub fn from_heights(
        extent: &GeoExtent,
        grid: &HeightGrid,
        delta_lod: Option<&[u16]>,
    ) -> ElevationResult<Self> {
        let mut out = NormalGrid::new(grid.width(), grid.height());
        build_normal_map(extent, grid, delta_lod, &mut out)?;
        Ok(out)
    }
}

/// Un-normalized surface normal at column `s`, row `t` from central differences.
///
/// Geographic extents have their steps converted to meters; a no-data
/// neighbour is treated like a missing edge neighbour.
pub fn surface_normal(extent: &GeoExtent, grid: &HeightGrid, s: u32, t: u32) -> DVec3 {
    let w = grid.width().max(2);
    let h = grid.height().max(2);

    let res_x = extent.width() / (w - 1) as f64;
    let res_y = extent.height() / (h - 1) as f64;
    let mut dx = res_x;
    let mut dy = res_y;

    let srs = extent.srs();
    if srs.is_geographic() {
        let m_per_deg = srs.ellipsoid().meters_per_degree_at_equator();
        let lat = extent.y_min() + res_y * t as f64;
        dy *= m_per_deg;
        dx *= m_per_deg * lat.to_radians().cos();
    }

    let e = grid.get(s, t).value().unwrap_or(0.0) as f64;
    let height_at = |c: u32, r: u32| grid.get(c, r).value().map(|v| v as f64);

    let mut west = DVec3::new(0.0, 0.0, e);
    let mut east = west;
    let mut south = west;
    let mut north = west;

    if s > 0 {
        if let Some(v) = height_at(s - 1, t) {
            west = DVec3::new(-dx, 0.0, v);
        }
    }
    if s + 1 < grid.width() {
        if let Some(v) = height_at(s + 1, t) {
            east = DVec3::new(dx, 0.0, v);
        }
    }
    if t > 0 {
        if let Some(v) = height_at(s, t - 1) {
            south = DVec3::new(0.0, -dy, v);
        }
    }
    if t + 1 < grid.height() {
        if let Some(v) = height_at(s, t + 1) {
            north = DVec3::new(0.0, dy, v);
        }
    }

    let normal = (east - west).cross(north - south);
    if normal.length_squared() > 0.0 {
        normal
    } else {
        // both axes collapsed (1-wide neighbourhoods or polar cos(lat) == 0)
        DVec3::Z
    }
}

/// Fill `out` with one unit normal per texel of `grid`.
///
/// `delta_lod` holds, per texel, how many levels coarser the source of the
/// elevation was than the grid itself. A delta of `d` places the real
/// samples `2^d` texels apart; normals in between are interpolated from the
/// enclosing anchors (nearest, linear along a row or column, or bilinear).
pub fn build_normal_map(
    extent: &GeoExtent,
    grid: &HeightGrid,
    delta_lod: Option<&[u16]>,
    out: &mut NormalGrid,
) -> ElevationResult<()> {
    if out.width() != grid.width() || out.height() != grid.height() {
        return Err(ElevationError::invalid_grid(format!(
            "normal grid {}x{} does not match height grid {}x{}",
            out.width(),
            out.height(),
            grid.width(),
            grid.height()
        )));
    }

    let w = grid.width();
    let h = grid.height();
    if let Some(delta) = delta_lod {
        if delta.len() != (w as usize) * (h as usize) {
            return Err(ElevationError::invalid_grid(format!(
                "resolution delta has {} entries for {}x{}",
                delta.len(),
                w,
                h
            )));
        }
    }

    let normal_at = |s: u32, t: u32| surface_normal(extent, grid, s, t);

    for t in 0..h {
        for s in 0..w {
            let d = delta_lod
                .map(|d| d[(t * w + s) as usize].min(MAX_DELTA_LOD))
                .unwrap_or(0);
            let step = 1u32 << d;

            let normal = if step == 1 {
                normal_at(s, t)
            } else {
                let s0 = s - (s % step);
                let s1 = if s % step == 0 { s0 } else { (s0 + step).min(w - 1) };
                let t0 = t - (t % step);
                let t1 = if t % step == 0 { t0 } else { (t0 + step).min(h - 1) };

                let fs = |v: u32| v as f64;
                if s0 == s1 && t0 == t1 {
                    normal_at(s0, t0)
                } else if s0 == s1 {
                    let south = normal_at(s0, t0).normalize_or_zero();
                    let north = normal_at(s0, t1).normalize_or_zero();
                    south * (fs(t1) - fs(t)) + north * (fs(t) - fs(t0))
                } else if t0 == t1 {
                    let west = normal_at(s0, t0).normalize_or_zero();
                    let east = normal_at(s1, t0).normalize_or_zero();
                    west * (fs(s1) - fs(s)) + east * (fs(s) - fs(s0))
                } else {
                    let sw = normal_at(s0, t0).normalize_or_zero();
                    let se = normal_at(s1, t0).normalize_or_zero();
                    let nw = normal_at(s0, t1).normalize_or_zero();
                    let ne = normal_at(s1, t1).normalize_or_zero();
                    let south = sw * (fs(s1) - fs(s)) + se * (fs(s) - fs(s0));
                    let north = nw * (fs(s1) - fs(s)) + ne * (fs(s) - fs(s0));
                    south * (fs(t1) - fs(t)) + north * (fs(t) - fs(t0))
                }
            };

            let unit = normal.try_normalize().unwrap_or(DVec3::Z);
            out.set(s, t, unit.as_vec3(), 0.0);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Srs;
    use std::sync::Arc;

    fn projected_extent(size: f64) -> GeoExtent {
        GeoExtent::new(Arc::new(Srs::projected("local")), 0.0, 0.0, size, size).unwrap()
    }

    fn ramp(w: u32, h: u32, slope: f32) -> HeightGrid {
        let mut g = HeightGrid::new(w, h);
        for r in 0..h {
            for c in 0..w {
                g.set_height(c, r, c as f32 * slope);
            }
        }
        g
    }

    #[test]
    fn test_flat_grid_points_up() {
        let grid = HeightGrid::filled(5, 5, 100.0);
        let normals = NormalGrid::from_heights(&projected_extent(4.0), &grid, None).unwrap();
        for n in normals.normals() {
            assert!((*n - Vec3::Z).length() < 1e-6);
        }
    }

    #[test]
    fn test_ramp_tilts_against_slope() {
        // 1 unit per 1 unit step: 45 degrees
        let grid = ramp(5, 5, 1.0);
        let normals = NormalGrid::from_heights(&projected_extent(4.0), &grid, None).unwrap();
        let n = normals.get(2, 2);
        assert!((n.x + std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
        assert!(n.y.abs() < 1e-6);
        assert!((n.z - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_geographic_steps_are_metric() {
        // one degree spacing at the equator; 1000m rise per column
        let srs = Arc::new(Srs::wgs84());
        let extent = GeoExtent::new(srs, 0.0, -2.0, 4.0, 2.0).unwrap();
        let grid = ramp(5, 5, 1000.0);
        let normal = surface_normal(&extent, &grid, 2, 2).normalize();
        let m_per_deg = crate::geo::Ellipsoid::WGS84.meters_per_degree_at_equator();
        let expected_slope = 1000.0 / m_per_deg;
        assert!(((-normal.x / normal.z) - expected_slope).abs() < 1e-6);
    }

    #[test]
    fn test_fallback_texels_interpolate_between_anchors() {
        let grid = ramp(9, 9, 0.5);
        let delta = vec![1u16; 81];
        let extent = projected_extent(8.0);
        let normals = NormalGrid::from_heights(&extent, &grid, Some(&delta)).unwrap();
        let anchor = surface_normal(&extent, &grid, 2, 2).normalize().as_vec3();
        // texel (3, 2) sits between anchors (2, 2) and (4, 2) on a uniform ramp
        assert!((normals.get(3, 2) - anchor).length() < 1e-5);
        for n in normals.normals() {
            assert!((n.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_no_data_neighbours_do_not_poison_normals() {
        let mut grid = HeightGrid::filled(3, 3, 10.0);
        grid.set(0, 1, crate::terrain::grid::Elevation::NoData);
        let normals = NormalGrid::from_heights(&projected_extent(2.0), &grid, None).unwrap();
        for n in normals.normals() {
            assert!(n.is_finite());
            assert!((n.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mismatched_output_is_rejected() {
        let grid = HeightGrid::filled(3, 3, 1.0);
        let mut out = NormalGrid::new(4, 3);
        assert!(build_normal_map(&projected_extent(2.0), &grid, None, &mut out).is_err());
    }
}
