// src/geo/extent.rs
// Georeferenced bounding rectangles
// RELEVANT FILES: src/geo/srs.rs, src/terrain/tiling.rs

use std::sync::Arc;

use super::srs::{Srs, SrsKind};
use crate::error::{ElevationError, ElevationResult};

/// Number of samples per edge used when transforming an extent between systems
const EDGE_SAMPLES: usize = 8;

/// Spatial bounds in a given reference system
#[derive(Debug, Clone, PartialEq)]
pub struct GeoExtent {
    srs: Arc<Srs>,
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

impl GeoExtent {
    pub fn new(srs: Arc<Srs>, xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> ElevationResult<Self> {
        if !(xmin < xmax && ymin < ymax) {
            return Err(ElevationError::InvalidExtent(format!(
                "[{}, {}] x [{}, {}]",
                xmin, xmax, ymin, ymax
            )));
        }
        Ok(Self {
            srs,
            xmin,
            ymin,
            xmax,
            ymax,
        })
    }

    /// Bounds already known to be ordered
    pub(crate) fn from_parts(srs: Arc<Srs>, xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            srs,
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn srs(&self) -> &Arc<Srs> {
        &self.srs
    }

    pub fn x_min(&self) -> f64 {
        self.xmin
    }

    pub fn y_min(&self) -> f64 {
        self.ymin
    }

    pub fn x_max(&self) -> f64 {
        self.xmax
    }

    pub fn y_max(&self) -> f64 {
        self.ymax
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.xmin + self.xmax) * 0.5,
            (self.ymin + self.ymax) * 0.5,
        )
    }

    /// Test if point is inside bounds, edges included
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let eps_x = self.width() * 1e-9;
        let eps_y = self.height() * 1e-9;
        x >= self.xmin - eps_x
            && x <= self.xmax + eps_x
            && y >= self.ymin - eps_y
            && y <= self.ymax + eps_y
    }

    /// Test if the interiors of two extents in the same system overlap
    pub fn intersects(&self, other: &GeoExtent) -> bool {
        self.xmin < other.xmax
            && self.xmax > other.xmin
            && self.ymin < other.ymax
            && self.ymax > other.ymin
    }

    /// Overlapping region of two extents in the same system
    pub fn intersection(&self, other: &GeoExtent) -> Option<GeoExtent> {
        if !self.intersects(other) {
            return None;
        }
        GeoExtent::new(
            self.srs.clone(),
            self.xmin.max(other.xmin),
            self.ymin.max(other.ymin),
            self.xmax.min(other.xmax),
            self.ymax.min(other.ymax),
        )
        .ok()
    }

    /// Transform this extent into `to` by sampling its edges.
    pub fn transform(&self, to: &Arc<Srs>) -> Option<GeoExtent> {
        if self.srs.is_horiz_equivalent_to(to) {
            return Some(GeoExtent {
                srs: to.clone(),
                ..self.clone()
            });
        }

        let mut bounds = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
        for i in 0..=EDGE_SAMPLES {
            let f = i as f64 / EDGE_SAMPLES as f64;
            let x = self.xmin + f * self.width();
            let y = self.ymin + f * self.height();
            for (px, py) in [
                (x, self.ymin),
                (x, self.ymax),
                (self.xmin, y),
                (self.xmax, y),
            ] {
                let (tx, ty) = self.srs.transform_point_clamped(px, py, to)?;
                bounds.0 = bounds.0.min(tx);
                bounds.1 = bounds.1.min(ty);
                bounds.2 = bounds.2.max(tx);
                bounds.3 = bounds.3.max(ty);
            }
        }

        // latitudes beyond the mercator limit were pinned to it above
        if to.kind() == SrsKind::Geographic {
            bounds.1 = bounds.1.max(-90.0);
            bounds.3 = bounds.3.min(90.0);
        }

        GeoExtent::new(to.clone(), bounds.0, bounds.1, bounds.2, bounds.3).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wgs84() -> Arc<Srs> {
        Arc::new(Srs::wgs84())
    }

    #[test]
    fn test_extent_requires_ordered_bounds() {
        assert!(GeoExtent::new(wgs84(), 0.0, 0.0, 10.0, 10.0).is_ok());
        assert!(GeoExtent::new(wgs84(), 10.0, 0.0, 0.0, 10.0).is_err());
        assert!(GeoExtent::new(wgs84(), 0.0, 5.0, 10.0, 5.0).is_err());
    }

    #[test]
    fn test_extent_bounds() {
        let e = GeoExtent::new(wgs84(), 0.0, 0.0, 10.0, 20.0).unwrap();
        assert_eq!(e.center(), (5.0, 10.0));
        assert_eq!(e.width(), 10.0);
        assert_eq!(e.height(), 20.0);
        assert!(e.contains(10.0, 20.0));
        assert!(!e.contains(10.5, 20.0));
    }

    #[test]
    fn test_edge_touching_extents_do_not_intersect() {
        let a = GeoExtent::new(wgs84(), 0.0, 0.0, 10.0, 10.0).unwrap();
        let b = GeoExtent::new(wgs84(), 10.0, 0.0, 20.0, 10.0).unwrap();
        let c = GeoExtent::new(wgs84(), 5.0, 5.0, 15.0, 15.0).unwrap();
        assert!(!a.intersects(&b));
        let i = a.intersection(&c).unwrap();
        assert_eq!((i.x_min(), i.y_min(), i.x_max(), i.y_max()), (5.0, 5.0, 10.0, 10.0));
    }

    #[test]
    fn test_transform_to_mercator_and_back() {
        let merc = Arc::new(Srs::spherical_mercator());
        let e = GeoExtent::new(wgs84(), -10.0, -10.0, 10.0, 10.0).unwrap();
        let m = e.transform(&merc).unwrap();
        assert!(m.x_min() < 0.0 && m.x_max() > 0.0);
        let back = m.transform(&wgs84()).unwrap();
        assert!((back.x_min() + 10.0).abs() < 1e-6);
        assert!((back.y_max() - 10.0).abs() < 1e-6);
    }
}
