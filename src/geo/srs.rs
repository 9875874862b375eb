// src/geo/srs.rs
// Horizontal spatial reference systems and the point transforms between them
// RELEVANT FILES: src/geo/extent.rs, src/terrain/tiling.rs

use std::f64::consts::PI;

use crate::error::{ElevationError, ElevationResult};

/// Latitude limit of the spherical mercator projection, in degrees
pub const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_59;

/// Reference ellipsoid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub radius_equator: f64,
    pub radius_polar: f64,
}

impl Ellipsoid {
    pub const WGS84: Ellipsoid = Ellipsoid {
        radius_equator: 6_378_137.0,
        radius_polar: 6_356_752.314_245,
    };

    /// Meters spanned by one degree of arc along the equator
    pub fn meters_per_degree_at_equator(&self) -> f64 {
        (2.0 * PI * self.radius_equator) / 360.0
    }
}

impl Default for Ellipsoid {
    fn default() -> Self {
        Ellipsoid::WGS84
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrsKind {
    /// Longitude/latitude in degrees
    Geographic,
    /// Web/spherical mercator in meters
    SphericalMercator,
    /// Any other projected system; only transforms to itself
    Projected,
}

/// Horizontal spatial reference system.
#[derive(Debug, Clone, PartialEq)]
pub struct Srs {
    name: String,
    kind: SrsKind,
    ellipsoid: Ellipsoid,
}

impl Srs {
    pub fn wgs84() -> Self {
        Self {
            name: "EPSG:4326".to_string(),
            kind: SrsKind::Geographic,
            ellipsoid: Ellipsoid::WGS84,
        }
    }

    pub fn spherical_mercator() -> Self {
        Self {
            name: "EPSG:3857".to_string(),
            kind: SrsKind::SphericalMercator,
            ellipsoid: Ellipsoid::WGS84,
        }
    }

    pub fn projected(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SrsKind::Projected,
            ellipsoid: Ellipsoid::WGS84,
        }
    }

    /// Parse an init string such as "EPSG:4326", "wgs84" or "spherical-mercator".
    pub fn from_init_string(init: &str) -> ElevationResult<Self> {
        let trimmed = init.trim();
        if trimmed.is_empty() {
            return Err(ElevationError::config("empty SRS init string"));
        }
        let lower = trimmed.to_lowercase();
        match lower.as_str() {
            "wgs84" | "global-geodetic" => return Ok(Srs::wgs84()),
            "spherical-mercator" | "web-mercator" => return Ok(Srs::spherical_mercator()),
            _ => {}
        }
        match parse_epsg_code(trimmed) {
            Some(4326) => Ok(Srs::wgs84()),
            Some(3857) | Some(900913) | Some(3785) => Ok(Srs::spherical_mercator()),
            Some(code) => Ok(Srs::projected(format!("EPSG:{}", code))),
            None => Ok(Srs::projected(trimmed)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SrsKind {
        self.kind
    }

    pub fn ellipsoid(&self) -> &Ellipsoid {
        &self.ellipsoid
    }

    pub fn is_geographic(&self) -> bool {
        self.kind == SrsKind::Geographic
    }

    /// Two systems are horizontally equivalent when points need no transform between them.
    pub fn is_horiz_equivalent_to(&self, other: &Srs) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            SrsKind::Projected => self.name.eq_ignore_ascii_case(&other.name),
            _ => self.ellipsoid == other.ellipsoid,
        }
    }

    /// Transform a point into `to`. Returns None when no transform exists or
    /// the point lies outside the area `to` can represent (for mercator,
    /// latitudes beyond `MERCATOR_MAX_LAT`).
    pub fn transform_point(&self, x: f64, y: f64, to: &Srs) -> Option<(f64, f64)> {
        if self.kind == SrsKind::Geographic
            && to.kind == SrsKind::SphericalMercator
            && y.abs() > MERCATOR_MAX_LAT
        {
            return None;
        }
        self.transform_point_clamped(x, y, to)
    }

    /// Like `transform_point`, but pins latitudes beyond the mercator limit
    /// to the limit. Used when bounding extents.
    pub fn transform_point_clamped(&self, x: f64, y: f64, to: &Srs) -> Option<(f64, f64)> {
        if self.is_horiz_equivalent_to(to) {
            return Some((x, y));
        }
        let r = self.ellipsoid.radius_equator;
        match (self.kind, to.kind) {
            (SrsKind::Geographic, SrsKind::SphericalMercator) => {
                let lat = y.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT).to_radians();
                let mx = r * x.to_radians();
                let my = r * (PI / 4.0 + lat / 2.0).tan().ln();
                Some((mx, my))
            }
            (SrsKind::SphericalMercator, SrsKind::Geographic) => {
                let lon = (x / r).to_degrees();
                let lat = (2.0 * (y / r).exp().atan() - PI / 2.0).to_degrees();
                Some((lon, lat))
            }
            _ => None,
        }
    }

    /// Convert a horizontal distance in this system's units to meters at latitude `lat_deg`.
    pub fn units_to_meters(&self, units: f64, lat_deg: f64) -> f64 {
        match self.kind {
            SrsKind::Geographic => {
                units * self.ellipsoid.meters_per_degree_at_equator() * lat_deg.to_radians().cos()
            }
            _ => units,
        }
    }
}

/// Get the EPSG code from a CRS string if it's in EPSG format.
pub fn parse_epsg_code(crs: &str) -> Option<u32> {
    let crs_upper = crs.to_uppercase();
    if crs_upper.starts_with("EPSG:") {
        crs_upper[5..].trim().parse::<u32>().ok()
    } else {
        None
    }
}
