// src/geo/vdatum.rs
// Vertical datums: reference surfaces elevation values are measured against
// RELEVANT FILES: src/terrain/normalize.rs, src/terrain/tiling.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A vertical reference surface expressed relative to the ellipsoid.
pub trait VerticalDatum: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Height of the datum surface above the ellipsoid at a geographic location (degrees).
    fn geoid_height(&self, lat_deg: f64, lon_deg: f64) -> f64;

    fn msl_to_hae(&self, lat_deg: f64, lon_deg: f64, msl: f64) -> f64 {
        msl + self.geoid_height(lat_deg, lon_deg)
    }

    fn hae_to_msl(&self, lat_deg: f64, lon_deg: f64, hae: f64) -> f64 {
        hae - self.geoid_height(lat_deg, lon_deg)
    }
}

/// Datum whose surface sits at a fixed offset from the ellipsoid everywhere.
#[derive(Debug, Clone)]
pub struct ConstantOffsetDatum {
    name: String,
    offset: f64,
}

impl ConstantOffsetDatum {
    pub fn new(name: impl Into<String>, offset: f64) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

impl VerticalDatum for ConstantOffsetDatum {
    fn name(&self) -> &str {
        &self.name
    }

    fn geoid_height(&self, _lat_deg: f64, _lon_deg: f64) -> f64 {
        self.offset
    }
}

/// Case-insensitive lookup of known vertical datums by init string.
#[derive(Debug, Default, Clone)]
pub struct VerticalDatumRegistry {
    datums: HashMap<String, Arc<dyn VerticalDatum>>,
}

impl VerticalDatumRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, datum: Arc<dyn VerticalDatum>) {
        self.datums.insert(datum.name().to_lowercase(), datum);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VerticalDatum>> {
        self.datums.get(&name.trim().to_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.datums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datums.is_empty()
    }
}

/// Two optional datums are equivalent when both are absent (ellipsoid heights)
/// or when their names match ignoring case.
pub fn datums_equivalent(a: Option<&dyn VerticalDatum>, b: Option<&dyn VerticalDatum>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.name().eq_ignore_ascii_case(b.name()),
        _ => false,
    }
}
