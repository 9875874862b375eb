// src/geo/mod.rs
// Geographic utilities: reference systems, extents and vertical datums
// RELEVANT FILES: src/geo/srs.rs, src/geo/extent.rs, src/geo/vdatum.rs

pub mod extent;
pub mod srs;
pub mod vdatum;

// Re-export main types and functions
pub use extent::GeoExtent;
pub use srs::{parse_epsg_code, Ellipsoid, Srs, SrsKind};
pub use vdatum::{datums_equivalent, ConstantOffsetDatum, VerticalDatum, VerticalDatumRegistry};
