//! Elevation tile compositing and caching for quadtree terrain paging.
//!
//! An [`ElevationLayer`] wraps one [`ElevationSource`] with a memory tier, an
//! optional persistent tier and per-key request coalescing. An
//! [`ElevationLayerSet`] stacks layers by priority and composites them,
//! with additive offset layers and ancestor fallback, into one height grid
//! and an optional normal map per tile key.

pub mod cache;
pub mod config;
pub mod error;
pub mod geo;
pub mod terrain;

pub use cache::{CacheBin, CachePolicy, CacheRecord, CacheUsage, DiskCacheBin, MemoryCacheBin};
pub use config::{ElevationLayerOptions, NoDataPolicy};
pub use error::{ElevationError, ElevationResult};
pub use geo::{ConstantOffsetDatum, GeoExtent, Srs, VerticalDatum, VerticalDatumRegistry};
pub use terrain::{
    CancelToken, CompositeOptions, Elevation, ElevationLayer, ElevationLayerSet, ElevationSource,
    GeoHeightGrid, HeightGrid, MemorySource, NormalGrid, Profile, RasterInterpolation,
    SyntheticSource, TileKey, NO_DATA_VALUE,
};
