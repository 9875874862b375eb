// src/terrain/mod.rs
// Elevation layers, tiling and multi-layer compositing
// RELEVANT FILES: src/terrain/layer.rs, src/terrain/compositor.rs, src/terrain/tiling.rs

pub mod assemble;
pub mod cancel;
pub mod compositor;
pub mod grid;
pub mod inflight;
pub mod layer;
pub mod normalize;
pub mod normals;
pub mod source;
pub mod tiling;

// Re-export main types and functions
pub use assemble::assemble_height_grid;
pub use cancel::CancelToken;
pub use compositor::{CompositeOptions, ElevationLayerSet, MAX_FETCHED_GRIDS};
pub use grid::{Elevation, GeoHeightGrid, HeightGrid, RasterInterpolation, NO_DATA_VALUE};
pub use inflight::InFlightTable;
pub use layer::ElevationLayer;
pub use normalize::{normalize_no_data, resolve_invalid_heights, transform_vertical};
pub use normals::{build_normal_map, surface_normal, NormalGrid};
pub use source::{ElevationSource, MemorySource, SyntheticSource};
pub use tiling::{Profile, TileKey};
