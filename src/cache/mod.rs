//! Cache tiers for composited height grids.
//!
//! Two tiers sit in front of the sources: an in-process memory tier and a
//! persistent tier. Both implement [`CacheBin`] and synchronize internally,
//! so one bin can be shared by every request thread.

pub mod disk;
pub mod memory;
pub mod policy;

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::ElevationResult;
use crate::terrain::grid::HeightGrid;
use crate::terrain::tiling::TileKey;

pub use disk::{decode_grid, encode_grid, DiskCacheBin};
pub use memory::{MemoryCacheBin, MemoryCacheStats};
pub use policy::{CachePolicy, CacheUsage};

/// Namespace for persisted elevation tiles
pub const ELEVATION_NAMESPACE: &str = "elevation";

/// A cached grid plus the time it was stored
#[derive(Debug, Clone)]
pub struct CacheRecord {
    pub grid: Arc<HeightGrid>,
    pub last_modified: SystemTime,
}

/// One tier of key/grid storage.
pub trait CacheBin: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// `Ok(None)` on a miss
    fn read(&self, key: &str) -> ElevationResult<Option<CacheRecord>>;

    fn write(&self, key: &str, grid: &HeightGrid) -> ElevationResult<()>;
}

/// Memory tier key: the layer revision scopes every entry so that bumping it
/// invalidates the whole tier at once.
pub fn memory_cache_key(revision: u32, key: &TileKey) -> String {
    format!(
        "{}/{}/{}",
        revision,
        key.str(),
        key.profile().horiz_signature()
    )
}

/// Persistent tier key, namespaced under "elevation"
pub fn persistent_cache_key(key: &TileKey) -> String {
    format!(
        "{}/{}-{}",
        ELEVATION_NAMESPACE,
        key.str(),
        key.profile().horiz_signature()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::tiling::Profile;

    #[test]
    fn test_cache_key_formats() {
        let profile = Profile::global_geodetic();
        let key = TileKey::new(5, 10, 6, profile.clone()).unwrap();
        let sig = profile.horiz_signature();
        assert_eq!(memory_cache_key(3, &key), format!("3/5/10/6/{}", sig));
        assert_eq!(persistent_cache_key(&key), format!("elevation/5/10/6-{}", sig));
    }
}
