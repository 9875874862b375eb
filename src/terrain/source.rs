// src/terrain/source.rs
// Elevation data sources: the pluggable boundary the compositor reads tiles through
// RELEVANT FILES: src/terrain/layer.rs, src/terrain/tiling.rs, src/terrain/grid.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{ElevationError, ElevationResult};
use crate::terrain::cancel::CancelToken;
use crate::terrain::grid::{Elevation, HeightGrid};
use crate::terrain::tiling::{Profile, TileKey};

/// Default edge length of a source tile, in samples
pub const DEFAULT_TILE_SIZE: u32 = 257;

/// Anything that can hand out height grids by tile key.
pub trait ElevationSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Native tiling profile; `None` until the source has been opened successfully
    fn profile(&self) -> Option<Arc<Profile>>;

    fn tile_size(&self) -> u32 {
        DEFAULT_TILE_SIZE
    }

    /// Best key at or above `key` that this source can actually serve
    fn best_available_key(&self, key: &TileKey) -> Option<TileKey> {
        if self.may_have_data(key) {
            Some(key.clone())
        } else {
            None
        }
    }

    fn may_have_data(&self, _key: &TileKey) -> bool {
        true
    }

    fn is_key_in_legal_range(&self, _key: &TileKey) -> bool {
        true
    }

    /// Produce the grid for exactly `key`. Blocking.
    fn fetch(&self, key: &TileKey, cancel: &CancelToken) -> ElevationResult<HeightGrid>;

    fn supports_writing(&self) -> bool {
        false
    }

    fn write(&self, _key: &TileKey, _grid: &HeightGrid) -> ElevationResult<()> {
        Err(ElevationError::ServiceUnavailable)
    }
}

/// Source backed by a map of explicitly inserted tiles.
///
/// Useful for tests and for small preloaded datasets. Lookups for a key that
/// was never inserted fail, and `best_available_key` walks up to the nearest
/// stored ancestor.
pub struct MemorySource {
    name: String,
    profile: Arc<Profile>,
    tile_size: u32,
    tiles: RwLock<HashMap<TileKey, Arc<HeightGrid>>>,
    latency: Option<Duration>,
    writable: bool,
    online: AtomicBool,
    fetches: AtomicUsize,
}

impl fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySource")
            .field("name", &self.name)
            .field("tile_size", &self.tile_size)
            .field("tiles", &self.tiles.read().map(|t| t.len()).unwrap_or(0))
            .finish()
    }
}

impl MemorySource {
    pub fn new(name: impl Into<String>, profile: Arc<Profile>, tile_size: u32) -> Self {
        Self {
            name: name.into(),
            profile,
            tile_size,
            tiles: RwLock::new(HashMap::new()),
            latency: None,
            writable: false,
            online: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Sleep this long inside every fetch, to imitate a remote service
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn insert(&self, key: TileKey, grid: HeightGrid) {
        if let Ok(mut tiles) = self.tiles.write() {
            tiles.insert(key, Arc::new(grid));
        }
    }

    /// Store the same constant-valued tile for `key`
    pub fn insert_constant(&self, key: TileKey, value: f32) {
        let size = self.tile_size;
        self.insert(key, HeightGrid::filled(size, size, value));
    }

    pub fn remove(&self, key: &TileKey) -> bool {
        self.tiles
            .write()
            .map(|mut tiles| tiles.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Simulate the backing service going away (fetches fail) or returning
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Number of fetch calls served or attempted
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }

    fn contains(&self, key: &TileKey) -> bool {
        self.tiles.read().map(|t| t.contains_key(key)).unwrap_or(false)
    }
}

impl ElevationSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> Option<Arc<Profile>> {
        Some(self.profile.clone())
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn best_available_key(&self, key: &TileKey) -> Option<TileKey> {
        let mut current = Some(key.clone());
        while let Some(k) = current {
            if self.contains(&k) {
                return Some(k);
            }
            current = k.parent();
        }
        None
    }

    fn may_have_data(&self, key: &TileKey) -> bool {
        self.tiles
            .read()
            .map(|tiles| {
                tiles
                    .keys()
                    .any(|k| k == key || k.is_descendant_of(key))
            })
            .unwrap_or(false)
    }

    fn fetch(&self, key: &TileKey, cancel: &CancelToken) -> ElevationResult<HeightGrid> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        cancel.check()?;
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
            cancel.check()?;
        }
        if !self.online.load(Ordering::Acquire) {
            return Err(ElevationError::unavailable(format!("{} is offline", self.name)));
        }
        let tiles = self
            .tiles
            .read()
            .map_err(|_| ElevationError::unavailable("tile table poisoned"))?;
        tiles
            .get(key)
            .map(|grid| grid.as_ref().clone())
            .ok_or_else(|| ElevationError::unavailable(format!("{}: no tile {}", self.name, key)))
    }

    fn supports_writing(&self) -> bool {
        self.writable
    }

    fn write(&self, key: &TileKey, grid: &HeightGrid) -> ElevationResult<()> {
        if !self.writable {
            return Err(ElevationError::ServiceUnavailable);
        }
        grid.validate()?;
        self.insert(key.clone(), grid.clone());
        Ok(())
    }
}

type HeightFn = dyn Fn(f64, f64) -> Option<f32> + Send + Sync;

/// Source that evaluates a height function at every sample location.
///
/// Coordinates passed to the function are in the profile's SRS. Returning
/// `None` marks a sample as no data.
pub struct SyntheticSource {
    name: String,
    profile: Arc<Profile>,
    tile_size: u32,
    max_level: u32,
    height_fn: Arc<HeightFn>,
    fetches: AtomicUsize,
}

impl fmt::Debug for SyntheticSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticSource")
            .field("name", &self.name)
            .field("tile_size", &self.tile_size)
            .field("max_level", &self.max_level)
            .finish()
    }
}

impl SyntheticSource {
    pub fn new<F>(name: impl Into<String>, profile: Arc<Profile>, tile_size: u32, height_fn: F) -> Self
    where
        F: Fn(f64, f64) -> Option<f32> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            profile,
            tile_size,
            max_level: crate::terrain::tiling::MAX_LOD,
            height_fn: Arc::new(height_fn),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Rolling sine/cosine hills
    pub fn waves(name: impl Into<String>, profile: Arc<Profile>, tile_size: u32) -> Self {
        Self::new(name, profile, tile_size, |x, y| {
            Some(((x * 0.1).sin() * 10.0 + (y * 0.1).cos() * 10.0) as f32)
        })
    }

    /// Same value everywhere
    pub fn constant(name: impl Into<String>, profile: Arc<Profile>, tile_size: u32, value: f32) -> Self {
        Self::new(name, profile, tile_size, move |_, _| Some(value))
    }

    /// Deepest level with native data; deeper requests resolve to ancestors
    pub fn with_max_level(mut self, max_level: u32) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Acquire)
    }
}

impl ElevationSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn profile(&self) -> Option<Arc<Profile>> {
        Some(self.profile.clone())
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }

    fn best_available_key(&self, key: &TileKey) -> Option<TileKey> {
        if key.lod() <= self.max_level {
            Some(key.clone())
        } else {
            key.ancestor(self.max_level)
        }
    }

    fn may_have_data(&self, key: &TileKey) -> bool {
        key.lod() <= self.max_level
    }

    fn is_key_in_legal_range(&self, key: &TileKey) -> bool {
        key.lod() <= self.max_level
    }

    fn fetch(&self, key: &TileKey, cancel: &CancelToken) -> ElevationResult<HeightGrid> {
        self.fetches.fetch_add(1, Ordering::AcqRel);
        cancel.check()?;
        if key.lod() > self.max_level {
            return Err(ElevationError::unavailable(format!(
                "{}: level {} beyond max level {}",
                self.name,
                key.lod(),
                self.max_level
            )));
        }

        let size = self.tile_size.max(2);
        let extent = key.extent();
        let dx = extent.width() / (size - 1) as f64;
        let dy = extent.height() / (size - 1) as f64;
        let mut grid = HeightGrid::new(size, size);
        for r in 0..size {
            let y = extent.y_min() + dy * r as f64;
            for c in 0..size {
                let x = extent.x_min() + dx * c as f64;
                grid.set(c, r, Elevation::from((self.height_fn)(x, y)));
            }
        }
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_walks_to_stored_ancestor() {
        let profile = Profile::global_geodetic();
        let source = MemorySource::new("mem", profile.clone(), 17);
        let root = TileKey::new(1, 0, 0, profile.clone()).unwrap();
        source.insert_constant(root.clone(), 5.0);

        let deep = TileKey::new(4, 3, 2, profile.clone()).unwrap();
        assert_eq!(source.best_available_key(&deep), Some(root.clone()));
        // only the stored tile and its ancestors hold data
        assert!(!source.may_have_data(&deep));
        assert!(source.may_have_data(&root.parent().unwrap()));

        let elsewhere = TileKey::new(4, 20, 2, profile).unwrap();
        assert_eq!(source.best_available_key(&elsewhere), None);
        assert!(!source.may_have_data(&elsewhere));
    }

    #[test]
    fn test_memory_source_fetch() {
        let profile = Profile::global_geodetic();
        let source = MemorySource::new("mem", profile.clone(), 5);
        let key = TileKey::new(0, 0, 0, profile.clone()).unwrap();
        source.insert_constant(key.clone(), 12.0);

        let cancel = CancelToken::new();
        let grid = source.fetch(&key, &cancel).unwrap();
        assert_eq!(grid.get(2, 2), Elevation::Valid(12.0));

        let missing = TileKey::new(0, 1, 0, profile).unwrap();
        assert!(matches!(
            source.fetch(&missing, &cancel),
            Err(ElevationError::SourceUnavailable(_))
        ));

        source.set_online(false);
        assert!(source.fetch(&key, &cancel).is_err());
        assert_eq!(source.fetch_count(), 3);
    }

    #[test]
    fn test_fetch_honours_cancellation() {
        let profile = Profile::global_geodetic();
        let source = MemorySource::new("mem", profile.clone(), 5);
        let key = TileKey::new(0, 0, 0, profile).unwrap();
        source.insert_constant(key.clone(), 1.0);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(source.fetch(&key, &cancel).unwrap_err().is_canceled());
    }

    #[test]
    fn test_memory_source_write() {
        let profile = Profile::global_geodetic();
        let key = TileKey::new(0, 0, 0, profile.clone()).unwrap();
        let grid = HeightGrid::filled(3, 3, 1.0);

        let read_only = MemorySource::new("ro", profile.clone(), 3);
        assert!(matches!(
            read_only.write(&key, &grid),
            Err(ElevationError::ServiceUnavailable)
        ));

        let writable = MemorySource::new("rw", profile, 3).writable();
        writable.write(&key, &grid).unwrap();
        assert!(writable.fetch(&key, &CancelToken::new()).is_ok());
    }

    #[test]
    fn test_synthetic_source_clamps_to_max_level() {
        let profile = Profile::global_geodetic();
        let source = SyntheticSource::waves("waves", profile.clone(), 9).with_max_level(2);
        let deep = TileKey::new(5, 9, 3, profile).unwrap();
        let best = source.best_available_key(&deep).unwrap();
        assert_eq!(best.lod(), 2);
        assert!(!source.is_key_in_legal_range(&deep));

        let cancel = CancelToken::new();
        assert!(source.fetch(&deep, &cancel).is_err());
        let grid = source.fetch(&best, &cancel).unwrap();
        assert_eq!(grid.width(), 9);
        assert_eq!(grid.valid_count(), 81);
    }
}
