// src/terrain/compositor.rs
// Multi-layer elevation compositing: priority, fallback and additive offsets
// RELEVANT FILES: src/terrain/layer.rs, src/terrain/normals.rs, src/terrain/normalize.rs

use std::sync::Arc;

use log::{debug, trace};

use crate::config::NoDataPolicy;
use crate::error::{ElevationError, ElevationResult};
use crate::terrain::cancel::CancelToken;
use crate::terrain::grid::{GeoHeightGrid, HeightGrid, RasterInterpolation};
use crate::terrain::layer::ElevationLayer;
use crate::terrain::normalize::resolve_invalid_heights;
use crate::terrain::normals::{build_normal_map, NormalGrid};
use crate::terrain::tiling::{Profile, TileKey};

/// Most source grids kept alive during one compositing pass
pub const MAX_FETCHED_GRIDS: usize = 50;

/// Knobs for one compositing call
#[derive(Debug, Clone)]
pub struct CompositeOptions {
    pub interpolation: RasterInterpolation,
    /// Query sources through this profile (same tiling, no vertical datum)
    /// to get heights above the ellipsoid
    pub hae_profile: Option<Arc<Profile>>,
    /// How to fill texels no layer could answer; `None` leaves them no data
    pub no_data_policy: Option<NoDataPolicy>,
}

impl Default for CompositeOptions {
    fn default() -> Self {
        Self {
            interpolation: RasterInterpolation::Bilinear,
            hae_profile: None,
            no_data_policy: Some(NoDataPolicy::Interpolate),
        }
    }
}

/// A layer admitted to one compositing call
struct SourceRecord {
    layer: Arc<ElevationLayer>,
    key: TileKey,
    /// position in the layer set; higher wins
    index: usize,
}

/// A fetched grid and the level of the key that actually produced it
struct FetchedGrid {
    grid: GeoHeightGrid,
    lod: u32,
    fallback: bool,
}

/// Per-call cache of fetched contender grids, emptied wholesale once it
/// reaches its capacity
struct FetchCache {
    slots: Vec<Option<FetchedGrid>>,
    failed: Vec<bool>,
    cached: usize,
    capacity: usize,
}

impl FetchCache {
    fn new(len: usize, capacity: usize) -> Self {
        Self {
            slots: (0..len).map(|_| None).collect(),
            failed: vec![false; len],
            cached: 0,
            capacity,
        }
    }

    fn insert(&mut self, i: usize, fetched: FetchedGrid) {
        self.slots[i] = Some(fetched);
        self.cached += 1;
    }

    fn clear_if_full(&mut self) {
        if self.cached >= self.capacity {
            trace!(target: "elevstack::compositor", "clearing fetch cache of {} grids", self.cached);
            self.slots.iter_mut().for_each(|s| *s = None);
            self.cached = 0;
        }
    }
}

/// Ordered stack of elevation layers; the last layer has the highest priority.
#[derive(Debug, Clone, Default)]
pub struct ElevationLayerSet {
    layers: Vec<Arc<ElevationLayer>>,
}

impl ElevationLayerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_layers(layers: Vec<Arc<ElevationLayer>>) -> Self {
        Self { layers }
    }

    /// Add a layer above every existing one
    pub fn push(&mut self, layer: Arc<ElevationLayer>) {
        self.layers.push(layer);
    }

    pub fn layers(&self) -> &[Arc<ElevationLayer>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Fill `grid` (and `normals`, when given) for `key` from every usable layer.
    ///
    /// Returns `Ok(true)` when at least one sample came from data at the
    /// requested resolution and `Ok(false)` when there was nothing or only
    /// fallback data. Cancellation surfaces as `Err(Canceled)`.
    pub fn populate(
        &self,
        grid: &mut HeightGrid,
        mut normals: Option<&mut NormalGrid>,
        key: &TileKey,
        options: &CompositeOptions,
        cancel: &CancelToken,
    ) -> ElevationResult<bool> {
        grid.validate()?;
        let num_columns = grid.width();
        let num_rows = grid.height();
        if let Some(n) = normals.as_deref() {
            if n.width() != num_columns || n.height() != num_rows {
                return Err(ElevationError::invalid_grid("normal grid does not match target"));
            }
        }

        let key_to_use = match &options.hae_profile {
            Some(hae) => key.with_profile(hae.clone()),
            None => key.clone(),
        };

        let mut contenders: Vec<SourceRecord> = Vec::new();
        let mut offsets: Vec<SourceRecord> = Vec::new();
        let mut num_fallback = 0usize;

        // highest priority is last
        for (index, layer) in self.layers.iter().enumerate().rev() {
            if !(layer.is_enabled() && layer.is_visible()) {
                continue;
            }
            if key.lod() < layer.min_level() {
                continue;
            }

            let mapped = key_to_use.map_resolution(num_columns, layer.tile_size());
            let Some(best) = layer.best_available_key(&mapped) else {
                continue;
            };
            if best != mapped {
                num_fallback += 1;
            }

            let record = SourceRecord {
                layer: layer.clone(),
                key: best,
                index,
            };
            if layer.is_offset() {
                offsets.push(record);
            } else {
                contenders.push(record);
            }
        }

        if contenders.is_empty() && offsets.is_empty() {
            debug!(target: "elevstack::compositor", "{}: no usable layers", key);
            return Ok(false);
        }
        if contenders.len() + offsets.len() == num_fallback {
            debug!(target: "elevstack::compositor", "{}: every layer would be fallback", key);
            return Ok(false);
        }

        let extent = key_to_use.extent();
        let key_srs = extent.srs().clone();
        let xmin = extent.x_min();
        let ymin = extent.y_min();
        let dx = extent.width() / (num_columns - 1) as f64;
        let dy = extent.height() / (num_rows - 1) as f64;

        let mut delta_lod: Option<Vec<u16>> = normals
            .as_ref()
            .map(|_| vec![0u16; (num_columns * num_rows) as usize]);

        let mut real_data = false;
        let mut requires_resample = true;

        // one contender at the target size: take its grid as is
        if contenders.len() == 1 && offsets.is_empty() {
            let only = &contenders[0];
            if let Some(fetched) = only.layer.create_height_field(&only.key, cancel)? {
                if fetched.grid().width() == num_columns && fetched.grid().height() == num_rows {
                    grid.copy_from(fetched.grid())?;
                    requires_resample = false;
                    real_data = true;
                }
            }
        }

        if requires_resample {
            let mut height_grids = FetchCache::new(contenders.len(), MAX_FETCHED_GRIDS);
            let mut offset_grids: Vec<Option<GeoHeightGrid>> = (0..offsets.len()).map(|_| None).collect();
            let mut offset_failed = vec![false; offsets.len()];

            for c in 0..num_columns {
                cancel.check()?;
                let x = xmin + dx * c as f64;

                for r in 0..num_rows {
                    let y = ymin + dy * r as f64;
                    let texel = (r * num_columns + c) as usize;
                    let mut resolved_index: Option<usize> = None;

                    for (i, contender) in contenders.iter().enumerate() {
                        if resolved_index.is_some() {
                            break;
                        }
                        if height_grids.failed[i] {
                            continue;
                        }

                        if height_grids.slots[i].is_none() {
                            match fetch_with_fallback(contender, cancel)? {
                                Some(fetched) => height_grids.insert(i, fetched),
                                None => {
                                    height_grids.failed[i] = true;
                                    continue;
                                }
                            }
                        }

                        if let Some(fetched) = &height_grids.slots[i] {
                            if !fetched.fallback {
                                real_data = true;
                            }
                            if let Some(elevation) =
                                fetched.grid.elevation(&key_srs, x, y, options.interpolation)
                            {
                                resolved_index = Some(contender.index);
                                grid.set_height(c, r, elevation);
                                if let Some(delta) = delta_lod.as_mut() {
                                    delta[texel] = key.lod().saturating_sub(fetched.lod) as u16;
                                }
                            }
                        }

                        height_grids.clear_if_full();
                    }

                    for (i, offset) in offsets.iter().enumerate().rev() {
                        // only offsets stacked above the resolving contender apply
                        if resolved_index.map_or(false, |resolved| offset.index < resolved) {
                            continue;
                        }
                        if offset_failed[i] {
                            continue;
                        }
                        if offset_grids[i].is_none() {
                            match offset.layer.create_height_field(&offset.key, cancel)? {
                                Some(g) => offset_grids[i] = Some(g),
                                None => {
                                    offset_failed[i] = true;
                                    continue;
                                }
                            }
                        }

                        real_data = true;

                        if let Some(elevation) = offset_grids[i]
                            .as_ref()
                            .and_then(|g| g.elevation(&key_srs, x, y, options.interpolation))
                        {
                            grid.add_offset(c, r, elevation);
                            // overwrites the base sample's delta; known to facet normals
                            // when the base came from a coarser level
                            if let Some(delta) = delta_lod.as_mut() {
                                delta[texel] = key.lod().saturating_sub(offset.key.lod()) as u16;
                            }
                        }
                    }
                }
            }
        }

        if let Some(policy) = options.no_data_policy {
            let filled = resolve_invalid_heights(grid, policy);
            if filled > 0 {
                trace!(target: "elevstack::compositor", "{}: filled {} empty texels", key, filled);
            }
        }

        if let Some(out) = normals.as_deref_mut() {
            cancel.check()?;
            build_normal_map(&key.extent(), grid, delta_lod.as_deref(), out)?;
        }

        cancel.check()?;
        Ok(real_data)
    }

    /// Allocate and populate a grid for `key`; `Ok(None)` when there is no real data
    pub fn create_composite(
        &self,
        key: &TileKey,
        width: u32,
        height: u32,
        with_normals: bool,
        options: &CompositeOptions,
        cancel: &CancelToken,
    ) -> ElevationResult<Option<GeoHeightGrid>> {
        let mut grid = HeightGrid::new(width, height);
        grid.validate()?;
        let mut normals = with_normals.then(|| NormalGrid::new(width, height));

        if !self.populate(&mut grid, normals.as_mut(), key, options, cancel)? {
            return Ok(None);
        }

        let mut result = GeoHeightGrid::new(Arc::new(grid), key.extent());
        if let Some(n) = normals {
            result = result.with_normals(Arc::new(n));
        }
        Ok(Some(result))
    }
}

/// Fetch a contender's grid, walking up to ancestors while the layer
/// considers the key legal. `None` when even the walk found nothing.
fn fetch_with_fallback(
    contender: &SourceRecord,
    cancel: &CancelToken,
) -> ElevationResult<Option<FetchedGrid>> {
    let layer = &contender.layer;
    let mut actual = Some(contender.key.clone());

    while let Some(key) = actual {
        if !layer.is_key_in_legal_range(&key) {
            break;
        }
        if let Some(grid) = layer.create_height_field(&key, cancel)? {
            let fallback = key != contender.key;
            if fallback {
                trace!(
                    target: "elevstack::compositor",
                    "{}: fell back from {} to {}",
                    layer.name(),
                    contender.key,
                    key
                );
            }
            return Ok(Some(FetchedGrid {
                grid,
                lod: key.lod(),
                fallback,
            }));
        }
        actual = key.parent();
    }

    debug!(target: "elevstack::compositor", "{}: no data at or above {}", layer.name(), contender.key);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ElevationLayerOptions;
    use crate::terrain::source::MemorySource;

    fn layer(name: &str, source: Arc<MemorySource>, offset: bool) -> Arc<ElevationLayer> {
        let mut options = ElevationLayerOptions::new(name);
        options.offset = offset;
        Arc::new(ElevationLayer::new(options, source))
    }

    #[test]
    fn test_fetch_cache_clears_on_overflow() {
        let mut cache = FetchCache::new(3, 2);
        let profile = Profile::global_geodetic();
        let key = TileKey::new(0, 0, 0, profile).unwrap();
        let fetched = || FetchedGrid {
            grid: GeoHeightGrid::new(Arc::new(HeightGrid::filled(2, 2, 1.0)), key.extent()),
            lod: 0,
            fallback: false,
        };
        cache.insert(0, fetched());
        cache.clear_if_full();
        assert!(cache.slots[0].is_some());
        cache.insert(1, fetched());
        cache.clear_if_full();
        assert!(cache.slots.iter().all(|s| s.is_none()));
        assert_eq!(cache.cached, 0);
    }

    #[test]
    fn test_resampling_single_contender() {
        let profile = Profile::global_geodetic();
        let key = TileKey::new(0, 0, 0, profile.clone()).unwrap();
        let source = Arc::new(MemorySource::new("mem", profile, 9));
        source.insert_constant(key.clone(), 30.0);
        let set = ElevationLayerSet::from_layers(vec![layer("base", source, false)]);

        // 5x5 target from a 9x9 source goes through resampling
        let mut grid = HeightGrid::new(5, 5);
        let real = set
            .populate(&mut grid, None, &key, &CompositeOptions::default(), &CancelToken::new())
            .unwrap();
        assert!(real);
        assert!(grid.samples().iter().all(|s| s.value() == Some(30.0)));
    }

    #[test]
    fn test_rejects_degenerate_target() {
        let set = ElevationLayerSet::new();
        let key = TileKey::new(0, 0, 0, Profile::global_geodetic()).unwrap();
        let mut grid = HeightGrid::new(1, 5);
        assert!(set
            .populate(&mut grid, None, &key, &CompositeOptions::default(), &CancelToken::new())
            .is_err());

        let mut grid = HeightGrid::new(4096, 2);
        let err = set
            .populate(&mut grid, None, &key, &CompositeOptions::default(), &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ElevationError::InvalidGrid(_)));
    }

    #[test]
    fn test_offset_without_base_counts_from_sea_level() {
        let profile = Profile::global_geodetic();
        let key = TileKey::new(0, 0, 0, profile.clone()).unwrap();
        let relief = Arc::new(MemorySource::new("relief", profile, 5));
        relief.insert_constant(key.clone(), 4.0);
        let set = ElevationLayerSet::from_layers(vec![layer("relief", relief, true)]);

        let mut grid = HeightGrid::new(5, 5);
        let options = CompositeOptions {
            no_data_policy: None,
            ..CompositeOptions::default()
        };
        assert!(set.populate(&mut grid, None, &key, &options, &CancelToken::new()).unwrap());
        assert!(grid.samples().iter().all(|s| s.value() == Some(4.0)));
    }
}
