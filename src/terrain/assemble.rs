// src/terrain/assemble.rs
// Builds a grid for a key whose profile differs from the layer's native profile
// RELEVANT FILES: src/terrain/layer.rs, src/terrain/tiling.rs, src/terrain/grid.rs

use std::sync::Arc;

use log::{debug, trace};

use crate::error::ElevationResult;
use crate::terrain::cancel::CancelToken;
use crate::terrain::grid::{GeoHeightGrid, HeightGrid, RasterInterpolation};
use crate::terrain::layer::ElevationLayer;
use crate::terrain::normalize::normalize_no_data;
use crate::terrain::normals::NormalGrid;
use crate::terrain::tiling::TileKey;

/// Mosaic the layer's native tiles covering `key` into one grid in `key`'s
/// extent, together with a normal per texel.
///
/// Native tiles are sampled finest first and the first valid elevation at a
/// texel wins. Texels nothing covers stay no data with an up normal.
/// Returns `Ok(None)` when no native tile could be fetched.
pub fn assemble_height_grid(
    layer: &ElevationLayer,
    key: &TileKey,
    cancel: &CancelToken,
) -> ElevationResult<Option<(HeightGrid, NormalGrid)>> {
    cancel.check()?;

    let Some(profile) = layer.profile() else {
        return Ok(None);
    };
    let key_extent = key.extent();

    let intersecting: Vec<TileKey> = if key.lod() > 0 {
        let lod = profile.equivalent_lod(key.profile(), key.lod());
        profile.intersecting_tiles(&key_extent, lod)
    } else {
        // the equivalent level can exceed what the source holds when the two
        // tiling schemes differ a lot; back off until something may have data
        let mut lod = profile.equivalent_lod(key.profile(), key.lod()) as i64;
        let mut tiles = Vec::new();
        while lod >= 0 {
            tiles = profile.intersecting_tiles(&key_extent, lod as u32);
            if tiles.iter().any(|k| layer.may_have_data(k)) {
                break;
            }
            lod -= 1;
        }
        tiles
    };

    if intersecting.is_empty() {
        debug!(target: "elevstack::assemble", "{}: no native tiles intersect {}", layer.name(), key);
        return Ok(None);
    }

    // tiles the source lacks are served by their best available ancestor
    let mut native_keys: Vec<TileKey> = Vec::with_capacity(intersecting.len());
    for best in intersecting.iter().filter_map(|k| layer.best_available_key(k)) {
        if !native_keys.contains(&best) {
            native_keys.push(best);
        }
    }

    let options = layer.options();
    let mut fetched: Vec<GeoHeightGrid> = Vec::with_capacity(native_keys.len());
    for native_key in native_keys.iter().filter(|k| layer.is_key_in_legal_range(k)) {
        match layer.fetch_native(native_key, cancel) {
            Ok(mut grid) => {
                if grid.validate().is_err() {
                    continue;
                }
                normalize_no_data(
                    &mut grid,
                    options.no_data_value,
                    options.min_valid_value,
                    options.max_valid_value,
                );
                fetched.push(GeoHeightGrid::new(Arc::new(grid), native_key.extent()));
            }
            Err(e) if e.is_canceled() => return Err(e),
            Err(e) => trace!(target: "elevstack::assemble", "{}: skipping {}: {}", layer.name(), native_key, e),
        }
    }

    if fetched.is_empty() {
        debug!(target: "elevstack::assemble", "{}: assembly of {} yielded no grids", layer.name(), key);
        return Ok(None);
    }

    let width = fetched.iter().map(|g| g.grid().width()).max().unwrap_or(0);
    let height = fetched.iter().map(|g| g.grid().height()).max().unwrap_or(0);

    // finest first
    fetched.sort_by(|a, b| a.x_resolution().total_cmp(&b.x_resolution()));

    let mut out = HeightGrid::new(width, height);
    let mut normals = NormalGrid::new(width, height);

    let srs = key_extent.srs().clone();
    let dx = key_extent.width() / (width - 1) as f64;
    let dy = key_extent.height() / (height - 1) as f64;

    for c in 0..width {
        cancel.check()?;
        let x = key_extent.x_min() + dx * c as f64;
        for r in 0..height {
            let y = key_extent.y_min() + dy * r as f64;
            let hit = fetched
                .iter()
                .find_map(|g| g.elevation_and_normal(&srs, x, y, RasterInterpolation::Bilinear));
            if let Some((elevation, normal)) = hit {
                out.set_height(c, r, elevation);
                normals.set(c, r, normal, 0.0);
            }
        }
    }

    Ok(Some((out, normals)))
}
