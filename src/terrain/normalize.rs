// src/terrain/normalize.rs
// Post-composite adjustments: vertical datum conversion and no-data cleanup
// RELEVANT FILES: src/geo/vdatum.rs, src/terrain/layer.rs, src/config.rs

use crate::config::NoDataPolicy;
use crate::geo::{datums_equivalent, GeoExtent, Srs, VerticalDatum};
use crate::terrain::grid::{Elevation, HeightGrid};

/// Rewrite samples that must not be treated as elevation to `NoData`.
///
/// NaN, the source's raw no-data value and anything outside
/// `[min_valid, max_valid]` are rejected. Returns the number of samples
/// rewritten.
pub fn normalize_no_data(
    grid: &mut HeightGrid,
    raw_no_data: Option<f32>,
    min_valid: Option<f32>,
    max_valid: Option<f32>,
) -> usize {
    let mut rewritten = 0;
    for sample in grid.samples_mut() {
        let Elevation::Valid(v) = *sample else {
            continue;
        };
        let reject = !v.is_finite()
            || raw_no_data.map_or(false, |nd| v == nd)
            || min_valid.map_or(false, |min| v < min)
            || max_valid.map_or(false, |max| v > max);
        if reject {
            *sample = Elevation::NoData;
            rewritten += 1;
        }
    }
    rewritten
}

/// Fill `NoData` samples according to `policy`. Returns the number filled.
///
/// `Interpolate` takes the nearest valid sample in each of the four grid
/// directions and blends them by inverse distance; a sample with no valid
/// neighbour on its row or column falls back to sea level.
pub fn resolve_invalid_heights(grid: &mut HeightGrid, policy: NoDataPolicy) -> usize {
    let holes: Vec<(u32, u32)> = (0..grid.height())
        .flat_map(|r| (0..grid.width()).map(move |c| (c, r)))
        .filter(|&(c, r)| !grid.get(c, r).is_valid())
        .collect();
    if holes.is_empty() {
        return 0;
    }

    match policy {
        NoDataPolicy::MeanSeaLevel => {
            for &(c, r) in &holes {
                grid.set_height(c, r, 0.0);
            }
        }
        NoDataPolicy::Interpolate => {
            // read from the unfilled grid so fills never feed each other
            let source = grid.clone();
            for &(c, r) in &holes {
                let value = interpolate_hole(&source, c, r).unwrap_or(0.0);
                grid.set_height(c, r, value);
            }
        }
    }
    holes.len()
}

fn interpolate_hole(grid: &HeightGrid, col: u32, row: u32) -> Option<f32> {
    let w = grid.width() as i64;
    let h = grid.height() as i64;
    let directions = [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)];

    let mut weighted = 0.0f64;
    let mut total_weight = 0.0f64;
    for (dc, dr) in directions {
        let (mut c, mut r) = (col as i64 + dc, row as i64 + dr);
        let mut dist = 1.0f64;
        while c >= 0 && c < w && r >= 0 && r < h {
            if let Some(v) = grid.get(c as u32, r as u32).value() {
                let weight = 1.0 / dist;
                weighted += v as f64 * weight;
                total_weight += weight;
                break;
            }
            c += dc;
            r += dr;
            dist += 1.0;
        }
    }

    if total_weight > 0.0 {
        Some((weighted / total_weight) as f32)
    } else {
        None
    }
}

/// Convert every valid sample from datum `from` to datum `to`.
///
/// `None` stands for height above the ellipsoid. Nothing happens when the
/// two datums are equivalent. Returns false when a sample location could not
/// be expressed in geographic coordinates; such samples are left unchanged.
pub fn transform_vertical(
    from: Option<&dyn VerticalDatum>,
    to: Option<&dyn VerticalDatum>,
    extent: &GeoExtent,
    grid: &mut HeightGrid,
) -> bool {
    if datums_equivalent(from, to) {
        return true;
    }

    let geo = Srs::wgs84();
    let w = grid.width();
    let h = grid.height();
    let dx = extent.width() / (w.max(2) - 1) as f64;
    let dy = extent.height() / (h.max(2) - 1) as f64;
    let mut all_located = true;

    for r in 0..h {
        let y = extent.y_min() + dy * r as f64;
        for c in 0..w {
            let Some(v) = grid.get(c, r).value() else {
                continue;
            };
            let x = extent.x_min() + dx * c as f64;
            let Some((lon, lat)) = extent.srs().transform_point(x, y, &geo) else {
                all_located = false;
                continue;
            };
            let hae = match from {
                Some(d) => d.msl_to_hae(lat, lon, v as f64),
                None => v as f64,
            };
            let out = match to {
                Some(d) => d.hae_to_msl(lat, lon, hae),
                None => hae,
            };
            grid.set_height(c, r, out as f32);
        }
    }
    all_located
}
