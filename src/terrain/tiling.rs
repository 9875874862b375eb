//! Quadtree tiling profiles and tile keys
//!
//! A `Profile` binds a horizontal reference system and extent to a quadtree
//! tiling scheme; a `TileKey` addresses one cell of that quadtree. Tile rows
//! are counted from the northern edge of the profile extent.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{ElevationError, ElevationResult};
use crate::geo::{datums_equivalent, GeoExtent, Srs, VerticalDatum};

/// Deepest level considered when matching resolutions across profiles
pub const MAX_LOD: u32 = 30;

/// Spherical mercator half-width in meters
const MERCATOR_HALF_EXTENT: f64 = 20_037_508.342_789_244;

/// Horizontal tiling scheme plus an optional vertical datum
#[derive(Clone)]
pub struct Profile {
    extent: GeoExtent,
    tiles_wide: u32,
    tiles_high: u32,
    vdatum: Option<Arc<dyn VerticalDatum>>,
    signature: String,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("srs", &self.extent.srs().name())
            .field("extent", &(self.extent.x_min(), self.extent.y_min(), self.extent.x_max(), self.extent.y_max()))
            .field("tiles", &(self.tiles_wide, self.tiles_high))
            .field("vdatum", &self.vdatum_name())
            .finish()
    }
}

impl Profile {
    pub fn new(extent: GeoExtent, tiles_wide: u32, tiles_high: u32) -> ElevationResult<Arc<Self>> {
        if tiles_wide == 0 || tiles_high == 0 {
            return Err(ElevationError::config(format!(
                "profile needs at least one tile at level 0, got {}x{}",
                tiles_wide, tiles_high
            )));
        }
        Ok(Self::from_parts(extent, tiles_wide, tiles_high))
    }

    fn from_parts(extent: GeoExtent, tiles_wide: u32, tiles_high: u32) -> Arc<Self> {
        let signature = horiz_signature(&extent, tiles_wide, tiles_high);
        Arc::new(Self {
            extent,
            tiles_wide,
            tiles_high,
            vdatum: None,
            signature,
        })
    }

    /// WGS84 geographic profile with two tiles at level 0
    pub fn global_geodetic() -> Arc<Self> {
        let srs = Arc::new(Srs::wgs84());
        let extent = GeoExtent::from_parts(srs, -180.0, -90.0, 180.0, 90.0);
        Self::from_parts(extent, 2, 1)
    }

    /// Spherical mercator profile with one tile at level 0
    pub fn spherical_mercator() -> Arc<Self> {
        let srs = Arc::new(Srs::spherical_mercator());
        let extent = GeoExtent::from_parts(
            srs,
            -MERCATOR_HALF_EXTENT,
            -MERCATOR_HALF_EXTENT,
            MERCATOR_HALF_EXTENT,
            MERCATOR_HALF_EXTENT,
        );
        Self::from_parts(extent, 1, 1)
    }

    /// Copy of this profile measured against another vertical datum
    pub fn with_vertical_datum(&self, vdatum: Option<Arc<dyn VerticalDatum>>) -> Arc<Self> {
        Arc::new(Self {
            vdatum,
            ..self.clone()
        })
    }

    pub fn srs(&self) -> &Arc<Srs> {
        self.extent.srs()
    }

    pub fn extent(&self) -> &GeoExtent {
        &self.extent
    }

    pub fn vertical_datum(&self) -> Option<&Arc<dyn VerticalDatum>> {
        self.vdatum.as_ref()
    }

    pub fn vdatum_name(&self) -> Option<&str> {
        self.vdatum.as_ref().map(|d| d.name())
    }

    /// Stable hash of the horizontal definition (SRS, extent, level-0 tiling)
    pub fn horiz_signature(&self) -> &str {
        &self.signature
    }

    pub fn is_horiz_equivalent_to(&self, other: &Profile) -> bool {
        self.signature == other.signature
    }

    pub fn is_vert_equivalent_to(&self, other: &Profile) -> bool {
        datums_equivalent(
            self.vdatum.as_deref(),
            other.vdatum.as_deref(),
        )
    }

    pub fn num_tiles(&self, lod: u32) -> (u32, u32) {
        let scale = 1u32 << lod.min(MAX_LOD);
        (self.tiles_wide * scale, self.tiles_high * scale)
    }

    /// Tile width and height in SRS units at a level
    pub fn tile_dimensions(&self, lod: u32) -> (f64, f64) {
        let (nx, ny) = self.num_tiles(lod);
        (
            self.extent.width() / nx as f64,
            self.extent.height() / ny as f64,
        )
    }

    pub fn tile_extent(&self, lod: u32, x: u32, y: u32) -> GeoExtent {
        let (w, h) = self.tile_dimensions(lod);
        let xmin = self.extent.x_min() + w * x as f64;
        let ymax = self.extent.y_max() - h * y as f64;
        GeoExtent::from_parts(self.srs().clone(), xmin, ymax - h, xmin + w, ymax)
    }

    /// Approximate tile width in meters at the equator
    fn tile_width_meters(&self, lod: u32) -> f64 {
        let (w, _) = self.tile_dimensions(lod);
        self.srs().units_to_meters(w, 0.0)
    }

    /// Level in this profile whose tiles best match the size of `other`'s tiles at `lod`
    pub fn equivalent_lod(&self, other: &Profile, lod: u32) -> u32 {
        if self.is_horiz_equivalent_to(other) {
            return lod;
        }
        let target = other.tile_width_meters(lod);
        let mut prev = self.tile_width_meters(0);
        if prev <= target {
            return 0;
        }
        for i in 1..=MAX_LOD {
            let w = self.tile_width_meters(i);
            if w <= target {
                return if (target - w) < (prev - target) { i } else { i - 1 };
            }
            prev = w;
        }
        MAX_LOD
    }

    /// All tiles at `lod` whose interiors overlap `extent` (in any transformable SRS)
    pub fn intersecting_tiles(self: &Arc<Self>, extent: &GeoExtent, lod: u32) -> Vec<TileKey> {
        let mut out = Vec::new();
        let local = match extent.transform(self.srs()) {
            Some(e) => e,
            None => return out,
        };
        let clipped = match local.intersection(&self.extent) {
            Some(e) => e,
            None => return out,
        };

        let (w, h) = self.tile_dimensions(lod);
        let (nx, ny) = self.num_tiles(lod);
        let eps = 1e-9;
        let px = self.extent.x_min();
        let py = self.extent.y_max();

        let x0 = (((clipped.x_min() - px) / w) + eps).floor().max(0.0) as u32;
        let x1 = ((((clipped.x_max() - px) / w) - eps).ceil() as u32).clamp(1, nx) - 1;
        let y0 = (((py - clipped.y_max()) / h) + eps).floor().max(0.0) as u32;
        let y1 = ((((py - clipped.y_min()) / h) - eps).ceil() as u32).clamp(1, ny) - 1;

        for y in y0..=y1 {
            for x in x0..=x1 {
                out.push(TileKey::from_parts(lod, x, y, self.clone()));
            }
        }
        out
    }
}

fn horiz_signature(extent: &GeoExtent, tiles_wide: u32, tiles_high: u32) -> String {
    let definition = format!(
        "{}|{:.9}|{:.9}|{:.9}|{:.9}|{}x{}",
        extent.srs().name().to_lowercase(),
        extent.x_min(),
        extent.y_min(),
        extent.x_max(),
        extent.y_max(),
        tiles_wide,
        tiles_high
    );
    let digest = Sha256::digest(definition.as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Unique identifier for a tile in the quadtree of a profile
#[derive(Debug, Clone)]
pub struct TileKey {
    lod: u32,
    x: u32,
    y: u32,
    profile: Arc<Profile>,
}

impl TileKey {
    pub fn new(lod: u32, x: u32, y: u32, profile: Arc<Profile>) -> ElevationResult<Self> {
        if lod > MAX_LOD {
            return Err(ElevationError::InvalidKey(format!("level {} exceeds {}", lod, MAX_LOD)));
        }
        let (nx, ny) = profile.num_tiles(lod);
        if x >= nx || y >= ny {
            return Err(ElevationError::InvalidKey(format!(
                "{}/{}/{} outside {}x{} tiles",
                lod, x, y, nx, ny
            )));
        }
        Ok(Self::from_parts(lod, x, y, profile))
    }

    pub(crate) fn from_parts(lod: u32, x: u32, y: u32, profile: Arc<Profile>) -> Self {
        Self { lod, x, y, profile }
    }

    pub fn lod(&self) -> u32 {
        self.lod
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    /// "lod/x/y"
    pub fn str(&self) -> String {
        format!("{}/{}/{}", self.lod, self.x, self.y)
    }

    pub fn extent(&self) -> GeoExtent {
        self.profile.tile_extent(self.lod, self.x, self.y)
    }

    /// Get the parent tile at the next lower resolution
    pub fn parent(&self) -> Option<TileKey> {
        if self.lod == 0 {
            None
        } else {
            Some(Self::from_parts(self.lod - 1, self.x / 2, self.y / 2, self.profile.clone()))
        }
    }

    /// Ancestor at `lod`; the key itself when `lod` equals its level
    pub fn ancestor(&self, lod: u32) -> Option<TileKey> {
        if lod > self.lod {
            return None;
        }
        let shift = self.lod - lod;
        Some(Self::from_parts(lod, self.x >> shift, self.y >> shift, self.profile.clone()))
    }

    /// Get the four child tiles at the next higher resolution
    pub fn children(&self) -> [TileKey; 4] {
        let child_lod = self.lod + 1;
        let base_x = self.x * 2;
        let base_y = self.y * 2;
        let p = &self.profile;
        [
            Self::from_parts(child_lod, base_x, base_y, p.clone()),
            Self::from_parts(child_lod, base_x + 1, base_y, p.clone()),
            Self::from_parts(child_lod, base_x, base_y + 1, p.clone()),
            Self::from_parts(child_lod, base_x + 1, base_y + 1, p.clone()),
        ]
    }

    /// Return true if `self` is a strict descendant of `ancestor` in the quadtree.
    pub fn is_descendant_of(&self, ancestor: &TileKey) -> bool {
        if self.lod <= ancestor.lod {
            return false;
        }
        let shift = self.lod - ancestor.lod;
        (self.x >> shift) == ancestor.x && (self.y >> shift) == ancestor.y
    }

    /// Same cell addressed through another profile with identical horizontal tiling
    pub fn with_profile(&self, profile: Arc<Profile>) -> TileKey {
        Self::from_parts(self.lod, self.x, self.y, profile)
    }

    /// Key whose tiles, at `source_tile_size` pixels, cover this key's area at
    /// about `target_size` pixels. Walks one level up per doubling of the
    /// target size until the source tile size is reached.
    pub fn map_resolution(&self, target_size: u32, source_tile_size: u32) -> TileKey {
        if source_tile_size == 0 || source_tile_size == target_size {
            return self.clone();
        }
        let mut lod = self.lod;
        let mut target_pot = target_size.max(1).next_power_of_two();
        loop {
            if target_pot >= source_tile_size || lod == 0 {
                return self.ancestor(lod).unwrap_or_else(|| self.clone());
            }
            lod -= 1;
            target_pot *= 2;
        }
    }
}

impl PartialEq for TileKey {
    fn eq(&self, other: &Self) -> bool {
        self.lod == other.lod
            && self.x == other.x
            && self.y == other.y
            && self.profile.is_horiz_equivalent_to(&other.profile)
    }
}

impl Eq for TileKey {}

impl Hash for TileKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lod.hash(state);
        self.x.hash(state);
        self.y.hash(state);
        self.profile.horiz_signature().hash(state);
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.lod, self.x, self.y)
    }
}
