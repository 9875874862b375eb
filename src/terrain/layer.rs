// src/terrain/layer.rs
// One elevation source wrapped with configuration, cache tiers and per-key exclusion
// RELEVANT FILES: src/terrain/source.rs, src/cache/mod.rs, src/terrain/assemble.rs, src/terrain/normalize.rs

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn};

use crate::cache::{
    memory_cache_key, persistent_cache_key, CacheBin, CachePolicy, MemoryCacheBin,
};
use crate::config::{ElevationLayerOptions, NoDataPolicy};
use crate::error::{ElevationError, ElevationResult};
use crate::geo::VerticalDatumRegistry;
use crate::terrain::assemble::assemble_height_grid;
use crate::terrain::cancel::CancelToken;
use crate::terrain::grid::{GeoHeightGrid, HeightGrid};
use crate::terrain::inflight::InFlightTable;
use crate::terrain::normalize::{normalize_no_data, transform_vertical};
use crate::terrain::source::ElevationSource;
use crate::terrain::tiling::{Profile, TileKey};

type LayerResult = ElevationResult<Option<GeoHeightGrid>>;

/// An elevation source as the compositor sees it.
///
/// Requests run through the memory tier, then the persistent tier, then the
/// source itself (directly when the requested key shares the layer's
/// horizontal profile, by assembly otherwise). Fresh grids are validated,
/// cleaned up and written back to both tiers.
pub struct ElevationLayer {
    options: ElevationLayerOptions,
    source: Arc<dyn ElevationSource>,
    profile: Option<Arc<Profile>>,
    enabled: AtomicBool,
    visible: AtomicBool,
    status: Mutex<Option<ElevationError>>,
    revision: AtomicU32,
    memory_cache: Option<Arc<dyn CacheBin>>,
    persistent_cache: Option<Arc<dyn CacheBin>>,
    in_flight: InFlightTable<String, LayerResult>,
}

impl fmt::Debug for ElevationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevationLayer")
            .field("name", &self.options.name)
            .field("source", &self.source.name())
            .field("enabled", &self.is_enabled())
            .field("offset", &self.options.offset)
            .field("revision", &self.revision())
            .finish()
    }
}

impl ElevationLayer {
    pub fn new(options: ElevationLayerOptions, source: Arc<dyn ElevationSource>) -> Self {
        Self::with_registry(options, source, &VerticalDatumRegistry::default())
    }

    /// Build a layer, resolving a vertical datum override through `registry`
    pub fn with_registry(
        options: ElevationLayerOptions,
        source: Arc<dyn ElevationSource>,
        registry: &VerticalDatumRegistry,
    ) -> Self {
        let profile = source
            .profile()
            .map(|p| apply_profile_overrides(&options, p, registry));

        let memory_cache: Option<Arc<dyn CacheBin>> = if options.memory_cache_mb > 0 {
            Some(Arc::new(MemoryCacheBin::new(
                format!("{}-memory", options.name),
                options.memory_cache_mb,
            )))
        } else {
            None
        };

        let enabled = options.enabled;
        Self {
            options,
            source,
            profile,
            enabled: AtomicBool::new(enabled),
            // elevation layers do not render; visibility mirrors enabled
            visible: AtomicBool::new(enabled),
            status: Mutex::new(None),
            revision: AtomicU32::new(0),
            memory_cache,
            persistent_cache: None,
            in_flight: InFlightTable::new(),
        }
    }

    /// Replace the memory tier; `None` disables it
    pub fn with_memory_cache(mut self, bin: Option<Arc<dyn CacheBin>>) -> Self {
        self.memory_cache = bin;
        self
    }

    pub fn with_persistent_cache(mut self, bin: Arc<dyn CacheBin>) -> Self {
        self.persistent_cache = Some(bin);
        self
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ElevationLayerOptions {
        &self.options
    }

    pub fn source(&self) -> &Arc<dyn ElevationSource> {
        &self.source
    }

    pub fn memory_cache(&self) -> Option<&Arc<dyn CacheBin>> {
        self.memory_cache.as_ref()
    }

    pub fn persistent_cache(&self) -> Option<&Arc<dyn CacheBin>> {
        self.persistent_cache.as_ref()
    }

    pub fn cache_policy(&self) -> &CachePolicy {
        &self.options.cache_policy
    }

    pub fn profile(&self) -> Option<Arc<Profile>> {
        self.profile.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, value: bool) {
        self.visible.store(value, Ordering::Release);
        self.enabled.store(value, Ordering::Release);
    }

    pub fn set_visible(&self, value: bool) {
        self.set_enabled(value);
    }

    /// Error that took the layer out of service, if any
    pub fn status(&self) -> Option<ElevationError> {
        self.status.lock().ok().and_then(|s| s.clone())
    }

    fn disable(&self, err: ElevationError) {
        if let Ok(mut status) = self.status.lock() {
            if status.is_none() {
                error!(target: "elevstack::layer", "Layer \"{}\" disabled: {}", self.name(), err);
                *status = Some(err);
            }
        }
        self.set_enabled(false);
    }

    pub fn is_offset(&self) -> bool {
        self.options.offset
    }

    pub fn min_level(&self) -> u32 {
        self.options.min_level
    }

    pub fn no_data_policy(&self) -> NoDataPolicy {
        self.options.nodata_policy
    }

    pub fn tile_size(&self) -> u32 {
        self.options.tile_size.unwrap_or_else(|| self.source.tile_size())
    }

    /// Memory tier entries are scoped by revision
    pub fn revision(&self) -> u32 {
        self.revision.load(Ordering::Acquire)
    }

    /// Invalidate every memory tier entry of this layer
    pub fn bump_revision(&self) -> u32 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Best key at or above `key` the layer can serve, honouring `max_data_level`.
    ///
    /// Keys from another horizontal profile are answered through the native
    /// tiles covering them. When those only have coarser data, the result is
    /// the ancestor of `key` whose resolution matches that data.
    pub fn best_available_key(&self, key: &TileKey) -> Option<TileKey> {
        let profile = match self.profile() {
            Some(profile) if !key.profile().is_horiz_equivalent_to(&profile) => profile,
            _ => return self.best_native_key(key),
        };

        let (lod, natives) = native_cover(&profile, key);
        let best_lod = natives
            .iter()
            .filter_map(|native| self.best_native_key(native))
            .map(|best| best.lod())
            .max()?;
        if best_lod >= lod {
            return Some(key.clone());
        }
        let matching = key.profile().equivalent_lod(&profile, best_lod).min(key.lod());
        key.ancestor(matching)
    }

    fn best_native_key(&self, key: &TileKey) -> Option<TileKey> {
        let clamped = match self.options.max_data_level {
            Some(max) if key.lod() > max => key.ancestor(max)?,
            _ => key.clone(),
        };
        self.source.best_available_key(&clamped)
    }

    pub fn is_key_in_legal_range(&self, key: &TileKey) -> bool {
        if key.lod() < self.options.min_level {
            return false;
        }
        match self.profile() {
            Some(profile) if !key.profile().is_horiz_equivalent_to(&profile) => native_cover(&profile, key)
                .1
                .iter()
                .any(|native| self.source.is_key_in_legal_range(native)),
            _ => self.source.is_key_in_legal_range(key),
        }
    }

    pub fn may_have_data(&self, key: &TileKey) -> bool {
        match self.profile() {
            Some(profile) if !key.profile().is_horiz_equivalent_to(&profile) => native_cover(&profile, key)
                .1
                .iter()
                .any(|native| self.source.may_have_data(native)),
            _ => self.source.may_have_data(key),
        }
    }

    /// Height grid for `key`, in the vertical datum of `key`'s profile.
    ///
    /// `Ok(None)` means the layer has no data for the key. Concurrent calls
    /// for the same key share one computation.
    pub fn create_height_field(&self, key: &TileKey, cancel: &CancelToken) -> LayerResult {
        if self.status().is_some() || !self.is_enabled() {
            return Ok(None);
        }

        let flight_key = format!(
            "{}#{}",
            memory_cache_key(self.revision(), key),
            key.profile().vdatum_name().unwrap_or_default()
        );

        loop {
            let result = self
                .in_flight
                .run(flight_key.clone(), || self.create_in_key_profile(key, cancel));
            // the leader was canceled, not us: compute again under our own token
            match result {
                Err(ref e) if e.is_canceled() && !cancel.is_canceled() => continue,
                other => return other,
            }
        }
    }

    /// Fetch exactly `key` from the source, in the layer's native profile
    pub(crate) fn fetch_native(&self, key: &TileKey, cancel: &CancelToken) -> ElevationResult<HeightGrid> {
        cancel.check()?;
        let grid = self.source.fetch(key, cancel)?;
        trace!(target: "elevstack::layer", "{}: fetched {}", self.name(), key);
        Ok(grid)
    }

    fn create_in_key_profile(&self, key: &TileKey, cancel: &CancelToken) -> LayerResult {
        let mem_key = memory_cache_key(self.revision(), key);

        if let Some(bin) = &self.memory_cache {
            match bin.read(&mem_key) {
                Ok(Some(record)) => {
                    debug!(target: "elevstack::cache", "{}: memory hit {}", self.name(), mem_key);
                    return Ok(Some(GeoHeightGrid::new(record.grid, key.extent())));
                }
                Ok(None) => {}
                Err(e) => debug!(target: "elevstack::cache", "{}: memory read failed: {}", self.name(), e),
            }
        }

        let policy = &self.options.cache_policy;
        let cache_key = persistent_cache_key(key);
        let profile = self.profile();

        if profile.is_none() && !policy.is_cache_only() {
            self.disable(ElevationError::NoProfile(
                "could not establish a valid profile".into(),
            ));
            return Ok(None);
        }

        // a valid persistent record, fresh or not; stale ones are a last resort
        let mut cached: Option<Arc<HeightGrid>> = None;
        let mut from_cache = false;

        if let Some(bin) = self.persistent_cache.as_ref().filter(|_| policy.is_cache_readable()) {
            match bin.read(&cache_key) {
                Ok(Some(record)) => match record.grid.validate() {
                    Ok(()) => {
                        from_cache = !policy.is_expired(record.last_modified);
                        debug!(
                            target: "elevstack::cache",
                            "{}: persistent hit {} (expired: {})",
                            self.name(),
                            cache_key,
                            !from_cache
                        );
                        cached = Some(record.grid);
                    }
                    Err(e) => warn!(target: "elevstack::cache", "{}: cached grid {} rejected: {}", self.name(), cache_key, e),
                },
                Ok(None) => {}
                Err(e) => warn!(target: "elevstack::cache", "{}: unreadable cache record {}: {}", self.name(), cache_key, e),
            }
        }

        let (grid, normals) = match cached {
            Some(grid) if from_cache => (grid, None),
            stale => {
                if policy.is_cache_only() {
                    return Ok(None);
                }
                let Some(profile) = profile else {
                    return Ok(None);
                };
                if !self.is_key_in_legal_range(key) {
                    return Ok(None);
                }

                let produced = if key.profile().is_horiz_equivalent_to(&profile) {
                    self.fetch_native(&key.with_profile(profile.clone()), cancel)
                        .map(|grid| Some((grid, None)))
                } else {
                    assemble_height_grid(self, key, cancel)
                        .map(|assembled| assembled.map(|(grid, normals)| (grid, Some(normals))))
                };

                cancel.check()?;

                let mut fresh = match produced {
                    Ok(fresh) => fresh,
                    Err(e) if e.is_canceled() => return Err(e),
                    Err(e) => {
                        debug!(target: "elevstack::layer", "{}: no data for {}: {}", self.name(), key, e);
                        None
                    }
                };

                if let Some((grid, _)) = &fresh {
                    if let Err(e) = grid.validate() {
                        warn!(target: "elevstack::layer", "{}: generated an illegal height grid for {}: {}", self.name(), key, e);
                        fresh = None;
                    }
                }

                match fresh {
                    Some((mut grid, normals)) => {
                        self.adjust(&mut grid, &profile, key);
                        let grid = Arc::new(grid);
                        if let Some(bin) = self.persistent_cache.as_ref().filter(|_| policy.is_cache_writeable()) {
                            if let Err(e) = bin.write(&cache_key, &grid) {
                                warn!(target: "elevstack::cache", "{}: cache write {} failed: {}", self.name(), cache_key, e);
                            }
                        }
                        (grid, normals)
                    }
                    None => match stale {
                        Some(grid) => {
                            debug!(target: "elevstack::cache", "{}: using cached but expired grid for {}", self.name(), key);
                            (grid, None)
                        }
                        None => return Ok(None),
                    },
                }
            }
        };

        cancel.check()?;

        if let Some(bin) = &self.memory_cache {
            if let Err(e) = bin.write(&mem_key, &grid) {
                debug!(target: "elevstack::cache", "{}: memory write failed: {}", self.name(), e);
            }
        }

        let mut result = GeoHeightGrid::new(grid, key.extent());
        if let Some(normals) = normals {
            result = result.with_normals(Arc::new(normals));
        }
        Ok(Some(result))
    }

    /// No-data cleanup then conversion into the datum of `key`'s profile
    fn adjust(&self, grid: &mut HeightGrid, profile: &Profile, key: &TileKey) {
        let rewritten = normalize_no_data(
            grid,
            self.options.no_data_value,
            self.options.min_valid_value,
            self.options.max_valid_value,
        );
        if rewritten > 0 {
            trace!(target: "elevstack::layer", "{}: {} samples of {} set to no data", self.name(), rewritten, key);
        }

        if !key.profile().is_vert_equivalent_to(profile) {
            let located = transform_vertical(
                profile.vertical_datum().map(|d| d.as_ref()),
                key.profile().vertical_datum().map(|d| d.as_ref()),
                &key.extent(),
                grid,
            );
            if !located {
                warn!(target: "elevstack::layer", "{}: vertical transform incomplete for {}", self.name(), key);
            }
        }
    }

    /// Push a grid back to the source. Only sources that support writing,
    /// on layers configured to request it, accept data.
    pub fn write_height_field(&self, key: &TileKey, grid: &HeightGrid, cancel: &CancelToken) -> ElevationResult<()> {
        if self.source.supports_writing() && self.options.writing_requested {
            cancel.check()?;
            grid.validate()?;
            self.source.write(key, grid)
        } else {
            Err(ElevationError::ServiceUnavailable)
        }
    }
}

/// Level and tiles of `profile` covering `key`, which belongs to another profile
fn native_cover(profile: &Arc<Profile>, key: &TileKey) -> (u32, Vec<TileKey>) {
    let lod = profile.equivalent_lod(key.profile(), key.lod());
    (lod, profile.intersecting_tiles(&key.extent(), lod))
}

/// Rebuild the profile with the configured vertical datum when it differs
fn apply_profile_overrides(
    options: &ElevationLayerOptions,
    profile: Arc<Profile>,
    registry: &VerticalDatumRegistry,
) -> Arc<Profile> {
    let Some(vdatum) = options.vdatum.as_deref().map(str::trim).filter(|v| !v.is_empty()) else {
        return profile;
    };

    info!(
        target: "elevstack::layer",
        "{}: override vdatum = {}, profile vdatum = {}",
        options.name,
        vdatum,
        profile.vdatum_name().unwrap_or("")
    );

    if profile
        .vdatum_name()
        .map_or(false, |current| current.eq_ignore_ascii_case(vdatum))
    {
        return profile;
    }

    match registry.get(vdatum) {
        Some(datum) => {
            let overridden = profile.with_vertical_datum(Some(datum));
            info!(target: "elevstack::layer", "{}: override profile: {:?}", options.name, overridden);
            overridden
        }
        None => {
            warn!(target: "elevstack::layer", "{}: unknown vertical datum \"{}\", keeping source profile", options.name, vdatum);
            profile
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::ConstantOffsetDatum;
    use crate::terrain::source::{MemorySource, SyntheticSource};

    fn layer_with(value: f32) -> (ElevationLayer, Arc<MemorySource>, TileKey) {
        let profile = Profile::global_geodetic();
        let source = Arc::new(MemorySource::new("mem", profile.clone(), 5));
        let key = TileKey::new(1, 1, 0, profile).unwrap();
        source.insert_constant(key.clone(), value);
        let layer = ElevationLayer::new(ElevationLayerOptions::new("test"), source.clone());
        (layer, source, key)
    }

    #[test]
    fn test_enabled_and_visible_stay_in_sync() {
        let (layer, _, _) = layer_with(1.0);
        assert!(layer.is_enabled() && layer.is_visible());
        layer.set_visible(false);
        assert!(!layer.is_enabled());
        layer.set_enabled(true);
        assert!(layer.is_visible());
    }

    #[test]
    fn test_memory_tier_warms_on_miss() {
        let (layer, source, key) = layer_with(7.0);
        let cancel = CancelToken::new();
        let first = layer.create_height_field(&key, &cancel).unwrap().unwrap();
        let second = layer.create_height_field(&key, &cancel).unwrap().unwrap();
        assert_eq!(first.grid(), second.grid());
        assert_eq!(source.fetch_count(), 1);

        layer.bump_revision();
        layer.create_height_field(&key, &cancel).unwrap().unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[test]
    fn test_disabled_layer_has_no_data() {
        let (layer, source, key) = layer_with(7.0);
        layer.set_enabled(false);
        assert!(layer.create_height_field(&key, &CancelToken::new()).unwrap().is_none());
        assert_eq!(source.fetch_count(), 0);
    }

    #[test]
    fn test_out_of_range_values_become_no_data() {
        let (layer, _, key) = layer_with(-32767.0);
        let geo = layer.create_height_field(&key, &CancelToken::new()).unwrap().unwrap();
        assert!(geo.grid().is_all_no_data());
    }

    #[test]
    fn test_max_data_level_clamps_best_key() {
        let profile = Profile::global_geodetic();
        let source = Arc::new(MemorySource::new("mem", profile.clone(), 5));
        let root = TileKey::new(0, 0, 0, profile.clone()).unwrap();
        let child = TileKey::new(1, 0, 0, profile.clone()).unwrap();
        source.insert_constant(root.clone(), 1.0);
        source.insert_constant(child, 2.0);

        let mut options = ElevationLayerOptions::new("clamped");
        options.max_data_level = Some(0);
        let layer = ElevationLayer::new(options, source);
        let deep = TileKey::new(3, 1, 1, profile).unwrap();
        assert_eq!(layer.best_available_key(&deep), Some(root));
    }

    #[test]
    fn test_key_queries_cross_profiles() {
        let merc = Profile::spherical_mercator();
        let source = Arc::new(MemorySource::new("merc", merc.clone(), 9));
        source.insert_constant(TileKey::new(0, 0, 0, merc).unwrap(), 1.0);
        let layer = ElevationLayer::new(ElevationLayerOptions::new("merc"), source);

        let geo = Profile::global_geodetic();
        let root = TileKey::new(0, 1, 0, geo.clone()).unwrap();
        assert_eq!(layer.best_available_key(&root), Some(root.clone()));

        // only coarse mercator data exists under a deep geodetic key
        let deep = TileKey::new(3, 2, 1, geo.clone()).unwrap();
        assert_eq!(layer.best_available_key(&deep), Some(TileKey::new(0, 0, 0, geo).unwrap()));
    }

    #[test]
    fn test_level_limits_cross_profiles() {
        let source = Arc::new(SyntheticSource::constant("merc", Profile::spherical_mercator(), 9, 3.0).with_max_level(2));
        let layer = ElevationLayer::new(ElevationLayerOptions::new("merc"), source);

        let geo = Profile::global_geodetic();
        let shallow = TileKey::new(1, 1, 0, geo.clone()).unwrap();
        assert!(layer.is_key_in_legal_range(&shallow));
        assert_eq!(layer.best_available_key(&shallow), Some(shallow.clone()));

        let deep = TileKey::new(3, 5, 2, geo).unwrap();
        assert!(!layer.is_key_in_legal_range(&deep));
        assert_eq!(layer.best_available_key(&deep).map(|k| k.lod()), Some(1));
    }

    #[test]
    fn test_vdatum_override_uses_registry() {
        let profile = Profile::global_geodetic();
        let source = Arc::new(MemorySource::new("mem", profile.clone(), 5));
        let mut registry = VerticalDatumRegistry::new();
        registry.register(Arc::new(ConstantOffsetDatum::new("egm96", 10.0)));

        let mut options = ElevationLayerOptions::new("geoid");
        options.vdatum = Some("EGM96".into());
        let layer = ElevationLayer::with_registry(options.clone(), source.clone(), &registry);
        assert_eq!(layer.profile().unwrap().vdatum_name(), Some("egm96"));

        options.vdatum = Some("unknown".into());
        let layer = ElevationLayer::with_registry(options, source, &registry);
        assert_eq!(layer.profile().unwrap().vdatum_name(), None);
    }

    #[test]
    fn test_vertical_conversion_into_key_datum() {
        let profile = Profile::global_geodetic();
        let msl = profile.with_vertical_datum(Some(Arc::new(ConstantOffsetDatum::new("egm96", 10.0))));
        let source = Arc::new(MemorySource::new("mem", msl.clone(), 5));
        let key = TileKey::new(0, 0, 0, msl).unwrap();
        source.insert_constant(key.clone(), 100.0);
        let layer = ElevationLayer::new(ElevationLayerOptions::new("msl"), source);

        // ask for ellipsoid heights
        let hae_key = key.with_profile(profile);
        let geo = layer.create_height_field(&hae_key, &CancelToken::new()).unwrap().unwrap();
        assert_eq!(geo.grid().get(2, 2).value(), Some(110.0));
    }

    #[test]
    fn test_write_requires_support_and_request() {
        let profile = Profile::global_geodetic();
        let key = TileKey::new(0, 0, 0, profile.clone()).unwrap();
        let grid = HeightGrid::filled(5, 5, 1.0);
        let cancel = CancelToken::new();

        let source = Arc::new(MemorySource::new("rw", profile.clone(), 5).writable());
        let layer = ElevationLayer::new(ElevationLayerOptions::new("no-request"), source.clone());
        assert!(matches!(
            layer.write_height_field(&key, &grid, &cancel),
            Err(ElevationError::ServiceUnavailable)
        ));

        let mut options = ElevationLayerOptions::new("requested");
        options.writing_requested = true;
        let layer = ElevationLayer::new(options.clone(), source);
        layer.write_height_field(&key, &grid, &cancel).unwrap();

        let read_only = Arc::new(MemorySource::new("ro", profile, 5));
        let layer = ElevationLayer::new(options, read_only);
        assert!(matches!(
            layer.write_height_field(&key, &grid, &cancel),
            Err(ElevationError::ServiceUnavailable)
        ));
    }
}
