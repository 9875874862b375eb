//! Integration tests for the memory and persistent cache tiers
//!
//! These tests run layers against a disk tier in a temporary directory and
//! toggle the source offline to observe which tier served a request.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use elevstack::cache::{persistent_cache_key, CacheBin};
use elevstack::{
    CachePolicy, CacheUsage, CancelToken, DiskCacheBin, ElevationLayer, ElevationLayerOptions,
    HeightGrid, MemoryCacheBin, MemorySource, Profile, TileKey,
};

fn fixture(dir: &std::path::Path) -> (Arc<MemorySource>, Arc<DiskCacheBin>, TileKey) {
    let profile = Profile::global_geodetic();
    let source = Arc::new(MemorySource::new("dem", profile.clone(), 9));
    let key = TileKey::new(2, 5, 1, profile).unwrap();
    let raw: Vec<f32> = (0..81).map(|i| (i as f32).sqrt() * 12.5).collect();
    source.insert(key.clone(), HeightGrid::from_raw(9, 9, raw));
    let disk = Arc::new(DiskCacheBin::new("disk", dir).unwrap());
    (source, disk, key)
}

fn layer(
    options: ElevationLayerOptions,
    source: &Arc<MemorySource>,
    disk: &Arc<DiskCacheBin>,
) -> ElevationLayer {
    ElevationLayer::new(options, source.clone()).with_persistent_cache(disk.clone())
}

#[test]
fn test_persistent_round_trip_survives_source_outage() {
    let dir = tempfile::tempdir().unwrap();
    let (source, disk, key) = fixture(dir.path());
    let cancel = CancelToken::new();

    let first = layer(ElevationLayerOptions::new("dem"), &source, &disk)
        .create_height_field(&key, &cancel)
        .unwrap()
        .unwrap();
    assert!(disk.path_for(&persistent_cache_key(&key)).exists());

    // a new layer has a cold memory tier; only the disk can answer
    source.set_online(false);
    let second = layer(ElevationLayerOptions::new("dem"), &source, &disk)
        .create_height_field(&key, &cancel)
        .unwrap()
        .unwrap();
    second.grid().validate().unwrap();
    assert_eq!(first.grid().to_raw(), second.grid().to_raw());
    assert_eq!(source.fetch_count(), 1);
}

#[test]
fn test_expired_entry_is_last_resort() {
    let dir = tempfile::tempdir().unwrap();
    let (source, disk, key) = fixture(dir.path());
    let cancel = CancelToken::new();

    layer(ElevationLayerOptions::new("dem"), &source, &disk)
        .create_height_field(&key, &cancel)
        .unwrap()
        .unwrap();

    let mut options = ElevationLayerOptions::new("dem");
    options.cache_policy = CachePolicy::default().with_min_time(SystemTime::now() + Duration::from_secs(3600));

    // expired and the source is down: serve the stale grid
    source.set_online(false);
    let stale = layer(options.clone(), &source, &disk)
        .create_height_field(&key, &cancel)
        .unwrap();
    assert!(stale.is_some());
    assert_eq!(source.fetch_count(), 2);

    // expired and the source is back: fetch again
    source.set_online(true);
    let fresh = layer(options, &source, &disk)
        .create_height_field(&key, &cancel)
        .unwrap();
    assert!(fresh.is_some());
    assert_eq!(source.fetch_count(), 3);
}

#[test]
fn test_cache_only_never_touches_source() {
    let dir = tempfile::tempdir().unwrap();
    let (source, disk, key) = fixture(dir.path());
    let cancel = CancelToken::new();

    let mut options = ElevationLayerOptions::new("dem");
    options.cache_policy = CachePolicy::cache_only();
    let cache_only = layer(options, &source, &disk);
    assert!(cache_only.create_height_field(&key, &cancel).unwrap().is_none());
    assert_eq!(source.fetch_count(), 0);

    layer(ElevationLayerOptions::new("dem"), &source, &disk)
        .create_height_field(&key, &cancel)
        .unwrap()
        .unwrap();
    assert_eq!(source.fetch_count(), 1);

    let mut options = ElevationLayerOptions::new("dem");
    options.cache_policy = CachePolicy::cache_only();
    let cache_only = layer(options, &source, &disk);
    assert!(cache_only.create_height_field(&key, &cancel).unwrap().is_some());
    assert_eq!(source.fetch_count(), 1);
}

#[test]
fn test_read_only_and_no_cache_skip_writes() {
    for usage in [CacheUsage::ReadOnly, CacheUsage::NoCache] {
        let dir = tempfile::tempdir().unwrap();
        let (source, disk, key) = fixture(dir.path());

        let mut options = ElevationLayerOptions::new("dem");
        options.cache_policy = CachePolicy::new(usage);
        let grid = layer(options, &source, &disk)
            .create_height_field(&key, &CancelToken::new())
            .unwrap();
        assert!(grid.is_some());
        assert!(disk.read(&persistent_cache_key(&key)).unwrap().is_none(), "{:?}", usage);
    }
}

#[test]
fn test_canceled_request_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (source, disk, key) = fixture(dir.path());
    let memory = Arc::new(MemoryCacheBin::new("mem", 16));
    let dem = layer(ElevationLayerOptions::new("dem"), &source, &disk)
        .with_memory_cache(Some(memory.clone()));

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = dem.create_height_field(&key, &cancel).unwrap_err();
    assert!(err.is_canceled());
    assert!(memory.is_empty());
    assert!(disk.read(&persistent_cache_key(&key)).unwrap().is_none());
}

#[test]
fn test_cancel_during_assembly_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let disk = Arc::new(DiskCacheBin::new("disk", dir.path()).unwrap());
    let memory = Arc::new(MemoryCacheBin::new("mem", 16));

    let merc = Profile::spherical_mercator();
    let source = Arc::new(MemorySource::new("slow", merc.clone(), 9).with_latency(Duration::from_millis(300)));
    for x in 0..2 {
        for y in 0..2 {
            source.insert_constant(TileKey::new(1, x, y, merc.clone()).unwrap(), 8.0);
        }
    }
    let dem = Arc::new(
        ElevationLayer::new(ElevationLayerOptions::new("slow"), source.clone())
            .with_persistent_cache(disk.clone())
            .with_memory_cache(Some(memory.clone())),
    );

    // geodetic request, so the layer assembles from mercator tiles
    let key = TileKey::new(1, 1, 0, Profile::global_geodetic()).unwrap();
    let cancel = CancelToken::new();
    let request = {
        let dem = dem.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        thread::spawn(move || dem.create_height_field(&key, &cancel))
    };
    thread::sleep(Duration::from_millis(100));
    cancel.cancel();

    let err = request.join().unwrap().unwrap_err();
    assert!(err.is_canceled());
    assert!(source.fetch_count() >= 1);
    assert!(memory.is_empty());
    assert!(disk.read(&persistent_cache_key(&key)).unwrap().is_none());
}

#[test]
fn test_invalid_grid_is_never_cached() {
    let dir = tempfile::tempdir().unwrap();
    let (source, disk, _) = fixture(dir.path());
    let profile = Profile::global_geodetic();
    let bad_key = TileKey::new(2, 0, 0, profile).unwrap();
    source.insert(bad_key.clone(), HeightGrid::from_raw(1, 1, vec![5.0]));

    let memory = Arc::new(MemoryCacheBin::new("mem", 16));
    let dem = layer(ElevationLayerOptions::new("dem"), &source, &disk)
        .with_memory_cache(Some(memory.clone()));
    assert!(dem.create_height_field(&bad_key, &CancelToken::new()).unwrap().is_none());
    assert!(memory.is_empty());
    assert!(disk.read(&persistent_cache_key(&bad_key)).unwrap().is_none());
}

#[test]
fn test_memory_tier_revision_scoping() {
    let dir = tempfile::tempdir().unwrap();
    let (source, disk, key) = fixture(dir.path());
    let memory = Arc::new(MemoryCacheBin::new("mem", 16));
    let mut options = ElevationLayerOptions::new("dem");
    options.cache_policy = CachePolicy::no_cache();
    let dem = layer(options, &source, &disk).with_memory_cache(Some(memory.clone()));
    let cancel = CancelToken::new();

    dem.create_height_field(&key, &cancel).unwrap().unwrap();
    dem.create_height_field(&key, &cancel).unwrap().unwrap();
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(memory.stats().hits, 1);

    dem.bump_revision();
    dem.create_height_field(&key, &cancel).unwrap().unwrap();
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(memory.len(), 2);
}
