// src/cache/disk.rs
// File-backed persistent cache tier and the on-disk grid encoding
// RELEVANT FILES: src/cache/mod.rs, src/terrain/grid.rs

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{CacheBin, CacheRecord};
use crate::error::{ElevationError, ElevationResult};
use crate::terrain::grid::HeightGrid;

const GRID_MAGIC: [u8; 4] = *b"ELEV";
const GRID_VERSION: u32 = 1;
const FILE_EXTENSION: &str = "elev";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fixed 16-byte header in front of the samples. Integers are little-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GridHeader {
    magic: [u8; 4],
    version: u32,
    width: u32,
    height: u32,
}

const HEADER_LEN: usize = std::mem::size_of::<GridHeader>();

/// Serialize a grid: header followed by little-endian f32 samples, with
/// no data written as `NO_DATA_VALUE`.
pub fn encode_grid(grid: &HeightGrid) -> Vec<u8> {
    let header = GridHeader {
        magic: GRID_MAGIC,
        version: GRID_VERSION.to_le(),
        width: grid.width().to_le(),
        height: grid.height().to_le(),
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + grid.samples().len() * 4);
    bytes.extend_from_slice(bytemuck::bytes_of(&header));
    for sample in grid.samples() {
        bytes.extend_from_slice(&sample.to_raw().to_le_bytes());
    }
    bytes
}

/// Inverse of [`encode_grid`]. The decoded grid is validated.
pub fn decode_grid(bytes: &[u8]) -> ElevationResult<HeightGrid> {
    if bytes.len() < HEADER_LEN {
        return Err(ElevationError::invalid_grid(format!(
            "record of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let header: GridHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
    if header.magic != GRID_MAGIC {
        return Err(ElevationError::invalid_grid("bad magic"));
    }
    let version = u32::from_le(header.version);
    if version != GRID_VERSION {
        return Err(ElevationError::invalid_grid(format!("unsupported version {}", version)));
    }
    let width = u32::from_le(header.width);
    let height = u32::from_le(header.height);

    let body = &bytes[HEADER_LEN..];
    if body.len() % 4 != 0 {
        return Err(ElevationError::invalid_grid("truncated sample data"));
    }
    let raw: Vec<f32> = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let grid = HeightGrid::from_raw(width, height, raw);
    grid.validate()?;
    Ok(grid)
}

/// Persistent tier storing one file per key under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written record.
#[derive(Debug, Clone)]
pub struct DiskCacheBin {
    id: String,
    root: PathBuf,
}

impl DiskCacheBin {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> ElevationResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { id: id.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `key`. Path separators in the key become directories.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            let clean: String = segment
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            path.push(if clean.is_empty() { "_".to_string() } else { clean });
        }
        path.set_extension(FILE_EXTENSION);
        path
    }
}

impl CacheBin for DiskCacheBin {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self, key: &str) -> ElevationResult<Option<CacheRecord>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let last_modified = fs::metadata(&path)?.modified()?;
        let grid = decode_grid(&bytes)?;
        Ok(Some(CacheRecord {
            grid: Arc::new(grid),
            last_modified,
        }))
    }

    fn write(&self, key: &str, grid: &HeightGrid) -> ElevationResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encode_grid(grid))?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}
