//! In-process cache tier with LRU eviction and a memory budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::cache::{CacheBin, CacheRecord};
use crate::error::ElevationResult;
use crate::terrain::grid::HeightGrid;

/// Default memory budget for the in-process tier
pub const DEFAULT_MEMORY_BUDGET_MB: u32 = 64;

/// Statistics for the memory tier.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_used_bytes: u64,
    pub memory_budget_bytes: u64,
}

struct CacheEntry {
    record: CacheRecord,
    memory_bytes: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    // least recently used first
    lru_order: Vec<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru_order.iter().position(|k| k == key) {
            let k = self.lru_order.remove(pos);
            self.lru_order.push(k);
        }
    }
}

/// Memory tier holding shared, immutable grids.
pub struct MemoryCacheBin {
    id: String,
    inner: Mutex<Inner>,
    memory_budget_bytes: u64,
    current_memory: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for MemoryCacheBin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBin")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryCacheBin {
    /// Create a new bin with the given memory budget in MB.
    pub fn new(id: impl Into<String>, budget_mb: u32) -> Self {
        Self::with_budget_bytes(id, (budget_mb as u64) * 1024 * 1024)
    }

    pub fn with_budget_bytes(id: impl Into<String>, budget_bytes: u64) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(Inner::default()),
            memory_budget_bytes: budget_bytes,
            current_memory: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert a shared grid without copying it
    pub fn insert(&self, key: &str, grid: Arc<HeightGrid>) {
        let memory_bytes = grid.memory_bytes();
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        if let Some(old) = inner.entries.remove(key) {
            self.current_memory
                .fetch_sub(old.memory_bytes as u64, Ordering::Relaxed);
            if let Some(pos) = inner.lru_order.iter().position(|k| k == key) {
                inner.lru_order.remove(pos);
            }
        }

        self.evict_to_budget(&mut inner, memory_bytes);

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                record: CacheRecord {
                    grid,
                    last_modified: SystemTime::now(),
                },
                memory_bytes,
            },
        );
        inner.lru_order.push(key.to_string());
        self.current_memory
            .fetch_add(memory_bytes as u64, Ordering::Relaxed);
    }

    /// Evict entries until there's room for new_bytes.
    fn evict_to_budget(&self, inner: &mut Inner, new_bytes: usize) {
        let target = self.memory_budget_bytes.saturating_sub(new_bytes as u64);

        while self.current_memory.load(Ordering::Relaxed) > target {
            if inner.lru_order.is_empty() {
                break;
            }
            let key = inner.lru_order.remove(0);
            if let Some(entry) = inner.entries.remove(&key) {
                self.current_memory
                    .fetch_sub(entry.memory_bytes as u64, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn stats(&self) -> MemoryCacheStats {
        MemoryCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            memory_used_bytes: self.current_memory.load(Ordering::Relaxed),
            memory_budget_bytes: self.memory_budget_bytes,
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.lru_order.clear();
        }
        self.current_memory.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBin for MemoryCacheBin {
    fn id(&self) -> &str {
        &self.id
    }

    fn read(&self, key: &str) -> ElevationResult<Option<CacheRecord>> {
        let Ok(mut inner) = self.inner.lock() else {
            return Ok(None);
        };
        let record = inner.entries.get(key).map(|e| e.record.clone());
        match record {
            Some(record) => {
                inner.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(record))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn write(&self, key: &str, grid: &HeightGrid) -> ElevationResult<()> {
        self.insert(key, Arc::new(grid.clone()));
        Ok(())
    }
}
