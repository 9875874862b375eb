// src/cache/policy.rs
// How a layer may use its cache tiers and when cached entries go stale
// RELEVANT FILES: src/cache/mod.rs, src/terrain/layer.rs, src/config.rs

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Read/write permission for the persistent tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUsage {
    #[default]
    ReadWrite,
    ReadOnly,
    /// Never touch a source; a cache miss means no data
    CacheOnly,
    #[serde(alias = "none")]
    NoCache,
}

/// Cache usage plus expiry rules.
///
/// An entry is expired when it is older than `max_age_secs` or was written
/// before `min_time_secs` (seconds since the Unix epoch).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub usage: CacheUsage,
    pub max_age_secs: Option<u64>,
    pub min_time_secs: Option<u64>,
}

impl CachePolicy {
    pub fn new(usage: CacheUsage) -> Self {
        Self {
            usage,
            ..Self::default()
        }
    }

    pub fn no_cache() -> Self {
        Self::new(CacheUsage::NoCache)
    }

    pub fn cache_only() -> Self {
        Self::new(CacheUsage::CacheOnly)
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = Some(max_age.as_secs());
        self
    }

    /// Treat anything stored before `min_time` as stale
    pub fn with_min_time(mut self, min_time: SystemTime) -> Self {
        self.min_time_secs = min_time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs());
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    pub fn min_time(&self) -> Option<SystemTime> {
        self.min_time_secs.map(|s| UNIX_EPOCH + Duration::from_secs(s))
    }

    pub fn is_cache_readable(&self) -> bool {
        self.usage != CacheUsage::NoCache
    }

    pub fn is_cache_writeable(&self) -> bool {
        self.usage == CacheUsage::ReadWrite
    }

    pub fn is_cache_only(&self) -> bool {
        self.usage == CacheUsage::CacheOnly
    }

    pub fn is_expired(&self, last_modified: SystemTime) -> bool {
        if let Some(min_time) = self.min_time() {
            if last_modified < min_time {
                return true;
            }
        }
        match self.max_age() {
            Some(max_age) => SystemTime::now()
                .duration_since(last_modified)
                .map_or(false, |age| age > max_age),
            None => false,
        }
    }
}
