use serde::{Deserialize, Serialize};
use std::fmt;

/// Default byte budget: 3 GiB
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 3 * 1024 * 1024 * 1024;

/// Instance name used when none is configured
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Default capacity of the event broadcast channel
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Which collection an entry lives in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactClass {
    Image,
    Volume,
}

impl ArtifactClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Volume => "volume",
        }
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    /// Caller asked for it
    Explicit,
    /// Chosen by the LRU sweep or by `reserve`
    Evicted,
    /// Dropped by `purge_all`
    Purged,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Evicted => "evicted",
            Self::Purged => "purged",
        }
    }
}

/// Configuration for the artifact cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    /// Instance name; labels this cache's usage metrics
    pub name: String,
    /// Maximum total size of loaded artifacts in bytes
    pub max_cache_size_bytes: u64,
    /// Number of events buffered per observer before lagging
    pub event_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Statistics for the artifact cache
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    /// Image entries, loaded or pending
    pub image_entries: usize,
    /// Volume entries, loaded or pending
    pub volume_entries: usize,
    /// Entries whose load has not completed yet
    pub pending_loads: usize,
    /// Sum of sizes of all loaded entries
    pub current_size: u64,
    /// Configured byte budget
    pub max_size: u64,
    /// Load-handle lookups that found an entry, or artifact lookups that
    /// found a loaded one
    pub hits: u64,
    /// Lookups that found nothing usable; a pending entry is a miss for
    /// artifact lookups
    pub misses: u64,
    /// Accepted `put_*_load` calls
    pub puts: u64,
    /// Loads that completed and were accounted
    pub loads_completed: u64,
    /// Loads that rejected or produced a malformed artifact
    pub loads_failed: u64,
    /// Entries removed by the LRU sweep or `reserve`
    pub evictions: u64,
    /// Entries removed explicitly or by purge
    pub removals: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Fraction of the byte budget in use (0.0 when the budget is zero)
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.current_size as f64 / self.max_size as f64
        }
    }
}
