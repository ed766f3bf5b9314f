use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::CacheConfig;
use crate::core::types::{
    DEFAULT_CACHE_NAME, DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_MAX_CACHE_SIZE,
};

/// Service-level configuration for a process hosting the cache
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    pub cache: CacheSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSection {
    pub name: String,
    pub max_cache_size_bytes: u64,
    pub event_channel_capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            max_cache_size_bytes: DEFAULT_MAX_CACHE_SIZE,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> anyhow::Result<Self> {
        let config: ServiceConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Convert to CacheConfig
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            name: self.cache.name.clone(),
            max_cache_size_bytes: self.cache.max_cache_size_bytes,
            event_channel_capacity: self.cache.event_channel_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = ServiceConfig::from_yaml_str("cache:\n  max_cache_size_bytes: 1024\n").unwrap();

        assert_eq!(config.cache.max_cache_size_bytes, 1024);
        assert_eq!(config.cache.event_channel_capacity, 1024);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(ServiceConfig::from_yaml_str("cache: [1, 2").is_err());
    }
}
