pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use config::{LoggingConfig, ServiceConfig};
pub use crate::core::{
    Artifact, ArtifactCache, ArtifactClass, CacheConfig, CacheError, CacheEvent, CacheStats,
    EntrySnapshot, LoadError, LoadHandle, LoadResult, RemovalReason,
};
pub use logging::init_tracing;
pub use metrics::encode_metrics;
