pub mod artifact_cache;
pub mod entry;
pub mod error;
pub mod events;
pub mod handle;
mod store;
pub mod types;

pub use artifact_cache::ArtifactCache;
pub use entry::{CacheEntry, EntrySnapshot};
pub use error::{CacheError, Result};
pub use events::CacheEvent;
pub use handle::{Artifact, Hook, LoadError, LoadFuture, LoadHandle, LoadResult};
pub use types::{ArtifactClass, CacheConfig, CacheStats, RemovalReason};
