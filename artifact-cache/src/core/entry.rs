use super::handle::{Artifact, LoadHandle};
use super::types::ArtifactClass;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;

/// Bookkeeping record for one artifact
pub struct CacheEntry<A: Artifact> {
    pub id: String,
    pub class: ArtifactClass,
    pub load_handle: Arc<LoadHandle<A>>,
    /// Decoded payload, present once `loaded`
    pub artifact: Option<Arc<A>>,
    pub loaded: bool,
    /// Images only; copied from the artifact on completion
    pub shared_key: Option<String>,
    /// Last access time
    pub time_stamp: Instant,
    /// Monotonic access counter; orders eviction candidates
    pub recency: u64,
    /// Zero until loaded
    pub size_in_bytes: u64,
    /// Distinguishes this entry from earlier entries with the same id
    pub(crate) generation: u64,
    /// Task applying the load outcome; aborted if the entry leaves while pending
    pub(crate) observer: Option<AbortHandle>,
}

impl<A: Artifact> CacheEntry<A> {
    pub(crate) fn pending(
        id: String,
        class: ArtifactClass,
        load_handle: Arc<LoadHandle<A>>,
        recency: u64,
        generation: u64,
    ) -> Self {
        Self {
            id,
            class,
            load_handle,
            artifact: None,
            loaded: false,
            shared_key: None,
            time_stamp: Instant::now(),
            recency,
            size_in_bytes: 0,
            generation,
            observer: None,
        }
    }

    /// Update access time
    pub(crate) fn touch(&mut self, recency: u64) {
        self.time_stamp = Instant::now();
        self.recency = recency;
    }

    pub fn snapshot(&self) -> EntrySnapshot<A> {
        EntrySnapshot {
            id: self.id.clone(),
            class: self.class,
            loaded: self.loaded,
            size_in_bytes: self.size_in_bytes,
            shared_key: self.shared_key.clone(),
            time_stamp: self.time_stamp,
            artifact: self.artifact.clone(),
        }
    }
}

impl<A: Artifact> fmt::Debug for CacheEntry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("loaded", &self.loaded)
            .field("shared_key", &self.shared_key)
            .field("recency", &self.recency)
            .field("size_in_bytes", &self.size_in_bytes)
            .finish()
    }
}

/// Point-in-time copy of an entry, carried by events and lookups
pub struct EntrySnapshot<A: Artifact> {
    pub id: String,
    pub class: ArtifactClass,
    pub loaded: bool,
    pub size_in_bytes: u64,
    pub shared_key: Option<String>,
    pub time_stamp: Instant,
    pub artifact: Option<Arc<A>>,
}

impl<A: Artifact> Clone for EntrySnapshot<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            class: self.class,
            loaded: self.loaded,
            size_in_bytes: self.size_in_bytes,
            shared_key: self.shared_key.clone(),
            time_stamp: self.time_stamp,
            artifact: self.artifact.clone(),
        }
    }
}

impl<A: Artifact> fmt::Debug for EntrySnapshot<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntrySnapshot")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("loaded", &self.loaded)
            .field("size_in_bytes", &self.size_in_bytes)
            .field("shared_key", &self.shared_key)
            .finish()
    }
}
