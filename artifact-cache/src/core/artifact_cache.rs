//! Size-bounded cache of asynchronously loaded images and volumes
//!
//! Every `put_*_load` inserts a pending entry immediately so concurrent
//! lookups see the in-flight load, then a Tokio task observes the load
//! future and applies the outcome under the store lock. Removal hooks and
//! event delivery always run after the lock is released.

use super::entry::{CacheEntry, EntrySnapshot};
use super::error::{CacheError, Result};
use super::events::{CacheEvent, EventChannel};
use super::handle::{Artifact, LoadFuture, LoadHandle, LoadResult};
use super::store::{Completion, EntryStore};
use super::types::{ArtifactClass, CacheConfig, CacheStats, RemovalReason};
use crate::metrics;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// In-memory cache for image and volume artifacts with a byte budget
///
/// Cloning is cheap; clones share the same entries and event channel.
pub struct ArtifactCache<I: Artifact, V: Artifact> {
    name: Arc<str>,
    store: Arc<Mutex<EntryStore<I, V>>>,
    events: Arc<EventChannel<I, V>>,
}

impl<I: Artifact, V: Artifact> Clone for ArtifactCache<I, V> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: Arc::clone(&self.store),
            events: Arc::clone(&self.events),
        }
    }
}

impl<I: Artifact, V: Artifact> Default for ArtifactCache<I, V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<I: Artifact, V: Artifact> ArtifactCache<I, V> {
    /// Create a new cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        info!(
            "Initializing artifact cache {} with max_size={} bytes, event_capacity={}",
            config.name, config.max_cache_size_bytes, config.event_channel_capacity
        );

        let cache = Self {
            name: Arc::from(config.name.as_str()),
            store: Arc::new(Mutex::new(EntryStore::new(config.max_cache_size_bytes))),
            events: Arc::new(EventChannel::new(config.event_channel_capacity)),
        };
        cache.publish_usage();
        cache
    }

    /// Receive add/remove notifications from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent<I, V>> {
        self.events.subscribe()
    }

    /// Instance name used to label this cache's metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observer_count(&self) -> usize {
        self.events.observer_count()
    }

    // ========================================================================
    // Size accounting
    // ========================================================================

    /// Set the byte budget.
    ///
    /// Fails with [`CacheError::Configuration`] when `bytes` is below the
    /// current total; lowering the ceiling never evicts.
    pub fn set_max_cache_size(&self, bytes: u64) -> Result<()> {
        let result = self.store.lock().set_max_size(bytes);
        match &result {
            Ok(()) => info!("Max cache size set to {} bytes", bytes),
            Err(err) => warn!("Rejected max cache size {}: {}", bytes, err),
        }
        self.publish_usage();
        result
    }

    /// Sum of the sizes of all loaded entries
    pub fn current_size(&self) -> u64 {
        self.store.lock().current_size()
    }

    pub fn max_size(&self) -> u64 {
        self.store.lock().max_size()
    }

    /// Bytes left before the budget is reached
    pub fn unallocated_bytes(&self) -> u64 {
        self.store.lock().headroom()
    }

    /// Pre-flight check before starting a load of known size.
    ///
    /// Returns [`CacheError::CapacityExceeded`] when adding `byte_length`
    /// would push the total past the budget.
    pub fn will_exceed(&self, byte_length: u64) -> Result<()> {
        let result = self.store.lock().will_exceed(byte_length);
        if let Err(err) = &result {
            debug!("Capacity pre-check failed: {}", err);
        }
        result
    }

    /// Whether `byte_length` could fit once every loaded image is evicted
    pub fn is_cacheable(&self, byte_length: u64) -> bool {
        let store = self.store.lock();
        byte_length <= store.headroom().saturating_add(store.evictable_bytes())
    }

    // ========================================================================
    // Images
    // ========================================================================

    /// Track an image load under `id`.
    ///
    /// The entry is visible to lookups as soon as this returns. The returned
    /// task applies the load outcome; it may be awaited or dropped.
    pub fn put_image_load(&self, id: &str, handle: LoadHandle<I>) -> Result<JoinHandle<()>> {
        let (promise, runtime) = Self::prepare_load(id, &handle)?;
        let generation = self
            .store
            .lock()
            .insert_image(id, Arc::new(handle))
            .inspect_err(|err| metrics::record_cache_op("image", "put", err.kind()))?;

        debug!("PUT image id={}", id);
        metrics::record_cache_op("image", "put", "success");
        self.publish_usage();

        let cache = self.clone();
        let task_id = id.to_string();
        let started = Instant::now();
        let observer = runtime.spawn(async move {
            let outcome = promise.await;
            cache.finish_image_load(&task_id, generation, outcome, started);
        });
        self.store.lock().attach_observer(
            ArtifactClass::Image,
            id,
            generation,
            observer.abort_handle(),
        );
        Ok(observer)
    }

    /// Load handle for `id`, refreshing its recency. `None` when not cached.
    pub fn get_image_load(&self, id: &str) -> Result<Option<Arc<LoadHandle<I>>>> {
        validate_id(id)?;
        let handle = {
            let mut store = self.store.lock();
            let handle = store
                .touch_image(id)
                .map(|entry| Arc::clone(&entry.load_handle));
            store.record_lookup(handle.is_some());
            handle
        };
        debug!("GET image load id={}, hit={}", id, handle.is_some());
        Ok(handle)
    }

    /// Completed image, refreshing its recency. `None` when absent or pending.
    pub fn get_image(&self, id: &str) -> Result<Option<Arc<I>>> {
        validate_id(id)?;
        let artifact = {
            let mut store = self.store.lock();
            let artifact = store
                .touch_image(id)
                .and_then(|entry| entry.artifact.clone());
            store.record_lookup(artifact.is_some());
            artifact
        };
        Ok(artifact)
    }

    /// Snapshot of an image entry without touching its recency
    pub fn get_image_entry(&self, id: &str) -> Option<EntrySnapshot<I>> {
        self.store.lock().images.get(id).map(CacheEntry::snapshot)
    }

    pub fn has_image(&self, id: &str) -> bool {
        self.store.lock().images.contains(id)
    }

    pub fn image_ids(&self) -> Vec<String> {
        self.store.lock().images.ids()
    }

    /// Remove an image, cancelling its load and releasing its resources
    pub fn remove_image_load(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let entry = self
            .store
            .lock()
            .remove_image(id)
            .inspect_err(|err| metrics::record_cache_op("image", "remove", err.kind()))?;

        debug!("REMOVE image id={}, size={}", id, entry.size_in_bytes);
        metrics::record_cache_op("image", "remove", "success");
        self.release_images(vec![entry], RemovalReason::Explicit);
        self.publish_usage();
        Ok(())
    }

    fn finish_image_load(
        &self,
        id: &str,
        generation: u64,
        outcome: LoadResult<I>,
        started: Instant,
    ) {
        match outcome {
            Ok(artifact) => {
                let (completion, evicted) = {
                    let mut store = self.store.lock();
                    let completion = store.complete_image(id, generation, artifact);
                    let evicted = match completion {
                        Completion::Loaded(_) => store.evict_over_budget(),
                        _ => Vec::new(),
                    };
                    (completion, evicted)
                };

                match completion {
                    Completion::Loaded(snapshot) => {
                        debug!(
                            "Image {} loaded ({} bytes), evicting {} entries",
                            id,
                            snapshot.size_in_bytes,
                            evicted.len()
                        );
                        metrics::record_cache_op("image", "complete", "success");
                        metrics::record_load_duration("image", started.elapsed().as_secs_f64());
                        self.events.emit(CacheEvent::ImageAdded(snapshot));
                        self.release_images(evicted, RemovalReason::Evicted);
                    }
                    Completion::Stale => {
                        debug!("Image {} was removed while loading, discarding result", id);
                    }
                    Completion::Malformed(err) => {
                        warn!("Discarding image load: {}", err);
                        metrics::record_cache_op("image", "complete", err.kind());
                    }
                }
            }
            Err(err) => {
                if self.store.lock().fail(ArtifactClass::Image, id, generation) {
                    let err = CacheError::LoadFailed {
                        id: id.to_string(),
                        reason: err.to_string(),
                    };
                    warn!("Discarding image load: {}", err);
                    metrics::record_cache_op("image", "complete", err.kind());
                } else {
                    debug!("Image load {} failed after removal: {}", id, err);
                }
            }
        }
        self.publish_usage();
    }

    fn release_images(&self, entries: Vec<CacheEntry<I>>, reason: RemovalReason) {
        for entry in entries {
            metrics::record_removal("image", reason.as_str());
            self.events.emit(CacheEvent::ImageRemoved {
                entry: entry.snapshot(),
                reason,
            });
            release_entry(entry);
        }
    }

    // ========================================================================
    // Volumes
    // ========================================================================

    /// Track a volume load under `id`. Volumes are never auto-evicted.
    pub fn put_volume_load(&self, id: &str, handle: LoadHandle<V>) -> Result<JoinHandle<()>> {
        let (promise, runtime) = Self::prepare_load(id, &handle)?;
        let generation = self
            .store
            .lock()
            .insert_volume(id, Arc::new(handle))
            .inspect_err(|err| metrics::record_cache_op("volume", "put", err.kind()))?;

        debug!("PUT volume id={}", id);
        metrics::record_cache_op("volume", "put", "success");
        self.publish_usage();

        let cache = self.clone();
        let task_id = id.to_string();
        let started = Instant::now();
        let observer = runtime.spawn(async move {
            let outcome = promise.await;
            cache.finish_volume_load(&task_id, generation, outcome, started);
        });
        self.store.lock().attach_observer(
            ArtifactClass::Volume,
            id,
            generation,
            observer.abort_handle(),
        );
        Ok(observer)
    }

    pub fn get_volume_load(&self, id: &str) -> Result<Option<Arc<LoadHandle<V>>>> {
        validate_id(id)?;
        let handle = {
            let mut store = self.store.lock();
            let handle = store
                .touch_volume(id)
                .map(|entry| Arc::clone(&entry.load_handle));
            store.record_lookup(handle.is_some());
            handle
        };
        debug!("GET volume load id={}, hit={}", id, handle.is_some());
        Ok(handle)
    }

    pub fn get_volume(&self, id: &str) -> Result<Option<Arc<V>>> {
        validate_id(id)?;
        let artifact = {
            let mut store = self.store.lock();
            let artifact = store
                .touch_volume(id)
                .and_then(|entry| entry.artifact.clone());
            store.record_lookup(artifact.is_some());
            artifact
        };
        Ok(artifact)
    }

    pub fn get_volume_entry(&self, id: &str) -> Option<EntrySnapshot<V>> {
        self.store.lock().volumes.get(id).map(CacheEntry::snapshot)
    }

    pub fn has_volume(&self, id: &str) -> bool {
        self.store.lock().volumes.contains(id)
    }

    pub fn volume_ids(&self) -> Vec<String> {
        self.store.lock().volumes.ids()
    }

    pub fn remove_volume_load(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let entry = self
            .store
            .lock()
            .remove_volume(id)
            .inspect_err(|err| metrics::record_cache_op("volume", "remove", err.kind()))?;

        debug!("REMOVE volume id={}, size={}", id, entry.size_in_bytes);
        metrics::record_cache_op("volume", "remove", "success");
        self.release_volumes(vec![entry], RemovalReason::Explicit);
        self.publish_usage();
        Ok(())
    }

    fn finish_volume_load(
        &self,
        id: &str,
        generation: u64,
        outcome: LoadResult<V>,
        started: Instant,
    ) {
        match outcome {
            Ok(artifact) => {
                let completion = self.store.lock().complete_volume(id, generation, artifact);
                match completion {
                    Completion::Loaded(snapshot) => {
                        debug!("Volume {} loaded ({} bytes)", id, snapshot.size_in_bytes);
                        metrics::record_cache_op("volume", "complete", "success");
                        metrics::record_load_duration("volume", started.elapsed().as_secs_f64());
                        self.events.emit(CacheEvent::VolumeAdded(snapshot));
                    }
                    Completion::Stale => {
                        debug!("Volume {} was removed while loading, discarding result", id);
                    }
                    Completion::Malformed(err) => {
                        warn!("Discarding volume load: {}", err);
                        metrics::record_cache_op("volume", "complete", err.kind());
                    }
                }
            }
            Err(err) => {
                if self.store.lock().fail(ArtifactClass::Volume, id, generation) {
                    let err = CacheError::LoadFailed {
                        id: id.to_string(),
                        reason: err.to_string(),
                    };
                    warn!("Discarding volume load: {}", err);
                    metrics::record_cache_op("volume", "complete", err.kind());
                } else {
                    debug!("Volume load {} failed after removal: {}", id, err);
                }
            }
        }
        self.publish_usage();
    }

    fn release_volumes(&self, entries: Vec<CacheEntry<V>>, reason: RemovalReason) {
        for entry in entries {
            metrics::record_removal("volume", reason.as_str());
            self.events.emit(CacheEvent::VolumeRemoved {
                entry: entry.snapshot(),
                reason,
            });
            release_entry(entry);
        }
    }

    // ========================================================================
    // Eviction & teardown
    // ========================================================================

    /// Evict least recently used images until `num_bytes` of headroom exist.
    ///
    /// Returns the headroom available afterwards, which is less than
    /// `num_bytes` when there was nothing left to evict.
    pub fn reserve(&self, num_bytes: u64) -> u64 {
        let (evicted, headroom) = self.store.lock().reserve(num_bytes);
        if headroom < num_bytes {
            debug!(
                "Reserve of {} bytes fell short: {} bytes available",
                num_bytes, headroom
            );
        }
        self.release_images(evicted, RemovalReason::Evicted);
        self.publish_usage();
        headroom
    }

    /// Remove every image and then every volume
    pub fn purge_all(&self) {
        let (images, volumes) = self.store.lock().drain();
        info!(
            "Purging artifact cache ({} images, {} volumes)",
            images.len(),
            volumes.len()
        );
        self.release_images(images, RemovalReason::Purged);
        self.release_volumes(volumes, RemovalReason::Purged);
        self.publish_usage();
    }

    /// Get statistics
    pub fn stats(&self) -> CacheStats {
        self.store.lock().stats()
    }

    /// Recompute the total from the loaded entries
    pub fn accounted_size(&self) -> u64 {
        self.store.lock().accounted_bytes()
    }

    fn prepare_load<A: Artifact>(
        id: &str,
        handle: &LoadHandle<A>,
    ) -> Result<(LoadFuture<A>, Handle)> {
        validate_id(id)?;
        let promise = handle.promise().ok_or_else(|| {
            CacheError::Validation(format!("load handle for {} has no pending result", id))
        })?;
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::Configuration("observing loads requires a Tokio runtime".to_string())
        })?;
        Ok((promise, runtime))
    }

    fn publish_usage(&self) {
        let (used, max, images, volumes) = self.store.lock().usage();
        metrics::update_cache_usage(&self.name, used, max, images, volumes);
    }
}

impl<I: Artifact, V: Artifact> fmt::Debug for ArtifactCache<I, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("ArtifactCache")
            .field("images", &stats.image_entries)
            .field("volumes", &stats.volume_entries)
            .field("current_size", &stats.current_size)
            .field("max_size", &stats.max_size)
            .finish()
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CacheError::Validation("id must not be empty".to_string()));
    }
    Ok(())
}

/// Cancel then decache; hook failures are logged, never propagated.
///
/// A pending entry's observer task is aborted last so an abandoned load
/// does not keep the cache alive. Loaded entries are skipped: their task
/// has finished or is the one running this removal.
fn release_entry<A: Artifact>(entry: CacheEntry<A>) {
    if let Some(Err(err)) = entry.load_handle.cancel() {
        warn!("Cancel hook for {} {} failed: {}", entry.class, entry.id, err);
    }
    if let Some(Err(err)) = entry.load_handle.decache() {
        warn!("Decache hook for {} {} failed: {}", entry.class, entry.id, err);
    }
    if !entry.loaded {
        if let Some(observer) = &entry.observer {
            observer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Slice(u64);

    impl Artifact for Slice {
        fn size_in_bytes(&self) -> Option<u64> {
            Some(self.0)
        }
    }

    type TestCache = ArtifactCache<Slice, Slice>;

    fn cache(max: u64) -> TestCache {
        ArtifactCache::new(CacheConfig {
            max_cache_size_bytes: max,
            ..Default::default()
        })
    }

    #[test]
    fn test_put_without_runtime_is_configuration_error() {
        let cache = cache(100);
        let err = cache
            .put_image_load("a", LoadHandle::ready(Slice(1)))
            .unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(!cache.has_image("a"));
    }

    #[tokio::test]
    async fn test_empty_id_rejected() {
        let cache = cache(100);
        let err = cache
            .put_image_load("", LoadHandle::ready(Slice(1)))
            .unwrap_err();
        assert!(matches!(err, CacheError::Validation(_)));
        assert!(cache.get_image_load("  ").is_err());
        assert!(cache.get_volume("").is_err());
        assert!(cache.image_ids().is_empty());
    }

    #[tokio::test]
    async fn test_ready_load_completes() {
        let cache = cache(100);
        cache
            .put_image_load("a", LoadHandle::ready(Slice(10)))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(cache.current_size(), 10);
        assert_eq!(cache.get_image("a").unwrap().unwrap().0, 10);
        assert_eq!(cache.accounted_size(), 10);
    }

    #[tokio::test]
    async fn test_is_cacheable_counts_evictable_images() {
        let cache = cache(100);
        cache
            .put_image_load("a", LoadHandle::ready(Slice(60)))
            .unwrap()
            .await
            .unwrap();
        cache
            .put_volume_load("v", LoadHandle::ready(Slice(30)))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(cache.unallocated_bytes(), 10);
        assert!(cache.is_cacheable(70));
        assert!(!cache.is_cacheable(71));
    }

    #[tokio::test]
    async fn test_debug_output() {
        let cache = cache(100);
        let text = format!("{:?}", cache);
        assert!(text.contains("max_size: 100"));
    }
}
