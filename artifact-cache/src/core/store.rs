//! Entry store and size accounting
//!
//! Holds both keyed collections, the running byte total and the recency
//! index of loaded images. Nothing here runs hooks or emits events; callers
//! receive the removed entries and finish the removal outside the lock.

use super::entry::{CacheEntry, EntrySnapshot};
use super::error::{CacheError, Result};
use super::handle::{Artifact, LoadHandle};
use super::types::{ArtifactClass, CacheStats};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::debug;

/// Entries of a single artifact class
pub(crate) struct Collection<A: Artifact> {
    class: ArtifactClass,
    entries: HashMap<String, CacheEntry<A>>,
}

impl<A: Artifact> Collection<A> {
    fn new(class: ArtifactClass) -> Self {
        Self {
            class,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&CacheEntry<A>> {
        self.entries.get(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.loaded).count()
    }

    fn loaded_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| e.loaded)
            .fold(0u64, |total, e| total.saturating_add(e.size_in_bytes))
    }

    fn not_found(&self, id: &str) -> CacheError {
        CacheError::NotFound(format!("{} {}", self.class, id))
    }

    /// Entry for `id` only if it is the same insertion as `generation`
    fn current_mut(&mut self, id: &str, generation: u64) -> Option<&mut CacheEntry<A>> {
        self.entries
            .get_mut(id)
            .filter(|entry| entry.generation == generation)
    }
}

/// Result of applying a finished load to the store
pub(crate) enum Completion<A: Artifact> {
    /// Entry is accounted; carries its post-completion state
    Loaded(EntrySnapshot<A>),
    /// Entry was removed (or replaced) before the load finished
    Stale,
    /// Artifact violated its contract; the entry was dropped
    Malformed(CacheError),
}

/// Shared mutable state of the cache; guarded by a single mutex
pub(crate) struct EntryStore<I: Artifact, V: Artifact> {
    pub(crate) images: Collection<I>,
    pub(crate) volumes: Collection<V>,
    /// Loaded images keyed by recency, oldest first
    image_recency: BTreeMap<u64, String>,
    current_size: u64,
    max_size: u64,
    clock: u64,
    next_generation: u64,
    stats: CacheStats,
}

impl<I: Artifact, V: Artifact> EntryStore<I, V> {
    pub(crate) fn new(max_size: u64) -> Self {
        Self {
            images: Collection::new(ArtifactClass::Image),
            volumes: Collection::new(ArtifactClass::Volume),
            image_recency: BTreeMap::new(),
            current_size: 0,
            max_size,
            clock: 0,
            next_generation: 0,
            stats: CacheStats::default(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn current_size(&self) -> u64 {
        self.current_size
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.max_size
    }

    pub(crate) fn headroom(&self) -> u64 {
        self.max_size.saturating_sub(self.current_size)
    }

    /// Lowering the ceiling below the current total is rejected, never evicts
    pub(crate) fn set_max_size(&mut self, max_size: u64) -> Result<()> {
        if max_size < self.current_size {
            return Err(CacheError::Configuration(format!(
                "max cache size {} is smaller than current size {}",
                max_size, self.current_size
            )));
        }
        self.max_size = max_size;
        Ok(())
    }

    pub(crate) fn will_exceed(&self, byte_length: u64) -> Result<()> {
        let available = self.headroom();
        if byte_length > available {
            return Err(CacheError::CapacityExceeded {
                requested: byte_length,
                available,
            });
        }
        Ok(())
    }

    /// Bytes held by images that eviction could reclaim
    pub(crate) fn evictable_bytes(&self) -> u64 {
        self.images.loaded_bytes()
    }

    // ------------------------------------------------------------------
    // Insertion & lookup
    // ------------------------------------------------------------------

    pub(crate) fn insert_image(&mut self, id: &str, handle: Arc<LoadHandle<I>>) -> Result<u64> {
        let exists = self.images.contains(id);
        let (recency, generation) = self.prepare_insert(id, exists)?;
        self.images.entries.insert(
            id.to_string(),
            CacheEntry::pending(id.to_string(), ArtifactClass::Image, handle, recency, generation),
        );
        Ok(generation)
    }

    pub(crate) fn insert_volume(&mut self, id: &str, handle: Arc<LoadHandle<V>>) -> Result<u64> {
        let exists = self.volumes.contains(id);
        let (recency, generation) = self.prepare_insert(id, exists)?;
        self.volumes.entries.insert(
            id.to_string(),
            CacheEntry::pending(id.to_string(), ArtifactClass::Volume, handle, recency, generation),
        );
        Ok(generation)
    }

    fn prepare_insert(&mut self, id: &str, exists: bool) -> Result<(u64, u64)> {
        if exists {
            return Err(CacheError::Validation(format!(
                "id {} is already present in the cache",
                id
            )));
        }
        self.next_generation += 1;
        self.stats.puts += 1;
        Ok((self.tick(), self.next_generation))
    }

    /// Count a lookup. Callers decide what a hit is: a present entry for
    /// load-handle lookups, a loaded one for artifact lookups.
    pub(crate) fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }

    /// Keep the observer task of a pending entry so removal can abort it
    pub(crate) fn attach_observer(
        &mut self,
        class: ArtifactClass,
        id: &str,
        generation: u64,
        observer: AbortHandle,
    ) {
        match class {
            ArtifactClass::Image => {
                if let Some(entry) = self.images.current_mut(id, generation) {
                    entry.observer = Some(observer);
                }
            }
            ArtifactClass::Volume => {
                if let Some(entry) = self.volumes.current_mut(id, generation) {
                    entry.observer = Some(observer);
                }
            }
        }
    }

    /// Look up an image and refresh its recency
    pub(crate) fn touch_image(&mut self, id: &str) -> Option<&CacheEntry<I>> {
        if !self.images.contains(id) {
            return None;
        }
        let recency = self.tick();
        let entry = self.images.entries.get_mut(id)?;
        if entry.loaded {
            self.image_recency.remove(&entry.recency);
            self.image_recency.insert(recency, id.to_string());
        }
        entry.touch(recency);
        Some(&*entry)
    }

    /// Look up a volume and refresh its recency
    pub(crate) fn touch_volume(&mut self, id: &str) -> Option<&CacheEntry<V>> {
        if !self.volumes.contains(id) {
            return None;
        }
        let recency = self.tick();
        let entry = self.volumes.entries.get_mut(id)?;
        entry.touch(recency);
        Some(&*entry)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    pub(crate) fn complete_image(
        &mut self,
        id: &str,
        generation: u64,
        artifact: Arc<I>,
    ) -> Completion<I> {
        let Some(size) = self.validate_completion(ArtifactClass::Image, id, generation, &*artifact)
        else {
            return Completion::Stale;
        };
        let size = match size {
            Ok(size) => size,
            Err(err) => {
                self.images.entries.remove(id);
                self.stats.loads_failed += 1;
                return Completion::Malformed(err);
            }
        };

        let recency = self.tick();
        let Some(entry) = self.images.current_mut(id, generation) else {
            return Completion::Stale;
        };
        entry.shared_key = artifact.shared_key().map(str::to_string);
        entry.artifact = Some(artifact);
        entry.loaded = true;
        entry.size_in_bytes = size;
        entry.touch(recency);
        let snapshot = entry.snapshot();

        self.image_recency.insert(recency, id.to_string());
        self.current_size = self.current_size.saturating_add(size);
        self.stats.loads_completed += 1;
        Completion::Loaded(snapshot)
    }

    pub(crate) fn complete_volume(
        &mut self,
        id: &str,
        generation: u64,
        artifact: Arc<V>,
    ) -> Completion<V> {
        let Some(size) =
            self.validate_completion(ArtifactClass::Volume, id, generation, &*artifact)
        else {
            return Completion::Stale;
        };
        let size = match size {
            Ok(size) => size,
            Err(err) => {
                self.volumes.entries.remove(id);
                self.stats.loads_failed += 1;
                return Completion::Malformed(err);
            }
        };

        let recency = self.tick();
        let Some(entry) = self.volumes.current_mut(id, generation) else {
            return Completion::Stale;
        };
        entry.artifact = Some(artifact);
        entry.loaded = true;
        entry.size_in_bytes = size;
        entry.touch(recency);
        let snapshot = entry.snapshot();

        self.current_size = self.current_size.saturating_add(size);
        self.stats.loads_completed += 1;
        Completion::Loaded(snapshot)
    }

    /// `None` when the completion is stale, otherwise the reported size.
    ///
    /// Runs before the entry is touched so a rejected size leaves no trace.
    fn validate_completion<A: Artifact>(
        &self,
        class: ArtifactClass,
        id: &str,
        generation: u64,
        artifact: &A,
    ) -> Option<Result<u64>> {
        let present = match class {
            ArtifactClass::Image => self
                .images
                .get(id)
                .is_some_and(|e| e.generation == generation && !e.loaded),
            ArtifactClass::Volume => self
                .volumes
                .get(id)
                .is_some_and(|e| e.generation == generation && !e.loaded),
        };
        if !present {
            return None;
        }
        let malformed = |reason: String| CacheError::MalformedArtifact {
            id: id.to_string(),
            reason,
        };
        let checked = match artifact.size_in_bytes() {
            None => Err(malformed("artifact did not report a size".to_string())),
            Some(size) if self.current_size.checked_add(size).is_none() => Err(malformed(format!(
                "size {} overflows the running total {}",
                size, self.current_size
            ))),
            Some(size) => Ok(size),
        };
        Some(checked)
    }

    /// Drop a pending entry whose load rejected. Returns false when stale.
    pub(crate) fn fail(&mut self, class: ArtifactClass, id: &str, generation: u64) -> bool {
        let removed = match class {
            ArtifactClass::Image => {
                let pending = self.images.current_mut(id, generation).is_some_and(|e| !e.loaded);
                pending && self.images.entries.remove(id).is_some()
            }
            ArtifactClass::Volume => {
                let pending = self.volumes.current_mut(id, generation).is_some_and(|e| !e.loaded);
                pending && self.volumes.entries.remove(id).is_some()
            }
        };
        if removed {
            self.stats.loads_failed += 1;
        }
        removed
    }

    // ------------------------------------------------------------------
    // Removal & eviction
    // ------------------------------------------------------------------

    pub(crate) fn remove_image(&mut self, id: &str) -> Result<CacheEntry<I>> {
        let entry = self.take_image(id)?;
        self.stats.removals += 1;
        Ok(entry)
    }

    pub(crate) fn remove_volume(&mut self, id: &str) -> Result<CacheEntry<V>> {
        let entry = self
            .volumes
            .entries
            .remove(id)
            .ok_or_else(|| self.volumes.not_found(id))?;
        self.current_size = self.current_size.saturating_sub(entry.size_in_bytes);
        self.stats.removals += 1;
        Ok(entry)
    }

    fn take_image(&mut self, id: &str) -> Result<CacheEntry<I>> {
        let entry = self
            .images
            .entries
            .remove(id)
            .ok_or_else(|| self.images.not_found(id))?;
        if entry.loaded {
            self.image_recency.remove(&entry.recency);
        }
        self.current_size = self.current_size.saturating_sub(entry.size_in_bytes);
        Ok(entry)
    }

    /// Remove the least recently used loaded image
    fn evict_oldest_image(&mut self) -> Option<CacheEntry<I>> {
        let (_, id) = self.image_recency.pop_first()?;
        let entry = self.images.entries.remove(&id)?;
        self.current_size = self.current_size.saturating_sub(entry.size_in_bytes);
        self.stats.evictions += 1;
        debug!(
            "Evicting image {} ({} bytes), total now {}",
            id, entry.size_in_bytes, self.current_size
        );
        Some(entry)
    }

    /// Evict oldest loaded images until the total fits the budget
    pub(crate) fn evict_over_budget(&mut self) -> Vec<CacheEntry<I>> {
        let mut evicted = Vec::new();
        while self.current_size > self.max_size {
            match self.evict_oldest_image() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        evicted
    }

    /// Evict oldest loaded images until `num_bytes` of headroom exist
    pub(crate) fn reserve(&mut self, num_bytes: u64) -> (Vec<CacheEntry<I>>, u64) {
        let mut evicted = Vec::new();
        while self.headroom() < num_bytes {
            match self.evict_oldest_image() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        (evicted, self.headroom())
    }

    /// Empty both collections
    pub(crate) fn drain(&mut self) -> (Vec<CacheEntry<I>>, Vec<CacheEntry<V>>) {
        let images: Vec<_> = self.images.entries.drain().map(|(_, e)| e).collect();
        let volumes: Vec<_> = self.volumes.entries.drain().map(|(_, e)| e).collect();
        self.image_recency.clear();
        self.current_size = 0;
        self.stats.removals += (images.len() + volumes.len()) as u64;
        (images, volumes)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Recompute the total from the entries; equals `current_size` at rest
    pub(crate) fn accounted_bytes(&self) -> u64 {
        self.images
            .loaded_bytes()
            .saturating_add(self.volumes.loaded_bytes())
    }

    /// Byte and entry counts for the usage gauges; O(1)
    pub(crate) fn usage(&self) -> (u64, u64, usize, usize) {
        (
            self.current_size,
            self.max_size,
            self.images.len(),
            self.volumes.len(),
        )
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            image_entries: self.images.len(),
            volume_entries: self.volumes.len(),
            pending_loads: self.images.pending_count() + self.volumes.pending_count(),
            current_size: self.current_size,
            max_size: self.max_size,
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Blob {
        size: Option<u64>,
        key: Option<String>,
    }

    impl Artifact for Blob {
        fn size_in_bytes(&self) -> Option<u64> {
            self.size
        }

        fn shared_key(&self) -> Option<&str> {
            self.key.as_deref()
        }
    }

    fn blob(size: u64) -> Arc<Blob> {
        Arc::new(Blob {
            size: Some(size),
            key: None,
        })
    }

    fn handle() -> Arc<LoadHandle<Blob>> {
        Arc::new(LoadHandle::empty())
    }

    fn loaded_image(store: &mut EntryStore<Blob, Blob>, id: &str, size: u64) {
        let generation = store.insert_image(id, handle()).unwrap();
        assert!(matches!(
            store.complete_image(id, generation, blob(size)),
            Completion::Loaded(_)
        ));
    }

    #[test]
    fn test_pending_entry_not_accounted() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        store.insert_image("a", handle()).unwrap();

        assert_eq!(store.current_size(), 0);
        assert_eq!(store.stats().pending_loads, 1);
        assert_eq!(store.accounted_bytes(), 0);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        store.insert_image("a", handle()).unwrap();

        let err = store.insert_image("a", handle()).unwrap_err();
        assert_eq!(err.kind(), "validation");

        // Same id in the other collection is independent
        store.insert_volume("a", handle()).unwrap();
    }

    #[test]
    fn test_complete_accounts_size_and_shared_key() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        let generation = store.insert_image("a", handle()).unwrap();
        let artifact = Arc::new(Blob {
            size: Some(30),
            key: Some("series-1".to_string()),
        });

        match store.complete_image("a", generation, artifact) {
            Completion::Loaded(snapshot) => {
                assert!(snapshot.loaded);
                assert_eq!(snapshot.size_in_bytes, 30);
                assert_eq!(snapshot.shared_key.as_deref(), Some("series-1"));
            }
            _ => panic!("expected loaded completion"),
        }
        assert_eq!(store.current_size(), 30);
        assert_eq!(store.accounted_bytes(), 30);
    }

    #[test]
    fn test_malformed_artifact_dropped() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        let generation = store.insert_image("a", handle()).unwrap();
        let artifact = Arc::new(Blob {
            size: None,
            key: None,
        });

        match store.complete_image("a", generation, artifact) {
            Completion::Malformed(err) => assert_eq!(err.kind(), "malformed_artifact"),
            _ => panic!("expected malformed completion"),
        }
        assert!(!store.images.contains("a"));
        assert_eq!(store.current_size(), 0);
        assert_eq!(store.stats().loads_failed, 1);
    }

    #[test]
    fn test_size_overflowing_total_dropped() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(u64::MAX);
        let big = store.insert_volume("v1", handle()).unwrap();
        assert!(matches!(
            store.complete_volume("v1", big, blob(u64::MAX - 5)),
            Completion::Loaded(_)
        ));

        let small = store.insert_volume("v2", handle()).unwrap();
        match store.complete_volume("v2", small, blob(10)) {
            Completion::Malformed(err) => assert_eq!(err.kind(), "malformed_artifact"),
            _ => panic!("expected malformed completion"),
        }
        assert!(!store.volumes.contains("v2"));

        let image = store.insert_image("img", handle()).unwrap();
        assert!(matches!(
            store.complete_image("img", image, blob(6)),
            Completion::Malformed(_)
        ));
        assert!(!store.images.contains("img"));
        assert!(store.image_recency.is_empty());

        assert_eq!(store.current_size(), u64::MAX - 5);
        assert_eq!(store.accounted_bytes(), store.current_size());
        assert_eq!(store.stats().loads_failed, 2);
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        let old = store.insert_image("a", handle()).unwrap();
        store.remove_image("a").unwrap();
        let new = store.insert_image("a", handle()).unwrap();

        assert!(matches!(
            store.complete_image("a", old, blob(10)),
            Completion::Stale
        ));
        assert!(!store.fail(ArtifactClass::Image, "a", old));
        assert!(!store.images.get("a").unwrap().loaded);
        assert_eq!(store.current_size(), 0);

        assert!(store.fail(ArtifactClass::Image, "a", new));
        assert!(!store.images.contains("a"));
    }

    #[test]
    fn test_set_max_size_below_current_rejected() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        loaded_image(&mut store, "a", 60);

        let err = store.set_max_size(50).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert_eq!(store.max_size(), 100);
        assert_eq!(store.current_size(), 60);

        store.set_max_size(60).unwrap();
        assert_eq!(store.max_size(), 60);
    }

    #[test]
    fn test_will_exceed() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        loaded_image(&mut store, "a", 60);

        assert!(store.will_exceed(40).is_ok());
        assert_eq!(
            store.will_exceed(41).unwrap_err(),
            CacheError::CapacityExceeded {
                requested: 41,
                available: 40
            }
        );
    }

    #[test]
    fn test_evict_over_budget_oldest_first() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(1000);
        loaded_image(&mut store, "a", 40);
        loaded_image(&mut store, "b", 40);
        loaded_image(&mut store, "c", 40);
        store.touch_image("a");

        store.max_size = 90;
        let evicted: Vec<String> = store
            .evict_over_budget()
            .into_iter()
            .map(|e| e.id)
            .collect();

        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(store.current_size(), 80);
        assert_eq!(store.accounted_bytes(), 80);
    }

    #[test]
    fn test_eviction_skips_pending_and_volumes() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(1000);
        let generation = store.insert_volume("vol", handle()).unwrap();
        assert!(matches!(
            store.complete_volume("vol", generation, blob(500)),
            Completion::Loaded(_)
        ));
        store.insert_image("pending", handle()).unwrap();

        store.max_size = 100;
        assert!(store.evict_over_budget().is_empty());
        assert!(store.volumes.contains("vol"));
        assert!(store.images.contains("pending"));
        assert_eq!(store.current_size(), 500);
    }

    #[test]
    fn test_reserve_returns_available_headroom() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        loaded_image(&mut store, "a", 30);
        loaded_image(&mut store, "b", 30);

        // Already enough room: nothing evicted
        let (evicted, headroom) = store.reserve(40);
        assert!(evicted.is_empty());
        assert_eq!(headroom, 40);

        let (evicted, headroom) = store.reserve(50);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "a");
        assert_eq!(headroom, 70);

        let (_, headroom) = store.reserve(500);
        assert_eq!(headroom, 100);
        assert_eq!(store.images.len(), 0);
    }

    #[test]
    fn test_drain_resets_total() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        loaded_image(&mut store, "a", 30);
        store.insert_volume("v", handle()).unwrap();

        let (images, volumes) = store.drain();
        assert_eq!(images.len(), 1);
        assert_eq!(volumes.len(), 1);
        assert_eq!(store.current_size(), 0);
        assert_eq!(store.stats().image_entries, 0);
        assert_eq!(store.stats().volume_entries, 0);
    }

    #[test]
    fn test_lookups_counted_by_caller() {
        let mut store: EntryStore<Blob, Blob> = EntryStore::new(100);
        loaded_image(&mut store, "a", 10);

        assert!(store.touch_image("a").is_some());
        assert!(store.touch_image("missing").is_none());
        assert!(store.touch_volume("missing").is_none());
        assert_eq!(store.stats().hits, 0);

        store.record_lookup(true);
        store.record_lookup(false);
        store.record_lookup(false);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }
}
