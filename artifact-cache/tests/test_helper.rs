//! Test helper utilities: artifact types and loader handles driven by the test

#![allow(dead_code)]

use artifact_cache::{Artifact, ArtifactCache, CacheConfig, LoadError, LoadHandle, LoadResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Decoded image used by the tests
#[derive(Debug, Clone, PartialEq)]
pub struct TestImage {
    pub size: Option<u64>,
    pub shared_key: Option<String>,
}

impl TestImage {
    pub fn sized(size: u64) -> Self {
        Self {
            size: Some(size),
            shared_key: None,
        }
    }

    pub fn with_key(size: u64, key: &str) -> Self {
        Self {
            size: Some(size),
            shared_key: Some(key.to_string()),
        }
    }

    /// Violates the artifact contract by not reporting a size
    pub fn unsized_image() -> Self {
        Self {
            size: None,
            shared_key: None,
        }
    }
}

impl Artifact for TestImage {
    fn size_in_bytes(&self) -> Option<u64> {
        self.size
    }

    fn shared_key(&self) -> Option<&str> {
        self.shared_key.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestVolume {
    pub size: u64,
}

impl Artifact for TestVolume {
    fn size_in_bytes(&self) -> Option<u64> {
        Some(self.size)
    }
}

pub type TestCache = ArtifactCache<TestImage, TestVolume>;

pub fn create_test_cache(max_cache_size_bytes: u64) -> TestCache {
    ArtifactCache::new(CacheConfig {
        max_cache_size_bytes,
        ..Default::default()
    })
}

/// Load handle that completes when the test sends on the returned channel
pub fn deferred<A: Artifact>() -> (oneshot::Sender<LoadResult<A>>, LoadHandle<A>) {
    let (tx, rx) = oneshot::channel();
    let handle = LoadHandle::new(async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LoadError::new("loader dropped")),
        }
    });
    (tx, handle)
}

/// Insert an image and wait until its completion has been applied
pub async fn load_image(cache: &TestCache, id: &str, size: u64) {
    cache
        .put_image_load(id, LoadHandle::ready(TestImage::sized(size)))
        .unwrap()
        .await
        .unwrap();
}

pub async fn load_volume(cache: &TestCache, id: &str, size: u64) {
    cache
        .put_volume_load(id, LoadHandle::ready(TestVolume { size }))
        .unwrap()
        .await
        .unwrap();
}

/// Records hook invocations in call order
#[derive(Clone, Default)]
pub struct HookLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl HookLog {
    pub fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Attach recording cancel/decache hooks to a handle
    pub fn instrument<A: Artifact>(&self, id: &str, handle: LoadHandle<A>) -> LoadHandle<A> {
        let cancel_log = self.clone();
        let decache_log = self.clone();
        let cancel_id = format!("cancel:{}", id);
        let decache_id = format!("decache:{}", id);
        handle
            .with_cancel(move || {
                cancel_log.record(cancel_id);
                Ok(())
            })
            .with_decache(move || {
                decache_log.record(decache_id);
                Ok(())
            })
    }
}
