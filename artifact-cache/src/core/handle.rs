//! Load-handle and artifact contracts
//!
//! Loaders hand the cache a [`LoadHandle`] wrapping the future that produces
//! the artifact, plus optional `cancel` and `decache` hooks. The cache never
//! knows how loading works; it awaits the shared future once and runs the
//! hooks when the entry leaves the cache.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Decoded payload stored by the cache
pub trait Artifact: Send + Sync + 'static {
    /// Size of the decoded payload in bytes.
    ///
    /// `None` means the loader did not report a usable size; such an artifact
    /// is rejected as malformed and never accounted.
    fn size_in_bytes(&self) -> Option<u64>;

    /// Identifier shared by artifacts backed by the same decoded buffer
    fn shared_key(&self) -> Option<&str> {
        None
    }
}

/// Error reported by a loader when its asynchronous work rejects
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LoadError(pub String);

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome of a load
pub type LoadResult<A> = std::result::Result<Arc<A>, LoadError>;

/// Cloneable future resolving to the load outcome
pub type LoadFuture<A> = Shared<BoxFuture<'static, LoadResult<A>>>;

/// Cancel/decache callback supplied by a loader
pub type Hook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Handle to an in-flight or completed load
pub struct LoadHandle<A: Artifact> {
    promise: Option<LoadFuture<A>>,
    cancel: Mutex<Option<Hook>>,
    decache: Mutex<Option<Hook>>,
}

impl<A: Artifact> LoadHandle<A> {
    /// Wrap a loader future
    pub fn new<F>(load: F) -> Self
    where
        F: Future<Output = LoadResult<A>> + Send + 'static,
    {
        Self {
            promise: Some(load.boxed().shared()),
            cancel: Mutex::new(None),
            decache: Mutex::new(None),
        }
    }

    /// Handle whose load already succeeded
    pub fn ready(artifact: A) -> Self {
        Self::new(futures_util::future::ready(Ok(Arc::new(artifact))))
    }

    /// Handle whose load already failed
    pub fn failed(error: LoadError) -> Self {
        Self::new(futures_util::future::ready(Err(error)))
    }

    /// Handle without a pending result; the cache rejects it
    pub fn empty() -> Self {
        Self {
            promise: None,
            cancel: Mutex::new(None),
            decache: Mutex::new(None),
        }
    }

    /// Attach a hook that aborts the in-flight load
    pub fn with_cancel<F>(self, cancel: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        *self.cancel.lock() = Some(Box::new(cancel));
        self
    }

    /// Attach a hook that releases backing resources of the artifact
    pub fn with_decache<F>(self, decache: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        *self.decache.lock() = Some(Box::new(decache));
        self
    }

    /// The shared load future, if this handle carries one
    pub fn promise(&self) -> Option<LoadFuture<A>> {
        self.promise.clone()
    }

    pub fn has_promise(&self) -> bool {
        self.promise.is_some()
    }

    /// Whether the load future has already resolved
    pub fn is_settled(&self) -> bool {
        self.promise
            .as_ref()
            .is_some_and(|promise| promise.peek().is_some())
    }

    pub fn has_cancel(&self) -> bool {
        self.cancel.lock().is_some()
    }

    pub fn has_decache(&self) -> bool {
        self.decache.lock().is_some()
    }

    /// Run the cancel hook. Returns `None` if there is none or it already ran.
    pub fn cancel(&self) -> Option<anyhow::Result<()>> {
        let hook = self.cancel.lock().take();
        hook.map(|cancel| cancel())
    }

    /// Run the decache hook. Returns `None` if there is none or it already ran.
    pub fn decache(&self) -> Option<anyhow::Result<()>> {
        let hook = self.decache.lock().take();
        hook.map(|decache| decache())
    }
}

impl<A: Artifact> fmt::Debug for LoadHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadHandle")
            .field("has_promise", &self.has_promise())
            .field("settled", &self.is_settled())
            .field("has_cancel", &self.has_cancel())
            .field("has_decache", &self.has_decache())
            .finish()
    }
}
