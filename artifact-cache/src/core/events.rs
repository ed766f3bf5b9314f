//! Add/remove notifications for cache observers

use super::entry::EntrySnapshot;
use super::handle::Artifact;
use super::types::{ArtifactClass, RemovalReason};
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;

/// Notification emitted when an entry is added or removed
pub enum CacheEvent<I: Artifact, V: Artifact> {
    ImageAdded(EntrySnapshot<I>),
    ImageRemoved {
        entry: EntrySnapshot<I>,
        reason: RemovalReason,
    },
    VolumeAdded(EntrySnapshot<V>),
    VolumeRemoved {
        entry: EntrySnapshot<V>,
        reason: RemovalReason,
    },
}

impl<I: Artifact, V: Artifact> CacheEvent<I, V> {
    pub fn id(&self) -> &str {
        match self {
            Self::ImageAdded(entry) => &entry.id,
            Self::ImageRemoved { entry, .. } => &entry.id,
            Self::VolumeAdded(entry) => &entry.id,
            Self::VolumeRemoved { entry, .. } => &entry.id,
        }
    }

    pub fn class(&self) -> ArtifactClass {
        match self {
            Self::ImageAdded(_) | Self::ImageRemoved { .. } => ArtifactClass::Image,
            Self::VolumeAdded(_) | Self::VolumeRemoved { .. } => ArtifactClass::Volume,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, Self::ImageRemoved { .. } | Self::VolumeRemoved { .. })
    }

    /// Event name in the `image_added` style
    pub fn name(&self) -> &'static str {
        match self {
            Self::ImageAdded(_) => "image_added",
            Self::ImageRemoved { .. } => "image_removed",
            Self::VolumeAdded(_) => "volume_added",
            Self::VolumeRemoved { .. } => "volume_removed",
        }
    }
}

impl<I: Artifact, V: Artifact> Clone for CacheEvent<I, V> {
    fn clone(&self) -> Self {
        match self {
            Self::ImageAdded(entry) => Self::ImageAdded(entry.clone()),
            Self::ImageRemoved { entry, reason } => Self::ImageRemoved {
                entry: entry.clone(),
                reason: *reason,
            },
            Self::VolumeAdded(entry) => Self::VolumeAdded(entry.clone()),
            Self::VolumeRemoved { entry, reason } => Self::VolumeRemoved {
                entry: entry.clone(),
                reason: *reason,
            },
        }
    }
}

impl<I: Artifact, V: Artifact> fmt::Debug for CacheEvent<I, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEvent")
            .field("name", &self.name())
            .field("id", &self.id())
            .finish()
    }
}

/// Broadcast sender shared by every cache clone
pub(crate) struct EventChannel<I: Artifact, V: Artifact> {
    sender: broadcast::Sender<CacheEvent<I, V>>,
}

impl<I: Artifact, V: Artifact> EventChannel<I, V> {
    pub(crate) fn new(capacity: usize) -> Self {
        // broadcast::channel panics on zero capacity
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CacheEvent<I, V>> {
        self.sender.subscribe()
    }

    /// Deliver an event; having no observers is not an error
    pub(crate) fn emit(&self, event: CacheEvent<I, V>) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!("Event {} delivered to {} observers", name, receivers),
            Err(_) => trace!("Event {} dropped, no observers", name),
        }
    }

    pub(crate) fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
