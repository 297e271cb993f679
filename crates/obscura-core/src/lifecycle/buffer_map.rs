//! Generic per-category buffer map.
//!
//! One map type serves all four buffer categories (application/internal ×
//! image/metadata) instead of four hand-duplicated implementations; the
//! category is a value, not a type.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::lifecycle::users::UsersManager;
use crate::stream::{BufferHandle, StreamId, StreamInfo, StreamKind, StreamOrigin};

/// The four buffer ownership categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferCategory {
    /// Application-owned image buffers.
    AppImage,
    /// Internally allocated image buffers.
    InternalImage,
    /// Application-owned metadata buffers.
    AppMeta,
    /// Internally allocated metadata buffers.
    InternalMeta,
}

impl BufferCategory {
    /// All categories, in map-index order.
    pub const ALL: [Self; 4] = [
        Self::AppImage,
        Self::InternalImage,
        Self::AppMeta,
        Self::InternalMeta,
    ];

    /// Maps a stream's origin and kind to its category.
    pub fn of(info: &StreamInfo) -> Self {
        match (info.origin, info.kind) {
            (StreamOrigin::App, StreamKind::Image) => Self::AppImage,
            (StreamOrigin::Internal, StreamKind::Image) => Self::InternalImage,
            (StreamOrigin::App, StreamKind::Metadata) => Self::AppMeta,
            (StreamOrigin::Internal, StreamKind::Metadata) => Self::InternalMeta,
        }
    }

    /// Index into per-category storage arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::AppImage => 0,
            Self::InternalImage => 1,
            Self::AppMeta => 2,
            Self::InternalMeta => 3,
        }
    }

    /// Payload kind of this category.
    pub fn kind(self) -> StreamKind {
        match self {
            Self::AppImage | Self::InternalImage => StreamKind::Image,
            Self::AppMeta | Self::InternalMeta => StreamKind::Metadata,
        }
    }
}

/// Acquisition state of one buffer.
///
/// `Failed` is sticky: a failed acquisition is never retried for the same
/// frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcquireState {
    /// Not yet requested from the provider.
    NotAcquired,
    /// Held, with the provider's handle.
    Acquired(BufferHandle),
    /// Acquisition failed; never retried.
    Failed,
}

/// One stream's buffer within a frame: acquisition state plus the user
/// graph tracking its release.
#[derive(Debug)]
pub struct BufferItem {
    /// Descriptor of the stream this buffer belongs to.
    pub info: Arc<StreamInfo>,
    /// Acquisition state.
    pub state: AcquireState,
    /// Ordered producer/consumer release tracking.
    pub users: UsersManager,
    /// Whether the buffer was already returned to the provider.
    pub returned: bool,
}

/// Stream-id → buffer-item map for one category of one frame.
#[derive(Debug)]
pub struct BufferMap {
    category: BufferCategory,
    items: BTreeMap<StreamId, BufferItem>,
}

impl BufferMap {
    /// Creates an empty map for a category.
    pub fn new(category: BufferCategory) -> Self {
        Self {
            category,
            items: BTreeMap::new(),
        }
    }

    /// The category this map serves.
    pub fn category(&self) -> BufferCategory {
        self.category
    }

    /// Inserts an item for a stream. Idempotent per stream.
    pub fn insert(&mut self, info: Arc<StreamInfo>, users: UsersManager) {
        self.items.entry(info.id).or_insert(BufferItem {
            info,
            state: AcquireState::NotAcquired,
            users,
            returned: false,
        });
    }

    /// Returns the item for a stream.
    pub fn get(&self, stream: StreamId) -> Result<&BufferItem> {
        self.items
            .get(&stream)
            .ok_or(PipelineError::StreamNotFound(stream))
    }

    /// Returns the item for a stream, mutably.
    pub fn get_mut(&mut self, stream: StreamId) -> Result<&mut BufferItem> {
        self.items
            .get_mut(&stream)
            .ok_or(PipelineError::StreamNotFound(stream))
    }

    /// Returns whether the map tracks a stream.
    pub fn contains(&self, stream: StreamId) -> bool {
        self.items.contains_key(&stream)
    }

    /// Number of tracked streams.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns whether every tracked buffer is fully resolved.
    pub fn all_resolved(&self) -> bool {
        self.items.values().all(|item| item.users.all_resolved())
    }

    /// Iterates the tracked items in stream-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &BufferItem)> {
        self.items.iter()
    }
}
