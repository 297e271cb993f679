//! Per-frame, per-node completion tracking.
//!
//! A node is finished with a frame once all four of its pending buffer sets
//! (in/out × image/metadata) are drained. Each set carries a notified flag
//! so its completion milestone fires exactly once.

use std::collections::BTreeSet;

use crate::lifecycle::buffer_map::BufferCategory;
use crate::lifecycle::users::UserRole;
use crate::stream::{StreamId, StreamKind};

/// One pending set with its idempotent notification flag.
#[derive(Clone, Debug, Default)]
pub struct PendingSet {
    /// Streams the node has not yet released in this direction/kind.
    pub pending: BTreeSet<StreamId>,
    /// Streams originally seeded (kept for result reporting).
    pub seeded: BTreeSet<StreamId>,
    /// Whether the drain milestone has already been notified.
    pub notified: bool,
}

impl PendingSet {
    fn seed(&mut self, stream: StreamId) {
        self.pending.insert(stream);
        self.seeded.insert(stream);
    }

    /// Removes a stream; returns whether the set just drained for the first
    /// time.
    fn resolve(&mut self, stream: StreamId) -> bool {
        self.pending.remove(&stream);
        if self.pending.is_empty() && !self.seeded.is_empty() && !self.notified {
            self.notified = true;
            return true;
        }
        false
    }

    /// Returns whether this set was seeded with any streams.
    pub fn is_seeded(&self) -> bool {
        !self.seeded.is_empty()
    }

    /// Returns whether the set has drained.
    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Which milestone a drain corresponds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainedSet {
    /// All metadata inputs released.
    InMeta,
    /// All metadata outputs released.
    OutMeta,
    /// All image inputs released.
    InImage,
    /// All image outputs released.
    OutImage,
}

/// The four pending buffer sets of one node for one frame.
#[derive(Clone, Debug, Default)]
pub struct NodeStatus {
    /// Metadata the node consumes.
    pub in_meta: PendingSet,
    /// Metadata the node produces.
    pub out_meta: PendingSet,
    /// Images the node consumes.
    pub in_image: PendingSet,
    /// Images the node produces.
    pub out_image: PendingSet,
}

impl NodeStatus {
    fn set_mut(&mut self, kind: StreamKind, role: UserRole) -> Option<(&mut PendingSet, DrainedSet)> {
        match (kind, role) {
            (StreamKind::Metadata, UserRole::Consumer) => Some((&mut self.in_meta, DrainedSet::InMeta)),
            (StreamKind::Metadata, UserRole::Producer) => Some((&mut self.out_meta, DrainedSet::OutMeta)),
            (StreamKind::Image, UserRole::Consumer) => Some((&mut self.in_image, DrainedSet::InImage)),
            (StreamKind::Image, UserRole::Producer) => Some((&mut self.out_image, DrainedSet::OutImage)),
            (_, UserRole::None) => None,
        }
    }

    /// Seeds one pending entry for a stream the node touches.
    pub fn seed(&mut self, category: BufferCategory, role: UserRole, stream: StreamId) {
        if let Some((set, _)) = self.set_mut(category.kind(), role) {
            set.seed(stream);
        }
    }

    /// Resolves one pending entry; returns the milestone if its set just
    /// drained for the first time.
    pub fn resolve(
        &mut self,
        category: BufferCategory,
        role: UserRole,
        stream: StreamId,
    ) -> Option<DrainedSet> {
        let (set, milestone) = self.set_mut(category.kind(), role)?;
        set.resolve(stream).then_some(milestone)
    }

    /// Returns whether the node is fully drained for this frame.
    pub fn is_drained(&self) -> bool {
        self.in_meta.is_drained()
            && self.out_meta.is_drained()
            && self.in_image.is_drained()
            && self.out_image.is_drained()
    }
}
