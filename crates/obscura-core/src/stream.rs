//! Stream descriptors and buffer handles.
//!
//! A stream is the unit of buffer routing between nodes: a stable 64-bit id
//! plus a declared payload kind (image or metadata), an origin (application
//! or internal), memory usage hints needed to acquire buffers, and format/
//! size metadata the scheduler treats as opaque.

/// Stable 64-bit identifier for a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl core::fmt::Display for StreamId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

/// Payload kind of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    /// Pixel data.
    Image,
    /// Capture metadata.
    Metadata,
}

/// Who owns buffers on this stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Buffers handed in by the application.
    App,
    /// Buffers allocated internally between pipeline stages.
    Internal,
}

/// Memory usage hints required to acquire a buffer for a stream.
///
/// A bit-set; the concrete meaning of each bit belongs to the buffer
/// provider. The scheduler only carries it through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferUsage(pub u32);

impl BufferUsage {
    /// CPU-readable mapping requested.
    pub const CPU_READ: Self = Self(1);
    /// CPU-writable mapping requested.
    pub const CPU_WRITE: Self = Self(1 << 1);
    /// Hardware (ISP/codec) access requested.
    pub const HW_ACCESS: Self = Self(1 << 2);

    /// Combines two usage sets.
    #[inline]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns whether all bits of `other` are set.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Descriptor for one stream.
///
/// Format and size are opaque to the scheduler; they are carried for the
/// buffer provider's benefit.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    /// Stable stream identifier.
    pub id: StreamId,
    /// Payload kind.
    pub kind: StreamKind,
    /// Buffer ownership origin.
    pub origin: StreamOrigin,
    /// Memory usage hints for acquisition.
    pub usage: BufferUsage,
    /// Width in pixels (0 for metadata streams).
    pub width: u32,
    /// Height in pixels (0 for metadata streams).
    pub height: u32,
    /// Opaque pixel/serialization format code.
    pub format: u32,
}

impl StreamInfo {
    /// Creates a metadata stream descriptor.
    pub fn metadata(id: StreamId, origin: StreamOrigin) -> Self {
        Self {
            id,
            kind: StreamKind::Metadata,
            origin,
            usage: BufferUsage::CPU_READ.union(BufferUsage::CPU_WRITE),
            width: 0,
            height: 0,
            format: 0,
        }
    }

    /// Creates an image stream descriptor.
    pub fn image(id: StreamId, origin: StreamOrigin, width: u32, height: u32, format: u32) -> Self {
        Self {
            id,
            kind: StreamKind::Image,
            origin,
            usage: BufferUsage::HW_ACCESS,
            width,
            height,
            format,
        }
    }
}

/// Opaque handle to a physically allocated buffer.
///
/// The scheduler never interprets the contents; it only tracks ownership
/// from acquisition until the final user releases it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferHandle {
    /// Provider-assigned handle value.
    pub raw: u64,
}
