//! Segments: the unit of allocation and eviction.
//!
//! A segment is a contiguous extent of the segment space:
//!
//! ```text
//! | SEGHEAD header | descriptor array | digest | free | payloads |
//! ```
//!
//! Segments are kept in creation order. At most one is open for inserts;
//! the others are read-only until they are evicted as a whole.

mod alloc;
mod ptr;
mod runtime;

pub use alloc::Cursor;
pub use ptr::{LiveMap, SegPtr, SegmentRecord, MIN_RECORD_SIZE, SEGPTR_SIZE};
pub use runtime::LoadReport;

pub(crate) use runtime::Segment;

/// Signature tag of a segment head.
pub const SEGHEAD_TAG: &str = "SEGHEAD";

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentState {
    /// Known from the segment table; descriptors not read yet.
    MustLoad,
    /// Descriptors read back from the medium.
    Loaded,
    /// Accepting inserts.
    Open,
    /// Finalized during this mount.
    Closed,
}

impl SegmentState {
    /// Returns whether the descriptors are in memory.
    #[must_use]
    pub const fn is_loaded(self) -> bool {
        !matches!(self, Self::MustLoad)
    }

    /// Returns a lower-case name for display.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MustLoad => "must-load",
            Self::Loaded => "loaded",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// A snapshot of one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Serial number.
    pub serial: u32,
    /// Silo-relative start.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Lifecycle state.
    pub state: SegmentState,
    /// Live objects.
    pub nobj: u32,
    /// Descriptor slots allocated.
    pub nalloc: u32,
    /// Descriptors recorded in the last saved segment table.
    pub nfixed: u32,
    /// Oldest ban the segment's objects may refer to.
    pub ban_tail: Option<u64>,
}
