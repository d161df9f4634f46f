//! Silo media trait definition.

use crate::error::{StorageError, StorageResult};

/// A fixed-size, byte-addressable region backing a silo.
///
/// Media are **opaque byte regions**. They hand out the whole region as a
/// slice and know how to commit a range of it to durable storage. The silo
/// owns all format interpretation; media do not know about signatures,
/// tables or segments.
///
/// # Invariants
///
/// - `len()` never changes after construction
/// - `as_slice().len() == len()`
/// - after `flush_range(off, len)` returns, those bytes survive process
///   termination (for persistent media)
///
/// # Implementors
///
/// - [`super::MappedFile`] - memory-mapped file or anonymous mapping
/// - [`super::InMemoryMedia`] - heap buffer for tests
pub trait SiloMedia: Send + Sync {
    /// Returns the size of the region in bytes.
    fn len(&self) -> u64;

    /// Returns whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the whole region.
    fn as_slice(&self) -> &[u8];

    /// Returns the whole region for writing.
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Commits `len` bytes starting at `offset` to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the range lies outside the region or the
    /// underlying flush fails.
    fn flush_range(&self, offset: u64, len: u64) -> StorageResult<()>;

    /// Commits the whole region to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying flush fails.
    fn flush(&self) -> StorageResult<()> {
        self.flush_range(0, self.len())
    }
}

/// Validates that `[offset, offset + len)` lies within a region of `size` bytes.
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> StorageResult<()> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StorageError::OutOfBounds { offset, len, size }),
    }
}
