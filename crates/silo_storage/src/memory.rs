//! In-memory silo medium for testing.

use crate::error::StorageResult;
use crate::media::{check_range, SiloMedia};

/// A heap-backed silo medium.
///
/// This medium keeps the whole silo in a `Vec<u8>` and is suitable for:
/// - Unit tests
/// - Remount tests (hand the medium back to `Silo::open`)
/// - Crash simulations via [`InMemoryMedia::data`] snapshots
///
/// Flushing is a bounds-checked no-op.
///
/// # Example
///
/// ```rust
/// use silo_storage::{InMemoryMedia, SiloMedia};
///
/// let mut media = InMemoryMedia::new(4096);
/// media.as_mut_slice()[..5].copy_from_slice(b"hello");
/// assert_eq!(&media.as_slice()[..5], b"hello");
/// assert_eq!(media.len(), 4096);
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryMedia {
    data: Vec<u8>,
}

impl InMemoryMedia {
    /// Creates a zero-filled medium of `len` bytes.
    #[must_use]
    pub fn new(len: u64) -> Self {
        Self {
            data: vec![0u8; usize::try_from(len).unwrap_or(usize::MAX)],
        }
    }

    /// Creates a medium with pre-existing contents.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns a copy of the whole region.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl SiloMedia for InMemoryMedia {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn flush_range(&self, offset: u64, len: u64) -> StorageResult<()> {
        check_range(offset, len, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn memory_new_is_zeroed() {
        let media = InMemoryMedia::new(1024);
        assert_eq!(media.len(), 1024);
        assert!(media.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn memory_write_and_read() {
        let mut media = InMemoryMedia::new(64);
        media.as_mut_slice()[10..15].copy_from_slice(b"world");
        assert_eq!(&media.as_slice()[10..15], b"world");
    }

    #[test]
    fn memory_with_data() {
        let media = InMemoryMedia::with_data(b"existing".to_vec());
        assert_eq!(media.len(), 8);
        assert_eq!(media.data(), b"existing");
    }

    #[test]
    fn memory_flush_in_bounds() {
        let media = InMemoryMedia::new(128);
        assert!(media.flush_range(0, 128).is_ok());
        assert!(media.flush().is_ok());
    }

    #[test]
    fn memory_flush_out_of_bounds() {
        let media = InMemoryMedia::new(128);
        let result = media.flush_range(100, 64);
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
    }

    #[test]
    fn memory_empty() {
        let media = InMemoryMedia::default();
        assert!(media.is_empty());
    }
}
