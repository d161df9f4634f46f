//! Bounds-checked access to the mapped silo.
//!
//! Everything persisted in a silo refers to other parts of it by
//! silo-relative offset. `Region` is the single place where an offset is
//! turned back into bytes; every accessor asserts the range lies inside
//! the medium.

use crate::error::SiloResult;
use silo_storage::SiloMedia;

/// The mapped silo, addressed by offset.
pub struct Region {
    media: Box<dyn SiloMedia>,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region").field("len", &self.len()).finish()
    }
}

impl Region {
    /// Wraps a medium.
    #[must_use]
    pub fn new(media: Box<dyn SiloMedia>) -> Self {
        Self { media }
    }

    /// Returns the medium, consuming the region.
    #[must_use]
    pub fn into_media(self) -> Box<dyn SiloMedia> {
        self.media
    }

    /// Returns the size of the silo in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.media.len()
    }

    /// Returns whether the silo has no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn span(&self, offset: u64, len: u64) -> std::ops::Range<usize> {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.len()),
            "range {offset}+{len} outside silo of {} bytes",
            self.len()
        );
        // Bounded by the medium length, which is addressable.
        offset as usize..(offset + len) as usize
    }

    /// Returns `len` bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the silo.
    #[must_use]
    pub fn bytes(&self, offset: u64, len: u64) -> &[u8] {
        let span = self.span(offset, len);
        &self.media.as_slice()[span]
    }

    /// Returns `len` writable bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the silo.
    pub fn bytes_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        let span = self.span(offset, len);
        &mut self.media.as_mut_slice()[span]
    }

    /// Copies `data` into the silo at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the silo.
    pub fn write(&mut self, offset: u64, data: &[u8]) {
        self.bytes_mut(offset, data.len() as u64)
            .copy_from_slice(data);
    }

    /// Copies `len` bytes within the silo from `src` to `dst`.
    ///
    /// # Panics
    ///
    /// Panics if either range is outside the silo.
    pub fn copy_within(&mut self, src: u64, dst: u64, len: u64) {
        let from = self.span(src, len);
        let to = self.span(dst, len);
        self.media.as_mut_slice().copy_within(from, to.start);
    }

    /// Zeroes `len` bytes at `offset`.
    pub fn zero(&mut self, offset: u64, len: u64) {
        self.bytes_mut(offset, len).fill(0);
    }

    /// Commits a range to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to flush.
    pub fn sync(&self, offset: u64, len: u64) -> SiloResult<()> {
        self.media.flush_range(offset, len)?;
        Ok(())
    }

    /// Commits the whole silo to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to flush.
    pub fn sync_all(&self) -> SiloResult<()> {
        self.media.flush()?;
        Ok(())
    }
}

/// Little-endian field reader over a byte slice.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub(crate) fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub(crate) fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }

    pub(crate) fn f64(&mut self) -> Option<f64> {
        self.array().map(f64::from_le_bytes)
    }
}

/// Rounds `x` up to a multiple of the power of two `align`.
#[must_use]
pub const fn round_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}

/// Rounds `x` down to a multiple of the power of two `align`.
#[must_use]
pub const fn round_down(x: u64, align: u64) -> u64 {
    x & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_storage::InMemoryMedia;

    #[test]
    fn write_and_read_back() {
        let mut region = Region::new(Box::new(InMemoryMedia::new(256)));
        region.write(10, b"abc");
        assert_eq!(region.bytes(10, 3), b"abc");
        assert_eq!(region.len(), 256);
    }

    #[test]
    fn copy_within_moves_bytes() {
        let mut region = Region::new(Box::new(InMemoryMedia::new(64)));
        region.write(0, b"ping");
        region.copy_within(0, 32, 4);
        assert_eq!(region.bytes(32, 4), b"ping");
    }

    #[test]
    #[should_panic(expected = "outside silo")]
    fn out_of_bounds_asserts() {
        let region = Region::new(Box::new(InMemoryMedia::new(64)));
        let _ = region.bytes(60, 8);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_down(1023, 512), 512);
        assert_eq!(round_down(0, 8), 0);
    }

    #[test]
    fn reader_fields() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&(-3i64).to_le_bytes());
        buf.extend_from_slice(&1.5f64.to_le_bytes());
        let mut r = Reader::new(&buf);
        assert_eq!(r.u32(), Some(7));
        assert_eq!(r.i64(), Some(-3));
        assert_eq!(r.f64(), Some(1.5));
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.u64(), None);
    }
}
