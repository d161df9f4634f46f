//! Bump allocation inside the open segment.
//!
//! ```text
//! offset                                               offset+length
//! | head + descriptors + digest | ....free.... | payloads (newest first) |
//!                               ^bottom       ^top
//! ```
//!
//! `bottom` covers the signed descriptor array and its digest; `top`
//! descends as payloads are placed. Both stay multiples of the
//! granularity and never cross.

use crate::region::round_up;
use crate::sign::DIGEST_SIZE;

/// The cursor pair of the open segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    offset: u64,
    length: u64,
    granularity: u64,
    bottom: u64,
    top: u64,
}

impl Cursor {
    /// Starts a cursor over an empty segment whose descriptor array ends
    /// at `data_end`.
    ///
    /// # Panics
    ///
    /// Panics if the segment is misaligned or too short for its head.
    #[must_use]
    pub fn new(offset: u64, length: u64, granularity: u64, data_end: u64) -> Self {
        let cursor = Self {
            offset,
            length,
            granularity,
            bottom: round_up(data_end + DIGEST_SIZE, granularity),
            top: offset + length,
        };
        cursor.check();
        cursor
    }

    /// Returns the lower cursor.
    #[must_use]
    pub const fn bottom(&self) -> u64 {
        self.bottom
    }

    /// Returns the upper cursor.
    #[must_use]
    pub const fn top(&self) -> u64 {
        self.top
    }

    /// Returns the bytes between the cursors.
    #[must_use]
    pub const fn free(&self) -> u64 {
        self.top - self.bottom
    }

    /// Places `len` payload bytes for a descriptor array that will end at
    /// `data_end` once the new descriptor is appended.
    ///
    /// Returns the payload offset, or `None` if the segment is full.
    pub fn alloc(&mut self, data_end: u64, len: u64) -> Option<u64> {
        let bottom = round_up(data_end + DIGEST_SIZE, self.granularity);
        let ptr = self.top.checked_sub(round_up(len, self.granularity))?;
        if ptr < bottom {
            return None;
        }
        self.bottom = bottom;
        self.top = ptr;
        self.check();
        Some(ptr)
    }

    fn check(&self) {
        assert!(
            self.offset <= self.bottom
                && self.bottom <= self.top
                && self.top <= self.offset + self.length,
            "cursor out of order: {} <= {} <= {} <= {}",
            self.offset,
            self.bottom,
            self.top,
            self.offset + self.length
        );
        assert!(
            self.bottom % self.granularity == 0 && self.top % self.granularity == 0,
            "cursor misaligned"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::DESC_SIZE;
    use crate::sign::SIGN_HEADER_SIZE;
    use proptest::prelude::*;

    const GRAN: u64 = 512;

    fn fill(seg: u64, sizes: &[u64]) -> (Cursor, Vec<(u64, u64)>) {
        let data = seg + SIGN_HEADER_SIZE;
        let mut cursor = Cursor::new(seg, 4096, GRAN, data);
        let mut placed = Vec::new();
        for &len in sizes {
            let data_end = data + (placed.len() as u64 + 1) * DESC_SIZE;
            match cursor.alloc(data_end, len) {
                Some(ptr) => placed.push((ptr, len)),
                None => break,
            }
        }
        (cursor, placed)
    }

    #[test]
    fn three_kib_objects_fit_a_4k_segment() {
        let (cursor, placed) = fill(8192, &[1024, 1024, 1024, 1024]);
        assert_eq!(placed.len(), 3);
        assert_eq!(placed[0].0, 8192 + 3072);
        assert_eq!(cursor.top(), 8192 + 1024);
        assert_eq!(cursor.bottom(), 8192 + 512);
    }

    #[test]
    fn failed_alloc_leaves_cursor_unchanged() {
        let mut cursor = Cursor::new(0, 4096, GRAN, SIGN_HEADER_SIZE);
        let before = cursor;
        assert_eq!(cursor.alloc(SIGN_HEADER_SIZE + DESC_SIZE, 8192), None);
        assert_eq!(cursor, before);
    }

    #[test]
    fn zero_length_payload_takes_no_space() {
        let mut cursor = Cursor::new(0, 4096, GRAN, SIGN_HEADER_SIZE);
        assert_eq!(cursor.alloc(SIGN_HEADER_SIZE + DESC_SIZE, 0), Some(4096));
        assert_eq!(cursor.top(), 4096);
    }

    proptest! {
        #[test]
        fn allocations_never_overlap(
            seg in (0u64..64).prop_map(|n| n * GRAN),
            sizes in proptest::collection::vec(0u64..1500, 0..40),
        ) {
            let (cursor, placed) = fill(seg, &sizes);
            prop_assert!(seg <= cursor.bottom());
            prop_assert!(cursor.bottom() <= cursor.top());
            prop_assert!(cursor.top() <= seg + 4096);
            prop_assert_eq!(cursor.bottom() % GRAN, 0);
            prop_assert_eq!(cursor.top() % GRAN, 0);

            for (i, &(a, alen)) in placed.iter().enumerate() {
                prop_assert!(a >= cursor.bottom());
                prop_assert!(a + alen <= seg + 4096);
                for &(b, blen) in &placed[i + 1..] {
                    prop_assert!(a + alen <= b || b + blen <= a || alen == 0 || blen == 0);
                }
            }
        }
    }
}
