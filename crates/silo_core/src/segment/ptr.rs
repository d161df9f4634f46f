//! Segment table records.
//!
//! The segment table payload holds one record per segment, in creation
//! order. A record is a segment pointer followed by the segment's object
//! list block:
//!
//! ```text
//! | offset u64 | length u64 | objlist u64 | lobjlist u32 | serial u32 |
//! | ban_tail i64 | bitmap_len u32 | reserved u32 | live bitmap (padded to 8) |
//! ```
//!
//! `objlist` is the silo-relative offset of the descriptor array and
//! `lobjlist` the number of descriptors it held when the table was saved.
//! The live bitmap has one bit per descriptor; cleared bits are objects
//! removed or evicted since they were written.

use crate::error::{SiloError, SiloResult};
use crate::object::{decode_ban, encode_ban};
use crate::region::Reader;

/// Size of an encoded segment pointer.
pub const SEGPTR_SIZE: u64 = 32;

/// Size of the object list block header.
pub const OBJLIST_HEADER: u64 = 16;

/// Smallest encoded record.
pub const MIN_RECORD_SIZE: u64 = SEGPTR_SIZE + OBJLIST_HEADER;

/// Position-independent description of a segment extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegPtr {
    /// Silo-relative start of the segment.
    pub offset: u64,
    /// Length of the segment in bytes.
    pub length: u64,
    /// Silo-relative offset of the descriptor array.
    pub objlist: u64,
    /// Descriptors in the array when the table was saved.
    pub lobjlist: u32,
    /// Serial number of the segment.
    pub serial: u32,
}

impl SegPtr {
    /// Returns the offset one past the segment.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Returns whether the extents of two segments intersect.
    #[must_use]
    pub const fn overlaps(&self, offset: u64, length: u64) -> bool {
        self.offset < offset + length && offset < self.end()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.objlist.to_le_bytes());
        out.extend_from_slice(&self.lobjlist.to_le_bytes());
        out.extend_from_slice(&self.serial.to_le_bytes());
    }
}

/// One bit per descriptor slot; set while the object is live.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveMap {
    words: Vec<u64>,
    len: u32,
}

impl LiveMap {
    /// Creates a map of `len` bits, all set.
    #[must_use]
    pub fn all_live(len: u32) -> Self {
        let mut map = Self::default();
        for _ in 0..len {
            map.push(true);
        }
        map
    }

    /// Returns the number of slots.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// Returns whether the map has no slots.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a slot.
    pub fn push(&mut self, live: bool) {
        let i = self.len as usize;
        if i % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
        self.set(i as u32, live);
    }

    /// Returns whether slot `i` is live; slots past the end are not.
    #[must_use]
    pub fn get(&self, i: u32) -> bool {
        i < self.len && self.words[i as usize / 64] & (1 << (i % 64)) != 0
    }

    /// Sets slot `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is past the end.
    pub fn set(&mut self, i: u32, live: bool) {
        assert!(i < self.len, "live slot {i} out of range {}", self.len);
        let word = &mut self.words[i as usize / 64];
        if live {
            *word |= 1 << (i % 64);
        } else {
            *word &= !(1 << (i % 64));
        }
    }

    /// Returns the number of live slots.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// Grows the map to `len` slots, new ones set to `live`.
    pub fn extend_to(&mut self, len: u32, live: bool) {
        while self.len < len {
            self.push(live);
        }
    }

    /// Returns the encoded size of the bitmap.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        self.words.len() as u64 * 8
    }
}

/// A segment pointer with its object list block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Segment pointer.
    pub ptr: SegPtr,
    /// Oldest ban generation objects in the segment may refer to.
    pub ban_tail: Option<u64>,
    /// Liveness of each descriptor slot.
    pub live: LiveMap,
}

impl SegmentRecord {
    /// Returns the encoded size of this record.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        MIN_RECORD_SIZE + self.live.encoded_len()
    }

    /// Appends the encoded record to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.ptr.encode_into(out);
        out.extend_from_slice(&encode_ban(self.ban_tail).to_le_bytes());
        out.extend_from_slice(&(self.live.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for w in &self.live.words {
            out.extend_from_slice(&w.to_le_bytes());
        }
    }

    /// Decodes a segment table payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a record is truncated or inconsistent.
    pub fn decode_all(payload: &[u8]) -> SiloResult<Vec<Self>> {
        let mut r = Reader::new(payload);
        let mut out = Vec::new();
        let short = || SiloError::corrupt("segment table truncated");
        while r.remaining() > 0 {
            let ptr = SegPtr {
                offset: r.u64().ok_or_else(short)?,
                length: r.u64().ok_or_else(short)?,
                objlist: r.u64().ok_or_else(short)?,
                lobjlist: r.u32().ok_or_else(short)?,
                serial: r.u32().ok_or_else(short)?,
            };
            let ban_tail = decode_ban(r.i64().ok_or_else(short)?);
            let bitmap_len = r.u32().ok_or_else(short)?;
            let _reserved = r.u32().ok_or_else(short)?;

            let words_needed = ptr.lobjlist.div_ceil(64);
            if bitmap_len % 8 != 0 || bitmap_len / 8 != words_needed {
                return Err(SiloError::corrupt(format!(
                    "segment {} bitmap of {bitmap_len} bytes for {} objects",
                    ptr.serial, ptr.lobjlist
                )));
            }
            let mut words = Vec::with_capacity(words_needed as usize);
            for _ in 0..words_needed {
                words.push(r.u64().ok_or_else(short)?);
            }
            // Bits past lobjlist carry no meaning.
            if let Some(last) = words.last_mut() {
                let used = ptr.lobjlist % 64;
                if used != 0 {
                    *last &= (1u64 << used) - 1;
                }
            }
            out.push(Self {
                ptr,
                ban_tail,
                live: LiveMap {
                    words,
                    len: ptr.lobjlist,
                },
            });
        }
        Ok(out)
    }
}
