//! Signature codec.
//!
//! A signature protects a byte range of the silo:
//!
//! ```text
//! | tag (8) | unique (4) | reserved (4) | mapped (8) | length (8) | data (length) | sha256 (32) |
//! ```
//!
//! The digest covers the header up to (not including) `length`, then the
//! data, then `length` itself. Because `length` is hashed last, a context
//! can keep a running SHA-256 over header and data and append more data
//! without rehashing what is already covered.
//!
//! `mapped` holds the silo-relative offset of the header, so a copy of a
//! signature moved elsewhere in the silo no longer validates.

use crate::error::SiloResult;
use crate::region::{Reader, Region};
use sha2::{Digest, Sha256};

/// Size of the signature header.
pub const SIGN_HEADER_SIZE: u64 = 32;

/// Size of the trailing digest.
pub const DIGEST_SIZE: u64 = 32;

/// Bytes a signature adds around its data.
pub const SIGN_SPACE: u64 = SIGN_HEADER_SIZE + DIGEST_SIZE;

/// Maximum length of a signature tag.
pub const TAG_SIZE: usize = 8;

/// Byte offset of the `length` field inside the header.
const LENGTH_FIELD: usize = 24;

/// Outcome of validating a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignStatus {
    /// Header and digest match.
    Valid,
    /// Tag, unique id, mapped offset or length disagree with the context.
    TagMismatch,
    /// The header is plausible but the digest does not match.
    DigestMismatch,
}

impl SignStatus {
    /// Returns whether the signature validated.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// A signature bound to a location in the silo.
#[derive(Clone)]
pub struct SignCtx {
    offset: u64,
    limit: u64,
    tag: [u8; TAG_SIZE],
    unique: u32,
    length: u64,
    hasher: Sha256,
}

impl std::fmt::Debug for SignCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignCtx")
            .field("tag", &self.tag_str())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl SignCtx {
    /// Binds a context to the header at `offset`.
    ///
    /// Data and digest may not extend past `limit`. Nothing is read or
    /// written until `reset` or `check` is called.
    ///
    /// # Panics
    ///
    /// Panics if `tag` is longer than [`TAG_SIZE`] or the header does not
    /// fit before `limit`.
    #[must_use]
    pub fn define(offset: u64, limit: u64, tag: &str, unique: u32) -> Self {
        assert!(tag.len() <= TAG_SIZE, "signature tag {tag:?} too long");
        assert!(
            offset + SIGN_SPACE <= limit,
            "signature at {offset} does not fit below {limit}"
        );
        let mut padded = [0u8; TAG_SIZE];
        padded[..tag.len()].copy_from_slice(tag.as_bytes());
        Self {
            offset,
            limit,
            tag: padded,
            unique,
            length: 0,
            hasher: Sha256::new(),
        }
    }

    /// Returns the tag as text.
    #[must_use]
    pub fn tag_str(&self) -> String {
        let end = self.tag.iter().position(|&b| b == 0).unwrap_or(TAG_SIZE);
        String::from_utf8_lossy(&self.tag[..end]).into_owned()
    }

    /// Returns the offset of the header.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the offset of the first data byte.
    #[must_use]
    pub const fn data_offset(&self) -> u64 {
        self.offset + SIGN_HEADER_SIZE
    }

    /// Returns the number of signed data bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.length
    }

    /// Returns whether no data is signed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Returns the offset one past the last data byte (where the digest sits).
    #[must_use]
    pub const fn data_end(&self) -> u64 {
        self.data_offset() + self.length
    }

    /// Returns the offset one past the digest.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.data_end() + DIGEST_SIZE
    }

    /// Returns how many more data bytes fit before the limit.
    #[must_use]
    pub const fn capacity_left(&self) -> u64 {
        self.limit - self.end()
    }

    fn header(&self, length: u64) -> [u8; SIGN_HEADER_SIZE as usize] {
        let mut h = [0u8; SIGN_HEADER_SIZE as usize];
        h[..TAG_SIZE].copy_from_slice(&self.tag);
        h[8..12].copy_from_slice(&self.unique.to_le_bytes());
        h[16..24].copy_from_slice(&self.offset.to_le_bytes());
        h[LENGTH_FIELD..].copy_from_slice(&length.to_le_bytes());
        h
    }

    fn write_digest(&self, region: &mut Region) {
        let mut cx = self.hasher.clone();
        cx.update(self.length.to_le_bytes());
        let digest = cx.finalize();
        region.write(self.data_end(), &digest);
    }

    /// Truncates the signed data to zero bytes and writes a valid empty
    /// signature in place.
    pub fn reset(&mut self, region: &mut Region) {
        let header = self.header(0);
        region.write(self.offset, &header);
        self.length = 0;
        self.hasher = Sha256::new();
        self.hasher.update(&header[..LENGTH_FIELD]);
        self.write_digest(region);
    }

    /// Signs `len` bytes already present at [`data_end`](Self::data_end).
    ///
    /// # Panics
    ///
    /// Panics if the data and digest would run past the limit.
    pub fn fold(&mut self, region: &mut Region, len: u64) {
        assert!(
            len <= self.capacity_left(),
            "signature {} overflow: {len} bytes, {} left",
            self.tag_str(),
            self.capacity_left()
        );
        if len != 0 {
            self.hasher.update(region.bytes(self.data_end(), len));
            self.length += len;
            region.write(self.offset + LENGTH_FIELD as u64, &self.length.to_le_bytes());
        }
        self.write_digest(region);
    }

    /// Appends `data` to the signed range and updates the digest.
    ///
    /// # Panics
    ///
    /// Panics if the data and digest would run past the limit.
    pub fn append(&mut self, region: &mut Region, data: &[u8]) {
        assert!(
            data.len() as u64 <= self.capacity_left(),
            "signature {} overflow: {} bytes, {} left",
            self.tag_str(),
            data.len(),
            self.capacity_left()
        );
        region.write(self.data_end(), data);
        self.fold(region, data.len() as u64);
    }

    /// Re-signs only the first `len` bytes of the current data.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the signed length.
    pub fn truncate(&mut self, region: &mut Region, len: u64) {
        assert!(len <= self.length, "truncate beyond signed length");
        self.reset(region);
        self.fold(region, len);
    }

    /// Validates the signature found on the medium.
    ///
    /// On success the context adopts the stored length and running digest,
    /// so further appends continue from there.
    pub fn check(&mut self, region: &Region) -> SignStatus {
        let header = region.bytes(self.offset, SIGN_HEADER_SIZE);
        let mut r = Reader::new(header);
        let tag: [u8; TAG_SIZE] = r.array().unwrap_or_default();
        let unique = r.u32().unwrap_or_default();
        let _reserved = r.u32();
        let mapped = r.u64().unwrap_or_default();
        let length = r.u64().unwrap_or(u64::MAX);

        if tag != self.tag || unique != self.unique || mapped != self.offset {
            return SignStatus::TagMismatch;
        }
        let max_len = self.limit - self.offset - SIGN_SPACE;
        if length > max_len {
            return SignStatus::TagMismatch;
        }

        let mut hasher = Sha256::new();
        hasher.update(&header[..LENGTH_FIELD]);
        hasher.update(region.bytes(self.data_offset(), length));
        let mut cx = hasher.clone();
        cx.update(length.to_le_bytes());
        let digest = cx.finalize();

        if digest.as_slice() != region.bytes(self.data_offset() + length, DIGEST_SIZE) {
            return SignStatus::DigestMismatch;
        }

        self.length = length;
        self.hasher = hasher;
        SignStatus::Valid
    }

    /// Commits header, data and digest to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to flush.
    pub fn sync(&self, region: &Region) -> SiloResult<()> {
        region.sync(self.offset, self.end() - self.offset)
    }
}

/// A fixed region of the silo wrapped by one signature.
///
/// The signature header sits at the start of the region and the data may
/// grow up to `size` bytes, leaving room for the digest.
#[derive(Debug, Clone)]
pub struct SignSpace {
    ctx: SignCtx,
    size: u64,
}

impl SignSpace {
    /// Binds a signspace to the region `[offset, offset + region_len)`.
    ///
    /// # Panics
    ///
    /// Panics if the region cannot hold a signature.
    #[must_use]
    pub fn define(offset: u64, region_len: u64, tag: &str, unique: u32) -> Self {
        assert!(region_len >= SIGN_SPACE, "signspace {tag} too small");
        Self {
            ctx: SignCtx::define(offset, offset + region_len, tag, unique),
            size: region_len - SIGN_SPACE,
        }
    }

    /// Returns the signature context.
    #[must_use]
    pub const fn ctx(&self) -> &SignCtx {
        &self.ctx
    }

    /// Returns the data capacity in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of signed data bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.ctx.len()
    }

    /// Returns whether the signspace holds no data.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ctx.is_empty()
    }

    /// Returns the unused data capacity.
    #[must_use]
    pub const fn free(&self) -> u64 {
        self.size - self.ctx.len()
    }

    /// Returns the signed data.
    #[must_use]
    pub fn data<'r>(&self, region: &'r Region) -> &'r [u8] {
        region.bytes(self.ctx.data_offset(), self.ctx.len())
    }

    /// Validates the signspace.
    pub fn check(&mut self, region: &Region) -> SignStatus {
        self.ctx.check(region)
    }

    /// Empties the signspace, leaving a valid signature.
    pub fn reset(&mut self, region: &mut Region) {
        self.ctx.reset(region);
    }

    /// Appends `data`.
    ///
    /// # Panics
    ///
    /// Panics if the signspace would overflow.
    pub fn append(&mut self, region: &mut Region, data: &[u8]) {
        self.ctx.append(region, data);
    }

    /// Truncates the signed data to `len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds the current length.
    pub fn truncate(&mut self, region: &mut Region, len: u64) {
        self.ctx.truncate(region, len);
    }

    /// Replaces this signspace's contents with a copy of `src`'s data.
    ///
    /// # Panics
    ///
    /// Panics if `src` holds more data than this signspace can take.
    pub fn copy_from(&mut self, region: &mut Region, src: &SignSpace) {
        let len = src.len();
        assert!(len <= self.size, "signspace copy overflow");
        self.ctx.reset(region);
        region.copy_within(src.ctx.data_offset(), self.ctx.data_offset(), len);
        self.ctx.fold(region, len);
    }

    /// Commits the signspace to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to flush.
    pub fn sync(&self, region: &Region) -> SiloResult<()> {
        self.ctx.sync(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_storage::InMemoryMedia;

    fn region(len: u64) -> Region {
        Region::new(Box::new(InMemoryMedia::new(len)))
    }

    #[test]
    fn reset_produces_valid_empty_signature() {
        let mut r = region(4096);
        let mut ctx = SignCtx::define(512, 4096, "TEST", 42);
        ctx.reset(&mut r);

        let mut fresh = SignCtx::define(512, 4096, "TEST", 42);
        assert_eq!(fresh.check(&r), SignStatus::Valid);
        assert_eq!(fresh.len(), 0);
    }

    #[test]
    fn append_extends_and_validates() {
        let mut r = region(4096);
        let mut ctx = SignCtx::define(0, 4096, "TEST", 1);
        ctx.reset(&mut r);
        ctx.append(&mut r, b"hello ");
        ctx.append(&mut r, b"world");
        assert_eq!(ctx.len(), 11);

        let mut fresh = SignCtx::define(0, 4096, "TEST", 1);
        assert_eq!(fresh.check(&r), SignStatus::Valid);
        assert_eq!(fresh.len(), 11);
        assert_eq!(r.bytes(fresh.data_offset(), 11), b"hello world");
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut a = region(4096);
        let mut b = region(4096);
        let mut ca = SignCtx::define(64, 4096, "X", 9);
        let mut cb = SignCtx::define(64, 4096, "X", 9);
        ca.reset(&mut a);
        cb.reset(&mut b);
        for chunk in [&b"ab"[..], b"cdef", b"", b"g"] {
            ca.append(&mut a, chunk);
        }
        cb.append(&mut b, b"abcdefg");
        assert_eq!(a.bytes(64, ca.end() - 64), b.bytes(64, cb.end() - 64));
    }

    #[test]
    fn check_continues_appending() {
        let mut r = region(4096);
        let mut ctx = SignCtx::define(0, 4096, "TEST", 1);
        ctx.reset(&mut r);
        ctx.append(&mut r, b"one");

        let mut resumed = SignCtx::define(0, 4096, "TEST", 1);
        assert!(resumed.check(&r).is_valid());
        resumed.append(&mut r, b"two");

        let mut fresh = SignCtx::define(0, 4096, "TEST", 1);
        assert!(fresh.check(&r).is_valid());
        assert_eq!(r.bytes(fresh.data_offset(), fresh.len()), b"onetwo");
    }

    #[test]
    fn wrong_tag_unique_or_location() {
        let mut r = region(4096);
        let mut ctx = SignCtx::define(128, 4096, "TEST", 1);
        ctx.reset(&mut r);
        ctx.append(&mut r, b"payload");

        assert_eq!(
            SignCtx::define(128, 4096, "OTHER", 1).check(&r),
            SignStatus::TagMismatch
        );
        assert_eq!(
            SignCtx::define(128, 4096, "TEST", 2).check(&r),
            SignStatus::TagMismatch
        );

        // A verbatim copy elsewhere carries the wrong mapped offset.
        r.copy_within(128, 1024, ctx.end() - 128);
        assert_eq!(
            SignCtx::define(1024, 4096, "TEST", 1).check(&r),
            SignStatus::TagMismatch
        );
    }

    #[test]
    fn zeroed_medium_is_not_valid() {
        let r = region(4096);
        assert_ne!(SignCtx::define(0, 4096, "", 0).check(&r), SignStatus::Valid);
    }

    #[test]
    fn byte_flips_inside_signed_range_detected() {
        let mut r = region(1024);
        let mut ctx = SignCtx::define(100, 1024, "FLIP", 5);
        ctx.reset(&mut r);
        ctx.append(&mut r, &[0xA5; 40]);
        let end = ctx.end();

        for pos in 100..end {
            let mut copy = region(1024);
            copy.write(0, r.bytes(0, 1024));
            copy.bytes_mut(pos, 1)[0] ^= 0x01;
            let status = SignCtx::define(100, 1024, "FLIP", 5).check(&copy);
            assert_ne!(status, SignStatus::Valid, "flip at {pos} not detected");
        }
    }

    #[test]
    fn byte_flips_outside_signed_range_ignored() {
        let mut r = region(1024);
        let mut ctx = SignCtx::define(100, 1024, "FLIP", 5);
        ctx.reset(&mut r);
        ctx.append(&mut r, &[0x5A; 40]);
        let end = ctx.end();

        for pos in (0..100).chain(end..1024) {
            let mut copy = region(1024);
            copy.write(0, r.bytes(0, 1024));
            copy.bytes_mut(pos, 1)[0] ^= 0xFF;
            let status = SignCtx::define(100, 1024, "FLIP", 5).check(&copy);
            assert_eq!(status, SignStatus::Valid, "flip at {pos} rejected");
        }
    }

    #[test]
    fn oversized_length_is_tag_mismatch() {
        let mut r = region(1024);
        let mut ctx = SignCtx::define(0, 256, "LEN", 1);
        ctx.reset(&mut r);
        r.write(24, &10_000u64.to_le_bytes());
        assert_eq!(
            SignCtx::define(0, 256, "LEN", 1).check(&r),
            SignStatus::TagMismatch
        );
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn append_past_limit_asserts() {
        let mut r = region(1024);
        let mut ctx = SignCtx::define(0, 128, "SMALL", 1);
        ctx.reset(&mut r);
        ctx.append(&mut r, &[0u8; 65]);
    }

    #[test]
    fn signspace_capacity_and_truncate() {
        let mut r = region(4096);
        let mut spc = SignSpace::define(1024, 256, "SPC", 3);
        spc.reset(&mut r);
        assert_eq!(spc.size(), 256 - SIGN_SPACE);
        spc.append(&mut r, b"0123456789");
        assert_eq!(spc.free(), spc.size() - 10);

        spc.truncate(&mut r, 4);
        let mut fresh = SignSpace::define(1024, 256, "SPC", 3);
        assert!(fresh.check(&r).is_valid());
        assert_eq!(fresh.data(&r), b"0123");
    }

    #[test]
    fn signspace_copy_between_slots() {
        let mut r = region(4096);
        let mut a = SignSpace::define(0, 512, "SLOT", 3);
        let mut b = SignSpace::define(512, 512, "SLOT", 3);
        a.reset(&mut r);
        b.reset(&mut r);
        a.append(&mut r, b"table image");

        b.copy_from(&mut r, &a);
        let mut fresh = SignSpace::define(512, 512, "SLOT", 3);
        assert!(fresh.check(&r).is_valid());
        assert_eq!(fresh.data(&r), b"table image");
    }
}
