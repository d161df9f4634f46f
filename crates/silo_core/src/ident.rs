//! Silo ident block.
//!
//! The ident block is the signed payload of the `SILO` signature at offset
//! zero. It records the geometry of the silo and the offsets of the fixed
//! regions that follow it:
//!
//! ```text
//! | ident (32) | byte_order (4) | size (4) | major (4) | unique (4) |
//! | align (4) | granularity (4) | mediasize (8) | stuff[6] (48) |
//! ```
//!
//! It is written once when the silo is created and never modified; any
//! field that disagrees at mount time is fatal.

use crate::error::{SiloError, SiloResult};
use crate::region::{round_down, round_up, Reader, Region};
use crate::sign::{SignCtx, SignStatus, SIGN_HEADER_SIZE, SIGN_SPACE};

/// Fixed size of the ident record.
pub const IDENT_SIZE: u64 = 112;

/// Human readable tag stored in every ident block.
pub const IDENT_STRING: &str = "Persistent Storage Silo";

/// Byte-order marker as written by this implementation.
pub const BYTE_ORDER: u32 = 0x1234_5678;

/// On-media format version.
pub const MAJOR_VERSION: u32 = 2;

/// Signature tag of the ident block.
pub const IDENT_TAG: &str = "SILO";

/// Smallest table region accepted.
pub const MIN_TABLE_SIZE: u64 = 64 * 1024;

/// Largest default table region.
pub const MAX_TABLE_SIZE: u64 = 1024 * 1024;

/// Regions recorded in the ident block, in on-media order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stuff {
    /// First ban table.
    Ban1 = 0,
    /// Second ban table.
    Ban2 = 1,
    /// First segment table.
    Seg1 = 2,
    /// Second segment table.
    Seg2 = 3,
    /// Segment space.
    Space = 4,
    /// End of silo.
    End = 5,
}

/// The decoded ident block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    /// NUL padded tag string.
    pub ident: [u8; 32],
    /// Byte-order marker.
    pub byte_order: u32,
    /// Size of the ident record.
    pub size: u32,
    /// Format version.
    pub major_version: u32,
    /// Random id assigned at creation; signs every signature in the silo.
    pub unique: u32,
    /// Alignment of records inside the silo.
    pub align: u32,
    /// Smallest allocation unit in bytes.
    pub granularity: u32,
    /// Size of the silo in bytes.
    pub mediasize: u64,
    /// Region offsets, indexed by [`Stuff`].
    pub stuff: [u64; 6],
}

impl Ident {
    /// Lays out a new silo.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the geometry is unusable or the
    /// silo is too small to hold the tables and any segment space.
    pub fn new(
        mediasize: u64,
        align: u32,
        granularity: u32,
        table_size: Option<u64>,
        unique: u32,
    ) -> SiloResult<Self> {
        if !granularity.is_power_of_two() || granularity < 512 {
            return Err(SiloError::config(format!(
                "granularity {granularity} must be a power of two >= 512"
            )));
        }
        if !align.is_power_of_two() || align < 8 || align > granularity {
            return Err(SiloError::config(format!(
                "alignment {align} must be a power of two between 8 and the granularity"
            )));
        }
        let gran = u64::from(granularity);
        let mediasize = round_down(mediasize, gran);

        let table = table_size
            .unwrap_or_else(|| (mediasize / 16).clamp(MIN_TABLE_SIZE, MAX_TABLE_SIZE));
        let table = round_up(table.max(SIGN_SPACE + 8), gran);

        let ban1 = round_up(SIGN_SPACE + IDENT_SIZE, gran);
        let ban2 = ban1 + table;
        let seg1 = ban2 + table;
        let seg2 = seg1 + table;
        let space = seg2 + table;

        if space + 4 * gran > mediasize {
            return Err(SiloError::config(format!(
                "silo of {mediasize} bytes too small for {table} byte tables"
            )));
        }

        let mut ident = [0u8; 32];
        ident[..IDENT_STRING.len()].copy_from_slice(IDENT_STRING.as_bytes());

        Ok(Self {
            ident,
            byte_order: BYTE_ORDER,
            size: IDENT_SIZE as u32,
            major_version: MAJOR_VERSION,
            unique,
            align,
            granularity,
            mediasize,
            stuff: [ban1, ban2, seg1, seg2, space, mediasize],
        })
    }

    /// Returns the start offset of a region.
    #[must_use]
    pub fn offset(&self, stuff: Stuff) -> u64 {
        self.stuff[stuff as usize]
    }

    /// Returns the length of the region starting at `stuff`.
    ///
    /// # Panics
    ///
    /// Panics for [`Stuff::End`], which has no length.
    #[must_use]
    pub fn region_len(&self, stuff: Stuff) -> u64 {
        assert!(stuff != Stuff::End, "end of silo has no length");
        let i = stuff as usize;
        self.stuff[i + 1] - self.stuff[i]
    }

    /// Returns the payload capacity of a signed region (length minus
    /// signature overhead).
    #[must_use]
    pub fn stuff_len(&self, stuff: Stuff) -> u64 {
        self.region_len(stuff) - SIGN_SPACE
    }

    /// Encodes the ident block.
    #[must_use]
    pub fn encode(&self) -> [u8; IDENT_SIZE as usize] {
        let mut buf = Vec::with_capacity(IDENT_SIZE as usize);
        buf.extend_from_slice(&self.ident);
        buf.extend_from_slice(&self.byte_order.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.major_version.to_le_bytes());
        buf.extend_from_slice(&self.unique.to_le_bytes());
        buf.extend_from_slice(&self.align.to_le_bytes());
        buf.extend_from_slice(&self.granularity.to_le_bytes());
        buf.extend_from_slice(&self.mediasize.to_le_bytes());
        for s in self.stuff {
            buf.extend_from_slice(&s.to_le_bytes());
        }
        let mut out = [0u8; IDENT_SIZE as usize];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes an ident block without validating it.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if fewer than [`IDENT_SIZE`] bytes are given.
    pub fn decode(data: &[u8]) -> SiloResult<Self> {
        let mut r = Reader::new(data);
        let short = || SiloError::corrupt("ident block truncated");
        let ident = r.array().ok_or_else(short)?;
        let byte_order = r.u32().ok_or_else(short)?;
        let size = r.u32().ok_or_else(short)?;
        let major_version = r.u32().ok_or_else(short)?;
        let unique = r.u32().ok_or_else(short)?;
        let align = r.u32().ok_or_else(short)?;
        let granularity = r.u32().ok_or_else(short)?;
        let mediasize = r.u64().ok_or_else(short)?;
        let mut stuff = [0u64; 6];
        for s in &mut stuff {
            *s = r.u64().ok_or_else(short)?;
        }
        Ok(Self {
            ident,
            byte_order,
            size,
            major_version,
            unique,
            align,
            granularity,
            mediasize,
            stuff,
        })
    }

    /// Returns whether the tag string is present.
    #[must_use]
    pub fn has_tag(&self) -> bool {
        let end = IDENT_STRING.len();
        &self.ident[..end] == IDENT_STRING.as_bytes() && self.ident[end..].iter().all(|&b| b == 0)
    }

    /// Checks the fixed fields and geometry against the medium.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::IdentMismatch`] for the first field that
    /// disagrees.
    pub fn validate(&self, mediasize: u64, granularity: u32) -> SiloResult<()> {
        if !self.has_tag() {
            return Err(SiloError::ident_mismatch(
                "ident",
                IDENT_STRING,
                String::from_utf8_lossy(&self.ident).trim_end_matches('\0'),
            ));
        }
        if self.byte_order != BYTE_ORDER {
            let found = if self.byte_order == BYTE_ORDER.swap_bytes() {
                format!("{:#010x} (foreign endian)", self.byte_order)
            } else {
                format!("{:#010x}", self.byte_order)
            };
            return Err(SiloError::ident_mismatch(
                "byte_order",
                format!("{BYTE_ORDER:#010x}"),
                found,
            ));
        }
        if u64::from(self.size) != IDENT_SIZE {
            return Err(SiloError::ident_mismatch("size", IDENT_SIZE, self.size));
        }
        if self.major_version != MAJOR_VERSION {
            return Err(SiloError::ident_mismatch(
                "major_version",
                MAJOR_VERSION,
                self.major_version,
            ));
        }
        if self.mediasize != mediasize {
            return Err(SiloError::ident_mismatch(
                "mediasize",
                mediasize,
                self.mediasize,
            ));
        }
        if self.granularity != granularity {
            return Err(SiloError::ident_mismatch(
                "granularity",
                granularity,
                self.granularity,
            ));
        }
        if self.align < 8 || !self.align.is_power_of_two() {
            return Err(SiloError::ident_mismatch(
                "align",
                "power of two >= 8",
                self.align,
            ));
        }
        let floor = SIGN_HEADER_SIZE + IDENT_SIZE;
        let ordered = self.stuff.windows(2).all(|w| w[0] + SIGN_SPACE <= w[1]);
        if self.stuff[Stuff::Ban1 as usize] < floor
            || !ordered
            || self.stuff[Stuff::End as usize] != self.mediasize
        {
            return Err(SiloError::ident_mismatch(
                "stuff",
                "ordered regions inside the silo",
                format!("{:?}", self.stuff),
            ));
        }
        Ok(())
    }

    /// Returns the signature context of the ident block.
    #[must_use]
    pub fn sign_ctx(&self) -> SignCtx {
        SignCtx::define(0, self.stuff[Stuff::Ban1 as usize], IDENT_TAG, self.unique)
    }

    /// Writes and syncs the signed ident block.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to flush.
    pub fn write(&self, region: &mut Region) -> SiloResult<()> {
        let mut ctx = self.sign_ctx();
        ctx.reset(region);
        ctx.append(region, &self.encode());
        ctx.sync(region)
    }

    /// Reads, authenticates and validates the ident block of a silo.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if the ident signature does not validate,
    /// or an ident mismatch if any field disagrees with the medium.
    pub fn read(region: &Region, granularity: u32) -> SiloResult<Self> {
        if region.len() < SIGN_SPACE + IDENT_SIZE {
            return Err(SiloError::config("medium too small to hold a silo"));
        }
        let ident = Self::decode(region.bytes(SIGN_HEADER_SIZE, IDENT_SIZE))?;
        if !ident.has_tag() {
            return Err(SiloError::ident_mismatch(
                "ident",
                IDENT_STRING,
                String::from_utf8_lossy(&ident.ident).trim_end_matches('\0'),
            ));
        }

        let limit = (SIGN_SPACE + IDENT_SIZE).max(ident.stuff[Stuff::Ban1 as usize]);
        let limit = limit.min(region.len());
        let mut ctx = SignCtx::define(0, limit, IDENT_TAG, ident.unique);
        match ctx.check(region) {
            SignStatus::Valid if ctx.len() == IDENT_SIZE => {}
            SignStatus::Valid => {
                return Err(SiloError::ident_mismatch("size", IDENT_SIZE, ctx.len()))
            }
            status => {
                return Err(SiloError::corrupt(format!(
                    "ident signature invalid ({status:?})"
                )))
            }
        }

        ident.validate(region.len(), granularity)?;
        Ok(ident)
    }

    /// Returns whether the ident area has never been written.
    #[must_use]
    pub fn is_blank(region: &Region) -> bool {
        let len = (SIGN_SPACE + IDENT_SIZE).min(region.len());
        region.bytes(0, len).iter().all(|&b| b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_storage::InMemoryMedia;

    const MIB: u64 = 1024 * 1024;

    fn region(len: u64) -> Region {
        Region::new(Box::new(InMemoryMedia::new(len)))
    }

    #[test]
    fn encoded_size_is_fixed() {
        let ident = Ident::new(8 * MIB, 8, 512, None, 7).unwrap();
        assert_eq!(ident.encode().len() as u64, IDENT_SIZE);
    }

    #[test]
    fn layout_is_ordered_and_aligned() {
        let ident = Ident::new(8 * MIB, 8, 512, None, 7).unwrap();
        assert_eq!(ident.offset(Stuff::Ban1), 512);
        assert!(ident.stuff.windows(2).all(|w| w[0] < w[1]));
        assert!(ident.stuff.iter().all(|s| s % 512 == 0));
        assert_eq!(ident.offset(Stuff::End), 8 * MIB);
        assert_eq!(ident.region_len(Stuff::Ban1), 512 * 1024);
        assert_eq!(ident.stuff_len(Stuff::Seg1), 512 * 1024 - SIGN_SPACE);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let ident = Ident::new(16 * MIB, 64, 4096, Some(128 * 1024), 0xdead_beef).unwrap();
        let decoded = Ident::decode(&ident.encode()).unwrap();
        assert_eq!(decoded, ident);
    }

    #[test]
    fn rejects_bad_geometry() {
        assert!(Ident::new(8 * MIB, 8, 1000, None, 1).is_err());
        assert!(Ident::new(8 * MIB, 3, 512, None, 1).is_err());
        assert!(Ident::new(256 * 1024, 8, 512, None, 1).unwrap_err().is_config());
    }

    #[test]
    fn write_then_read() {
        let mut r = region(8 * MIB);
        assert!(Ident::is_blank(&r));
        let ident = Ident::new(8 * MIB, 8, 512, None, 99).unwrap();
        ident.write(&mut r).unwrap();
        assert!(!Ident::is_blank(&r));

        let read = Ident::read(&r, 512).unwrap();
        assert_eq!(read, ident);
    }

    #[test]
    fn granularity_mismatch_is_fatal() {
        let mut r = region(8 * MIB);
        Ident::new(8 * MIB, 8, 512, None, 99)
            .unwrap()
            .write(&mut r)
            .unwrap();
        let err = Ident::read(&r, 4096).unwrap_err();
        assert!(matches!(
            err,
            SiloError::IdentMismatch {
                field: "granularity",
                ..
            }
        ));
    }

    #[test]
    fn mediasize_mismatch_is_fatal() {
        let mut r = region(8 * MIB);
        Ident::new(4 * MIB, 8, 512, None, 99)
            .unwrap()
            .write(&mut r)
            .unwrap();
        let err = Ident::read(&r, 512).unwrap_err();
        assert!(matches!(
            err,
            SiloError::IdentMismatch {
                field: "mediasize",
                ..
            }
        ));
    }

    #[test]
    fn foreign_endian_is_reported() {
        let mut ident = Ident::new(8 * MIB, 8, 512, None, 99).unwrap();
        ident.byte_order = BYTE_ORDER.swap_bytes();
        let err = ident.validate(8 * MIB, 512).unwrap_err();
        assert!(err.to_string().contains("foreign endian"));
    }

    #[test]
    fn wrong_version_is_fatal() {
        let mut ident = Ident::new(8 * MIB, 8, 512, None, 99).unwrap();
        ident.major_version = 1;
        assert!(ident.validate(8 * MIB, 512).unwrap_err().is_config());
    }

    #[test]
    fn tampered_ident_fails_signature() {
        let mut r = region(8 * MIB);
        let ident = Ident::new(8 * MIB, 8, 512, None, 99).unwrap();
        ident.write(&mut r).unwrap();
        // Flip a byte inside the recorded mediasize.
        r.bytes_mut(SIGN_HEADER_SIZE + 56, 1)[0] ^= 0x40;
        assert!(matches!(
            Ident::read(&r, 512),
            Err(SiloError::Corrupt { .. })
        ));
    }

    #[test]
    fn blank_medium_is_not_a_silo() {
        let r = region(8 * MIB);
        assert!(Ident::read(&r, 512).unwrap_err().is_config());
    }
}
