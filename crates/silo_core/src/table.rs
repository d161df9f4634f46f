//! Ping-pong tables.
//!
//! The ban table and the segment table each live in two fixed regions.
//! A table image is a generation number followed by the table payload:
//!
//! ```text
//! | generation u64 | payload ... |
//! ```
//!
//! An empty signspace is the generation-0 empty table.
//!
//! Writing a new image always targets the inactive copy: reset it, append
//! the whole image, commit it, then make it active. The image only becomes
//! valid when its digest lands, so an interrupted write leaves the active
//! copy as the newest valid one. At mount both copies are checked and the
//! valid one with the higher generation wins.

use crate::error::{SiloError, SiloResult};
use crate::ident::{Ident, Stuff};
use crate::region::Region;
use crate::sign::{SignSpace, SignStatus};
use tracing::{debug, warn};

/// Bytes taken by the generation prefix.
pub const GENERATION_SIZE: u64 = 8;

/// Which table a [`PingPong`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// The ban table.
    Ban,
    /// The segment table.
    Segment,
}

impl TableKind {
    /// Regions holding the two copies.
    #[must_use]
    pub const fn stuff(self) -> [Stuff; 2] {
        match self {
            Self::Ban => [Stuff::Ban1, Stuff::Ban2],
            Self::Segment => [Stuff::Seg1, Stuff::Seg2],
        }
    }

    /// Signature tags of the two copies.
    #[must_use]
    pub const fn tags(self) -> [&'static str; 2] {
        match self {
            Self::Ban => ["BAN1", "BAN2"],
            Self::Segment => ["SEG1", "SEG2"],
        }
    }

    /// Name used in log output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ban => "ban",
            Self::Segment => "segment",
        }
    }
}

/// Validation result of one table copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyStatus {
    /// Signature status.
    pub status: SignStatus,
    /// Generation, if the copy validated and carries a well-formed image.
    pub generation: Option<u64>,
}

impl CopyStatus {
    /// Returns whether the copy can be used.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.generation.is_some()
    }
}

/// A double-buffered, signed table.
#[derive(Debug, Clone)]
pub struct PingPong {
    kind: TableKind,
    slots: [SignSpace; 2],
    active: usize,
    generation: u64,
}

impl PingPong {
    /// Binds the table to its two regions.
    #[must_use]
    pub fn define(ident: &Ident, kind: TableKind) -> Self {
        let [a, b] = kind.stuff();
        let [ta, tb] = kind.tags();
        Self {
            kind,
            slots: [
                SignSpace::define(ident.offset(a), ident.region_len(a), ta, ident.unique),
                SignSpace::define(ident.offset(b), ident.region_len(b), tb, ident.unique),
            ],
            active: 0,
            generation: 0,
        }
    }

    /// Returns which table this is.
    #[must_use]
    pub const fn kind(&self) -> TableKind {
        self.kind
    }

    /// Returns the index of the authoritative copy.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.active
    }

    /// Returns the generation of the authoritative copy.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns how many payload bytes an image may carry.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.slots[0]
            .size()
            .min(self.slots[1].size())
            .saturating_sub(GENERATION_SIZE)
    }

    /// Returns the signspace of one copy.
    #[must_use]
    pub fn slot(&self, index: usize) -> &SignSpace {
        &self.slots[index]
    }

    /// Writes two valid empty copies.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium fails to flush.
    pub fn format(&mut self, region: &mut Region) -> SiloResult<()> {
        for slot in &mut self.slots {
            slot.reset(region);
            slot.sync(region)?;
        }
        self.active = 0;
        self.generation = 0;
        Ok(())
    }

    /// Checks both copies without selecting one.
    pub fn probe(&mut self, region: &Region) -> [CopyStatus; 2] {
        [0, 1].map(|i| {
            let slot = &mut self.slots[i];
            let status = slot.check(region);
            let generation = if status.is_valid() {
                image_generation(slot.data(region))
            } else {
                None
            };
            CopyStatus { status, generation }
        })
    }

    /// Selects the authoritative copy and returns its payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if neither copy validates.
    pub fn mount(&mut self, region: &Region) -> SiloResult<Vec<u8>> {
        let status = self.probe(region);
        for (i, copy) in status.iter().enumerate() {
            if !copy.is_usable() {
                warn!(
                    table = self.kind.name(),
                    copy = i + 1,
                    status = ?copy.status,
                    "table copy rejected"
                );
            }
        }

        let active = match (status[0].generation, status[1].generation) {
            (Some(a), Some(b)) if b > a => 1,
            (Some(_), _) => 0,
            (None, Some(_)) => 1,
            (None, None) => {
                return Err(SiloError::corrupt(format!(
                    "both copies of the {} table are invalid",
                    self.kind.name()
                )))
            }
        };
        self.active = active;
        self.generation = status[active].generation.unwrap_or_default();
        debug!(
            table = self.kind.name(),
            copy = active + 1,
            generation = self.generation,
            "table copy selected"
        );
        Ok(self.payload(region).to_vec())
    }

    /// Returns the payload of the authoritative copy.
    #[must_use]
    pub fn payload<'r>(&self, region: &'r Region) -> &'r [u8] {
        let data = self.slots[self.active].data(region);
        data.get(GENERATION_SIZE as usize..).unwrap_or_default()
    }

    /// Writes `payload` as the next generation into the inactive copy and
    /// makes it authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::TableFull`] if the image does not fit, or an error if
    /// the medium fails to flush. In both cases the active copy is untouched.
    pub fn persist(&mut self, region: &mut Region, payload: &[u8]) -> SiloResult<()> {
        if payload.len() as u64 > self.capacity() {
            return Err(SiloError::TableFull {
                table: self.kind.name(),
                requested: payload.len() as u64,
                capacity: self.capacity(),
            });
        }
        let next = self.generation + 1;
        let mut image = Vec::with_capacity(payload.len() + GENERATION_SIZE as usize);
        image.extend_from_slice(&next.to_le_bytes());
        image.extend_from_slice(payload);

        let target = 1 - self.active;
        let slot = &mut self.slots[target];
        slot.reset(region);
        slot.append(region, &image);
        slot.sync(region)?;

        self.active = target;
        self.generation = next;
        Ok(())
    }
}

fn image_generation(data: &[u8]) -> Option<u64> {
    match data.len() {
        0 => Some(0),
        n if (n as u64) < GENERATION_SIZE => None,
        _ => data[..8].try_into().ok().map(u64::from_le_bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::SIGN_HEADER_SIZE;
    use silo_storage::InMemoryMedia;

    const MIB: u64 = 1024 * 1024;

    fn setup() -> (Region, Ident) {
        let mut region = Region::new(Box::new(InMemoryMedia::new(8 * MIB)));
        let ident = Ident::new(8 * MIB, 8, 512, Some(64 * 1024), 11).unwrap();
        ident.write(&mut region).unwrap();
        (region, ident)
    }

    #[test]
    fn formatted_table_mounts_empty() {
        let (mut region, ident) = setup();
        let mut table = PingPong::define(&ident, TableKind::Segment);
        table.format(&mut region).unwrap();

        let mut mounted = PingPong::define(&ident, TableKind::Segment);
        assert!(mounted.mount(&region).unwrap().is_empty());
        assert_eq!(mounted.generation(), 0);
        assert_eq!(mounted.active(), 0);
    }

    #[test]
    fn persist_alternates_copies() {
        let (mut region, ident) = setup();
        let mut table = PingPong::define(&ident, TableKind::Ban);
        table.format(&mut region).unwrap();

        table.persist(&mut region, b"first").unwrap();
        assert_eq!(table.active(), 1);
        table.persist(&mut region, b"second").unwrap();
        assert_eq!(table.active(), 0);
        assert_eq!(table.generation(), 2);

        let mut mounted = PingPong::define(&ident, TableKind::Ban);
        assert_eq!(mounted.mount(&region).unwrap(), b"second");
        assert_eq!(mounted.generation(), 2);
    }

    #[test]
    fn corrupt_active_falls_back_to_previous() {
        let (mut region, ident) = setup();
        let mut table = PingPong::define(&ident, TableKind::Segment);
        table.format(&mut region).unwrap();
        table.persist(&mut region, b"old").unwrap();
        table.persist(&mut region, b"new").unwrap();

        let active = table.slot(table.active()).ctx().data_offset();
        region.bytes_mut(active + GENERATION_SIZE, 1)[0] ^= 0xff;

        let mut mounted = PingPong::define(&ident, TableKind::Segment);
        assert_eq!(mounted.mount(&region).unwrap(), b"old");
        assert_eq!(mounted.generation(), 1);
    }

    #[test]
    fn unfinished_write_keeps_active_copy() {
        let (mut region, ident) = setup();
        let mut table = PingPong::define(&ident, TableKind::Segment);
        table.format(&mut region).unwrap();
        table.persist(&mut region, b"committed").unwrap();

        // Inactive copy reset and image bytes written, digest never updated.
        let inactive = 1 - table.active();
        let mut slot = table.slot(inactive).clone();
        slot.reset(&mut region);
        let data = slot.ctx().data_offset();
        region.write(data, &2u64.to_le_bytes());
        region.write(data + GENERATION_SIZE, b"uncommitted");
        region.write(
            slot.ctx().offset() + SIGN_HEADER_SIZE - 8,
            &(GENERATION_SIZE + 11).to_le_bytes(),
        );

        let mut mounted = PingPong::define(&ident, TableKind::Segment);
        assert_eq!(mounted.mount(&region).unwrap(), b"committed");
        assert_eq!(mounted.active(), 1 - inactive);
    }

    #[test]
    fn both_copies_invalid_is_fatal() {
        let (mut region, ident) = setup();
        let mut table = PingPong::define(&ident, TableKind::Ban);
        table.format(&mut region).unwrap();
        for i in 0..2 {
            let off = table.slot(i).ctx().offset();
            region.bytes_mut(off, 1)[0] ^= 0xff;
        }
        let mut mounted = PingPong::define(&ident, TableKind::Ban);
        assert!(matches!(
            mounted.mount(&region),
            Err(SiloError::Corrupt { .. })
        ));
    }

    #[test]
    fn oversized_image_rejected() {
        let (mut region, ident) = setup();
        let mut table = PingPong::define(&ident, TableKind::Segment);
        table.format(&mut region).unwrap();
        let big = vec![0u8; table.capacity() as usize + 1];
        assert!(matches!(
            table.persist(&mut region, &big),
            Err(SiloError::TableFull { table: "segment", .. })
        ));
        assert_eq!(table.generation(), 0);
    }

    #[test]
    fn short_image_is_unusable() {
        assert_eq!(image_generation(&[]), Some(0));
        assert_eq!(image_generation(&[1, 2, 3]), None);
        assert_eq!(image_generation(&5u64.to_le_bytes()), Some(5));
    }
}
