//! Ban list persistence.
//!
//! The silo does not evaluate bans. It keeps the list of bans that stored
//! objects may still refer to, so the cache layer can rebuild its ban
//! list after a restart. Each ban record in the ban table is:
//!
//! ```text
//! | generation u64 | created f64 | len u32 | reserved u32 | spec (len, padded to 8) |
//! ```

use crate::error::{SiloError, SiloResult};
use crate::region::{round_up, Reader};

const BAN_HEADER: usize = 24;

/// A persisted ban.
#[derive(Debug, Clone, PartialEq)]
pub struct Ban {
    /// Monotonic generation number, starting at 1.
    pub generation: u64,
    /// Creation time, seconds since the Unix epoch.
    pub created: f64,
    /// Opaque ban specification.
    pub spec: Vec<u8>,
}

impl Ban {
    fn encoded_len(&self) -> usize {
        BAN_HEADER + round_up(self.spec.len() as u64, 8) as usize
    }
}

/// The in-memory ban list, oldest first.
#[derive(Debug, Clone, Default)]
pub struct BanList {
    bans: Vec<Ban>,
}

impl BanList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bans, oldest first.
    #[must_use]
    pub fn bans(&self) -> &[Ban] {
        &self.bans
    }

    /// Returns the generation of the newest ban.
    #[must_use]
    pub fn newest(&self) -> Option<u64> {
        self.bans.last().map(|b| b.generation)
    }

    /// Appends a ban and returns its generation.
    pub fn add(&mut self, spec: &[u8], created: f64) -> u64 {
        let generation = self.newest().map_or(1, |g| g + 1);
        self.bans.push(Ban {
            generation,
            created,
            spec: spec.to_vec(),
        });
        generation
    }

    /// Drops bans older than `tail`. The newest ban is always kept.
    pub fn prune(&mut self, tail: u64) {
        let Some(newest) = self.newest() else {
            return;
        };
        let keep_from = tail.min(newest);
        self.bans.retain(|b| b.generation >= keep_from);
    }

    /// Encodes the list as a ban table payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bans.iter().map(Ban::encoded_len).sum());
        for ban in &self.bans {
            out.extend_from_slice(&ban.generation.to_le_bytes());
            out.extend_from_slice(&ban.created.to_le_bytes());
            out.extend_from_slice(&(ban.spec.len() as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&ban.spec);
            out.resize(out.len() + ban.encoded_len() - BAN_HEADER - ban.spec.len(), 0);
        }
        out
    }

    /// Decodes a ban table payload.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if a record is truncated or generations
    /// are not strictly increasing.
    pub fn decode(payload: &[u8]) -> SiloResult<Self> {
        let mut r = Reader::new(payload);
        let mut bans: Vec<Ban> = Vec::new();
        let short = || SiloError::corrupt("ban table truncated");
        while r.remaining() > 0 {
            let generation = r.u64().ok_or_else(short)?;
            let created = r.f64().ok_or_else(short)?;
            let len = r.u32().ok_or_else(short)? as usize;
            let _reserved = r.u32().ok_or_else(short)?;
            let padded = round_up(len as u64, 8) as usize;
            let spec = r.take(padded).ok_or_else(short)?[..len].to_vec();
            if bans.last().is_some_and(|b| b.generation >= generation) {
                return Err(SiloError::corrupt(format!(
                    "ban generation {generation} out of order"
                )));
            }
            bans.push(Ban {
                generation,
                created,
                spec,
            });
        }
        Ok(Self { bans })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_increase() {
        let mut list = BanList::new();
        assert_eq!(list.newest(), None);
        assert_eq!(list.add(b"req.url ~ /a", 1.0), 1);
        assert_eq!(list.add(b"req.url ~ /b", 2.0), 2);
        assert_eq!(list.newest(), Some(2));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut list = BanList::new();
        list.add(b"obj.http.x == y", 10.5);
        list.add(b"", 11.0);
        list.add(b"req.http.host == example.com", 12.0);

        let payload = list.encode();
        assert_eq!(payload.len() % 8, 0);
        let decoded = BanList::decode(&payload).unwrap();
        assert_eq!(decoded.bans(), list.bans());
    }

    #[test]
    fn prune_keeps_newest() {
        let mut list = BanList::new();
        for i in 0..5 {
            list.add(format!("ban {i}").as_bytes(), f64::from(i));
        }
        list.prune(3);
        let gens: Vec<u64> = list.bans().iter().map(|b| b.generation).collect();
        assert_eq!(gens, vec![3, 4, 5]);

        list.prune(100);
        assert_eq!(list.bans().len(), 1);
        assert_eq!(list.newest(), Some(5));
    }

    #[test]
    fn out_of_order_is_corrupt() {
        let mut a = BanList::new();
        a.add(b"x", 0.0);
        let mut payload = a.encode();
        payload.extend_from_slice(&a.encode());
        assert!(BanList::decode(&payload).is_err());
    }

    #[test]
    fn truncated_is_corrupt() {
        let mut list = BanList::new();
        list.add(b"abcdefghij", 0.0);
        let payload = list.encode();
        assert!(BanList::decode(&payload[..payload.len() - 1]).is_err());
    }
}
