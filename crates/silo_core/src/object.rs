//! Object descriptors.
//!
//! Each stored object is described by a fixed 88-byte record in its
//! segment's descriptor array:
//!
//! ```text
//! | hash (32) | entered f64 | ttl f64 | grace f64 | keep f64 | ban i64 | ptr u64 | len u64 |
//! ```
//!
//! `ptr` is silo-relative. `ban` is the generation of the newest ban that
//! was active when the object was created, or `-1` for none.

use crate::error::{SiloError, SiloResult};
use crate::region::Reader;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of an encoded descriptor.
pub const DESC_SIZE: u64 = 88;

/// Length of an object hash.
pub const HASH_SIZE: usize = 32;

/// Content hash identifying a cached object.
pub type ObjectHash = [u8; HASH_SIZE];

/// Returns the current time as seconds since the Unix epoch.
#[must_use]
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// When an object was created and how long it stays useful.
///
/// All fields are seconds; `entered` is an absolute Unix time. An object
/// is dead once `entered + ttl + grace + keep` lies in the past.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Expiry {
    /// Creation time.
    pub entered: f64,
    /// Time to live.
    pub ttl: f64,
    /// Grace period after the ttl.
    pub grace: f64,
    /// Keep period after grace.
    pub keep: f64,
}

impl Expiry {
    /// Creates an expiry entered now.
    #[must_use]
    pub fn new(ttl: f64, grace: f64, keep: f64) -> Self {
        Self {
            entered: now(),
            ttl,
            grace,
            keep,
        }
    }

    /// Returns the time after which the object is dead.
    #[must_use]
    pub fn when(&self) -> f64 {
        self.entered + self.ttl + self.grace + self.keep
    }

    /// Returns whether the object is dead at `now`.
    #[must_use]
    pub fn is_expired(&self, now: f64) -> bool {
        self.when() <= now
    }
}

/// Encodes an optional ban generation as a signed marker.
#[must_use]
pub fn encode_ban(ban: Option<u64>) -> i64 {
    match ban {
        None => -1,
        Some(g) => i64::try_from(g).unwrap_or(i64::MAX),
    }
}

/// Decodes a signed ban marker; any negative value means no ban.
#[must_use]
pub fn decode_ban(marker: i64) -> Option<u64> {
    u64::try_from(marker).ok()
}

/// A descriptor as stored in a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDesc {
    /// Content hash.
    pub hash: ObjectHash,
    /// Expiry record.
    pub expiry: Expiry,
    /// Newest ban active at creation.
    pub ban: Option<u64>,
    /// Silo-relative payload offset.
    pub ptr: u64,
    /// Payload length in bytes.
    pub len: u64,
}

impl ObjectDesc {
    /// Encodes the descriptor.
    #[must_use]
    pub fn encode(&self) -> [u8; DESC_SIZE as usize] {
        let mut out = [0u8; DESC_SIZE as usize];
        out[..32].copy_from_slice(&self.hash);
        out[32..40].copy_from_slice(&self.expiry.entered.to_le_bytes());
        out[40..48].copy_from_slice(&self.expiry.ttl.to_le_bytes());
        out[48..56].copy_from_slice(&self.expiry.grace.to_le_bytes());
        out[56..64].copy_from_slice(&self.expiry.keep.to_le_bytes());
        out[64..72].copy_from_slice(&encode_ban(self.ban).to_le_bytes());
        out[72..80].copy_from_slice(&self.ptr.to_le_bytes());
        out[80..88].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decodes a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a corruption error if `data` is shorter than [`DESC_SIZE`].
    pub fn decode(data: &[u8]) -> SiloResult<Self> {
        let mut r = Reader::new(data);
        let short = || SiloError::corrupt("object descriptor truncated");
        let hash = r.array().ok_or_else(short)?;
        let expiry = Expiry {
            entered: r.f64().ok_or_else(short)?,
            ttl: r.f64().ok_or_else(short)?,
            grace: r.f64().ok_or_else(short)?,
            keep: r.f64().ok_or_else(short)?,
        };
        let ban = decode_ban(r.i64().ok_or_else(short)?);
        let ptr = r.u64().ok_or_else(short)?;
        let len = r.u64().ok_or_else(short)?;
        Ok(Self {
            hash,
            expiry,
            ban,
            ptr,
            len,
        })
    }
}

/// Restart-stable reference to a stored object.
///
/// A handle names the segment by its serial number and the object by its
/// slot in that segment's descriptor array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle {
    /// Serial number of the owning segment.
    pub serial: u32,
    /// Slot in the descriptor array.
    pub index: u32,
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.serial, self.index)
    }
}

impl FromStr for ObjectHandle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (serial, index) = s
            .split_once(':')
            .ok_or_else(|| format!("handle {s:?} is not SERIAL:INDEX"))?;
        Ok(Self {
            serial: serial.parse().map_err(|e| format!("bad serial: {e}"))?,
            index: index.parse().map_err(|e| format!("bad index: {e}"))?,
        })
    }
}

/// An object to be stored.
#[derive(Debug, Clone)]
pub struct NewObject<'a> {
    /// Content hash.
    pub hash: ObjectHash,
    /// Expiry record.
    pub expiry: Expiry,
    /// Newest ban active at creation.
    pub ban: Option<u64>,
    /// Payload bytes.
    pub payload: &'a [u8],
}

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    /// Handle for lookup and removal.
    pub handle: ObjectHandle,
    /// Content hash.
    pub hash: ObjectHash,
    /// Expiry record.
    pub expiry: Expiry,
    /// Newest ban active at creation.
    pub ban: Option<u64>,
    /// Payload length in bytes.
    pub len: u64,
}

/// An object read back from the silo.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// Handle of the object.
    pub handle: ObjectHandle,
    /// Content hash.
    pub hash: ObjectHash,
    /// Expiry record.
    pub expiry: Expiry,
    /// Newest ban active at creation.
    pub ban: Option<u64>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}
