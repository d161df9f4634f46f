//! # Silo Core
//!
//! Persistent storage silo for a caching HTTP proxy.
//!
//! A silo is one fixed-size mapped file laid out as:
//!
//! ```text
//! | ident | ban1 | ban2 | seg1 | seg2 | segment space ... |
//! ```
//!
//! This crate provides:
//! - Signed regions (`sign`) that commit by writing a SHA-256 digest last
//! - The ident block describing the silo geometry
//! - Ping-pong tables for bans and segments, so a torn write never loses
//!   the previous table image
//! - Segments with a bump allocator: descriptors grow up, payloads down
//! - A background aging thread that evicts the oldest segments
//! - Offline inspection of a silo image
//!
//! ## Example
//!
//! ```rust
//! use silo_core::{Expiry, NewObject, Silo, SiloConfig};
//! use silo_storage::InMemoryMedia;
//!
//! let config = SiloConfig::default().background_aging(false);
//! let silo = Silo::create(Box::new(InMemoryMedia::new(8 << 20)), config).unwrap();
//! let handle = silo
//!     .insert(&NewObject {
//!         hash: [7; 32],
//!         expiry: Expiry::new(60.0, 0.0, 0.0),
//!         ban: None,
//!         payload: b"body",
//!     })
//!     .unwrap();
//!
//! let media = silo.close().unwrap();
//! let silo = Silo::open(media, SiloConfig::default().background_aging(false)).unwrap();
//! assert_eq!(silo.lookup(handle).unwrap().unwrap().payload, b"body");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aging;
mod ban;
mod config;
mod error;
mod ident;
mod inspect;
mod object;
mod region;
pub mod segment;
pub mod sign;
mod silo;
mod stats;
mod table;

pub use aging::AgingReport;
pub use ban::{Ban, BanList};
pub use config::{min_segment_len, SiloConfig, Thresholds};
pub use error::{SiloError, SiloResult};
pub use ident::{Ident, Stuff, IDENT_SIZE, IDENT_STRING, MAJOR_VERSION};
pub use inspect::{inspect, InspectReport, SegmentReport, TableReport};
pub use object::{
    now, Expiry, NewObject, ObjectDesc, ObjectHandle, ObjectHash, ObjectInfo, StoredObject,
    DESC_SIZE,
};
pub use region::{round_down, round_up, Region};
pub use segment::{SegmentInfo, SegmentState};
pub use sign::{SignSpace, SignStatus};
pub use silo::Silo;
pub use stats::{SiloStats, StatsSnapshot};
pub use table::{CopyStatus, PingPong, TableKind};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
