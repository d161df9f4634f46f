//! # Silo Storage
//!
//! Backing media and file acquisition for persistent storage silos.
//!
//! This crate provides the lowest-level storage abstraction: a fixed-size
//! byte region that the silo maps once and addresses by offset. Media are
//! **opaque byte regions** - they do not interpret the data they hold.
//!
//! ## Design Principles
//!
//! - A medium is one contiguous region of fixed length
//! - Durability is a "commit this range" primitive (`flush_range`)
//! - No knowledge of signatures, tables or segments
//! - Must be `Send + Sync` so a silo can be shared across threads
//!
//! ## Available Media
//!
//! - [`MappedFile`] - memory-mapped file or anonymous mapping
//! - [`InMemoryMedia`] - heap buffer for tests and crash simulations
//!
//! ## Example
//!
//! ```rust
//! use silo_storage::{InMemoryMedia, SiloMedia};
//!
//! let mut media = InMemoryMedia::new(1024 * 1024);
//! media.as_mut_slice()[0..4].copy_from_slice(b"silo");
//! media.flush_range(0, 4).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod acquire;
mod error;
mod mapped;
mod media;
mod memory;

pub use acquire::{file_size, get_file, parse_size, AcquiredFile, FileOutcome, MIN_SIZE};
pub use error::{StorageError, StorageResult};
pub use mapped::MappedFile;
pub use media::SiloMedia;
pub use memory::InMemoryMedia;
