//! # Silo Testkit
//!
//! Test utilities for persistent storage silos.
//!
//! This crate provides:
//! - Test fixtures: in-memory and file-backed silos with remount helpers
//! - Property-based test generators using proptest
//! - Crash simulation: a medium that only keeps flushed bytes, and torn
//!   table writes at every step of the ping-pong protocol
//! - Stress testing utilities for concurrent access
//!
//! ## Usage
//!
//! ```rust
//! use silo_testkit::prelude::*;
//!
//! let mut silo = TestSilo::memory(small_config());
//! let handle = silo.insert(&sample_object(1, b"cached")).unwrap();
//! silo.remount();
//! assert_eq!(silo.lookup(handle).unwrap().unwrap().payload, b"cached");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
