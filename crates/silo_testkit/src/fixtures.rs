//! Test fixtures and silo helpers.
//!
//! Provides convenience functions for setting up test silos and common
//! test scenarios.

use silo_core::{Expiry, NewObject, Silo, SiloConfig};
use silo_storage::InMemoryMedia;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Size of the silos built by [`TestSilo`] unless stated otherwise.
pub const TEST_SILO_SIZE: u64 = 8 * 1024 * 1024;

/// A configuration with small segments and no aging thread.
///
/// At 512 byte granularity each segment holds three 1 KiB objects, so
/// tests reach segment rollover and eviction quickly.
pub fn small_config() -> SiloConfig {
    SiloConfig::default()
        .name("testkit")
        .max_segl(4096)
        .background_aging(false)
}

/// Builds an object with a hash filled with `tag` and a ten minute ttl.
pub fn sample_object(tag: u8, payload: &[u8]) -> NewObject<'_> {
    NewObject {
        hash: [tag; 32],
        expiry: Expiry::new(600.0, 10.0, 0.0),
        ban: None,
        payload,
    }
}

enum Backing {
    Memory,
    File { _dir: TempDir, path: PathBuf },
}

/// A test silo that can be closed and mounted again.
pub struct TestSilo {
    silo: Option<Silo>,
    config: SiloConfig,
    backing: Backing,
}

impl TestSilo {
    /// Creates a silo on an in-memory medium.
    pub fn memory(config: SiloConfig) -> Self {
        Self::memory_sized(TEST_SILO_SIZE, config)
    }

    /// Creates a silo of `size` bytes on an in-memory medium.
    pub fn memory_sized(size: u64, config: SiloConfig) -> Self {
        let media = InMemoryMedia::new(size);
        let silo = Silo::create(Box::new(media), config.clone())
            .expect("Failed to create in-memory silo");
        Self {
            silo: Some(silo),
            config,
            backing: Backing::Memory,
        }
    }

    /// Creates a silo in a file inside a temporary directory.
    ///
    /// The granularity is raised to the file system block size, so
    /// `config` must allow segments of at least two blocks.
    pub fn file(config: SiloConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("silo.bin");
        let size = TEST_SILO_SIZE.to_string();
        let silo = Silo::open_path(&path, Some(&size), config.clone())
            .expect("Failed to create file silo");
        Self {
            silo: Some(silo),
            config,
            backing: Backing::File { _dir: dir, path },
        }
    }

    /// Returns the silo file path if file-backed, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// Closes the silo cleanly and mounts it again.
    pub fn remount(&mut self) {
        self.remount_with(self.config.clone());
    }

    /// Closes the silo cleanly and mounts it again with `config`.
    pub fn remount_with(&mut self, config: SiloConfig) {
        let silo = self.silo.take().expect("silo is mounted");
        let silo = match &self.backing {
            Backing::Memory => {
                let media = silo.close().expect("Failed to close silo");
                Silo::open(media, config.clone()).expect("Failed to remount silo")
            }
            Backing::File { path, .. } => {
                silo.close().expect("Failed to close silo");
                Silo::open_path(path, None, config.clone()).expect("Failed to remount silo")
            }
        };
        self.config = config;
        self.silo = Some(silo);
    }

    /// Closes the silo and returns its medium. In-memory silos only.
    pub fn into_media(mut self) -> Box<dyn silo_storage::SiloMedia> {
        assert!(matches!(self.backing, Backing::Memory), "file silos keep their medium");
        let silo = self.silo.take().expect("silo is mounted");
        silo.close().expect("Failed to close silo")
    }
}

impl std::ops::Deref for TestSilo {
    type Target = Silo;

    fn deref(&self) -> &Self::Target {
        self.silo.as_ref().expect("silo is mounted")
    }
}

/// Runs a test with a temporary in-memory silo.
///
/// # Example
///
/// ```rust
/// use silo_testkit::{sample_object, small_config, with_temp_silo};
///
/// with_temp_silo(small_config(), |silo| {
///     silo.insert(&sample_object(1, b"x")).unwrap();
/// });
/// ```
pub fn with_temp_silo<F, R>(config: SiloConfig, f: F) -> R
where
    F: FnOnce(&Silo) -> R,
{
    let silo = TestSilo::memory(config);
    f(&silo)
}

/// Inserts `count` objects of `size` bytes tagged `0..count`.
pub fn fill(silo: &Silo, count: usize, size: usize) -> Vec<silo_core::ObjectHandle> {
    (0..count)
        .map(|i| {
            let payload = vec![i as u8; size];
            silo.insert(&sample_object(i as u8, &payload))
                .expect("Failed to insert object")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::SegmentState;

    #[test]
    fn memory_silo_remounts() {
        let mut silo = TestSilo::memory(small_config());
        let handles = fill(&silo, 7, 1024);
        assert_eq!(silo.segments().unwrap().len(), 3);
        silo.remount();
        assert!(silo
            .segments()
            .unwrap()
            .iter()
            .all(|s| s.state == SegmentState::MustLoad));
        for (i, handle) in handles.iter().enumerate() {
            let object = silo.lookup(*handle).unwrap().unwrap();
            assert_eq!(object.payload, vec![i as u8; 1024]);
        }
    }

    #[test]
    fn file_silo_remounts() {
        // File silos take the file system block size as granularity.
        let mut silo = TestSilo::file(SiloConfig::default().background_aging(false));
        assert!(silo.path().unwrap().exists());
        let handle = silo.insert(&sample_object(9, b"persisted")).unwrap();
        silo.remount();
        assert_eq!(silo.lookup(handle).unwrap().unwrap().payload, b"persisted");
    }

    #[test]
    fn with_temp_silo_returns_value() {
        let n = with_temp_silo(small_config(), |silo| fill(silo, 4, 10).len());
        assert_eq!(n, 4);
    }
}
