//! Silo statistics.
//!
//! # Usage
//!
//! ```rust,ignore
//! let silo = Silo::create(media, SiloConfig::default())?;
//! silo.insert(&object)?;
//!
//! let stats = silo.stats();
//! println!("inserts: {}", stats.inserts);
//! println!("segments evicted: {}", stats.segments_evicted);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a mounted silo.
///
/// All counters are atomic and monotonically increasing.
#[derive(Debug, Default)]
pub struct SiloStats {
    inserts: AtomicU64,
    lookups: AtomicU64,
    misses: AtomicU64,
    removals: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,

    segments_opened: AtomicU64,
    segments_closed: AtomicU64,
    segments_evicted: AtomicU64,
    segments_loaded: AtomicU64,
    objects_expired: AtomicU64,
    objects_nuked: AtomicU64,

    table_saves: AtomicU64,
    capacity_failures: AtomicU64,
}

impl SiloStats {
    /// Creates a zeroed instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_insert(&self, bytes: u64) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self, bytes: u64) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_opened(&self) {
        self.segments_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_closed(&self) {
        self.segments_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_segment_evicted(&self) {
        self.segments_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a segment load and the objects it dropped as expired.
    pub(crate) fn record_segment_loaded(&self, expired: u32) {
        self.segments_loaded.fetch_add(1, Ordering::Relaxed);
        self.objects_expired
            .fetch_add(u64::from(expired), Ordering::Relaxed);
    }

    pub(crate) fn record_nuke(&self) {
        self.objects_nuked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_table_save(&self) {
        self.table_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_capacity_failure(&self) {
        self.capacity_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of successful inserts.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups, hits and misses.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Returns the number of lookups that found nothing.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of segments evicted.
    pub fn segments_evicted(&self) -> u64 {
        self.segments_evicted.load(Ordering::Relaxed)
    }

    /// Returns the number of table images written (both tables).
    pub fn table_saves(&self) -> u64 {
        self.table_saves.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            inserts: load(&self.inserts),
            lookups: load(&self.lookups),
            misses: load(&self.misses),
            removals: load(&self.removals),
            bytes_written: load(&self.bytes_written),
            bytes_read: load(&self.bytes_read),
            segments_opened: load(&self.segments_opened),
            segments_closed: load(&self.segments_closed),
            segments_evicted: load(&self.segments_evicted),
            segments_loaded: load(&self.segments_loaded),
            objects_expired: load(&self.objects_expired),
            objects_nuked: load(&self.objects_nuked),
            table_saves: load(&self.table_saves),
            capacity_failures: load(&self.capacity_failures),
        }
    }
}

/// A point-in-time copy of [`SiloStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Successful inserts.
    pub inserts: u64,
    /// Lookups, hits and misses.
    pub lookups: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Objects removed by the caller.
    pub removals: u64,
    /// Payload bytes stored.
    pub bytes_written: u64,
    /// Payload bytes returned by lookups.
    pub bytes_read: u64,
    /// Segments opened.
    pub segments_opened: u64,
    /// Segments closed.
    pub segments_closed: u64,
    /// Segments evicted.
    pub segments_evicted: u64,
    /// Segments read back from the medium.
    pub segments_loaded: u64,
    /// Objects dropped at load because they had expired.
    pub objects_expired: u64,
    /// Objects dropped by `nuke_one`.
    pub objects_nuked: u64,
    /// Table images written.
    pub table_saves: u64,
    /// Inserts refused for lack of space.
    pub capacity_failures: u64,
}

impl StatsSnapshot {
    /// Returns lookups that found an object.
    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.lookups - self.misses
    }
}
