//! Crash recovery testing for silos.
//!
//! This module simulates power loss and torn writes and verifies that a
//! silo mounts afterwards with every surviving object intact.
//!
//! ## Test Strategy
//!
//! 1. **Torn table write** - Interrupt a ping-pong table update after
//!    each of its steps; the previous image must win until the digest
//!    lands
//! 2. **Power loss** - Run a workload on a medium that only keeps flushed
//!    bytes, cut the power after every possible flush and mount the result
//! 3. **Wrap-around** - The same power loss sweep on a workload that fills
//!    the segment space and reuses the extents of evicted segments
//!
//! ## Usage
//!
//! ```rust
//! use silo_testkit::crash::CrashRecoveryHarness;
//!
//! let harness = CrashRecoveryHarness::new();
//! for result in harness.run_torn_tables() {
//!     assert!(result.passed, "{}: {:?}", result.description, result.error);
//! }
//! ```

use crate::fixtures::small_config;
use parking_lot::Mutex;
use silo_core::{
    Expiry, Ident, NewObject, PingPong, Region, Silo, SiloConfig, SiloResult, TableKind,
};
use silo_storage::{InMemoryMedia, SiloMedia, StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Steps of a table update at which a write can be interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPoint {
    /// The inactive copy was reset to an empty signature.
    AfterReset,
    /// The new image was written but neither length nor digest.
    AfterData,
    /// The length was written but not the digest.
    AfterLength,
    /// The digest landed and the copy was flushed.
    Committed,
}

impl InterruptPoint {
    /// All points, in protocol order.
    pub const ALL: [Self; 4] = [
        Self::AfterReset,
        Self::AfterData,
        Self::AfterLength,
        Self::Committed,
    ];
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// Description of what was tested.
    pub description: String,
    /// Expected objects after recovery.
    pub expected_objects: usize,
    /// Actual objects after recovery.
    pub actual_objects: usize,
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    /// Creates a passing result.
    pub fn pass(description: &str, objects: usize) -> Self {
        Self {
            passed: true,
            description: description.to_string(),
            expected_objects: objects,
            actual_objects: objects,
            error: None,
        }
    }

    /// Creates a failing result.
    pub fn fail(description: &str, expected: usize, actual: usize, error: &str) -> Self {
        Self {
            passed: false,
            description: description.to_string(),
            expected_objects: expected,
            actual_objects: actual,
            error: Some(error.to_string()),
        }
    }
}

struct CrashState {
    durable: Mutex<Vec<u8>>,
    flushes: AtomicUsize,
    crash_after: AtomicUsize,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

/// A medium that only keeps bytes that were flushed.
///
/// Writes land in a working copy; `flush_range` copies the range into a
/// durable image. The durable image, taken through a [`CrashHandle`], is
/// what a power loss at that moment would leave behind.
pub struct CrashableMedia {
    live: Vec<u8>,
    state: Arc<CrashState>,
}

/// Controls a [`CrashableMedia`] after the silo took ownership of it.
#[derive(Clone)]
pub struct CrashHandle {
    state: Arc<CrashState>,
}

impl CrashableMedia {
    /// Creates a zero-filled medium and its handle.
    pub fn new(len: u64) -> (Self, CrashHandle) {
        let len = usize::try_from(len).expect("medium fits in memory");
        let state = Arc::new(CrashState {
            durable: Mutex::new(vec![0; len]),
            flushes: AtomicUsize::new(0),
            crash_after: AtomicUsize::new(usize::MAX),
            crashed: AtomicBool::new(false),
            fail_on_flush: AtomicBool::new(false),
        });
        let handle = CrashHandle {
            state: Arc::clone(&state),
        };
        (
            Self {
                live: vec![0; len],
                state,
            },
            handle,
        )
    }
}

impl CrashHandle {
    /// Loses power once `flushes` more flushes have completed.
    pub fn crash_after(&self, flushes: usize) {
        let done = self.state.flushes.load(Ordering::SeqCst);
        self.state
            .crash_after
            .store(done.saturating_add(flushes), Ordering::SeqCst);
    }

    /// Sets whether flushes fail with an I/O error.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.state.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of flushes so far.
    pub fn flushes(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst)
    }

    /// Returns whether the power was lost.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Returns what survives a power loss now.
    pub fn durable_image(&self) -> InMemoryMedia {
        InMemoryMedia::with_data(self.state.durable.lock().clone())
    }
}

impl SiloMedia for CrashableMedia {
    fn len(&self) -> u64 {
        self.live.len() as u64
    }

    fn as_slice(&self) -> &[u8] {
        &self.live
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.live
    }

    fn flush_range(&self, offset: u64, len: u64) -> StorageResult<()> {
        let size = self.len();
        let end = match offset.checked_add(len) {
            Some(end) if end <= size => end,
            _ => return Err(StorageError::OutOfBounds { offset, len, size }),
        };
        if self.state.fail_on_flush.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated flush failure",
            )));
        }
        let n = self.state.flushes.fetch_add(1, Ordering::SeqCst);
        if n >= self.state.crash_after.load(Ordering::SeqCst) {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let range = offset as usize..end as usize;
        self.state.durable.lock()[range.clone()].copy_from_slice(&self.live[range]);
        Ok(())
    }
}

/// Writes a torn update of `kind` into the inactive copy, stopping at
/// `point`. The new image carries `payload`.
///
/// # Errors
///
/// Returns an error if the table cannot be mounted or, for
/// [`InterruptPoint::Committed`], written.
pub fn tear_table(
    region: &mut Region,
    ident: &Ident,
    kind: TableKind,
    payload: &[u8],
    point: InterruptPoint,
) -> SiloResult<()> {
    let mut table = PingPong::define(ident, kind);
    table.mount(region)?;
    if point == InterruptPoint::Committed {
        return table.persist(region, payload);
    }

    let mut slot = table.slot(1 - table.active()).clone();
    let mut image = (table.generation() + 1).to_le_bytes().to_vec();
    image.extend_from_slice(payload);

    slot.reset(region);
    if point == InterruptPoint::AfterReset {
        return Ok(());
    }
    let header = slot.ctx().offset();
    region.write(slot.ctx().data_offset(), &image);
    if point == InterruptPoint::AfterLength {
        let length_field = slot.ctx().data_offset() - 8;
        debug_assert!(length_field > header);
        region.write(length_field, &(image.len() as u64).to_le_bytes());
    }
    Ok(())
}

/// Payload the harness stores under hash tag `tag`.
pub fn payload_for(tag: u8) -> Vec<u8> {
    vec![tag; 300 + usize::from(tag) * 7]
}

/// Payload of the wrap-around workload, two of which fill a segment.
pub fn large_payload_for(tag: u8) -> Vec<u8> {
    vec![tag; 200 * 1024 + usize::from(tag) * 512]
}

/// Mounts `media` and checks every object against `payload`.
///
/// Tags are inserted in ascending order, so the listing must be strictly
/// ascending as well. Returns the number of objects found, or a
/// description of the first problem.
fn audit(
    media: InMemoryMedia,
    config: SiloConfig,
    payload: fn(u8) -> Vec<u8>,
) -> Result<usize, String> {
    let silo = Silo::open(Box::new(media), config).map_err(|e| format!("mount failed: {e}"))?;
    let objects = silo.objects().map_err(|e| e.to_string())?;
    let mut last = None;
    for info in &objects {
        let stored = silo
            .lookup(info.handle)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("{} listed but not found", info.handle))?;
        let tag = stored.hash[0];
        if stored.payload != payload(tag) {
            return Err(format!("{} has a damaged payload", info.handle));
        }
        if last.is_some_and(|prev| prev >= tag) {
            return Err(format!("{} holds tag {tag} out of creation order", info.handle));
        }
        last = Some(tag);
    }
    Ok(objects.len())
}

/// Operations a harness runs before the crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workload {
    /// Small objects across a few segments.
    Mixed,
    /// Large objects that wrap around the segment space twice.
    Wrapping,
}

/// Runs crash scenarios against small in-memory silos.
pub struct CrashRecoveryHarness {
    config: SiloConfig,
    size: u64,
    workload: Workload,
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashRecoveryHarness {
    /// Creates a harness using [`small_config`] on 4 MiB silos.
    pub fn new() -> Self {
        Self {
            config: small_config().min_nseg(2).max_nseg(6),
            size: 4 * 1024 * 1024,
            workload: Workload::Mixed,
        }
    }

    /// Creates a harness whose workload fills the segment space of a 4 MiB
    /// silo with 512 KiB segments and keeps inserting, so new segments
    /// take the place of evicted ones.
    pub fn wrapping() -> Self {
        Self {
            config: small_config()
                .min_nseg(1)
                .max_nseg(64)
                .aim_segl(512 * 1024)
                .max_segl(512 * 1024)
                .free_reserve(0),
            size: 4 * 1024 * 1024,
            workload: Workload::Wrapping,
        }
    }

    fn payload(&self) -> fn(u8) -> Vec<u8> {
        match self.workload {
            Workload::Mixed => payload_for,
            Workload::Wrapping => large_payload_for,
        }
    }

    fn run(&self, silo: &Silo) -> SiloResult<()> {
        match self.workload {
            Workload::Mixed => Self::workload(silo),
            Workload::Wrapping => Self::wrapping_workload(silo),
        }
    }

    fn object(tag: u8, payload: &[u8]) -> NewObject<'_> {
        NewObject {
            hash: [tag; 32],
            expiry: Expiry::new(3600.0, 0.0, 0.0),
            ban: None,
            payload,
        }
    }

    /// Inserts objects across several segments with table saves, an
    /// explicit sync, removals and an aging pass in between.
    fn workload(silo: &Silo) -> SiloResult<()> {
        for tag in 0..8u8 {
            silo.insert(&Self::object(tag, &payload_for(tag)))?;
        }
        silo.add_ban(b"req.url ~ /tmp")?;
        silo.sync()?;
        for tag in 8..20u8 {
            let handle = silo.insert(&Self::object(tag, &payload_for(tag)))?;
            if tag % 5 == 0 {
                silo.remove(handle)?;
            }
        }
        silo.age_now()?;
        for tag in 20..24u8 {
            silo.insert(&Self::object(tag, &payload_for(tag)))?;
        }
        Ok(())
    }

    /// Fills the space, then keeps inserting so the allocator wraps and
    /// evicts the oldest segments.
    fn wrapping_workload(silo: &Silo) -> SiloResult<()> {
        for tag in 0..10u8 {
            silo.insert(&Self::object(tag, &large_payload_for(tag)))?;
        }
        silo.sync()?;
        for tag in 10..18u8 {
            let handle = silo.insert(&Self::object(tag, &large_payload_for(tag)))?;
            if tag == 15 {
                silo.remove(handle)?;
            }
        }
        silo.age_now()?;
        Ok(())
    }

    fn populated(&self) -> (Region, Ident, usize) {
        let media = InMemoryMedia::new(self.size);
        let silo = Silo::create(Box::new(media), self.config.clone()).expect("create silo");
        self.run(&silo).expect("workload");
        let count = silo.objects().expect("objects").len();
        let ident = silo.ident().expect("ident");
        let region = Region::new(silo.close().expect("close silo"));
        (region, ident, count)
    }

    /// Tears updates of both tables at every interrupt point.
    ///
    /// A torn update must leave the previous image authoritative; a
    /// committed one replaces it. The replacement images here are empty,
    /// so a committed segment table update leaves no objects.
    pub fn run_torn_tables(&self) -> Vec<CrashRecoveryResult> {
        let (base, ident, count) = self.populated();
        let image = base.bytes(0, base.len()).to_vec();
        let mut results = Vec::new();

        for kind in [TableKind::Ban, TableKind::Segment] {
            for point in InterruptPoint::ALL {
                let description = format!("torn {} table, {point:?}", kind.name());
                let mut region = Region::new(Box::new(InMemoryMedia::with_data(image.clone())));
                if let Err(e) = tear_table(&mut region, &ident, kind, &[], point) {
                    results.push(CrashRecoveryResult::fail(&description, count, 0, &e.to_string()));
                    continue;
                }
                let data = region.bytes(0, region.len()).to_vec();
                let expected = match (kind, point) {
                    (TableKind::Segment, InterruptPoint::Committed) => 0,
                    _ => count,
                };
                let survived = InMemoryMedia::with_data(data);
                results.push(
                    match audit(survived, self.config.clone(), self.payload()) {
                        Ok(n) if n == expected => CrashRecoveryResult::pass(&description, n),
                        Ok(n) => CrashRecoveryResult::fail(
                            &description,
                            expected,
                            n,
                            "unexpected object count",
                        ),
                        Err(e) => CrashRecoveryResult::fail(&description, expected, 0, &e),
                    },
                );
            }
        }
        results
    }

    /// Cuts the power after every flush the workload performs and mounts
    /// what survived.
    ///
    /// Every mount must succeed, and every object it finds must carry its
    /// own payload. Objects synced before the cut must survive.
    pub fn run_power_loss(&self) -> Vec<CrashRecoveryResult> {
        let total = {
            let (media, handle) = CrashableMedia::new(self.size);
            let silo = Silo::create(Box::new(media), self.config.clone()).expect("create silo");
            let formatted = handle.flushes();
            self.run(&silo).expect("workload");
            handle.flushes() - formatted
        };

        let mut results = Vec::new();
        for cut in 0..=total {
            let description = format!("power loss after {cut} of {total} flushes");
            let (media, handle) = CrashableMedia::new(self.size);
            let silo = Silo::create(Box::new(media), self.config.clone()).expect("create silo");
            handle.crash_after(cut);
            if let Err(e) = self.run(&silo) {
                results.push(CrashRecoveryResult::fail(&description, 0, 0, &e.to_string()));
                continue;
            }
            let survived = handle.durable_image();
            drop(silo);

            results.push(match audit(survived, self.config.clone(), self.payload()) {
                Ok(n) => CrashRecoveryResult::pass(&description, n),
                Err(e) => CrashRecoveryResult::fail(&description, 0, 0, &e),
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_object;
    use silo_core::{SiloError, Stuff};

    fn assert_all_passed(results: &[CrashRecoveryResult]) {
        assert!(!results.is_empty());
        for r in results {
            assert!(r.passed, "{}: {:?}", r.description, r.error);
        }
    }

    #[test]
    fn torn_tables_keep_previous_image() {
        assert_all_passed(&CrashRecoveryHarness::new().run_torn_tables());
    }

    #[test]
    fn power_loss_at_any_flush_mounts() {
        let results = CrashRecoveryHarness::new().run_power_loss();
        assert_all_passed(&results);
        // Without any flush after formatting the silo is empty; with all of
        // them nothing is lost compared to a clean run.
        assert_eq!(results.first().unwrap().actual_objects, 0);
        assert!(results.last().unwrap().actual_objects > 0);
    }

    #[test]
    fn power_loss_while_wrapping_mounts() {
        let harness = CrashRecoveryHarness::wrapping();
        let results = harness.run_power_loss();
        assert_all_passed(&results);
        assert!(results.last().unwrap().actual_objects > 0);
        assert_all_passed(&harness.run_torn_tables());
    }

    #[test]
    fn reused_extent_is_unlisted_first() {
        const MIB: u64 = 1024 * 1024;
        let config = small_config()
            .min_nseg(1)
            .aim_segl(MIB)
            .max_segl(MIB)
            .free_reserve(0)
            .sync_on_insert(true);
        let (media, handle) = CrashableMedia::new(4 * MIB);
        let silo = Silo::create(Box::new(media), config.clone()).unwrap();
        let payloads: Vec<Vec<u8>> = (1..=4u8).map(|tag| vec![tag; 600 * 1024]).collect();
        let handles: Vec<_> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| silo.insert(&sample_object(i as u8 + 1, p)).unwrap())
            .collect();
        // The fourth segment wrapped onto the extent of the first.
        assert_eq!(silo.stats().segments_evicted, 1);
        let space = silo.ident().unwrap().offset(Stuff::Space);
        assert_eq!(silo.segments().unwrap()[2].offset, space);

        let survived = Silo::open(Box::new(handle.durable_image()), config).unwrap();
        assert!(survived.lookup(handles[0]).unwrap().is_none());
        for (handle, payload) in handles.iter().zip(&payloads).take(3).skip(1) {
            let object = survived.lookup(*handle).unwrap().unwrap();
            assert_eq!(&object.payload, payload);
        }
        // Not listed until the next table save.
        assert!(survived.lookup(handles[3]).unwrap().is_none());
    }

    #[test]
    fn unsynced_inserts_are_lost() {
        let (media, handle) = CrashableMedia::new(4 * 1024 * 1024);
        let silo = Silo::create(Box::new(media), small_config()).unwrap();
        let kept: Vec<_> = (0..3u8)
            .map(|i| silo.insert(&sample_object(i, &payload_for(i))).unwrap())
            .collect();
        silo.sync().unwrap();
        let lost = silo.insert(&sample_object(3, &payload_for(3))).unwrap();
        assert_eq!(lost.serial, kept[0].serial);

        let survived = Silo::open(Box::new(handle.durable_image()), small_config()).unwrap();
        for (i, handle) in kept.iter().enumerate() {
            let object = survived.lookup(*handle).unwrap().unwrap();
            assert_eq!(object.payload, payload_for(i as u8));
        }
        assert!(survived.lookup(lost).unwrap().is_none());
        assert!(!handle.has_crashed());
    }

    #[test]
    fn flush_failure_is_reported() {
        let (media, handle) = CrashableMedia::new(4 * 1024 * 1024);
        let silo = Silo::create(Box::new(media), small_config()).unwrap();
        silo.insert(&sample_object(1, b"x")).unwrap();

        handle.set_fail_on_flush(true);
        let err = silo.sync().unwrap_err();
        assert!(matches!(err, SiloError::Storage(_)), "{err}");

        handle.set_fail_on_flush(false);
        silo.sync().unwrap();
    }
}
