//! The silo controller.
//!
//! A [`Silo`] owns the mapped region and all runtime state. Structural
//! changes (opening and closing segments, cursor movement, eviction,
//! table saves) happen under one mutex. Segment loads are bound to a
//! single thread: the mounting thread until the aging thread starts,
//! then the aging thread, which loads every segment up front. Lookups
//! from other threads wait for it instead of loading themselves.

use crate::aging::{self, AgingReport};
use crate::ban::{Ban, BanList};
use crate::config::{SiloConfig, Thresholds};
use crate::error::{SiloError, SiloResult};
use crate::ident::{Ident, Stuff};
use crate::object::{
    now, NewObject, ObjectHandle, ObjectHash, ObjectInfo, StoredObject, DESC_SIZE,
};
use crate::region::{round_up, Region};
use crate::segment::{
    Segment, SegmentInfo, SegmentRecord, SegmentState, MIN_RECORD_SIZE,
};
use crate::sign::{SignStatus, SIGN_HEADER_SIZE, SIGN_SPACE};
use crate::stats::{SiloStats, StatsSnapshot};
use crate::table::{PingPong, TableKind};
use parking_lot::{Condvar, Mutex};
use silo_storage::{file_size, get_file, MappedFile, SiloMedia};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info};

/// Mutable silo state, guarded by [`Shared::state`].
pub(crate) struct SiloState {
    pub(crate) region: Region,
    pub(crate) ident: Ident,
    pub(crate) config: SiloConfig,
    pub(crate) thresholds: Thresholds,
    seg_table: PingPong,
    ban_table: PingPong,
    pub(crate) segments: VecDeque<Segment>,
    next_serial: u32,
    next_offset: u64,
    bans: BanList,
    pub(crate) loader: ThreadId,
    pub(crate) aging_running: bool,
    pub(crate) stop: bool,
    pub(crate) dirty: bool,
    /// Segments were evicted since the segment table was last written, so
    /// the table on the medium still lists their extents.
    evicted_unsaved: bool,
}

/// State shared between the silo handle and its aging thread.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) state: Mutex<Option<SiloState>>,
    /// Wakes the aging thread early.
    pub(crate) wake: Condvar,
    /// Signalled whenever the aging thread finished loading a segment.
    pub(crate) loaded: Condvar,
    pub(crate) stats: SiloStats,
}

/// Number of segment records a table of `capacity` bytes can hold.
fn table_entries(capacity: u64) -> u32 {
    u32::try_from(capacity / (MIN_RECORD_SIZE + 8)).unwrap_or(u32::MAX)
}

impl SiloState {
    fn mount(region: Region, config: SiloConfig) -> SiloResult<Self> {
        let ident = Ident::read(&region, config.granularity)?;

        let mut ban_table = PingPong::define(&ident, TableKind::Ban);
        let mut seg_table = PingPong::define(&ident, TableKind::Segment);
        let bans = BanList::decode(&ban_table.mount(&region)?)?;
        let records = SegmentRecord::decode_all(&seg_table.mount(&region)?)?;

        let space = ident.offset(Stuff::Space);
        let end = ident.offset(Stuff::End);
        let gran = u64::from(ident.granularity);
        let mut serials = std::collections::HashSet::new();
        for rec in &records {
            let p = rec.ptr;
            let sane = p.offset >= space
                && p.offset % gran == 0
                && p.length >= SIGN_SPACE
                && p.end() <= end
                && p.objlist == p.offset + SIGN_HEADER_SIZE
                && serials.insert(p.serial);
            if !sane {
                return Err(SiloError::corrupt(format!(
                    "segment table entry {} at {}+{} is invalid",
                    p.serial, p.offset, p.length
                )));
            }
        }

        let thresholds = Thresholds::derive(
            end - space,
            table_entries(seg_table.capacity()),
            ident.granularity,
            &config,
        )?;

        let next_serial = records
            .iter()
            .map(|r| r.ptr.serial)
            .max()
            .map_or(1, |s| s.wrapping_add(1));
        let next_offset = records.last().map_or(space, |r| r.ptr.end());
        let segments: VecDeque<Segment> = records
            .into_iter()
            .map(|rec| Segment::from_record(rec, ident.unique))
            .collect();

        info!(
            silo = %config.name,
            mediasize = ident.mediasize,
            nseg = segments.len(),
            bans = bans.bans().len(),
            "silo mounted"
        );
        debug!(silo = %config.name, ?thresholds, "thresholds");

        Ok(Self {
            region,
            ident,
            config,
            thresholds,
            seg_table,
            ban_table,
            segments,
            next_serial,
            next_offset,
            bans,
            loader: thread::current().id(),
            aging_running: false,
            stop: false,
            dirty: false,
            evicted_unsaved: false,
        })
    }

    fn space(&self) -> (u64, u64) {
        (
            self.ident.offset(Stuff::Space),
            self.ident.offset(Stuff::End),
        )
    }

    /// Bytes of segment space not covered by any segment.
    pub(crate) fn free_bytes(&self) -> u64 {
        let (start, end) = self.space();
        let used: u64 = self.segments.iter().map(|s| s.ptr().length).sum();
        (end - start).saturating_sub(used)
    }

    fn position(&self, serial: u32) -> Option<usize> {
        self.segments.iter().position(|s| s.serial() == serial)
    }

    fn has_open_segment(&self) -> bool {
        self.segments
            .back()
            .is_some_and(|s| s.state() == SegmentState::Open)
    }

    pub(crate) fn oldest_referenced_ban(&self) -> Option<u64> {
        self.segments
            .iter()
            .filter_map(Segment::ban_tail)
            .min()
            .or_else(|| self.bans.newest())
    }

    pub(crate) fn load_segment(&mut self, pos: usize, stats: &SiloStats) {
        assert_eq!(
            thread::current().id(),
            self.loader,
            "segment load outside the silo thread"
        );
        let report = self.segments[pos].load(&self.region, now());
        stats.record_segment_loaded(report.expired);
        debug!(
            silo = %self.config.name,
            serial = self.segments[pos].serial(),
            loaded = report.loaded,
            expired = report.expired,
            "segment loaded"
        );
        if report.expired > 0 || report.rejected {
            self.dirty = true;
        }
    }

    /// Evicts the oldest segment unless it is the open one.
    pub(crate) fn evict_oldest(&mut self, reason: &str, stats: &SiloStats) -> bool {
        match self.segments.front() {
            Some(seg) if seg.state() != SegmentState::Open => {}
            _ => return false,
        }
        let Some(seg) = self.segments.pop_front() else {
            return false;
        };
        info!(
            silo = %self.config.name,
            serial = seg.serial(),
            offset = seg.ptr().offset,
            length = seg.ptr().length,
            nobj = seg.nobj(),
            reason,
            "segment evicted"
        );
        stats.record_segment_evicted();
        self.dirty = true;
        self.evicted_unsaved = true;
        true
    }

    fn segment_image(&self) -> Vec<u8> {
        let mut image = Vec::new();
        for seg in &self.segments {
            if seg.state() == SegmentState::Open && seg.nalloc() == 0 {
                continue;
            }
            seg.record().encode_into(&mut image);
        }
        image
    }

    fn segment_image_len(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| !(s.state() == SegmentState::Open && s.nalloc() == 0))
            .map(|s| s.record().encoded_len())
            .sum()
    }

    /// Returns the ban list without bans no stored object refers to.
    fn pruned_bans(&self) -> BanList {
        let mut bans = self.bans.clone();
        if let Some(tail) = self.oldest_referenced_ban() {
            bans.prune(tail);
        }
        bans
    }

    /// Writes both tables through the ping-pong protocol.
    pub(crate) fn save_tables(&mut self, stats: &SiloStats) -> SiloResult<()> {
        while let Some(first) = self.segments.front() {
            // Unloaded segments may hold objects written after the last save.
            if first.state() == SegmentState::Open
                || !first.state().is_loaded()
                || first.nobj() > 0
            {
                break;
            }
            debug!(silo = %self.config.name, serial = first.serial(), "empty segment dropped");
            self.segments.pop_front();
            stats.record_segment_evicted();
        }

        let bans = self.pruned_bans();
        let ban_image = bans.encode();
        if ban_image.len() as u64 > self.ban_table.capacity() {
            return Err(SiloError::TableFull {
                table: TableKind::Ban.name(),
                requested: ban_image.len() as u64,
                capacity: self.ban_table.capacity(),
            });
        }

        if let Some(open) = self.segments.back().filter(|s| s.state() == SegmentState::Open) {
            open.sync(&self.region)?;
        }
        let image = self.segment_image();
        self.seg_table.persist(&mut self.region, &image)?;
        for seg in &mut self.segments {
            seg.mark_saved();
        }
        self.evicted_unsaved = false;
        stats.record_table_save();

        self.ban_table.persist(&mut self.region, &ban_image)?;
        self.bans = bans;
        stats.record_table_save();

        self.dirty = false;
        debug!(
            silo = %self.config.name,
            generation = self.seg_table.generation(),
            nseg = self.segments.len(),
            "tables saved"
        );
        Ok(())
    }

    /// Carves a new open segment of at least `needed` bytes.
    fn new_segment(&mut self, needed: u64, stats: &SiloStats) -> SiloResult<()> {
        let t = self.thresholds;
        let (start, end) = self.space();
        let capacity = SiloError::Capacity { requested: needed };

        while self.segments.len() as u64 >= u64::from(t.max_nseg) {
            if !self.evict_oldest("segment count", stats) {
                return Err(capacity);
            }
        }

        let wanted = t.aim_segl.max(needed).min(t.max_segl);
        let (offset, length) = loop {
            let mut offset = self.next_offset;
            let tail = end.saturating_sub(offset);
            let length = if tail >= wanted {
                wanted
            } else if tail >= t.min_segl.max(needed) {
                tail
            } else {
                info!(silo = %self.config.name, offset, "wrapping to start of segment space");
                offset = start;
                wanted.min(end - start)
            };
            match self.segments.iter().position(|s| s.ptr().overlaps(offset, length)) {
                None => break (offset, length),
                Some(0) if self.evict_oldest("space", stats) => {}
                Some(_) => return Err(capacity),
            }
        };

        // The extent may still be listed on the medium; drop it from the
        // persisted table before writing over it.
        if self.evicted_unsaved {
            self.save_tables(stats)?;
        }

        let serial = self.next_serial;
        self.next_serial = serial.wrapping_add(1);
        self.next_offset = offset + length;
        let seg = Segment::open(
            &mut self.region,
            serial,
            offset,
            length,
            self.ident.granularity,
            self.ident.unique,
            self.bans.newest(),
        );
        self.segments.push_back(seg);
        stats.record_segment_opened();
        info!(silo = %self.config.name, serial, offset, length, "segment opened");
        Ok(())
    }

    /// Closes the open segment, or discards it if nothing was stored.
    pub(crate) fn close_open(&mut self, stats: &SiloStats) -> SiloResult<()> {
        let (empty, offset) = match self.segments.back() {
            Some(s) if s.state() == SegmentState::Open => (s.nalloc() == 0, s.ptr().offset),
            _ => return Ok(()),
        };
        if empty {
            if let Some(seg) = self.segments.pop_back() {
                debug!(silo = %self.config.name, serial = seg.serial(), "empty segment discarded");
            }
            self.next_offset = offset;
            return Ok(());
        }
        if let Some(seg) = self.segments.back_mut() {
            seg.close(&self.region)?;
            info!(
                silo = %self.config.name,
                serial = seg.serial(),
                nobj = seg.nobj(),
                "segment closed"
            );
        }
        stats.record_segment_closed();
        self.save_tables(stats)
    }

    /// Makes sure the next insert into the open segment still fits the
    /// segment table.
    fn reserve_table_room(&mut self, stats: &SiloStats) -> SiloResult<()> {
        let nalloc = match self.segments.back() {
            Some(s) if s.state() == SegmentState::Open => s.nalloc(),
            _ => return Ok(()),
        };
        let growth = match nalloc {
            0 => MIN_RECORD_SIZE + 8,
            n if n % 64 == 0 => 8,
            _ => return Ok(()),
        };
        while self.segment_image_len() + growth > self.seg_table.capacity() {
            if !self.evict_oldest("segment table full", stats) {
                return Err(SiloError::Capacity { requested: growth });
            }
        }
        Ok(())
    }

    fn insert(&mut self, object: &NewObject<'_>, stats: &SiloStats) -> SiloResult<ObjectHandle> {
        let len = object.payload.len() as u64;
        let gran = u64::from(self.ident.granularity);
        let needed = round_up(SIGN_SPACE + DESC_SIZE, gran) + round_up(len, gran);
        if needed > self.thresholds.max_segl {
            return Err(SiloError::Capacity { requested: len });
        }

        for _ in 0..2 {
            if !self.has_open_segment() {
                self.new_segment(needed, stats)?;
            }
            self.reserve_table_room(stats)?;

            let Some(seg) = self.segments.back_mut() else {
                break;
            };
            let placed = seg.insert(
                &mut self.region,
                object.hash,
                object.expiry,
                object.ban,
                object.payload,
            );
            if let Some(index) = placed {
                let handle = ObjectHandle {
                    serial: seg.serial(),
                    index,
                };
                if self.config.sync_on_insert {
                    seg.sync(&self.region)?;
                }
                self.dirty = true;
                stats.record_insert(len);
                return Ok(handle);
            }
            self.close_open(stats)?;
        }
        Err(SiloError::Capacity { requested: len })
    }

    fn add_ban(&mut self, spec: &[u8]) -> SiloResult<u64> {
        let mut bans = self.bans.clone();
        let generation = bans.add(spec, now());
        self.ban_table.persist(&mut self.region, &bans.encode())?;
        self.bans = bans;
        Ok(generation)
    }

    fn shutdown(&mut self, stats: &SiloStats) -> SiloResult<()> {
        self.close_open(stats)?;
        self.save_tables(stats)?;
        self.region.sync_all()?;
        info!(silo = %self.config.name, nseg = self.segments.len(), "silo closed");
        Ok(())
    }
}

/// A mounted persistent storage silo.
///
/// # Example
///
/// ```rust
/// use silo_core::{Expiry, NewObject, Silo, SiloConfig};
/// use silo_storage::InMemoryMedia;
///
/// let media = InMemoryMedia::new(8 * 1024 * 1024);
/// let config = SiloConfig::default().background_aging(false);
/// let silo = Silo::create(Box::new(media), config).unwrap();
///
/// let handle = silo
///     .insert(&NewObject {
///         hash: [1; 32],
///         expiry: Expiry::new(120.0, 10.0, 0.0),
///         ban: None,
///         payload: b"hello",
///     })
///     .unwrap();
/// let object = silo.lookup(handle).unwrap().unwrap();
/// assert_eq!(object.payload, b"hello");
/// ```
pub struct Silo {
    shared: Arc<Shared>,
    aging: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Silo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silo")
            .field("name", &self.shared.name)
            .field("aging", &self.aging.is_some())
            .finish_non_exhaustive()
    }
}

impl Silo {
    /// Formats `media` as an empty silo and mounts it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the geometry is unusable.
    pub fn create(media: Box<dyn SiloMedia>, config: SiloConfig) -> SiloResult<Self> {
        Self::format(Region::new(media), config)
    }

    /// Mounts an existing silo.
    ///
    /// # Errors
    ///
    /// Returns an error if the ident does not match or both copies of a
    /// table are corrupt.
    pub fn open(media: Box<dyn SiloMedia>, config: SiloConfig) -> SiloResult<Self> {
        Self::start(SiloState::mount(Region::new(media), config)?)
    }

    /// Mounts `media`, formatting it first if it has never held a silo.
    ///
    /// # Errors
    ///
    /// See [`Silo::create`] and [`Silo::open`].
    pub fn open_or_create(media: Box<dyn SiloMedia>, config: SiloConfig) -> SiloResult<Self> {
        let region = Region::new(media);
        if Ident::is_blank(&region) {
            Self::format(region, config)
        } else {
            Self::start(SiloState::mount(region, config)?)
        }
    }

    /// Opens, sizes and maps the silo file at `path` and mounts it.
    ///
    /// `size` is a size specification such as `"1G"`; `None` keeps the
    /// size of an existing file. New and anonymous files are formatted.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be acquired, sized or mapped,
    /// or the silo cannot be mounted.
    pub fn open_path(
        path: impl AsRef<Path>,
        size: Option<&str>,
        mut config: SiloConfig,
    ) -> SiloResult<Self> {
        let acquired = get_file(path.as_ref())?;
        let mut granularity = config.granularity;
        let len = file_size(&acquired.file, &acquired.path, size, &mut granularity)?;
        config.granularity = granularity;

        let may_hold_silo = acquired.outcome.may_hold_silo();
        info!(
            silo = %config.name,
            path = %acquired.path.display(),
            outcome = ?acquired.outcome,
            size = len,
            "silo file acquired"
        );
        let media = MappedFile::map(acquired.file, &acquired.path, len)?;
        let region = Region::new(Box::new(media));
        if may_hold_silo && !Ident::is_blank(&region) {
            Self::start(SiloState::mount(region, config)?)
        } else {
            Self::format(region, config)
        }
    }

    fn format(mut region: Region, config: SiloConfig) -> SiloResult<Self> {
        let ident = Ident::new(
            region.len(),
            config.align,
            config.granularity,
            config.table_size,
            rand::random(),
        )?;
        if ident.mediasize != region.len() {
            return Err(SiloError::config(format!(
                "silo size {} is not a multiple of the {} byte granularity",
                region.len(),
                config.granularity
            )));
        }
        ident.write(&mut region)?;
        PingPong::define(&ident, TableKind::Ban).format(&mut region)?;
        PingPong::define(&ident, TableKind::Segment).format(&mut region)?;
        info!(
            silo = %config.name,
            mediasize = ident.mediasize,
            granularity = ident.granularity,
            unique = ident.unique,
            "silo created"
        );
        Self::start(SiloState::mount(region, config)?)
    }

    fn start(state: SiloState) -> SiloResult<Self> {
        let background = state.config.background_aging;
        let shared = Arc::new(Shared {
            name: state.config.name.clone(),
            state: Mutex::new(Some(state)),
            wake: Condvar::new(),
            loaded: Condvar::new(),
            stats: SiloStats::new(),
        });
        let aging = if background {
            Some(aging::spawn(Arc::clone(&shared))?)
        } else {
            None
        };
        Ok(Self { shared, aging })
    }

    /// Returns the name used in log output.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SiloState) -> T) -> SiloResult<T> {
        let mut guard = self.shared.state.lock();
        let st = guard.as_mut().ok_or(SiloError::Closed)?;
        Ok(f(st))
    }

    /// Runs `f` on the loaded segment `serial`, loading it first if needed.
    ///
    /// Returns `None` if no such segment exists.
    ///
    /// # Panics
    ///
    /// Panics if the segment must be loaded, the calling thread is not the
    /// silo thread, and no aging thread is running to load it.
    fn with_loaded<T>(
        &self,
        serial: u32,
        f: impl FnOnce(&mut SiloState, usize) -> T,
    ) -> SiloResult<Option<T>> {
        let mut guard = self.shared.state.lock();
        loop {
            let st = guard.as_mut().ok_or(SiloError::Closed)?;
            let Some(pos) = st.position(serial) else {
                return Ok(None);
            };
            if st.segments[pos].state().is_loaded() {
                return Ok(Some(f(st, pos)));
            }
            if thread::current().id() == st.loader {
                st.load_segment(pos, &self.shared.stats);
                continue;
            }
            if st.stop {
                return Err(SiloError::Closed);
            }
            assert!(
                st.aging_running,
                "segment {serial} must be loaded by the silo thread"
            );
            self.shared.loaded.wait(&mut guard);
        }
    }

    fn serials(&self) -> SiloResult<Vec<u32>> {
        self.with_state(|st| st.segments.iter().map(Segment::serial).collect())
    }

    /// Stores an object and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Capacity`] if the object can never fit or no
    /// segment can be evicted to make room.
    pub fn insert(&self, object: &NewObject<'_>) -> SiloResult<ObjectHandle> {
        let stats = &self.shared.stats;
        let (result, pressure) = self.with_state(|st| {
            let result = st.insert(object, stats);
            (result, st.free_bytes() < st.thresholds.free_reserve)
        })?;
        if pressure {
            self.shared.wake.notify_all();
        }
        if matches!(result, Err(SiloError::Capacity { .. })) {
            stats.record_capacity_failure();
        }
        result
    }

    /// Reads an object back.
    ///
    /// Returns `None` if the object was removed, expired at load, or its
    /// segment was evicted.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn lookup(&self, handle: ObjectHandle) -> SiloResult<Option<StoredObject>> {
        let found = self
            .with_loaded(handle.serial, |st, pos| {
                let desc = st.segments[pos].touch(handle.index)?;
                Some(StoredObject {
                    handle,
                    hash: desc.hash,
                    expiry: desc.expiry,
                    ban: desc.ban,
                    payload: st.region.bytes(desc.ptr, desc.len).to_vec(),
                })
            })?
            .flatten();
        match &found {
            Some(object) => self.shared.stats.record_hit(object.payload.len() as u64),
            None => self.shared.stats.record_miss(),
        }
        Ok(found)
    }

    /// Marks an object dead. Returns whether it was live.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn remove(&self, handle: ObjectHandle) -> SiloResult<bool> {
        let removed = self
            .with_loaded(handle.serial, |st, pos| {
                let removed = st.segments[pos].remove(handle.index);
                st.dirty |= removed;
                removed
            })?
            .unwrap_or(false);
        if removed {
            self.shared.stats.record_removal();
        }
        Ok(removed)
    }

    /// Returns the newest live object with `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn find(&self, hash: &ObjectHash) -> SiloResult<Option<ObjectHandle>> {
        for serial in self.serials()?.into_iter().rev() {
            let hit = self
                .with_loaded(serial, |st, pos| {
                    st.segments[pos]
                        .live_objects()
                        .filter(|(_, d)| &d.hash == hash)
                        .map(|(i, _)| i)
                        .last()
                })?
                .flatten();
            if let Some(index) = hit {
                return Ok(Some(ObjectHandle { serial, index }));
            }
        }
        Ok(None)
    }

    /// Lists all live objects in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn objects(&self) -> SiloResult<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        for serial in self.serials()? {
            self.with_loaded(serial, |st, pos| {
                out.extend(st.segments[pos].live_objects().map(|(index, d)| ObjectInfo {
                    handle: ObjectHandle { serial, index },
                    hash: d.hash,
                    expiry: d.expiry,
                    ban: d.ban,
                    len: d.len,
                }));
            })?;
        }
        Ok(out)
    }

    /// Loads every segment that is still on the medium only.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn load_all(&self) -> SiloResult<()> {
        for serial in self.serials()? {
            self.with_loaded(serial, |_, _| ())?;
        }
        Ok(())
    }

    /// Returns a snapshot of every segment, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn segments(&self) -> SiloResult<Vec<SegmentInfo>> {
        self.with_state(|st| st.segments.iter().map(Segment::info).collect())
    }

    /// Re-validates the signature of segment `serial` on the medium.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn check_segment(&self, serial: u32) -> SiloResult<Option<SignStatus>> {
        self.with_state(|st| {
            st.position(serial)
                .map(|pos| st.segments[pos].check(&st.region))
        })
    }

    /// Records a ban and returns its generation.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::TableFull`] if the ban table has no room left,
    /// or an error if it cannot be written. The ban is not recorded then.
    pub fn add_ban(&self, spec: &[u8]) -> SiloResult<u64> {
        self.with_state(|st| st.add_ban(spec))?
    }

    /// Returns the persisted bans, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn bans(&self) -> SiloResult<Vec<Ban>> {
        self.with_state(|st| st.bans.bans().to_vec())
    }

    /// Returns the oldest ban any stored object may still refer to.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn oldest_referenced_ban(&self) -> SiloResult<Option<u64>> {
        self.with_state(|st| st.oldest_referenced_ban())
    }

    /// Drops the least recently used object of the oldest segment that
    /// still holds one.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn nuke_one(&self) -> SiloResult<Option<ObjectHandle>> {
        for serial in self.serials()? {
            let hit = self
                .with_loaded(serial, |st, pos| {
                    let seg = &mut st.segments[pos];
                    let index = seg.lru_oldest()?;
                    seg.remove(index);
                    st.dirty = true;
                    Some(index)
                })?
                .flatten();
            if let Some(index) = hit {
                self.shared.stats.record_nuke();
                debug!(silo = %self.shared.name, serial, index, "object nuked");
                return Ok(Some(ObjectHandle { serial, index }));
            }
        }
        Ok(None)
    }

    /// Persists both tables now.
    ///
    /// # Errors
    ///
    /// Returns an error if a table cannot be written.
    pub fn sync(&self) -> SiloResult<()> {
        let stats = &self.shared.stats;
        self.with_state(|st| st.save_tables(stats))?
    }

    /// Runs one aging pass on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be written.
    pub fn age_now(&self) -> SiloResult<AgingReport> {
        let stats = &self.shared.stats;
        self.with_state(|st| st.age(stats))?
    }

    /// Wakes the aging thread ahead of its interval.
    pub fn signal_pressure(&self) {
        self.shared.wake.notify_all();
    }

    /// Returns the thresholds in effect.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn thresholds(&self) -> SiloResult<Thresholds> {
        self.with_state(|st| st.thresholds)
    }

    /// Returns the ident block.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn ident(&self) -> SiloResult<Ident> {
        self.with_state(|st| st.ident.clone())
    }

    /// Returns bytes of segment space not covered by any segment.
    ///
    /// # Errors
    ///
    /// Returns [`SiloError::Closed`] after shutdown.
    pub fn free_bytes(&self) -> SiloResult<u64> {
        self.with_state(|st| st.free_bytes())
    }

    /// Returns a snapshot of the statistics counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn stop_aging(&mut self) {
        let Some(handle) = self.aging.take() else {
            return;
        };
        if let Some(st) = self.shared.state.lock().as_mut() {
            st.stop = true;
        }
        self.shared.wake.notify_all();
        self.shared.loaded.notify_all();
        if handle.join().is_err() {
            error!(silo = %self.shared.name, "aging thread panicked");
        }
    }

    /// Stops the aging thread, closes the open segment, saves both tables
    /// and returns the medium.
    ///
    /// # Errors
    ///
    /// Returns an error if the final save fails; the medium is dropped.
    pub fn close(mut self) -> SiloResult<Box<dyn SiloMedia>> {
        self.stop_aging();
        let mut state = self
            .shared
            .state
            .lock()
            .take()
            .ok_or(SiloError::Closed)?;
        state.shutdown(&self.shared.stats)?;
        Ok(state.region.into_media())
    }
}

impl Drop for Silo {
    fn drop(&mut self) {
        self.stop_aging();
        let state = self.shared.state.lock().take();
        if let Some(mut state) = state {
            if let Err(e) = state.shutdown(&self.shared.stats) {
                error!(silo = %self.shared.name, error = %e, "silo shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Expiry;
    use silo_storage::InMemoryMedia;
    use std::time::Duration;

    const MIB: u64 = 1024 * 1024;

    fn config() -> SiloConfig {
        SiloConfig::default().name("test").background_aging(false)
    }

    /// Segments of 4096 bytes hold three 1 KiB objects at 512 byte granularity.
    fn small_segments() -> SiloConfig {
        config().max_segl(4096)
    }

    fn fresh(config: SiloConfig) -> Silo {
        Silo::create(Box::new(InMemoryMedia::new(8 * MIB)), config).unwrap()
    }

    fn object(tag: u8, payload: &[u8]) -> NewObject<'_> {
        NewObject {
            hash: [tag; 32],
            expiry: Expiry::new(600.0, 10.0, 0.0),
            ban: None,
            payload,
        }
    }

    fn remount(silo: Silo, config: SiloConfig) -> Silo {
        let media = silo.close().unwrap();
        Silo::open(media, config).unwrap()
    }

    #[test]
    fn objects_survive_remount() {
        let silo = fresh(config());
        let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 1024]).collect();
        let handles: Vec<_> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| silo.insert(&object(i as u8, p)).unwrap())
            .collect();

        let silo = remount(silo, config());
        let segments = silo.segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].state, SegmentState::MustLoad);
        assert_eq!(segments[0].nobj, 3);

        for (handle, payload) in handles.iter().zip(&payloads) {
            let stored = silo.lookup(*handle).unwrap().unwrap();
            assert_eq!(&stored.payload, payload);
        }
        assert_eq!(silo.segments().unwrap()[0].state, SegmentState::Loaded);
        assert_eq!(silo.stats().segments_loaded, 1);
    }

    #[test]
    fn full_segment_is_closed_and_replaced() {
        let silo = fresh(small_segments());
        let payload = [0xab; 1024];
        let handles: Vec<_> = (0..4u8)
            .map(|i| silo.insert(&object(i, &payload)).unwrap())
            .collect();

        assert_eq!(handles[2].serial, handles[0].serial);
        assert_ne!(handles[3].serial, handles[0].serial);
        let segments = silo.segments().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].state, SegmentState::Closed);
        assert_eq!(segments[0].nobj, 3);
        assert_eq!(segments[1].state, SegmentState::Open);
        assert_eq!(segments[1].offset, segments[0].offset + segments[0].length);
        assert_eq!(
            silo.check_segment(segments[0].serial).unwrap(),
            Some(SignStatus::Valid)
        );
        assert_eq!(silo.stats().segments_closed, 1);
    }

    #[test]
    fn listing_follows_creation_order() {
        let silo = fresh(small_segments());
        for i in 0..10u8 {
            silo.insert(&object(i, &[i; 1000])).unwrap();
        }
        let silo = remount(silo, small_segments());
        let hashes: Vec<u8> = silo.objects().unwrap().iter().map(|o| o.hash[0]).collect();
        assert_eq!(hashes, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn find_returns_newest() {
        let silo = fresh(small_segments());
        silo.insert(&object(1, b"old")).unwrap();
        for i in 2..6u8 {
            silo.insert(&object(i, &[i; 1024])).unwrap();
        }
        let newest = silo.insert(&object(1, b"new")).unwrap();
        assert_eq!(silo.find(&[1; 32]).unwrap(), Some(newest));
        assert_eq!(silo.find(&[9; 32]).unwrap(), None);
    }

    #[test]
    fn removal_is_persisted() {
        let silo = fresh(config());
        let gone = silo.insert(&object(1, b"gone")).unwrap();
        let kept = silo.insert(&object(2, b"kept")).unwrap();
        assert!(silo.remove(gone).unwrap());
        assert!(!silo.remove(gone).unwrap());

        let silo = remount(silo, config());
        assert!(silo.lookup(gone).unwrap().is_none());
        assert_eq!(silo.lookup(kept).unwrap().unwrap().payload, b"kept");
        assert_eq!(silo.stats().misses, 1);
    }

    #[test]
    fn expired_objects_are_dropped_at_load() {
        let silo = fresh(config());
        let stale = silo
            .insert(&NewObject {
                expiry: Expiry {
                    entered: now() - 3600.0,
                    ttl: 60.0,
                    grace: 10.0,
                    keep: 0.0,
                },
                ..object(1, b"stale")
            })
            .unwrap();
        let fresh_handle = silo.insert(&object(2, b"fresh")).unwrap();

        let silo = remount(silo, config());
        assert!(silo.lookup(fresh_handle).unwrap().is_some());
        assert!(silo.lookup(stale).unwrap().is_none());
        assert_eq!(silo.stats().objects_expired, 1);
        assert_eq!(silo.segments().unwrap()[0].nobj, 1);
    }

    #[test]
    fn open_segment_is_discarded_when_empty() {
        let silo = fresh(config());
        assert!(silo.segments().unwrap().is_empty());
        let silo = remount(silo, config());
        assert!(silo.segments().unwrap().is_empty());
        assert!(silo.objects().unwrap().is_empty());
    }

    #[test]
    fn aging_converges_to_aim() {
        let config = small_segments().min_nseg(2).max_nseg(8).free_reserve(0);
        let silo = fresh(config);
        let t = silo.thresholds().unwrap();
        assert_eq!((t.min_nseg, t.aim_nseg, t.max_nseg), (2, 4, 8));

        for i in 0..30u8 {
            silo.insert(&object(i, &[i; 1024])).unwrap();
            assert!(silo.segments().unwrap().len() <= 8);
        }
        let report = silo.age_now().unwrap();
        assert_eq!(report.nseg, 4);
        assert!(report.saved);
        let segments = silo.segments().unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments.last().unwrap().state, SegmentState::Open);
        assert!(silo.stats().segments_evicted >= 4);

        let again = silo.age_now().unwrap();
        assert_eq!(again.evicted, 0);
    }

    #[test]
    fn evicted_objects_are_gone() {
        let config = small_segments().min_nseg(1).max_nseg(2).free_reserve(0);
        let silo = fresh(config);
        let first = silo.insert(&object(0, &[0; 1024])).unwrap();
        for i in 1..7u8 {
            silo.insert(&object(i, &[i; 1024])).unwrap();
        }
        assert!(silo.lookup(first).unwrap().is_none());
        assert!(silo.segments().unwrap().iter().all(|s| s.serial != first.serial));
    }

    #[test]
    fn bans_are_persisted_and_pruned() {
        let silo = fresh(config());
        assert_eq!(silo.add_ban(b"obj.http.x ~ a").unwrap(), 1);
        assert_eq!(silo.add_ban(b"obj.http.x ~ b").unwrap(), 2);
        assert_eq!(silo.add_ban(b"obj.http.x ~ c").unwrap(), 3);
        silo.insert(&NewObject {
            ban: Some(2),
            ..object(1, b"banned maybe")
        })
        .unwrap();
        assert_eq!(silo.oldest_referenced_ban().unwrap(), Some(2));

        silo.sync().unwrap();
        let generations: Vec<u64> = silo.bans().unwrap().iter().map(|b| b.generation).collect();
        assert_eq!(generations, vec![2, 3]);

        let silo = remount(silo, config());
        let bans = silo.bans().unwrap();
        assert_eq!(bans.len(), 2);
        assert_eq!(bans[1].spec, b"obj.http.x ~ c");
        assert_eq!(silo.add_ban(b"obj.http.x ~ d").unwrap(), 4);
    }

    #[test]
    fn full_ban_table_refuses_ban_and_keeps_state() {
        let config = small_segments().table_size(64 * 1024);
        let silo = fresh(config.clone());
        assert_eq!(silo.add_ban(b"req.url ~ /a").unwrap(), 1);
        silo.insert(&NewObject {
            ban: Some(1),
            ..object(0, b"refers to ban 1")
        })
        .unwrap();

        let spec = vec![b'x'; 4000];
        let err = (0..100)
            .find_map(|_| silo.add_ban(&spec).err())
            .expect("ban table never filled");
        assert!(matches!(err, SiloError::TableFull { table: "ban", .. }), "{err}");
        let bans = silo.bans().unwrap();
        assert!(bans.len() > 2);

        // Rolling segments saves both tables again.
        for i in 1..=10u8 {
            silo.insert(&object(i, &[i; 1500])).unwrap();
        }
        assert!(silo.segments().unwrap().len() > 3);
        assert_eq!(silo.stats().capacity_failures, 0);
        assert_eq!(silo.bans().unwrap(), bans);

        let silo = remount(silo, config);
        assert_eq!(silo.bans().unwrap(), bans);
    }

    fn wrapping() -> SiloConfig {
        config()
            .min_nseg(1)
            .aim_segl(MIB)
            .max_segl(MIB)
            .free_reserve(0)
    }

    #[test]
    fn segments_wrap_to_start_of_space() {
        let silo = Silo::create(Box::new(InMemoryMedia::new(4 * MIB)), wrapping()).unwrap();
        let payloads: Vec<Vec<u8>> = (1..=4u8).map(|i| vec![i; 600 * 1024]).collect();
        let handles: Vec<_> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| silo.insert(&object(i as u8 + 1, p)).unwrap())
            .collect();

        let ident = silo.ident().unwrap();
        let (space, end) = (ident.offset(Stuff::Space), ident.offset(Stuff::End));
        let segments = silo.segments().unwrap();
        let serials: Vec<u32> = segments.iter().map(|s| s.serial).collect();
        assert_eq!(serials, vec![2, 3, 4]);
        assert_eq!(segments[0].offset, space + MIB);
        // The third segment was cut short at the end of the space.
        assert_eq!(segments[1].offset + segments[1].length, end);
        assert!(segments[1].length < MIB);
        assert_eq!(segments[2].offset, space);
        assert_eq!(segments[2].length, MIB);
        assert_eq!(silo.stats().segments_evicted, 1);

        let check = |silo: &Silo| {
            assert!(silo.lookup(handles[0]).unwrap().is_none());
            for (handle, payload) in handles.iter().zip(&payloads).skip(1) {
                assert_eq!(&silo.lookup(*handle).unwrap().unwrap().payload, payload);
            }
        };
        check(&silo);
        let silo = remount(silo, wrapping());
        check(&silo);
        assert_eq!(silo.segments().unwrap().len(), 3);
    }

    #[test]
    fn nuke_drops_least_recently_used() {
        let silo = fresh(config());
        let handles: Vec<_> = (0..3u8)
            .map(|i| silo.insert(&object(i, b"x")).unwrap())
            .collect();
        silo.lookup(handles[0]).unwrap();

        assert_eq!(silo.nuke_one().unwrap(), Some(handles[1]));
        assert!(silo.lookup(handles[1]).unwrap().is_none());
        assert_eq!(silo.stats().objects_nuked, 1);
    }

    #[test]
    fn oversized_object_is_refused() {
        let silo = fresh(config());
        let max = silo.thresholds().unwrap().max_segl;
        let big = vec![0u8; max as usize];
        let err = silo.insert(&object(1, &big)).unwrap_err();
        assert!(matches!(err, SiloError::Capacity { .. }));
        assert_eq!(silo.stats().capacity_failures, 1);
        assert!(silo.insert(&object(2, b"small")).is_ok());
    }

    #[test]
    fn corrupt_tables_refuse_mount() {
        let silo = fresh(config());
        silo.insert(&object(1, b"x")).unwrap();
        let ident = silo.ident().unwrap();
        let mut region = Region::new(silo.close().unwrap());
        for stuff in [Stuff::Seg1, Stuff::Seg2] {
            let offset = ident.offset(stuff) + SIGN_HEADER_SIZE;
            let byte = region.bytes(offset, 1)[0];
            region.write(offset, &[byte ^ 0x55]);
        }
        let err = Silo::open(region.into_media(), config()).unwrap_err();
        assert!(matches!(err, SiloError::Corrupt { .. }), "{err}");
    }

    #[test]
    fn mount_rejects_other_granularity() {
        let silo = fresh(config());
        let media = silo.close().unwrap();
        let err = Silo::open(media, config().granularity(4096)).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn open_or_create_formats_blank_media() {
        let silo = Silo::open_or_create(Box::new(InMemoryMedia::new(8 * MIB)), config()).unwrap();
        let handle = silo.insert(&object(1, b"x")).unwrap();
        let media = silo.close().unwrap();
        let silo = Silo::open_or_create(media, config()).unwrap();
        assert!(silo.lookup(handle).unwrap().is_some());
    }

    #[test]
    fn open_path_creates_then_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silo.bin");

        let silo = Silo::open_path(&path, Some("8M"), config()).unwrap();
        let handle = silo.insert(&object(1, b"on disk")).unwrap();
        let unique = silo.ident().unwrap().unique;
        drop(silo);

        let silo = Silo::open_path(&path, None, config()).unwrap();
        assert_eq!(silo.ident().unwrap().unique, unique);
        assert_eq!(silo.lookup(handle).unwrap().unwrap().payload, b"on disk");
    }

    #[test]
    fn aging_thread_loads_for_other_threads() {
        let silo = fresh(config());
        let handles: Vec<_> = (0..3u8)
            .map(|i| silo.insert(&object(i, &[i; 100])).unwrap())
            .collect();

        let background = config()
            .background_aging(true)
            .aging_interval(Duration::from_millis(10));
        let silo = remount(silo, background);
        std::thread::scope(|s| {
            for &handle in &handles {
                let silo = &silo;
                s.spawn(move || {
                    let stored = silo.lookup(handle).unwrap().unwrap();
                    assert_eq!(stored.payload, vec![handle.index as u8; 100]);
                });
            }
        });
        silo.signal_pressure();
        let media = silo.close().unwrap();
        assert!(!Ident::is_blank(&Region::new(media)));
    }

    #[test]
    fn drop_releases_state() {
        let silo = fresh(config());
        let shared = Arc::clone(&silo.shared);
        drop(silo);
        assert!(shared.state.lock().is_none());
    }
}
