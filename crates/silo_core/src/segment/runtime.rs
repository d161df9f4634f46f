//! In-memory segment state.

use super::alloc::Cursor;
use super::ptr::{LiveMap, SegPtr, SegmentRecord};
use super::{SegmentInfo, SegmentState, SEGHEAD_TAG};
use crate::error::SiloResult;
use crate::object::{Expiry, ObjectDesc, ObjectHash, DESC_SIZE};
use crate::region::Region;
use crate::sign::{SignCtx, SignStatus, SIGN_HEADER_SIZE};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Least-recently-used order of the live objects of one segment.
#[derive(Debug, Default)]
pub(crate) struct Lru {
    clock: u64,
    order: BTreeMap<u64, u32>,
    stamps: HashMap<u32, u64>,
}

impl Lru {
    /// Inserts `index` as most recently used, or moves it there.
    pub(crate) fn touch(&mut self, index: u32) {
        self.remove(index);
        self.clock += 1;
        self.order.insert(self.clock, index);
        self.stamps.insert(index, self.clock);
    }

    pub(crate) fn remove(&mut self, index: u32) {
        if let Some(stamp) = self.stamps.remove(&index) {
            self.order.remove(&stamp);
        }
    }

    pub(crate) fn oldest(&self) -> Option<u32> {
        self.order.values().next().copied()
    }
}

/// What loading a segment found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Live objects made available.
    pub loaded: u32,
    /// Objects dropped because they had expired.
    pub expired: u32,
    /// Whether the segment signature or contents were rejected.
    pub rejected: bool,
}

/// A segment of the silo.
#[derive(Debug)]
pub(crate) struct Segment {
    ptr: SegPtr,
    state: SegmentState,
    ban_tail: Option<u64>,
    live: LiveMap,
    nobj: u32,
    objects: Vec<ObjectDesc>,
    lru: Lru,
    sign: SignCtx,
    cursor: Option<Cursor>,
}

impl Segment {
    /// Starts a new, empty open segment at `[offset, offset + length)`.
    pub(crate) fn open(
        region: &mut Region,
        serial: u32,
        offset: u64,
        length: u64,
        granularity: u32,
        unique: u32,
        ban_tail: Option<u64>,
    ) -> Self {
        let mut sign = SignCtx::define(offset, offset + length, SEGHEAD_TAG, unique);
        sign.reset(region);
        let cursor = Cursor::new(offset, length, u64::from(granularity), sign.data_end());
        Self {
            ptr: SegPtr {
                offset,
                length,
                objlist: offset + SIGN_HEADER_SIZE,
                lobjlist: 0,
                serial,
            },
            state: SegmentState::Open,
            ban_tail,
            live: LiveMap::default(),
            nobj: 0,
            objects: Vec::new(),
            lru: Lru::default(),
            sign,
            cursor: Some(cursor),
        }
    }

    /// Rebuilds a segment from its table record; its objects are not read.
    pub(crate) fn from_record(record: SegmentRecord, unique: u32) -> Self {
        let ptr = record.ptr;
        Self {
            sign: SignCtx::define(ptr.offset, ptr.end(), SEGHEAD_TAG, unique),
            ptr,
            state: SegmentState::MustLoad,
            ban_tail: record.ban_tail,
            nobj: record.live.count(),
            live: record.live,
            objects: Vec::new(),
            lru: Lru::default(),
            cursor: None,
        }
    }

    pub(crate) const fn serial(&self) -> u32 {
        self.ptr.serial
    }

    pub(crate) const fn ptr(&self) -> &SegPtr {
        &self.ptr
    }

    pub(crate) const fn state(&self) -> SegmentState {
        self.state
    }

    pub(crate) const fn ban_tail(&self) -> Option<u64> {
        self.ban_tail
    }

    /// Live objects.
    pub(crate) const fn nobj(&self) -> u32 {
        self.nobj
    }

    /// Descriptor slots ever allocated.
    pub(crate) fn nalloc(&self) -> u32 {
        self.live.len()
    }

    pub(crate) fn info(&self) -> SegmentInfo {
        SegmentInfo {
            serial: self.ptr.serial,
            offset: self.ptr.offset,
            length: self.ptr.length,
            state: self.state,
            nobj: self.nobj,
            nalloc: self.nalloc(),
            nfixed: self.ptr.lobjlist,
            ban_tail: self.ban_tail,
        }
    }

    /// Places an object in this open segment.
    ///
    /// The payload is written before its descriptor is appended, so the
    /// descriptor never refers to unwritten bytes. Returns `None` if the
    /// segment has no room.
    ///
    /// # Panics
    ///
    /// Panics if the segment is not open.
    pub(crate) fn insert(
        &mut self,
        region: &mut Region,
        hash: ObjectHash,
        expiry: Expiry,
        ban: Option<u64>,
        payload: &[u8],
    ) -> Option<u32> {
        assert_eq!(self.state, SegmentState::Open, "insert into a segment that is not open");
        let cursor = self.cursor.as_mut()?;
        let len = payload.len() as u64;
        let ptr = cursor.alloc(self.sign.data_end() + DESC_SIZE, len)?;
        region.write(ptr, payload);

        let desc = ObjectDesc {
            hash,
            expiry,
            ban,
            ptr,
            len,
        };
        self.sign.append(region, &desc.encode());

        let index = self.live.len();
        self.objects.push(desc);
        self.live.push(true);
        self.nobj += 1;
        self.lru.touch(index);
        if let Some(g) = ban {
            self.ban_tail = Some(self.ban_tail.map_or(g, |t| t.min(g)));
        }
        Some(index)
    }

    /// Reads the descriptor array back from the medium.
    ///
    /// A segment whose signature or descriptors do not check out is kept
    /// in the list but treated as holding no objects.
    pub(crate) fn load(&mut self, region: &Region, now: f64) -> LoadReport {
        assert_eq!(self.state, SegmentState::MustLoad, "segment loaded twice");
        self.state = SegmentState::Loaded;

        let status = self.sign.check(region);
        let descs = if status == SignStatus::Valid {
            self.read_descriptors(region)
        } else {
            Err(format!("signature {status:?}"))
        };
        let descs = match descs {
            Ok(descs) => descs,
            Err(reason) => {
                warn!(
                    serial = self.ptr.serial,
                    offset = self.ptr.offset,
                    %reason,
                    "segment rejected"
                );
                self.live = LiveMap::default();
                self.nobj = 0;
                return LoadReport {
                    rejected: true,
                    ..LoadReport::default()
                };
            }
        };

        let count = descs.len() as u32;
        if self.live.len() > count {
            warn!(
                serial = self.ptr.serial,
                table = self.live.len(),
                signed = count,
                "segment holds fewer objects than its table record"
            );
            let mut live = LiveMap::default();
            for i in 0..count {
                live.push(self.live.get(i));
            }
            self.live = live;
        }
        self.live.extend_to(count, true);

        let mut report = LoadReport::default();
        for (i, desc) in descs.iter().enumerate() {
            let i = i as u32;
            if !self.live.get(i) {
                continue;
            }
            if desc.expiry.is_expired(now) {
                self.live.set(i, false);
                report.expired += 1;
                continue;
            }
            self.lru.touch(i);
            report.loaded += 1;
        }
        self.objects = descs;
        self.nobj = self.live.count();
        report
    }

    fn read_descriptors(&self, region: &Region) -> Result<Vec<ObjectDesc>, String> {
        let signed = self.sign.len();
        if signed % DESC_SIZE != 0 {
            return Err(format!("descriptor array of {signed} bytes"));
        }
        let floor = self.sign.end();
        let ceiling = self.ptr.end();
        let data = region.bytes(self.sign.data_offset(), signed);
        data.chunks_exact(DESC_SIZE as usize)
            .map(|chunk| {
                let desc = ObjectDesc::decode(chunk).map_err(|e| e.to_string())?;
                let inside = desc.ptr >= floor
                    && desc
                        .ptr
                        .checked_add(desc.len)
                        .is_some_and(|end| end <= ceiling);
                if inside {
                    Ok(desc)
                } else {
                    Err(format!(
                        "descriptor at {}+{} outside segment",
                        desc.ptr, desc.len
                    ))
                }
            })
            .collect()
    }

    /// Returns the descriptor in `index` if it is live, marking it used.
    pub(crate) fn touch(&mut self, index: u32) -> Option<&ObjectDesc> {
        self.get(index)?;
        self.lru.touch(index);
        self.get(index)
    }

    /// Returns the descriptor in `index` if it is live.
    pub(crate) fn get(&self, index: u32) -> Option<&ObjectDesc> {
        if self.live.get(index) {
            self.objects.get(index as usize)
        } else {
            None
        }
    }

    /// Iterates over live descriptors with their slot.
    pub(crate) fn live_objects(&self) -> impl Iterator<Item = (u32, &ObjectDesc)> {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, d)| (i as u32, d))
            .filter(|(i, _)| self.live.get(*i))
    }

    /// Returns the least recently used live object.
    pub(crate) fn lru_oldest(&self) -> Option<u32> {
        self.lru.oldest()
    }

    /// Marks an object dead. Returns whether it was live.
    pub(crate) fn remove(&mut self, index: u32) -> bool {
        if !self.live.get(index) {
            return false;
        }
        self.live.set(index, false);
        self.lru.remove(index);
        self.nobj -= 1;
        true
    }

    /// Commits the descriptors, their signature and every payload.
    pub(crate) fn sync(&self, region: &Region) -> SiloResult<()> {
        region.sync(self.ptr.offset, self.ptr.length)
    }

    /// Finalizes the open segment.
    pub(crate) fn close(&mut self, region: &Region) -> SiloResult<()> {
        assert_eq!(self.state, SegmentState::Open, "closing a segment that is not open");
        self.sync(region)?;
        self.state = SegmentState::Closed;
        self.cursor = None;
        Ok(())
    }

    /// Returns the table record of this segment.
    pub(crate) fn record(&self) -> SegmentRecord {
        SegmentRecord {
            ptr: SegPtr {
                lobjlist: self.live.len(),
                ..self.ptr
            },
            ban_tail: self.ban_tail,
            live: self.live.clone(),
        }
    }

    /// Notes that the current descriptors are recorded in the table.
    pub(crate) fn mark_saved(&mut self) {
        self.ptr.lobjlist = self.live.len();
    }

    /// Re-validates the segment signature on the medium.
    pub(crate) fn check(&self, region: &Region) -> SignStatus {
        self.sign.clone().check(region)
    }
}
