//! Background aging.
//!
//! Each silo runs one aging thread. On start it becomes the silo thread
//! and loads every segment left by the previous mount, then it wakes every
//! `aging_interval` (or when signalled) and evicts the oldest segments
//! while the silo holds more than `aim_nseg` segments or less than
//! `free_reserve` free bytes. Without space pressure it never goes below
//! `min_nseg`. Each pass that changed anything saves both tables.

use crate::error::{SiloError, SiloResult};
use crate::segment::SegmentState;
use crate::silo::{Shared, SiloState};
use crate::stats::SiloStats;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Outcome of one aging pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgingReport {
    /// Segments evicted by this pass.
    pub evicted: u32,
    /// Segments left.
    pub nseg: u32,
    /// Free bytes left.
    pub free: u64,
    /// Whether the tables were saved.
    pub saved: bool,
}

impl SiloState {
    /// Runs one aging pass.
    pub(crate) fn age(&mut self, stats: &SiloStats) -> SiloResult<AgingReport> {
        let t = self.thresholds;
        let mut evicted = 0;
        loop {
            let nseg = self.segments.len() as u64;
            let pressure = self.free_bytes() < t.free_reserve;
            let crowded = nseg > u64::from(t.aim_nseg) && nseg > u64::from(t.min_nseg);
            if !(pressure || crowded) {
                break;
            }
            let reason = if pressure { "free reserve" } else { "segment count" };
            if !self.evict_oldest(reason, stats) {
                break;
            }
            evicted += 1;
        }

        let saved = self.dirty;
        if saved {
            self.save_tables(stats)?;
        }
        let report = AgingReport {
            evicted,
            nseg: self.segments.len() as u32,
            free: self.free_bytes(),
            saved,
        };
        if evicted > 0 {
            debug!(silo = %self.config.name, ?report, "aging pass");
        }
        Ok(report)
    }
}

/// Starts the aging thread of a silo.
pub(crate) fn spawn(shared: Arc<Shared>) -> SiloResult<JoinHandle<()>> {
    if let Some(st) = shared.state.lock().as_mut() {
        st.aging_running = true;
    }
    thread::Builder::new()
        .name(format!("silo-{}", shared.name))
        .spawn(move || run(&shared))
        .map_err(SiloError::Io)
}

fn run(shared: &Shared) {
    info!(silo = %shared.name, "aging thread started");
    load_all(shared);

    let mut guard = shared.state.lock();
    while let Some(st) = guard.as_mut() {
        if st.stop {
            if st.dirty {
                if let Err(e) = st.save_tables(&shared.stats) {
                    error!(silo = %shared.name, error = %e, "final table save failed");
                }
            }
            break;
        }
        if let Err(e) = st.age(&shared.stats) {
            error!(silo = %shared.name, error = %e, "aging pass failed");
        }
        let interval = st.config.aging_interval;
        shared.wake.wait_for(&mut guard, interval);
    }
    if let Some(st) = guard.as_mut() {
        st.aging_running = false;
    }
    drop(guard);
    shared.loaded.notify_all();
    info!(silo = %shared.name, "aging thread stopped");
}

/// Takes over as silo thread and loads every unloaded segment, releasing
/// the lock between segments so lookups of loaded ones proceed.
fn load_all(shared: &Shared) {
    let me = thread::current().id();
    loop {
        let mut guard = shared.state.lock();
        let Some(st) = guard.as_mut() else {
            return;
        };
        st.loader = me;
        if st.stop {
            return;
        }
        let next = st
            .segments
            .iter()
            .position(|s| s.state() == SegmentState::MustLoad);
        match next {
            Some(pos) => st.load_segment(pos, &shared.stats),
            None => {
                drop(guard);
                shared.loaded.notify_all();
                return;
            }
        }
        drop(guard);
        shared.loaded.notify_all();
    }
}
