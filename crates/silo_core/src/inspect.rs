//! Offline inspection of a silo image.
//!
//! Reads the ident, both copies of both tables and the signature of every
//! segment listed in the active segment table, without mounting the silo
//! or changing a byte of it.

use crate::ban::BanList;
use crate::error::SiloResult;
use crate::ident::{Ident, IDENT_SIZE};
use crate::object::DESC_SIZE;
use crate::region::Region;
use crate::segment::{SegmentRecord, SEGHEAD_TAG};
use crate::sign::{SignCtx, SignStatus, SIGN_HEADER_SIZE};
use crate::table::{CopyStatus, PingPong, TableKind};

/// State of one ping-pong table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    /// Which table.
    pub kind: TableKind,
    /// Status of both copies.
    pub copies: [CopyStatus; 2],
    /// Index of the copy a mount would select.
    pub active: Option<usize>,
    /// Generation of that copy.
    pub generation: u64,
}

impl TableReport {
    /// Returns whether both copies validate.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.copies.iter().all(CopyStatus::is_usable)
    }
}

/// A segment listed in the active segment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReport {
    /// Serial number.
    pub serial: u32,
    /// Silo-relative start.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Descriptors recorded in the table.
    pub recorded: u32,
    /// Live objects according to the table.
    pub live: u32,
    /// Descriptors covered by the segment signature.
    pub signed: u32,
    /// Status of the segment signature.
    pub status: SignStatus,
}

/// Everything `inspect` found.
#[derive(Debug, Clone)]
pub struct InspectReport {
    /// The validated ident block.
    pub ident: Ident,
    /// Ban table state.
    pub ban_table: TableReport,
    /// Segment table state.
    pub seg_table: TableReport,
    /// Segments of the active segment table, oldest first.
    pub segments: Vec<SegmentReport>,
    /// Bans held by the active ban table.
    pub bans: usize,
    /// Problems that would make a mount fail or drop data.
    pub problems: Vec<String>,
}

impl InspectReport {
    /// Returns whether every copy and every segment validates.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
            && self.ban_table.is_clean()
            && self.seg_table.is_clean()
            && self.segments.iter().all(|s| s.status.is_valid())
    }
}

fn table_report(table: &mut PingPong, region: &Region) -> (TableReport, Option<Vec<u8>>) {
    let copies = table.probe(region);
    let active = match (copies[0].generation, copies[1].generation) {
        (Some(a), Some(b)) if b > a => Some(1),
        (Some(_), _) => Some(0),
        (None, Some(_)) => Some(1),
        (None, None) => None,
    };
    let payload = active.and_then(|_| table.mount(region).ok());
    let report = TableReport {
        kind: table.kind(),
        copies,
        active,
        generation: active.map_or(0, |_| table.generation()),
    };
    (report, payload)
}

/// Reads the granularity recorded in an ident without validating it.
fn recorded_granularity(region: &Region) -> Option<u32> {
    if region.len() < SIGN_HEADER_SIZE + IDENT_SIZE {
        return None;
    }
    Ident::decode(region.bytes(SIGN_HEADER_SIZE, IDENT_SIZE))
        .ok()
        .map(|ident| ident.granularity)
}

/// Inspects the silo held by `region`.
///
/// With no `granularity` the value recorded in the ident is trusted.
///
/// # Errors
///
/// Returns an error only if the ident block cannot be read; table and
/// segment damage is reported in [`InspectReport::problems`].
pub fn inspect(region: &Region, granularity: Option<u32>) -> SiloResult<InspectReport> {
    let granularity = granularity
        .or_else(|| recorded_granularity(region))
        .unwrap_or_default();
    let ident = Ident::read(region, granularity)?;
    let mut problems = Vec::new();

    let mut ban = PingPong::define(&ident, TableKind::Ban);
    let (ban_table, ban_payload) = table_report(&mut ban, region);
    let bans = match ban_payload.map(|p| BanList::decode(&p)) {
        Some(Ok(list)) => list.bans().len(),
        Some(Err(e)) => {
            problems.push(format!("ban table: {e}"));
            0
        }
        None => {
            problems.push("ban table: no valid copy".to_string());
            0
        }
    };

    let mut seg = PingPong::define(&ident, TableKind::Segment);
    let (seg_table, seg_payload) = table_report(&mut seg, region);
    let records = match seg_payload.map(|p| SegmentRecord::decode_all(&p)) {
        Some(Ok(records)) => records,
        Some(Err(e)) => {
            problems.push(format!("segment table: {e}"));
            Vec::new()
        }
        None => {
            problems.push("segment table: no valid copy".to_string());
            Vec::new()
        }
    };

    let segments = records
        .iter()
        .map(|rec| {
            let p = rec.ptr;
            let (status, signed) = if p.end() <= region.len() {
                let mut ctx = SignCtx::define(p.offset, p.end(), SEGHEAD_TAG, ident.unique);
                let status = ctx.check(region);
                (status, (ctx.len() / DESC_SIZE) as u32)
            } else {
                problems.push(format!("segment {} extends past the silo", p.serial));
                (SignStatus::TagMismatch, 0)
            };
            if status.is_valid() && signed < p.lobjlist {
                problems.push(format!(
                    "segment {} signs {signed} descriptors but the table records {}",
                    p.serial, p.lobjlist
                ));
            }
            SegmentReport {
                serial: p.serial,
                offset: p.offset,
                length: p.length,
                recorded: p.lobjlist,
                live: rec.live.count(),
                signed,
                status,
            }
        })
        .collect();

    Ok(InspectReport {
        ident,
        ban_table,
        seg_table,
        segments,
        bans,
        problems,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::Stuff;
    use crate::object::{Expiry, NewObject};
    use crate::{Silo, SiloConfig};
    use silo_storage::InMemoryMedia;

    fn populated() -> Region {
        let config = SiloConfig::default().background_aging(false);
        let silo = Silo::create(Box::new(InMemoryMedia::new(8 * 1024 * 1024)), config).unwrap();
        for i in 0..3u8 {
            silo.insert(&NewObject {
                hash: [i; 32],
                expiry: Expiry::new(600.0, 0.0, 0.0),
                ban: None,
                payload: &[i; 1024],
            })
            .unwrap();
        }
        silo.add_ban(b"req.url ~ /old").unwrap();
        Region::new(silo.close().unwrap())
    }

    #[test]
    fn clean_silo_reports_clean() {
        let region = populated();
        let report = inspect(&region, Some(512)).unwrap();
        assert!(report.is_clean(), "{:?}", report.problems);
        assert_eq!(report.segments.len(), 1);
        assert_eq!(report.segments[0].live, 3);
        assert_eq!(report.segments[0].signed, 3);
        assert_eq!(report.bans, 1);
        assert!(report.seg_table.generation > 0);
    }

    #[test]
    fn damaged_copy_is_reported() {
        let mut region = populated();
        let report = inspect(&region, Some(512)).unwrap();
        let active = report.seg_table.active.unwrap();
        let stuff = if active == 0 { Stuff::Seg1 } else { Stuff::Seg2 };
        let offset = report.ident.offset(stuff) + 40;
        let byte = region.bytes(offset, 1)[0];
        region.write(offset, &[byte ^ 0xff]);

        let report = inspect(&region, Some(512)).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.seg_table.copies[active].status, SignStatus::DigestMismatch);
        assert_eq!(report.seg_table.active, Some(1 - active));
    }

    #[test]
    fn blank_medium_is_an_error() {
        let region = Region::new(Box::new(InMemoryMedia::new(1024 * 1024)));
        assert!(inspect(&region, None).is_err());
    }
}
