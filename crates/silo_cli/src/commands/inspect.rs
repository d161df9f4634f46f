//! Inspect command implementation.

use super::{format_size, read_image};
use serde::Serialize;
use silo_core::{inspect, CopyStatus, InspectReport, Stuff, TableReport};
use std::path::Path;

/// Silo inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Silo path.
    pub path: String,
    /// Silo size in bytes.
    pub mediasize: u64,
    /// Allocation granularity in bytes.
    pub granularity: u32,
    /// Format version.
    pub major_version: u32,
    /// Random silo id.
    pub unique: u32,
    /// Region offsets.
    pub layout: Vec<RegionInfo>,
    /// Ban table state.
    pub ban_table: TableInfo,
    /// Segment table state.
    pub seg_table: TableInfo,
    /// Number of bans.
    pub bans: usize,
    /// Number of segments.
    pub segment_count: usize,
    /// Live objects according to the segment table.
    pub live_objects: u64,
    /// Segment details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<SegmentInfo>>,
    /// Problems found.
    pub problems: Vec<String>,
}

/// One region of the silo layout.
#[derive(Debug, Serialize)]
pub struct RegionInfo {
    /// Region name.
    pub name: &'static str,
    /// Silo-relative start.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
}

/// State of one table.
#[derive(Debug, Serialize)]
pub struct TableInfo {
    /// Copy a mount would use (1 or 2).
    pub active: Option<usize>,
    /// Generation of the active copy.
    pub generation: u64,
    /// Status of each copy.
    pub copies: [String; 2],
}

/// Details of one segment.
#[derive(Debug, Serialize)]
pub struct SegmentInfo {
    /// Serial number.
    pub serial: u32,
    /// Silo-relative start.
    pub offset: u64,
    /// Length in bytes.
    pub length: u64,
    /// Descriptors recorded in the segment table.
    pub recorded: u32,
    /// Live objects.
    pub live: u32,
    /// Descriptors covered by the signature.
    pub signed: u32,
    /// Signature status.
    pub status: String,
}

fn copy_status(copy: &CopyStatus) -> String {
    match copy.generation {
        Some(g) => format!("valid, generation {g}"),
        None => format!("{:?}", copy.status),
    }
}

fn table_info(table: &TableReport) -> TableInfo {
    TableInfo {
        active: table.active.map(|i| i + 1),
        generation: table.generation,
        copies: [copy_status(&table.copies[0]), copy_status(&table.copies[1])],
    }
}

fn layout(report: &InspectReport) -> Vec<RegionInfo> {
    let regions = [
        ("ban1", Stuff::Ban1),
        ("ban2", Stuff::Ban2),
        ("seg1", Stuff::Seg1),
        ("seg2", Stuff::Seg2),
        ("space", Stuff::Space),
    ];
    regions
        .iter()
        .map(|&(name, stuff)| RegionInfo {
            name,
            offset: report.ident.offset(stuff),
            length: report.ident.region_len(stuff),
        })
        .collect()
}

/// Builds the result from an inspection report.
pub fn summarize(path: &Path, report: &InspectReport, show_segments: bool) -> InspectResult {
    let segments: Vec<SegmentInfo> = report
        .segments
        .iter()
        .map(|s| SegmentInfo {
            serial: s.serial,
            offset: s.offset,
            length: s.length,
            recorded: s.recorded,
            live: s.live,
            signed: s.signed,
            status: format!("{:?}", s.status),
        })
        .collect();
    InspectResult {
        path: path.display().to_string(),
        mediasize: report.ident.mediasize,
        granularity: report.ident.granularity,
        major_version: report.ident.major_version,
        unique: report.ident.unique,
        layout: layout(report),
        ban_table: table_info(&report.ban_table),
        seg_table: table_info(&report.seg_table),
        bans: report.bans,
        segment_count: segments.len(),
        live_objects: segments.iter().map(|s| u64::from(s.live)).sum(),
        segments: show_segments.then_some(segments),
        problems: report.problems.clone(),
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, show_segments: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let region = read_image(path)?;
    let report = inspect(&region, None)?;
    let result = summarize(path, &report, show_segments);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Silo Inspection");
    println!("===============");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Ident:");
    println!("  Size:          {}", format_size(result.mediasize));
    println!("  Granularity:   {} bytes", result.granularity);
    println!("  Version:       {}", result.major_version);
    println!("  Unique:        {:#010x}", result.unique);
    println!();
    println!("Layout:");
    for region in &result.layout {
        println!(
            "  {:<6} at {:>12}  {}",
            region.name,
            region.offset,
            format_size(region.length)
        );
    }
    println!();
    for (name, table) in [("Ban table", &result.ban_table), ("Segment table", &result.seg_table)] {
        println!("{name}:");
        match table.active {
            Some(copy) => println!("  Active:  copy {copy}, generation {}", table.generation),
            None => println!("  Active:  none"),
        }
        println!("  Copy 1:  {}", table.copies[0]);
        println!("  Copy 2:  {}", table.copies[1]);
        println!();
    }
    println!("Contents:");
    println!("  Bans:         {}", result.bans);
    println!("  Segments:     {}", result.segment_count);
    println!("  Live objects: {}", result.live_objects);

    if let Some(segments) = &result.segments {
        println!();
        println!("Segments:");
        for seg in segments {
            println!(
                "  [{}] at {} ({}), {} live / {} recorded / {} signed, {}",
                seg.serial,
                seg.offset,
                format_size(seg.length),
                seg.live,
                seg.recorded,
                seg.signed,
                seg.status
            );
        }
    }

    if !result.problems.is_empty() {
        println!();
        println!("Problems:");
        for problem in &result.problems {
            println!("  {problem}");
        }
    }
}
