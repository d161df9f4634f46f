//! Create command implementation.

use super::format_size;
use silo_core::{Silo, SiloConfig, Stuff};
use std::path::Path;
use tracing::info;

/// Runs the create command.
pub fn run(path: &Path, size: &str, granularity: u32) -> Result<(), Box<dyn std::error::Error>> {
    if path.is_file() {
        return Err(format!("{} already exists", path.display()).into());
    }

    let config = SiloConfig::default()
        .name(path.display().to_string())
        .granularity(granularity)
        .background_aging(false);
    let silo = Silo::open_path(path, Some(size), config)?;
    let ident = silo.ident()?;
    let thresholds = silo.thresholds()?;
    silo.close()?;
    info!(path = %path.display(), mediasize = ident.mediasize, "silo formatted");

    println!("Created silo at {}", path.display());
    println!("  Size:          {}", format_size(ident.mediasize));
    println!("  Granularity:   {} bytes", ident.granularity);
    println!("  Unique:        {:#010x}", ident.unique);
    println!(
        "  Segment space: {}",
        format_size(ident.offset(Stuff::End) - ident.offset(Stuff::Space))
    );
    println!(
        "  Segments:      {} min, {} aim, {} max",
        thresholds.min_nseg, thresholds.aim_nseg, thresholds.max_nseg
    );
    Ok(())
}
