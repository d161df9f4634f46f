//! CLI command implementations.

pub mod create;
pub mod inspect;
pub mod object;
pub mod verify;

use silo_core::Region;
use silo_storage::InMemoryMedia;
use std::path::Path;

/// Reads a silo file into memory so it can be examined without locking
/// or modifying it.
pub fn read_image(path: &Path) -> Result<Region, Box<dyn std::error::Error>> {
    if !path.is_file() {
        return Err(format!("No silo found at {}", path.display()).into());
    }
    let data = std::fs::read(path)?;
    Ok(Region::new(Box::new(InMemoryMedia::with_data(data))))
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
