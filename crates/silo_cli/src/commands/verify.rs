//! Verify command implementation.

use super::read_image;
use silo_core::{inspect, Silo, SiloConfig};
use std::path::Path;
use tracing::debug;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of segments checked.
    pub segments_checked: usize,
    /// Number of segments whose signature validates.
    pub valid_segments: usize,
    /// Number of corrupt segments.
    pub corrupt_segments: usize,
    /// Objects available after a mount.
    pub objects_loaded: u64,
    /// Objects a mount would drop as expired.
    pub objects_expired: u64,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns whether nothing was found wrong.
    pub fn is_ok(&self) -> bool {
        self.corrupt_segments == 0 && self.errors.is_empty()
    }
}

/// Checks the silo image at `path` without modifying the file.
///
/// The tables and segment signatures are checked offline, then a copy of
/// the image is mounted in memory and every segment is loaded.
pub fn verify(path: &Path) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let region = read_image(path)?;
    let report = inspect(&region, None)?;

    let mut result = VerifyResult {
        segments_checked: report.segments.len(),
        errors: report.problems.clone(),
        ..VerifyResult::default()
    };
    for (name, table) in [("ban", &report.ban_table), ("segment", &report.seg_table)] {
        for (i, copy) in table.copies.iter().enumerate() {
            if !copy.is_usable() {
                result
                    .errors
                    .push(format!("{name} table copy {}: {:?}", i + 1, copy.status));
            }
        }
    }
    for seg in &report.segments {
        if seg.status.is_valid() {
            result.valid_segments += 1;
        } else {
            result.corrupt_segments += 1;
            result
                .errors
                .push(format!("segment {}: {:?}", seg.serial, seg.status));
        }
    }

    let config = SiloConfig::default()
        .name(path.display().to_string())
        .granularity(report.ident.granularity)
        .background_aging(false);
    debug!(
        segments = result.segments_checked,
        problems = result.errors.len(),
        "offline checks done, mounting a copy"
    );
    match Silo::open(region.into_media(), config) {
        Ok(silo) => {
            silo.load_all()?;
            result.objects_loaded = silo.objects()?.len() as u64;
            result.objects_expired = silo.stats().objects_expired;
        }
        Err(e) => result.errors.push(format!("mount failed: {e}")),
    }

    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying silo at {}", path.display());
    println!();

    let result = verify(path)?;
    println!(
        "  Segments checked: {}, valid: {}, corrupt: {}",
        result.segments_checked, result.valid_segments, result.corrupt_segments
    );
    println!(
        "  Objects loaded: {}, expired: {}",
        result.objects_loaded, result.objects_expired
    );
    for error in &result.errors {
        println!("    ERROR: {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Silo verification passed");
        Ok(())
    } else {
        println!("✗ Silo verification failed");
        Err("Verification failed".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_core::{Expiry, NewObject};
    use tempfile::tempdir;

    fn build(path: &Path) {
        let config = SiloConfig::default().background_aging(false);
        let silo = Silo::open_path(path, Some("4M"), config).unwrap();
        for i in 0..5u8 {
            silo.insert(&NewObject {
                hash: [i; 32],
                expiry: Expiry::new(600.0, 0.0, 0.0),
                ban: None,
                payload: &[i; 300],
            })
            .unwrap();
        }
        silo.close().unwrap();
    }

    #[test]
    fn healthy_silo_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silo.bin");
        build(&path);

        let result = verify(&path).unwrap();
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.segments_checked, 1);
        assert_eq!(result.objects_loaded, 5);
    }

    #[test]
    fn damaged_segment_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("silo.bin");
        build(&path);

        let region = read_image(&path).unwrap();
        let report = inspect(&region, None).unwrap();
        let offset = report.segments[0].offset as usize + 40;
        let mut data = std::fs::read(&path).unwrap();
        data[offset] ^= 0xff;
        std::fs::write(&path, data).unwrap();

        let result = verify(&path).unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.corrupt_segments, 1);
        assert_eq!(result.objects_loaded, 0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(verify(&dir.path().join("nope")).is_err());
    }
}
