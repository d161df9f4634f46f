//! Storage file acquisition and sizing.
//!
//! These helpers turn an operator-supplied path and size specification
//! into an open, correctly sized file. They never interpret silo contents.

use crate::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Smallest silo accepted from a size specification.
pub const MIN_SIZE: u64 = 1024 * 1024;

/// How [`get_file`] obtained the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// The file existed before.
    PreExisting,
    /// The file was created by this call.
    Created,
    /// A directory was given; the file is unlinked and vanishes on close.
    Anonymous,
}

impl FileOutcome {
    /// Returns whether the file may hold a previous silo.
    #[must_use]
    pub const fn may_hold_silo(self) -> bool {
        matches!(self, Self::PreExisting)
    }
}

/// An open storage file.
#[derive(Debug)]
pub struct AcquiredFile {
    /// The open read/write handle.
    pub file: File,
    /// The resolved file name.
    pub path: PathBuf,
    /// How the file was obtained.
    pub outcome: FileOutcome,
}

/// Opens the storage file named by `path`.
///
/// `path` can be an existing file, an existing directory or a nonexistent
/// name in an existing directory. A directory yields an anonymous file
/// inside it.
///
/// # Errors
///
/// Returns an error if the path can neither be created nor opened, or is
/// neither a regular file nor a directory.
pub fn get_file(path: &Path) -> StorageResult<AcquiredFile> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => {
            return Ok(AcquiredFile {
                file,
                path: path.to_path_buf(),
                outcome: FileOutcome::Created,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(StorageError::path(
                path,
                format!("does not exist and could not be created ({e})"),
            ))
        }
    }

    let meta = std::fs::metadata(path)
        .map_err(|e| StorageError::path(path, format!("could not stat ({e})")))?;

    let (file, resolved, outcome) = if meta.is_dir() {
        let temp = tempfile::Builder::new()
            .prefix("silo.")
            .tempfile_in(path)
            .map_err(|e| StorageError::path(path, format!("could not create file ({e})")))?;
        let resolved = temp.path().to_path_buf();
        let (file, temp_path) = temp.into_parts();
        temp_path.close()?;
        (file, resolved, FileOutcome::Anonymous)
    } else if meta.is_file() {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::path(path, format!("could not open ({e})")))?;
        (file, path.to_path_buf(), FileOutcome::PreExisting)
    } else {
        return Err(StorageError::path(path, "is neither file nor directory"));
    };

    if !file.metadata()?.is_file() {
        return Err(StorageError::path(path, "was not a file after opening"));
    }

    Ok(AcquiredFile {
        file,
        path: resolved,
        outcome,
    })
}

/// Decides the silo size for an open file.
///
/// `granularity` is raised to the filesystem block size if it is smaller.
/// With no specification an existing non-empty file keeps its size.
/// The result is clipped to platform limits and rounded down to
/// `granularity`.
///
/// # Errors
///
/// Returns an error if no size can be determined, the specification is
/// malformed, below [`MIN_SIZE`], or larger than the filesystem.
pub fn file_size(
    file: &File,
    path: &Path,
    spec: Option<&str>,
    granularity: &mut u32,
) -> StorageResult<u64> {
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(StorageError::path(path, "is not a regular file"));
    }

    let probe = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(path);
    let block = fs2::allocation_granularity(probe).unwrap_or(u64::from(*granularity));
    let block = u32::try_from(block).unwrap_or(u32::MAX);
    if *granularity < block {
        *granularity = block;
    }

    let spec = spec.map(str::trim).filter(|s| !s.is_empty());
    let mut size = match spec {
        None if meta.len() != 0 => meta.len(),
        None => return Err(StorageError::path(path, "no size specified")),
        Some(spec) => {
            let size = parse_size(spec)?;
            if size < MIN_SIZE {
                return Err(StorageError::invalid_size(
                    spec,
                    "too small, did you forget to specify M or G?",
                ));
            }
            if let Ok(fs_size) = fs2::total_space(probe) {
                if size > fs_size {
                    return Err(StorageError::invalid_size(spec, "larger than file system"));
                }
            }
            size
        }
    };

    let limit = u64::try_from(i64::MAX).unwrap_or(u64::MAX);
    if size > limit {
        size = limit;
        warn!(path = %path.display(), size, "file size reduced due to offset limitations");
    }
    let addressable = usize::MAX as u64;
    if size > addressable {
        size = addressable;
        warn!(path = %path.display(), size, "file size reduced to fit the address space");
    }

    let granularity = u64::from((*granularity).max(1));
    Ok(size - size % granularity)
}

/// Parses a human size specification such as `"8M"`, `"1.5g"` or `"4096"`.
///
/// Accepts an optional fraction and an optional `k`, `m`, `g`, `t` or `p`
/// suffix (powers of 1024), optionally followed by `b`. A lone `b` means bytes.
///
/// # Errors
///
/// Returns an error for a missing number, an unknown suffix, or a value
/// that overflows `u64`.
pub fn parse_size(spec: &str) -> StorageResult<u64> {
    let s = spec.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(StorageError::invalid_size(spec, "missing number"));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| StorageError::invalid_size(spec, "invalid number"))?;

    let suffix = suffix.trim().to_ascii_lowercase();
    let shift = match suffix.as_str() {
        "" | "b" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        "t" | "tb" => 40,
        "p" | "pb" => 50,
        _ => return Err(StorageError::invalid_size(spec, "invalid suffix")),
    };

    let bytes = value * (1u64 << shift) as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(StorageError::invalid_size(spec, "size too large"));
    }
    Ok(bytes as u64)
}
