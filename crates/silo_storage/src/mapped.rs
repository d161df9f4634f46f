//! Memory-mapped silo medium.

use crate::error::{StorageError, StorageResult};
use crate::media::{check_range, SiloMedia};
use fs2::FileExt;
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped silo medium.
///
/// The silo is mapped read/write in one piece; all silo offsets are
/// offsets into this mapping. A file-backed mapping holds an exclusive
/// advisory lock on the file for as long as it lives.
///
/// # Durability
///
/// - `flush_range()` calls `msync` on the page range
/// - anonymous mappings have nothing to commit; flushing only checks bounds
///
/// # Example
///
/// ```no_run
/// use silo_storage::{MappedFile, SiloMedia};
/// use std::fs::OpenOptions;
///
/// let file = OpenOptions::new().read(true).write(true).open("silo.bin").unwrap();
/// let media = MappedFile::map(file, "silo.bin", 8 * 1024 * 1024).unwrap();
/// media.flush().unwrap();
/// ```
#[derive(Debug)]
pub struct MappedFile {
    map: MmapMut,
    path: Option<PathBuf>,
    file: Option<File>,
}

impl MappedFile {
    /// Maps the first `len` bytes of `file`, extending the file if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is locked by another process, cannot be
    /// resized, or the mapping fails.
    pub fn map(file: File, path: impl AsRef<Path>, len: u64) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path));
        }

        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }

        let map_len = usize::try_from(len)
            .map_err(|_| StorageError::path(&path, "silo does not fit the address space"))?;

        // SAFETY: the file is exclusively locked for the lifetime of the
        // mapping, so no cooperating process truncates or rewrites it.
        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };

        Ok(Self {
            map,
            path: Some(path),
            file: Some(file),
        })
    }

    /// Maps `len` bytes of anonymous, zero-filled memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the mapping fails.
    pub fn anonymous(len: u64) -> StorageResult<Self> {
        let map_len = usize::try_from(len).map_err(|_| {
            StorageError::invalid_size(len.to_string(), "does not fit the address space")
        })?;
        let map = MmapMut::map_anon(map_len)?;
        Ok(Self {
            map,
            path: None,
            file: None,
        })
    }

    /// Returns the path of the mapped file, if file-backed.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SiloMedia for MappedFile {
    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn as_slice(&self) -> &[u8] {
        &self.map
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    fn flush_range(&self, offset: u64, len: u64) -> StorageResult<()> {
        check_range(offset, len, self.len())?;
        if self.file.is_none() || len == 0 {
            return Ok(());
        }
        // Both values are bounded by the mapping length, which is a usize.
        self.map.flush_range(offset as usize, len as usize)?;
        Ok(())
    }
}
