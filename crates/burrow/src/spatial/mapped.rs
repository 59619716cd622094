//! Managed memory-mapped file for persisting a spatial index.
//!
//! Disk-backed adapters serialize their structures into a single sidecar
//! file through a [`MappedArena`], a bump allocator over a writable
//! mapping. The required size is not known up front, so
//! [`create_with_retry`] grows the file progressively: each attempt maps a
//! larger file and re-runs the build callback until it fits or the attempt
//! budget is spent.

use crate::error::{Error, Result};
use crate::fio::checked;
use memmap2::{Mmap, MmapMut};
use std::path::Path;
use tracing::{debug, warn};

/// Default initial sidecar size (512 MiB).
pub const DEFAULT_STARTING_FILE_SIZE: usize = 512 * 1024 * 1024;

/// Default growth step between resize attempts (512 MiB).
pub const DEFAULT_FILE_INCREMENT: usize = 512 * 1024 * 1024;

/// Default number of resize attempts after the first try.
pub const DEFAULT_RESIZE_ATTEMPTS: usize = 5;

/// Parameters controlling the creation of a mapped index file.
#[derive(Debug, Clone, Copy)]
pub struct MappedFileParams {
    /// Initial raw size of the mapped file in bytes.
    pub starting_file_size: usize,
    /// Increment applied when the previous size was too small.
    pub file_increment: usize,
    /// Maximum number of resize attempts after the first try.
    pub resize_attempts: usize,
}

impl Default for MappedFileParams {
    fn default() -> Self {
        Self {
            starting_file_size: DEFAULT_STARTING_FILE_SIZE,
            file_increment: DEFAULT_FILE_INCREMENT,
            resize_attempts: DEFAULT_RESIZE_ATTEMPTS,
        }
    }
}

/// Observability record of a mapped-file initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitializationInfo {
    /// Raw size of the mapped file in bytes.
    pub raw_size_bytes: usize,
    /// Bytes actually allocated inside the arena.
    pub used_bytes: usize,
    /// Number of attempts performed (1 = no retry was needed).
    pub attempts: usize,
}

/// Bump allocator over a writable mapping.
pub struct MappedArena {
    map: MmapMut,
    used: usize,
}

impl MappedArena {
    fn new(map: MmapMut) -> Self {
        Self { map, used: 0 }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    /// Bytes allocated so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Allocates `len` bytes aligned to `align`, returning the offset.
    ///
    /// Fails with [`Error::ArenaExhausted`] when the arena cannot fit the
    /// request; the caller's retry loop reacts by growing the file.
    pub fn alloc(&mut self, len: usize, align: usize) -> Result<usize> {
        let align = align.max(1);
        let offset = (self.used + align - 1) / align * align;
        let end = offset.checked_add(len).ok_or(Error::ArenaExhausted {
            requested: len,
            available: 0,
        })?;
        if end > self.map.len() {
            return Err(Error::ArenaExhausted {
                requested: len,
                available: self.map.len().saturating_sub(offset),
            });
        }
        self.used = end;
        Ok(offset)
    }

    /// The bytes of a previously allocated region.
    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.map[offset..offset + len]
    }

    fn into_map(self) -> MmapMut {
        self.map
    }
}

/// Creates the mapped file, growing it until the build callback fits.
///
/// The callback serializes the index into the arena and returns its root
/// description. On [`Error::ArenaExhausted`] the file is deleted and the
/// next attempt uses a larger size; once the budget is spent the whole
/// operation fails with [`Error::IndexSizeTooBig`] carrying the last size
/// tried. Any partially built state lives inside the failed arena, so
/// dropping it is the storage reset.
pub fn create_with_retry<T>(
    path: &Path,
    params: &MappedFileParams,
    mut build: impl FnMut(&mut MappedArena) -> Result<T>,
) -> Result<(MmapMut, T, InitializationInfo)> {
    let mut info = InitializationInfo::default();

    for attempt in 0..=params.resize_attempts {
        let file_size = params.starting_file_size + attempt * params.file_increment;
        info.raw_size_bytes = file_size;
        info.attempts = attempt + 1;

        checked::remove_if_exists(path)?;
        let file = checked::open_file(path, true, true)?;
        if file_size > 0 {
            checked::write_at(&file, file_size as u64 - 1, &[0u8])?;
        }
        let map = checked::map_rw(&file)?;
        let mut arena = MappedArena::new(map);

        match build(&mut arena) {
            Ok(root) => {
                info.used_bytes = arena.used();
                debug!(
                    path = %path.display(),
                    raw_size = info.raw_size_bytes,
                    used = info.used_bytes,
                    attempts = info.attempts,
                    "mapped index file created"
                );
                return Ok((arena.into_map(), root, info));
            }
            Err(Error::ArenaExhausted { requested, .. }) => {
                drop(arena);
                checked::remove_if_exists(path)?;
                if attempt == params.resize_attempts {
                    return Err(Error::IndexSizeTooBig {
                        attempts: attempt,
                        last_size: file_size as u64,
                        path: path.to_path_buf(),
                    });
                }
                warn!(
                    path = %path.display(),
                    file_size,
                    requested,
                    "index did not fit mapped file, retrying with a larger size"
                );
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("the retry loop either returns or fails on the last attempt")
}

/// Opens an existing mapped file read-only.
///
/// The caller validates the content (well-known header, element counts)
/// and fills `used_bytes` from its own bookkeeping.
pub fn open_existing(path: &Path) -> Result<(Mmap, InitializationInfo)> {
    let file = checked::open_file(path, false, false)?;
    let map = checked::map_ro(&file)?;
    let info = InitializationInfo {
        raw_size_bytes: map.len(),
        used_bytes: 0,
        attempts: 0,
    };
    Ok((map, info))
}
