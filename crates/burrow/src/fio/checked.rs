//! Checked wrappers around the file system calls used by the dataset.
//!
//! Each wrapper turns a failed syscall into an [`Error::Io`] carrying the
//! operation name and the path it was acting on; the OS errno stays inside
//! the wrapped [`std::io::Error`]. Positioned reads and writes are single
//! calls so short transfers surface as `IncompleteRead`/`IncompleteWrite`
//! instead of being silently retried.

use crate::error::{Error, Result};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Opens a file, optionally creating and truncating it.
pub(crate) fn open_file(path: &Path, write: bool, create_truncate: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(write);
    if create_truncate {
        opts.create(true).truncate(true);
    }
    opts.open(path).map_err(|source| Error::Io {
        op: "open",
        path: Some(path.to_path_buf()),
        source,
    })
}

/// Returns the size of an open file in bytes.
pub(crate) fn file_size(file: &File) -> Result<u64> {
    let meta = file.metadata().map_err(|source| Error::Io {
        op: "stat",
        path: None,
        source,
    })?;
    Ok(meta.len())
}

/// Reads at most `buf.len()` bytes at `offset` with a single call.
pub(crate) fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    file.read_at(buf, offset).map_err(|source| Error::Io {
        op: "read",
        path: None,
        source,
    })
}

/// Writes `buf` at `offset`, failing on a short write.
pub(crate) fn write_at(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    let written = file.write_at(buf, offset).map_err(|source| Error::Io {
        op: "write",
        path: None,
        source,
    })?;
    if written != buf.len() {
        return Err(Error::IncompleteWrite {
            expected: buf.len(),
            actual: written,
        });
    }
    Ok(())
}

/// Flushes file contents and metadata to the disk.
pub(crate) fn sync(file: &File) -> Result<()> {
    file.sync_all().map_err(|source| Error::Io {
        op: "fsync",
        path: None,
        source,
    })
}

/// Maps a file read-only.
///
/// # Safety
///
/// The mapping is only sound while no other process truncates or rewrites
/// the file; the dataset format assumes a single writer (see the
/// concurrency notes on [`crate::dataset::Dataset`]).
pub(crate) fn map_ro(file: &File) -> Result<Mmap> {
    unsafe { MmapOptions::new().map(file) }.map_err(|source| Error::Io {
        op: "mmap",
        path: None,
        source,
    })
}

/// Maps a file read-write, shared.
pub(crate) fn map_rw(file: &File) -> Result<MmapMut> {
    unsafe { MmapOptions::new().map_mut(file) }.map_err(|source| Error::Io {
        op: "mmap",
        path: None,
        source,
    })
}

/// Flushes a writable mapping to the disk.
pub(crate) fn flush_map(map: &MmapMut) -> Result<()> {
    map.flush().map_err(|source| Error::Io {
        op: "msync",
        path: None,
        source,
    })
}

/// Removes a file.
pub(crate) fn remove(path: &Path) -> Result<()> {
    std::fs::remove_file(path).map_err(|source| Error::Io {
        op: "unlink",
        path: Some(path.to_path_buf()),
        source,
    })
}

/// Removes a file, treating a missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match remove(path) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
