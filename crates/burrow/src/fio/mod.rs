//! File handling for the meta/data file pair backing a dataset.
//!
//! A dataset is stored as two files sharing a basename:
//!
//! ```text
//! <basename>.<meta_ext>   header + fixed-size metadata rows
//! <basename>.<data_ext>   per-record data blobs, replicated per slot
//! ```
//!
//! [`FilePair`] owns both descriptors and, in mapped mode, their shared
//! memory mappings. It enforces the mode invariants: a mapped pair refuses
//! descriptor I/O, a read-only pair refuses writes, a `no_data` pair never
//! touches the data file. Descriptor access uses positioned reads and
//! writes; a clean end-of-file is distinguishable from a short read.

pub(crate) mod checked;

use crate::error::{Error, Result};
use bytemuck::Pod;
use memmap2::{Mmap, MmapMut};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Selects one of the two files of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSel {
    /// The metadata file.
    Meta,
    /// The data file.
    Data,
}

/// Open mode bits shared with the dataset facade.
pub(crate) struct OpenRequest {
    /// Allow writing to the files, creating them if they do not exist.
    pub write: bool,
    /// Truncate the files, creating them fresh.
    pub truncate: bool,
}

/// A memory mapping of one dataset file, if any.
#[derive(Debug)]
enum MapView {
    /// The file is accessed through its descriptor.
    None,
    /// Shared read-only mapping.
    Ro(Mmap),
    /// Shared read-write mapping.
    Rw(MmapMut),
}

#[derive(Debug)]
struct FileHandle {
    file: File,
    map: MapView,
}

/// The pair of files (and optional mappings) backing a dataset.
#[derive(Debug)]
pub struct FilePair {
    basename: PathBuf,
    meta_ext: String,
    data_ext: String,
    can_write: bool,
    no_data: bool,
    mapped: bool,
    meta: FileHandle,
    data: Option<FileHandle>,
}

impl FilePair {
    /// Opens or creates the file pair.
    ///
    /// `new_meta_size` / `new_data_size` pre-size freshly truncated files
    /// (sparse, by writing a single zero byte at `size - 1`); they must be
    /// zero when opening without truncation. When `map_files` is set both
    /// files are mapped shared, writable iff `write` is requested; mapping
    /// a zero-length file fails with [`Error::EmptyMmap`].
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn open(
        basepath: &Path,
        meta_ext: &str,
        data_ext: &str,
        request: OpenRequest,
        no_data: bool,
        map_files: bool,
        new_meta_size: u64,
        new_data_size: u64,
    ) -> Result<Self> {
        if meta_ext == data_ext {
            return Err(Error::ExtensionsEqual {
                extension: meta_ext.to_string(),
            });
        }

        let basename = basepath.to_path_buf();
        let dataset = basename.display().to_string();

        let meta_path = Self::file_path(&basename, meta_ext);
        let meta = open_one(
            &meta_path,
            &request,
            new_meta_size,
            map_files,
            &dataset,
        )?;

        let data = if no_data {
            None
        } else {
            let data_path = Self::file_path(&basename, data_ext);
            Some(open_one(
                &data_path,
                &request,
                new_data_size,
                map_files,
                &dataset,
            )?)
        };

        Ok(Self {
            basename,
            meta_ext: meta_ext.to_string(),
            data_ext: data_ext.to_string(),
            can_write: request.write,
            no_data,
            mapped: map_files,
            meta,
            data,
        })
    }

    /// Builds the path of a dataset file from a basename and an extension.
    pub fn file_path(basename: &Path, ext: &str) -> PathBuf {
        let mut name = basename.as_os_str().to_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    }

    /// The basename the pair was opened with.
    pub fn basename(&self) -> &Path {
        &self.basename
    }

    /// The basename as a displayable string, for error attribution.
    pub fn dataset_name(&self) -> String {
        self.basename.display().to_string()
    }

    /// Path of the metadata file.
    pub fn meta_path(&self) -> PathBuf {
        Self::file_path(&self.basename, &self.meta_ext)
    }

    /// Path of the data file.
    pub fn data_path(&self) -> PathBuf {
        Self::file_path(&self.basename, &self.data_ext)
    }

    /// True if the pair was opened with write access.
    pub fn can_write(&self) -> bool {
        self.can_write
    }

    /// True if the data file was not opened.
    pub fn no_data(&self) -> bool {
        self.no_data
    }

    /// True if the files are memory-mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn handle(&self, who: FileSel) -> Result<&FileHandle> {
        match who {
            FileSel::Meta => Ok(&self.meta),
            FileSel::Data => self.data.as_ref().ok_or_else(|| Error::NoData {
                dataset: self.dataset_name(),
            }),
        }
    }

    fn handle_mut(&mut self, who: FileSel) -> Result<&mut FileHandle> {
        let dataset = self.dataset_name();
        match who {
            FileSel::Meta => Ok(&mut self.meta),
            FileSel::Data => self.data.as_mut().ok_or(Error::NoData { dataset }),
        }
    }

    /// Descriptor with read intent; refused on a mapped pair.
    fn fd_read(&self, who: FileSel) -> Result<&File> {
        if self.mapped {
            return Err(Error::Mmapped {
                dataset: self.dataset_name(),
            });
        }
        Ok(&self.handle(who)?.file)
    }

    /// Descriptor with write intent; refused on mapped or read-only pairs.
    fn fd_write(&self, who: FileSel) -> Result<&File> {
        if self.mapped {
            return Err(Error::Mmapped {
                dataset: self.dataset_name(),
            });
        }
        if !self.can_write {
            return Err(Error::ReadOnly {
                dataset: self.dataset_name(),
            });
        }
        Ok(&self.handle(who)?.file)
    }

    /// Size of one of the files in bytes.
    pub fn file_size(&self, who: FileSel) -> Result<u64> {
        checked::file_size(&self.handle(who)?.file)
    }

    /// The mapped bytes of a file.
    pub fn map_bytes(&self, who: FileSel) -> Result<&[u8]> {
        let handle = self.handle(who)?;
        match &handle.map {
            MapView::Ro(m) => Ok(&m[..]),
            MapView::Rw(m) => Ok(&m[..]),
            MapView::None => Err(Error::NotMmapped {
                dataset: self.dataset_name(),
            }),
        }
    }

    /// The writable mapped bytes of a file.
    pub fn map_bytes_mut(&mut self, who: FileSel) -> Result<&mut [u8]> {
        let dataset = self.dataset_name();
        let handle = self.handle_mut(who)?;
        match &mut handle.map {
            MapView::Rw(m) => Ok(&mut m[..]),
            MapView::Ro(_) => Err(Error::ReadOnly { dataset }),
            MapView::None => Err(Error::NotMmapped { dataset }),
        }
    }

    /// Reads at `offset` into `buf` through the descriptor.
    ///
    /// Returns `Ok(false)` on a clean end-of-file. A partial read, or a
    /// missing object when `required` is set, fails with
    /// [`Error::IncompleteRead`].
    pub fn read_exact_at(
        &self,
        who: FileSel,
        offset: u64,
        buf: &mut [u8],
        required: bool,
    ) -> Result<bool> {
        let file = self.fd_read(who)?;
        let read = checked::read_at(file, offset, buf)?;
        if read == buf.len() {
            return Ok(true);
        }
        if read == 0 && !required {
            return Ok(false);
        }
        Err(Error::IncompleteRead {
            expected: buf.len(),
            actual: read,
        })
    }

    /// Writes `buf` at `offset` through the descriptor.
    pub fn write_all_at(&self, who: FileSel, offset: u64, buf: &[u8]) -> Result<()> {
        let file = self.fd_write(who)?;
        checked::write_at(file, offset, buf)
    }

    /// Reads a plain-data object at `offset`.
    ///
    /// Returns `Ok(None)` on a clean end-of-file when the object is not
    /// `required`.
    pub fn read_object_at<T: Pod>(
        &self,
        who: FileSel,
        offset: u64,
        required: bool,
    ) -> Result<Option<T>> {
        let mut value = T::zeroed();
        let found = self.read_exact_at(who, offset, bytemuck::bytes_of_mut(&mut value), required)?;
        Ok(found.then_some(value))
    }

    /// Writes a plain-data object at `offset`.
    pub fn write_object_at<T: Pod>(&self, who: FileSel, offset: u64, value: &T) -> Result<()> {
        self.write_all_at(who, offset, bytemuck::bytes_of(value))
    }

    /// Grows a file to `new_size` bytes by writing one zero byte at the end.
    ///
    /// The kernel fills the gap with zero pages, so the file stays sparse.
    pub fn grow_to(&self, who: FileSel, new_size: u64) -> Result<()> {
        if new_size == 0 {
            return Ok(());
        }
        self.write_all_at(who, new_size - 1, &[0u8])
    }

    /// Makes the writes to one of the files durable.
    ///
    /// Flushes the mapping when mapped, fsyncs the descriptor otherwise.
    pub fn sync(&self, who: FileSel) -> Result<()> {
        let handle = self.handle(who)?;
        match &handle.map {
            MapView::Rw(m) => checked::flush_map(m),
            // A read-only mapping has nothing of ours to flush; fsync keeps
            // the durability contract uniform.
            MapView::Ro(_) | MapView::None => {
                if !self.mapped && !self.can_write {
                    return Err(Error::ReadOnly {
                        dataset: self.dataset_name(),
                    });
                }
                checked::sync(&handle.file)
            }
        }
    }
}

/// Opens a single file per the pair's rules, pre-sizing and mapping it as
/// requested.
fn open_one(
    path: &Path,
    request: &OpenRequest,
    new_size: u64,
    map_file: bool,
    dataset: &str,
) -> Result<FileHandle> {
    if request.truncate && !request.write {
        return Err(Error::CreateWithoutWrite {
            dataset: dataset.to_string(),
            path: path.to_path_buf(),
        });
    }
    if !request.truncate && new_size != 0 {
        return Err(Error::OpenWithSize {
            dataset: dataset.to_string(),
            path: path.to_path_buf(),
        });
    }

    let file = checked::open_file(path, request.write, request.truncate)?;

    if new_size > 0 {
        // Seek to new_size - 1 and write one zero byte, allocating a
        // sparse file of the requested size.
        checked::write_at(&file, new_size - 1, &[0u8])?;
    }

    let map = if map_file {
        if checked::file_size(&file)? == 0 {
            return Err(Error::EmptyMmap {
                dataset: dataset.to_string(),
            });
        }
        if request.write {
            MapView::Rw(checked::map_rw(&file)?)
        } else {
            MapView::Ro(checked::map_ro(&file)?)
        }
    } else {
        MapView::None
    };

    Ok(FileHandle { file, map })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base(dir: &TempDir) -> PathBuf {
        dir.path().join("pair")
    }

    #[test]
    fn equal_extensions_are_rejected() {
        let dir = TempDir::new().unwrap();
        let err = FilePair::open(
            &base(&dir),
            "bin",
            "bin",
            OpenRequest {
                write: true,
                truncate: true,
            },
            false,
            false,
            0,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ExtensionsEqual { .. }));
    }

    #[test]
    fn truncate_requires_write() {
        let dir = TempDir::new().unwrap();
        let err = FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: false,
                truncate: true,
            },
            false,
            false,
            0,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CreateWithoutWrite { .. }));
    }

    #[test]
    fn open_with_size_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: true,
                truncate: false,
            },
            false,
            false,
            128,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::OpenWithSize { .. }));
    }

    #[test]
    fn presized_files_are_sparse_and_mappable() {
        let dir = TempDir::new().unwrap();
        let pair = FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: true,
                truncate: true,
            },
            false,
            true,
            256,
            512,
        )
        .unwrap();
        assert_eq!(pair.file_size(FileSel::Meta).unwrap(), 256);
        assert_eq!(pair.file_size(FileSel::Data).unwrap(), 512);
        assert_eq!(pair.map_bytes(FileSel::Data).unwrap().len(), 512);
    }

    #[test]
    fn empty_file_cannot_be_mapped() {
        let dir = TempDir::new().unwrap();
        // Create the empty pair first.
        FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: true,
                truncate: true,
            },
            false,
            false,
            0,
            0,
        )
        .unwrap();
        let err = FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: false,
                truncate: false,
            },
            false,
            true,
            0,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, Error::EmptyMmap { .. }));
    }

    #[test]
    fn descriptor_io_is_refused_on_mapped_pairs() {
        let dir = TempDir::new().unwrap();
        let pair = FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: true,
                truncate: true,
            },
            false,
            true,
            64,
            64,
        )
        .unwrap();
        let mut buf = [0u8; 8];
        let err = pair
            .read_exact_at(FileSel::Meta, 0, &mut buf, true)
            .unwrap_err();
        assert!(matches!(err, Error::Mmapped { .. }));
    }

    #[test]
    fn eof_reads_are_distinguished_from_short_reads() {
        let dir = TempDir::new().unwrap();
        let pair = FilePair::open(
            &base(&dir),
            "meta",
            "data",
            OpenRequest {
                write: true,
                truncate: true,
            },
            false,
            false,
            0,
            0,
        )
        .unwrap();
        pair.write_all_at(FileSel::Meta, 0, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        assert!(pair.read_exact_at(FileSel::Meta, 0, &mut buf, true).unwrap());
        assert_eq!(buf, [1, 2, 3, 4]);

        // At the end of the file: clean EOF.
        assert!(!pair.read_exact_at(FileSel::Meta, 4, &mut buf, false).unwrap());

        // Partially past the end: incomplete.
        let err = pair
            .read_exact_at(FileSel::Meta, 2, &mut buf, false)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteRead {
                expected: 4,
                actual: 2
            }
        ));
    }
}
