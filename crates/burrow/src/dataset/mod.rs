//! The dataset facade.
//!
//! A dataset is a collection of fixed-schema records, each with a point in
//! N-dimensional space and an opaque data blob, stored as a metadata/data
//! file pair and indexed by a pluggable spatial adapter. Two access modes
//! exist:
//!
//! - **Mapped mode** (the default): both files are memory-mapped, the
//!   spatial index is materialized, and records are reached by reference
//!   through uids, storage-order iteration or spatial queries.
//! - **RWP mode** ([`OpenFlags::RWP`]): plain descriptor I/O with no
//!   mapping and no spatial index. Records are read, rewritten and pushed
//!   by uid; this is the only mode that can grow a dataset.
//!
//! ```text
//! Create:  metadata slice → size files → write header + rows
//!          → bulk-load index → assign data offsets in storage order
//! Open:    map files → validate header/check → bulk-load index
//!          → cross-check offsets against the data file
//! ```
//!
//! # Concurrency
//!
//! A dataset is a single-writer object with no internal locking.
//! Concurrent read-only use from several threads is safe for paths that do
//! not touch the clean-bit or mutable accessors; concurrent writers are
//! undefined, including across processes sharing the mapped files.

mod iter;

pub use iter::{ElementIter, MetaIter, ReadMetaIter};

use crate::error::{Error, Result};
use crate::fio::{checked, FilePair, FileSel, OpenRequest};
use crate::format::{
    self, align64, FileHeader, RowLayout, CLEAN_SENTINEL, DIRTY_SENTINEL, HEADER_STRUCT_SIZE,
};
use crate::meta::{MetaAdapter, Uid};
use crate::spatial::{InitContext, NodeValue, SpatialIndex, SpatialPoint, SpatialQuery};
use bitflags::bitflags;
use bytemuck::Zeroable;
use std::path::Path;
use tracing::debug;

bitflags! {
    /// How the dataset files are opened or created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        /// Allow writing, creating files that do not exist.
        const WRITE = 1;
        /// Truncate existing files to zero length.
        const TRUNC = 2;
        /// Create an empty dataset open for writing.
        const NEW = Self::WRITE.bits() | Self::TRUNC.bits();
    }
}

bitflags! {
    /// Additional options for opening a dataset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Read/write/push through descriptors: no mapping, no index.
        const RWP = 1;
        /// Do not open the data file.
        const NO_DATA = 2;
        /// Do not require data blobs to follow the index order.
        const ALLOW_UNSORTED = 4;
        /// Skip the open-time offset/size cross-check.
        const NO_DATA_CHECK = 8;
    }
}

/// Raw row access over the mapped metadata region.
#[derive(Clone, Copy)]
struct RowReader<'a> {
    bytes: &'a [u8],
    header_size: usize,
    row: RowLayout,
}

impl RowReader<'_> {
    fn start(&self, uid: Uid) -> usize {
        self.header_size + self.row.row_offset(uid) as usize
    }

    fn meta<M: bytemuck::Pod>(&self, uid: Uid) -> M {
        let start = self.start(uid);
        bytemuck::pod_read_unaligned(&self.bytes[start..start + self.row.meta_size])
    }

    fn data_offset(&self, uid: Uid) -> u64 {
        let at = self.start(uid) + self.row.data_offset_at;
        bytemuck::pod_read_unaligned(&self.bytes[at..at + 8])
    }
}

/// An on-disk spatially indexed dataset.
///
/// `A` supplies the record schema ([`MetaAdapter`]); `S` supplies the
/// spatial index ([`SpatialIndex`]). The two must agree on the point type,
/// which pins the scalar type and the number of dimensions at compile
/// time.
pub struct Dataset<A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    meta_adapter: A,
    spatial_adapter: S,
    files: FilePair,
    can_rwp: bool,
    row: RowLayout,
    header_size: u64,
    max_elements: u64,
    num_slots: usize,
    slot_size: u64,
    storage: S::Storage,
}

impl<A, S> std::fmt::Debug for Dataset<A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset").finish_non_exhaustive()
    }
}

impl<A, S> Dataset<A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    /// Opens an existing dataset (or creates an empty one with
    /// [`OpenMode::NEW`]).
    ///
    /// Opening with [`OpenFlags::RWP`], or any truncating mode, requires
    /// [`OpenFlags::ALLOW_UNSORTED`]: without a spatial index there is
    /// nothing to enforce the data ordering against. [`OpenFlags::NO_DATA`]
    /// requires `num_slots == 0`; creating a dataset with data requires
    /// `num_slots == 1`.
    pub fn open(
        basepath: impl AsRef<Path>,
        mode: OpenMode,
        flags: OpenFlags,
        num_slots: usize,
        meta_adapter: A,
        spatial_adapter: S,
    ) -> Result<Self> {
        let basepath = basepath.as_ref();
        let dataset = basepath.display().to_string();
        let new_ds = mode.contains(OpenMode::TRUNC);
        let can_rwp = flags.contains(OpenFlags::RWP) || new_ds;
        let no_data = flags.contains(OpenFlags::NO_DATA);
        let allow_unsorted = flags.contains(OpenFlags::ALLOW_UNSORTED) || no_data;

        if can_rwp && !allow_unsorted {
            return Err(Error::UnsortedData {
                last_offset: 0,
                offset: 0,
                dataset,
            });
        }
        validate_num_slots(no_data, new_ds, num_slots, &dataset)?;
        assert_filenames(basepath, &meta_adapter, &spatial_adapter)?;

        let (header, header_size, row, check) = layout_of(&meta_adapter, &dataset)?;

        let files = FilePair::open(
            basepath,
            meta_adapter.meta_ext(),
            meta_adapter.data_ext(),
            OpenRequest {
                write: mode.contains(OpenMode::WRITE),
                truncate: new_ds,
            },
            no_data,
            !can_rwp,
            0,
            0,
        )?;

        if can_rwp {
            init_meta_fd(&files, &header, &check, header_size, &row, new_ds)?;
        } else {
            let bytes = files.map_bytes(FileSel::Meta)?;
            validate_meta_bytes(&header, &check, bytes, &dataset)?;
            validate_meta_size(bytes.len() as u64, header_size, &row, &dataset)?;
        }

        let max_elements = if can_rwp {
            u64::MAX
        } else {
            (files.file_size(FileSel::Meta)? - header_size) / row.row_size as u64
        };

        let slot_size = compute_slot_size(&files, no_data, num_slots, &dataset)?;

        let mut storage = spatial_adapter.new_storage();
        if !can_rwp {
            if !spatial_adapter.is_empty(&storage) {
                return Err(Error::AlreadyInitialized { dataset });
            }
            let reader = RowReader {
                bytes: files.map_bytes(FileSel::Meta)?,
                header_size: header_size as usize,
                row,
            };
            init_spatial_storage(
                &spatial_adapter,
                &mut storage,
                &meta_adapter,
                reader,
                basepath,
                new_ds,
                files.can_write(),
                max_elements,
            )?;
            if !allow_unsorted && !no_data {
                check_sorted::<A, S>(&spatial_adapter, &storage, reader, &dataset)?;
            }
        }

        let ds = Self {
            meta_adapter,
            spatial_adapter,
            files,
            can_rwp,
            row,
            header_size,
            max_elements,
            num_slots,
            slot_size,
            storage,
        };

        let run_check = !flags.contains(OpenFlags::NO_DATA_CHECK) && !no_data && !new_ds;
        if run_check {
            ds.cross_check_data()?;
        }

        debug!(
            dataset = %ds.files.basename().display(),
            rwp = ds.can_rwp,
            slots = ds.num_slots,
            "dataset opened"
        );
        Ok(ds)
    }

    /// Creates a dataset from a sequence of metadata records.
    ///
    /// Records must carry dense uids `1..=N`. Both files are created
    /// pre-sized and mapped; data offsets are assigned following the
    /// spatial index's natural order so records that are close in space
    /// are close in the file. Every record's clean bit ends up
    /// [`CLEAN_SENTINEL`].
    pub fn create(
        basepath: impl AsRef<Path>,
        flags: OpenFlags,
        num_slots: usize,
        metas: &[A::Metadata],
        meta_adapter: A,
        spatial_adapter: S,
    ) -> Result<Self> {
        let basepath = basepath.as_ref();
        let dataset = basepath.display().to_string();
        let no_data = flags.contains(OpenFlags::NO_DATA);

        if !no_data && num_slots == 0 {
            return Err(Error::InvalidNumSlots {
                expected: 1,
                requested: 0,
                dataset,
            });
        }
        assert_filenames(basepath, &meta_adapter, &spatial_adapter)?;

        let (header, header_size, row, check) = layout_of(&meta_adapter, &dataset)?;

        let count = metas.len() as u64;
        let meta_file_size = if count == 0 {
            0
        } else {
            header_size + count * row.row_size as u64
        };
        let data_file_size: u64 = metas
            .iter()
            .map(|m| align64(meta_adapter.data_size(m) as u64))
            .sum::<u64>()
            * num_slots as u64;

        let mut files = FilePair::open(
            basepath,
            meta_adapter.meta_ext(),
            meta_adapter.data_ext(),
            OpenRequest {
                write: true,
                truncate: true,
            },
            no_data,
            true,
            meta_file_size,
            data_file_size,
        )?;

        // Header, check block, then one row per record with a zero data
        // offset; offsets settle after the index imposes its order.
        {
            let bytes = files.map_bytes_mut(FileSel::Meta)?;
            bytes[..HEADER_STRUCT_SIZE].copy_from_slice(header.as_bytes());
            bytes[HEADER_STRUCT_SIZE..HEADER_STRUCT_SIZE + check.len()].copy_from_slice(&check);

            for meta in metas {
                let uid = meta_adapter.uid(meta);
                if uid == 0 || uid > count {
                    return Err(Error::InvalidUid {
                        maximum: count,
                        requested: uid,
                        dataset,
                    });
                }
                let start = header_size as usize + row.row_offset(uid) as usize;
                bytes[start..start + row.meta_size].copy_from_slice(bytemuck::bytes_of(meta));
                bytes[start + row.data_offset_at..start + row.data_offset_at + 8]
                    .copy_from_slice(&0u64.to_ne_bytes());
                bytes[start + row.clean_bit_at..start + row.clean_bit_at + 4]
                    .copy_from_slice(&0u32.to_ne_bytes());
            }
        }

        let mut storage = spatial_adapter.new_storage();
        {
            let reader = RowReader {
                bytes: files.map_bytes(FileSel::Meta)?,
                header_size: header_size as usize,
                row,
            };
            init_spatial_storage(
                &spatial_adapter,
                &mut storage,
                &meta_adapter,
                reader,
                basepath,
                true,
                true,
                count,
            )?;
        }

        if !no_data {
            if spatial_adapter.is_empty(&storage) {
                return Err(Error::NotInitialized { dataset });
            }
            let bytes = files.map_bytes_mut(FileSel::Meta)?;
            let mut current = 0u64;
            spatial_adapter.update_in_order(&mut storage, &mut |_, value| {
                let uid = value.uid();
                let start = header_size as usize + row.row_offset(uid) as usize;
                bytes[start + row.data_offset_at..start + row.data_offset_at + 8]
                    .copy_from_slice(&current.to_ne_bytes());
                bytes[start + row.clean_bit_at..start + row.clean_bit_at + 4]
                    .copy_from_slice(&CLEAN_SENTINEL.to_ne_bytes());
                value.set_data_offset(current);
                let meta: A::Metadata = bytemuck::pod_read_unaligned(
                    &bytes[start..start + row.meta_size],
                );
                current += align64(meta_adapter.data_size(&meta) as u64);
            });
        }

        let slot_size = compute_slot_size(&files, no_data, num_slots, &dataset)?;

        debug!(
            dataset = %files.basename().display(),
            elements = count,
            slots = num_slots,
            "dataset created"
        );

        Ok(Self {
            meta_adapter,
            spatial_adapter,
            files,
            can_rwp: false,
            row,
            header_size,
            max_elements: count,
            num_slots,
            slot_size,
            storage,
        })
    }

    /// Removes the meta, data and adapter sidecar files of a dataset.
    ///
    /// Missing files are ignored, so unlinking twice succeeds.
    pub fn unlink(
        basepath: impl AsRef<Path>,
        meta_adapter: &A,
        spatial_adapter: &S,
    ) -> Result<()> {
        let basepath = basepath.as_ref();
        let mut paths = vec![
            FilePair::file_path(basepath, meta_adapter.meta_ext()),
            FilePair::file_path(basepath, meta_adapter.data_ext()),
        ];
        spatial_adapter.extra_files(basepath, &mut paths);
        for path in paths {
            checked::remove_if_exists(&path)?;
        }
        Ok(())
    }

    // ----- accessors -------------------------------------------------

    /// The basename the dataset was opened with.
    pub fn basename(&self) -> &Path {
        self.files.basename()
    }

    /// Maximum number of elements addressable through this handle.
    ///
    /// Equals the stored element count in mapped mode and `u64::MAX` in
    /// RWP mode, where the dataset can still grow.
    pub fn max_elements(&self) -> u64 {
        self.max_elements
    }

    /// Number of data slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Size of one data slot in bytes.
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// True when the dataset is in descriptor (RWP) mode.
    pub fn is_rwp(&self) -> bool {
        self.can_rwp
    }

    /// True when the dataset allows writes.
    pub fn can_write(&self) -> bool {
        self.files.can_write()
    }

    /// The metadata adapter.
    pub fn meta_adapter(&self) -> &A {
        &self.meta_adapter
    }

    /// The spatial adapter.
    pub fn spatial_adapter(&self) -> &S {
        &self.spatial_adapter
    }

    /// The spatial storage.
    ///
    /// Must not be mutated behind the dataset's back; composite adapters
    /// expose read-only views (such as secondary key queries) through it.
    pub fn spatial_storage(&self) -> &S::Storage {
        &self.storage
    }

    // ----- guards ----------------------------------------------------

    fn dataset_name(&self) -> String {
        self.files.dataset_name()
    }

    fn require_mapped(&self) -> Result<()> {
        if self.can_rwp {
            return Err(Error::NotMmapped {
                dataset: self.dataset_name(),
            });
        }
        Ok(())
    }

    fn require_rwp(&self) -> Result<()> {
        if !self.can_rwp {
            return Err(Error::Mmapped {
                dataset: self.dataset_name(),
            });
        }
        Ok(())
    }

    fn require_data(&self) -> Result<()> {
        if self.files.no_data() {
            return Err(Error::NoData {
                dataset: self.dataset_name(),
            });
        }
        Ok(())
    }

    fn require_location_data(&self) -> Result<()> {
        if self.can_rwp || self.spatial_adapter.is_empty(&self.storage) {
            return Err(Error::LocationDataUnavailable {
                dataset: self.dataset_name(),
            });
        }
        Ok(())
    }

    fn row_start(&self, uid: Uid) -> Result<usize> {
        if uid == 0 || uid > self.max_elements {
            return Err(Error::InvalidUid {
                maximum: self.max_elements,
                requested: uid,
                dataset: self.dataset_name(),
            });
        }
        Ok(self.header_size as usize + self.row.row_offset(uid) as usize)
    }

    fn slot_offset(&self, slot: usize) -> Result<u64> {
        if slot >= self.num_slots {
            return Err(Error::InvalidSlot {
                maximum: self.num_slots.saturating_sub(1),
                requested: slot,
                dataset: self.dataset_name(),
            });
        }
        Ok(slot as u64 * self.slot_size)
    }

    // ----- shared resolution for the iterator layer ------------------

    pub(crate) fn mapped_meta_region(&self) -> Result<&[u8]> {
        self.require_mapped()?;
        self.files.map_bytes(FileSel::Meta)
    }

    pub(crate) fn mapped_regions(&self) -> Result<(&[u8], &[u8])> {
        self.require_mapped()?;
        self.require_data()?;
        Ok((
            self.files.map_bytes(FileSel::Meta)?,
            self.files.map_bytes(FileSel::Data)?,
        ))
    }

    pub(crate) fn resolve_meta<'b>(&self, meta_bytes: &'b [u8], uid: Uid) -> &'b A::Metadata {
        let start = self.header_size as usize + self.row.row_offset(uid) as usize;
        bytemuck::from_bytes(&meta_bytes[start..start + self.row.meta_size])
    }

    /// Resolves a node value to its data offset.
    ///
    /// The one branch of the iterator layer: offset-carrying adapters
    /// answer from the node value, uid-only adapters answer from the
    /// metadata row.
    pub(crate) fn resolve_data_offset(&self, meta_bytes: &[u8], value: &S::Value) -> u64 {
        if S::STORES_ELEMENT_OFFSETS {
            if let Some(offset) = value.data_offset() {
                return offset;
            }
        }
        let at = self.header_size as usize
            + self.row.row_offset(value.uid()) as usize
            + self.row.data_offset_at;
        bytemuck::pod_read_unaligned(&meta_bytes[at..at + 8])
    }

    // ----- mapped element access -------------------------------------

    /// Metadata reference of an element (mapped mode).
    pub fn metadata(&self, uid: Uid) -> Result<&A::Metadata> {
        let bytes = self.mapped_meta_region()?;
        let start = self.row_start(uid)?;
        Ok(bytemuck::from_bytes(&bytes[start..start + self.row.meta_size]))
    }

    /// Metadata reference, or `None` when the uid is invalid.
    pub fn try_metadata(&self, uid: Uid) -> Option<&A::Metadata> {
        self.metadata(uid).ok()
    }

    /// Mutable metadata reference of an element (mapped, writable).
    pub fn metadata_mut(&mut self, uid: Uid) -> Result<&mut A::Metadata> {
        self.require_mapped()?;
        let start = self.row_start(uid)?;
        let meta_size = self.row.meta_size;
        let bytes = self.files.map_bytes_mut(FileSel::Meta)?;
        Ok(bytemuck::from_bytes_mut(&mut bytes[start..start + meta_size]))
    }

    /// Metadata and slot-0 data of an element (mapped mode).
    pub fn element(&self, uid: Uid) -> Result<(&A::Metadata, &[u8])> {
        self.element_impl(uid, 0)
    }

    /// Metadata and data of an element in a selected slot (mapped mode).
    pub fn element_in_slot(&self, uid: Uid, slot: usize) -> Result<(&A::Metadata, &[u8])> {
        let slot_off = self.slot_offset(slot)?;
        self.element_impl(uid, slot_off)
    }

    /// Metadata and data, or `None` when the uid is invalid.
    pub fn try_element(&self, uid: Uid) -> Option<(&A::Metadata, &[u8])> {
        self.element(uid).ok()
    }

    fn element_impl(&self, uid: Uid, slot_off: u64) -> Result<(&A::Metadata, &[u8])> {
        let (meta_bytes, data_bytes) = self.mapped_regions()?;
        let start = self.row_start(uid)?;
        let meta: &A::Metadata =
            bytemuck::from_bytes(&meta_bytes[start..start + self.row.meta_size]);
        let offset: u64 = bytemuck::pod_read_unaligned(
            &meta_bytes[start + self.row.data_offset_at..start + self.row.data_offset_at + 8],
        );
        let size = self.meta_adapter.data_size(meta);
        let begin = (offset + slot_off) as usize;
        Ok((meta, &data_bytes[begin..begin + size]))
    }

    /// Slot-0 data of an element (mapped mode).
    pub fn data(&self, uid: Uid) -> Result<&[u8]> {
        Ok(self.element_impl(uid, 0)?.1)
    }

    /// Data of an element in a selected slot (mapped mode).
    pub fn data_in_slot(&self, uid: Uid, slot: usize) -> Result<&[u8]> {
        Ok(self.element_in_slot(uid, slot)?.1)
    }

    /// Mutable slot-0 data of an element (mapped, writable).
    pub fn data_mut(&mut self, uid: Uid) -> Result<&mut [u8]> {
        self.data_mut_in_slot(uid, 0)
    }

    /// Mutable data of an element in a selected slot (mapped, writable).
    pub fn data_mut_in_slot(&mut self, uid: Uid, slot: usize) -> Result<&mut [u8]> {
        self.require_mapped()?;
        self.require_data()?;
        let slot_off = self.slot_offset(slot)?;
        let start = self.row_start(uid)?;
        let (offset, size) = {
            let meta_bytes = self.files.map_bytes(FileSel::Meta)?;
            let meta: A::Metadata = bytemuck::pod_read_unaligned(
                &meta_bytes[start..start + self.row.meta_size],
            );
            let offset: u64 = bytemuck::pod_read_unaligned(
                &meta_bytes
                    [start + self.row.data_offset_at..start + self.row.data_offset_at + 8],
            );
            (offset, self.meta_adapter.data_size(&meta))
        };
        let data_bytes = self.files.map_bytes_mut(FileSel::Data)?;
        let begin = (offset + slot_off) as usize;
        Ok(&mut data_bytes[begin..begin + size])
    }

    // ----- RWP access ------------------------------------------------

    fn count_stored(&self) -> Result<u64> {
        let size = self.files.file_size(FileSel::Meta)?;
        Ok(size.saturating_sub(self.header_size) / self.row.row_size as u64)
    }

    fn read_row_fd(&self, uid: Uid) -> Result<Option<(A::Metadata, u64, u32)>> {
        if uid == 0 {
            return Err(Error::InvalidUid {
                maximum: self.max_elements,
                requested: uid,
                dataset: self.dataset_name(),
            });
        }
        let offset = self.header_size + (uid - 1) * self.row.row_size as u64;
        let mut buf = vec![0u8; self.row.clean_bit_at + 4];
        if !self.files.read_exact_at(FileSel::Meta, offset, &mut buf, false)? {
            return Ok(None);
        }
        let meta: A::Metadata = bytemuck::pod_read_unaligned(&buf[..self.row.meta_size]);
        let data_offset: u64 =
            bytemuck::pod_read_unaligned(&buf[self.row.data_offset_at..self.row.data_offset_at + 8]);
        let clean: u32 =
            bytemuck::pod_read_unaligned(&buf[self.row.clean_bit_at..self.row.clean_bit_at + 4]);
        Ok(Some((meta, data_offset, clean)))
    }

    /// Reads an element's metadata from disk (RWP mode).
    ///
    /// Returns `false` when the uid is past the end of the file. The uid
    /// stored in the row must equal the requested uid.
    pub fn read_element(&self, uid: Uid, meta: &mut A::Metadata) -> Result<bool> {
        self.require_rwp()?;
        let Some((stored, _, _)) = self.read_row_fd(uid)? else {
            return Ok(false);
        };
        let file_uid = self.meta_adapter.uid(&stored);
        if file_uid != uid {
            return Err(Error::InconsistentMeta {
                context: "stored uid",
                expected: uid,
                actual: file_uid,
                dataset: self.dataset_name(),
            });
        }
        *meta = stored;
        Ok(true)
    }

    /// Reads an element's metadata and data blob from disk (RWP mode).
    ///
    /// The buffer is resized to the record's data size.
    pub fn read_element_data(
        &self,
        uid: Uid,
        meta: &mut A::Metadata,
        data: &mut Vec<u8>,
        slot: usize,
    ) -> Result<bool> {
        self.require_rwp()?;
        self.require_data()?;
        let Some((stored, data_offset, _)) = self.read_row_fd(uid)? else {
            return Ok(false);
        };
        let file_uid = self.meta_adapter.uid(&stored);
        if file_uid != uid {
            return Err(Error::InconsistentMeta {
                context: "stored uid",
                expected: uid,
                actual: file_uid,
                dataset: self.dataset_name(),
            });
        }
        let slot_off = self.slot_offset(slot)?;
        let size = self.meta_adapter.data_size(&stored);
        data.resize(size, 0);
        if size > 0 {
            self.files
                .read_exact_at(FileSel::Data, data_offset + slot_off, data, true)?;
        }
        *meta = stored;
        Ok(true)
    }

    /// Reads a batch of elements, stopping at the first missing uid.
    ///
    /// Returns how many were read.
    pub fn read_elements(&self, uids: &[Uid], out: &mut Vec<A::Metadata>) -> Result<usize> {
        let mut read = 0;
        for &uid in uids {
            let mut meta = A::Metadata::zeroed();
            if !self.read_element(uid, &mut meta)? {
                break;
            }
            out.push(meta);
            read += 1;
        }
        Ok(read)
    }

    /// Sequential reader over all stored metadata (RWP mode).
    pub fn read_metadata_iter(&self) -> Result<ReadMetaIter<'_, A, S>> {
        self.require_rwp()?;
        Ok(ReadMetaIter::new(self))
    }

    /// Rewrites an existing element's metadata (RWP mode).
    ///
    /// The record's data size must not change; the stored `data_offset`
    /// and clean bit are left untouched.
    pub fn write_element(&self, meta: &A::Metadata) -> Result<()> {
        self.write_element_impl(meta, None, 0)
    }

    /// Rewrites an existing element's metadata and data blob (RWP mode).
    pub fn write_element_data(
        &self,
        meta: &A::Metadata,
        data: &[u8],
        slot: usize,
    ) -> Result<()> {
        self.require_data()?;
        self.write_element_impl(meta, Some(data), slot)
    }

    fn write_element_impl(
        &self,
        meta: &A::Metadata,
        data: Option<&[u8]>,
        slot: usize,
    ) -> Result<()> {
        self.require_rwp()?;
        let uid = self.meta_adapter.uid(meta);
        let stored_count = self.count_stored()?;
        if uid == 0 || uid > stored_count {
            return Err(Error::InvalidUid {
                maximum: stored_count,
                requested: uid,
                dataset: self.dataset_name(),
            });
        }

        let Some((old, data_offset, _)) = self.read_row_fd(uid)? else {
            return Err(Error::InconsistentMeta {
                context: "missing row",
                expected: stored_count,
                actual: uid,
                dataset: self.dataset_name(),
            });
        };
        let old_uid = self.meta_adapter.uid(&old);
        if old_uid != uid {
            return Err(Error::InconsistentMeta {
                context: "stored uid",
                expected: uid,
                actual: old_uid,
                dataset: self.dataset_name(),
            });
        }

        if !self.files.no_data() {
            let old_size = self.meta_adapter.data_size(&old);
            let new_size = self.meta_adapter.data_size(meta);
            if old_size != new_size {
                return Err(Error::InvalidDataSize {
                    expected: old_size,
                    actual: new_size,
                    dataset: self.dataset_name(),
                });
            }
            if let Some(bytes) = data {
                let slot_off = self.slot_offset(slot)?;
                self.files
                    .write_all_at(FileSel::Data, data_offset + slot_off, bytes)?;
            }
        }

        let offset = self.header_size + (uid - 1) * self.row.row_size as u64;
        self.files
            .write_all_at(FileSel::Meta, offset, bytemuck::bytes_of(meta))
    }

    /// Rewrites a batch of existing elements' metadata (RWP mode).
    pub fn write_elements(&self, metas: &[A::Metadata]) -> Result<()> {
        for meta in metas {
            self.write_element(meta)?;
        }
        Ok(())
    }

    /// Appends a new element without data (RWP mode), returning its uid.
    pub fn push_element(&self, meta: &A::Metadata) -> Result<Uid> {
        self.push_impl(meta, None)
    }

    /// Appends a new element and its data blob (RWP mode), returning its
    /// uid.
    pub fn push_element_data(&self, meta: &A::Metadata, data: &[u8]) -> Result<Uid> {
        self.push_impl(meta, Some(data))
    }

    /// Appends a batch of new elements, returning their uids.
    pub fn push_elements(&self, metas: &[A::Metadata]) -> Result<Vec<Uid>> {
        metas.iter().map(|m| self.push_element(m)).collect()
    }

    fn push_impl(&self, meta: &A::Metadata, data: Option<&[u8]>) -> Result<Uid> {
        self.require_rwp()?;

        // Pushing into a multi-slot dataset would require relocating every
        // existing slot; multi-slot datasets are immutable in shape.
        if self.num_slots > 1 {
            return Err(Error::InvalidNumSlots {
                expected: 1,
                requested: self.num_slots,
                dataset: self.dataset_name(),
            });
        }

        let uid = self.count_stored()? + 1;
        let mut stored = *meta;
        self.meta_adapter.set_uid(&mut stored, uid);

        let mut data_offset = 0u64;
        if self.files.no_data() {
            if data.is_some() {
                return Err(Error::NoData {
                    dataset: self.dataset_name(),
                });
            }
        } else {
            let size = self.meta_adapter.data_size(&stored);
            let aligned = align64(size as u64);
            data_offset = self.files.file_size(FileSel::Data)?;

            // Reserve the aligned region first; writing the final byte
            // keeps the file zero-padded between blobs.
            self.files.grow_to(FileSel::Data, data_offset + aligned)?;

            if let Some(bytes) = data {
                if bytes.len() != size {
                    return Err(Error::InvalidDataSize {
                        expected: size,
                        actual: bytes.len(),
                        dataset: self.dataset_name(),
                    });
                }
                self.files.write_all_at(FileSel::Data, data_offset, bytes)?;
            }
        }

        // Write the whole padded row at once: metadata, data offset,
        // clean sentinel, zero padding.
        let mut rowbuf = vec![0u8; self.row.row_size];
        rowbuf[..self.row.meta_size].copy_from_slice(bytemuck::bytes_of(&stored));
        rowbuf[self.row.data_offset_at..self.row.data_offset_at + 8]
            .copy_from_slice(&data_offset.to_ne_bytes());
        rowbuf[self.row.clean_bit_at..self.row.clean_bit_at + 4]
            .copy_from_slice(&CLEAN_SENTINEL.to_ne_bytes());

        let offset = self.header_size + (uid - 1) * self.row.row_size as u64;
        self.files.write_all_at(FileSel::Meta, offset, &rowbuf)?;

        validate_meta_size(
            self.files.file_size(FileSel::Meta)?,
            self.header_size,
            &self.row,
            &self.dataset_name(),
        )?;

        Ok(uid)
    }

    // ----- spatial iteration and queries -----------------------------

    /// The spatial bounds of the dataset: per-axis minima and maxima.
    pub fn bounds(&self) -> Result<(A::Point, A::Point)> {
        self.require_location_data()?;
        self.spatial_adapter
            .bounds(&self.storage)
            .ok_or_else(|| Error::LocationDataUnavailable {
                dataset: self.dataset_name(),
            })
    }

    /// Iterates `(metadata, data)` pairs in the index's natural order.
    pub fn iter_elements(&self) -> Result<ElementIter<'_, A, S>> {
        self.require_location_data()?;
        ElementIter::new(self, self.spatial_adapter.iter(&self.storage), 0)
    }

    /// Iterates `(metadata, data)` pairs with the data taken from a slot.
    pub fn iter_elements_in_slot(&self, slot: usize) -> Result<ElementIter<'_, A, S>> {
        self.require_location_data()?;
        let slot_off = self.slot_offset(slot)?;
        ElementIter::new(self, self.spatial_adapter.iter(&self.storage), slot_off)
    }

    /// Iterates metadata references in the index's natural order.
    pub fn iter_metadata(&self) -> Result<MetaIter<'_, A, S>> {
        self.require_location_data()?;
        MetaIter::new(self, self.spatial_adapter.iter(&self.storage))
    }

    /// Queries `(metadata, data)` pairs at slot 0.
    pub fn query_elements(&self, query: &SpatialQuery<A::Point>) -> Result<ElementIter<'_, A, S>> {
        self.require_location_data()?;
        let inner = self.spatial_adapter.query(&self.storage, query)?;
        ElementIter::new(self, inner, 0)
    }

    /// Queries `(metadata, data)` pairs with the data taken from a slot.
    pub fn query_elements_in_slot(
        &self,
        query: &SpatialQuery<A::Point>,
        slot: usize,
    ) -> Result<ElementIter<'_, A, S>> {
        self.require_location_data()?;
        let slot_off = self.slot_offset(slot)?;
        let inner = self.spatial_adapter.query(&self.storage, query)?;
        ElementIter::new(self, inner, slot_off)
    }

    /// Queries metadata references.
    pub fn query_metadata(&self, query: &SpatialQuery<A::Point>) -> Result<MetaIter<'_, A, S>> {
        self.require_location_data()?;
        let inner = self.spatial_adapter.query(&self.storage, query)?;
        MetaIter::new(self, inner)
    }

    /// The element at an exact location, with slot-0 data.
    ///
    /// Runs a 1-nearest query and requires the result to sit exactly at
    /// the requested point: fails with [`Error::EmptyQuery`] when the
    /// dataset is empty, [`Error::MultipleResults`] when more than one
    /// element comes back, and [`Error::LocationMismatch`] when the
    /// nearest element is elsewhere.
    pub fn find_element(&self, point: &A::Point) -> Result<(&A::Metadata, &[u8])> {
        self.find_element_impl(point, 0)
    }

    /// The element at an exact location, with data from a selected slot.
    pub fn find_element_in_slot(
        &self,
        point: &A::Point,
        slot: usize,
    ) -> Result<(&A::Metadata, &[u8])> {
        let slot_off = self.slot_offset(slot)?;
        self.find_element_impl(point, slot_off)
    }

    fn find_element_impl(&self, point: &A::Point, slot_off: u64) -> Result<(&A::Metadata, &[u8])> {
        let (meta_bytes, data_bytes) = self.mapped_regions()?;
        let meta = self.find_meta_common(point)?;
        let value_offset = {
            let uid = self.meta_adapter.uid(meta);
            let at = self.header_size as usize
                + self.row.row_offset(uid) as usize
                + self.row.data_offset_at;
            bytemuck::pod_read_unaligned::<u64>(&meta_bytes[at..at + 8])
        };
        let size = self.meta_adapter.data_size(meta);
        let begin = (value_offset + slot_off) as usize;
        Ok((meta, &data_bytes[begin..begin + size]))
    }

    /// The metadata of the element at an exact location.
    pub fn find_metadata(&self, point: &A::Point) -> Result<&A::Metadata> {
        self.find_meta_common(point)
    }

    fn find_meta_common(&self, point: &A::Point) -> Result<&A::Metadata> {
        self.require_location_data()?;
        let meta_bytes = self.mapped_meta_region()?;

        let mut results = self
            .spatial_adapter
            .query(&self.storage, &SpatialQuery::nearest(*point, 1))?;
        let Some((_, value)) = results.next() else {
            return Err(Error::EmptyQuery {
                location: point.to_f64_vec(),
                dataset: self.dataset_name(),
            });
        };
        let extra = results.count();
        if extra > 0 {
            return Err(Error::MultipleResults {
                location: point.to_f64_vec(),
                count: extra + 1,
                dataset: self.dataset_name(),
            });
        }

        let meta = self.resolve_meta(meta_bytes, value.uid());
        let found = self.meta_adapter.location(meta);
        if !self.spatial_adapter.points_equal(point, &found) {
            return Err(Error::LocationMismatch {
                requested: point.to_f64_vec(),
                actual: found.to_f64_vec(),
                dataset: self.dataset_name(),
            });
        }
        Ok(meta)
    }

    // ----- durability ------------------------------------------------

    /// Makes metadata writes durable (msync when mapped, fsync otherwise).
    pub fn sync_metadata(&self) -> Result<()> {
        self.files.sync(FileSel::Meta)
    }

    /// Makes data writes durable (msync when mapped, fsync otherwise).
    pub fn sync_data(&self) -> Result<()> {
        self.require_data()?;
        self.files.sync(FileSel::Data)
    }

    // ----- clean/dirty sentinel (experimental) -----------------------

    fn clean_bit(&self, uid: Uid) -> Result<u32> {
        let bytes = self.mapped_meta_region()?;
        let start = self.row_start(uid)?;
        let at = start + self.row.clean_bit_at;
        Ok(bytemuck::pod_read_unaligned(&bytes[at..at + 4]))
    }

    fn set_clean_bit(&mut self, uid: Uid, value: u32) -> Result<()> {
        self.require_mapped()?;
        let start = self.row_start(uid)?;
        let at = start + self.row.clean_bit_at;
        let bytes = self.files.map_bytes_mut(FileSel::Meta)?;
        bytes[at..at + 4].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Marks an element's sentinel clean.
    ///
    /// **Warning**: the clean/dirty sentinel is experimental and may not
    /// reliably reflect the actual state of the dataset.
    pub fn set_element_clean(&mut self, uid: Uid) -> Result<()> {
        self.set_clean_bit(uid, CLEAN_SENTINEL)
    }

    /// Marks an element's sentinel dirty.
    ///
    /// **Warning**: the clean/dirty sentinel is experimental and may not
    /// reliably reflect the actual state of the dataset.
    pub fn set_element_dirty(&mut self, uid: Uid) -> Result<()> {
        self.set_clean_bit(uid, DIRTY_SENTINEL)
    }

    /// True if the element's sentinel is clean.
    ///
    /// **Warning**: the clean/dirty sentinel is experimental and may not
    /// reliably reflect the actual state of the dataset.
    pub fn is_element_clean(&self, uid: Uid) -> Result<bool> {
        Ok(self.clean_bit(uid)? == CLEAN_SENTINEL)
    }

    /// True if the element's sentinel is dirty.
    ///
    /// **Warning**: the clean/dirty sentinel is experimental and may not
    /// reliably reflect the actual state of the dataset.
    pub fn is_element_dirty(&self, uid: Uid) -> Result<bool> {
        Ok(self.clean_bit(uid)? == DIRTY_SENTINEL)
    }

    /// True if the element's sentinel is neither clean nor dirty.
    ///
    /// **Warning**: the clean/dirty sentinel is experimental and may not
    /// reliably reflect the actual state of the dataset.
    pub fn is_element_corrupt(&self, uid: Uid) -> Result<bool> {
        let bit = self.clean_bit(uid)?;
        Ok(bit != CLEAN_SENTINEL && bit != DIRTY_SENTINEL)
    }

    /// Uids of every clean element (linear scan).
    pub fn clean_uids(&self) -> Result<Vec<Uid>> {
        self.scan_uids(|bit| bit == CLEAN_SENTINEL)
    }

    /// Uids of every dirty element (linear scan).
    pub fn dirty_uids(&self) -> Result<Vec<Uid>> {
        self.scan_uids(|bit| bit == DIRTY_SENTINEL)
    }

    /// Uids of every corrupt element (linear scan).
    pub fn corrupt_uids(&self) -> Result<Vec<Uid>> {
        self.scan_uids(|bit| bit != CLEAN_SENTINEL && bit != DIRTY_SENTINEL)
    }

    fn scan_uids(&self, keep: impl Fn(u32) -> bool) -> Result<Vec<Uid>> {
        let mut uids = Vec::new();
        for uid in 1..=self.max_elements {
            if keep(self.clean_bit(uid)?) {
                uids.push(uid);
            }
        }
        Ok(uids)
    }

    // ----- open-time consistency -------------------------------------

    /// Verifies that the stored `(data_offset, data_size)` pairs partition
    /// every slot exactly, with no gaps or overlap.
    fn cross_check_data(&self) -> Result<()> {
        let count = if self.can_rwp {
            self.count_stored()?
        } else {
            self.max_elements
        };
        if count == 0 {
            let real = self.files.file_size(FileSel::Data)?;
            if real != 0 {
                return Err(Error::InconsistentData {
                    context: "data file size",
                    expected: 0,
                    actual: real,
                    dataset: self.dataset_name(),
                });
            }
            return Ok(());
        }

        let mut info: Vec<(u64, usize)> = Vec::with_capacity(count as usize);
        if self.can_rwp {
            for uid in 1..=count {
                let Some((meta, data_offset, _)) = self.read_row_fd(uid)? else {
                    return Err(Error::InconsistentMeta {
                        context: "missing row",
                        expected: count,
                        actual: uid,
                        dataset: self.dataset_name(),
                    });
                };
                info.push((data_offset, self.meta_adapter.data_size(&meta)));
            }
        } else {
            let bytes = self.files.map_bytes(FileSel::Meta)?;
            let reader = RowReader {
                bytes,
                header_size: self.header_size as usize,
                row: self.row,
            };
            for uid in 1..=count {
                let meta: A::Metadata = reader.meta(uid);
                info.push((reader.data_offset(uid), self.meta_adapter.data_size(&meta)));
            }
        }

        // Offsets are unique thanks to the alignment, so a plain sort
        // reconstructs the physical layout.
        info.sort_unstable();

        let mut current = 0u64;
        for &(offset, size) in &info {
            if offset != current {
                return Err(Error::InconsistentData {
                    context: "data offset",
                    expected: current,
                    actual: offset,
                    dataset: self.dataset_name(),
                });
            }
            current += align64(size as u64);
        }

        if current != self.slot_size {
            return Err(Error::InconsistentData {
                context: "slot size",
                expected: self.slot_size,
                actual: current,
                dataset: self.dataset_name(),
            });
        }

        let real = self.files.file_size(FileSel::Data)?;
        if current * self.num_slots as u64 != real {
            return Err(Error::InconsistentData {
                context: "data file size",
                expected: real,
                actual: current * self.num_slots as u64,
                dataset: self.dataset_name(),
            });
        }
        Ok(())
    }
}

// ----- construction helpers (free of `self` borrows) ------------------

fn layout_of<A: MetaAdapter>(
    meta_adapter: &A,
    dataset: &str,
) -> Result<(FileHeader, u64, RowLayout, Vec<u8>)> {
    let check = meta_adapter.check().to_vec();
    format::validate_check_size(check.len(), dataset)?;
    let row = RowLayout::new::<A::Metadata>();
    let header = FileHeader::new(check.len(), row.row_size as u64);
    let header_size = format::header_size(check.len());
    Ok((header, header_size, row, check))
}

fn validate_num_slots(
    no_data: bool,
    new_ds: bool,
    num_slots: usize,
    dataset: &str,
) -> Result<()> {
    if no_data {
        if num_slots != 0 {
            return Err(Error::InvalidNumSlots {
                expected: 0,
                requested: num_slots,
                dataset: dataset.to_string(),
            });
        }
    } else if new_ds && num_slots != 1 {
        return Err(Error::InvalidNumSlots {
            expected: 1,
            requested: num_slots,
            dataset: dataset.to_string(),
        });
    } else if num_slots == 0 {
        return Err(Error::InvalidNumSlots {
            expected: 1,
            requested: 0,
            dataset: dataset.to_string(),
        });
    }
    Ok(())
}

/// Meta, data and sidecar paths must be pairwise distinct.
fn assert_filenames<A: MetaAdapter, S: SpatialIndex<A::Metadata, Point = A::Point>>(
    basepath: &Path,
    meta_adapter: &A,
    spatial_adapter: &S,
) -> Result<()> {
    let mut paths = vec![
        FilePair::file_path(basepath, meta_adapter.meta_ext()),
        FilePair::file_path(basepath, meta_adapter.data_ext()),
    ];
    spatial_adapter.extra_files(basepath, &mut paths);
    paths.sort();
    for pair in paths.windows(2) {
        if pair[0] == pair[1] {
            return Err(Error::ExtensionsEqual {
                extension: pair[0].display().to_string(),
            });
        }
    }
    Ok(())
}

fn compute_slot_size(
    files: &FilePair,
    no_data: bool,
    num_slots: usize,
    dataset: &str,
) -> Result<u64> {
    if no_data {
        return Ok(0);
    }
    let data_size = files.file_size(FileSel::Data)?;
    let extra = data_size % num_slots as u64;
    if extra != 0 {
        return Err(Error::ExtraSlotBytes {
            extra,
            dataset: dataset.to_string(),
        });
    }
    Ok(data_size / num_slots as u64)
}

/// Writes or validates the header region through the descriptor.
fn init_meta_fd(
    files: &FilePair,
    header: &FileHeader,
    check: &[u8],
    header_size: u64,
    row: &RowLayout,
    new_ds: bool,
) -> Result<()> {
    let dataset = files.dataset_name();
    if new_ds {
        files.write_all_at(FileSel::Meta, 0, header.as_bytes())?;
        files.write_all_at(FileSel::Meta, HEADER_STRUCT_SIZE as u64, check)?;
        let written = (HEADER_STRUCT_SIZE + check.len()) as u64;
        if header_size > written {
            files.write_all_at(FileSel::Meta, header_size - 1, &[0u8])?;
        }
        Ok(())
    } else {
        let stored: FileHeader = files
            .read_object_at(FileSel::Meta, 0, true)?
            .unwrap_or_else(FileHeader::zeroed);
        format::validate_header(header, stored.as_bytes(), &dataset)?;

        let mut stored_check = vec![0u8; check.len()];
        if !check.is_empty() {
            files.read_exact_at(
                FileSel::Meta,
                HEADER_STRUCT_SIZE as u64,
                &mut stored_check,
                true,
            )?;
        }
        format::validate_check(check, &stored_check, &dataset)?;

        validate_meta_size(files.file_size(FileSel::Meta)?, header_size, row, &dataset)
    }
}

/// Validates the header region of a mapped metadata file.
fn validate_meta_bytes(
    header: &FileHeader,
    check: &[u8],
    bytes: &[u8],
    dataset: &str,
) -> Result<()> {
    format::validate_header(header, bytes, dataset)?;
    if bytes.len() < HEADER_STRUCT_SIZE + check.len() {
        return Err(Error::IncompleteRead {
            expected: HEADER_STRUCT_SIZE + check.len(),
            actual: bytes.len().saturating_sub(HEADER_STRUCT_SIZE),
        });
    }
    format::validate_check(
        check,
        &bytes[HEADER_STRUCT_SIZE..HEADER_STRUCT_SIZE + check.len()],
        dataset,
    )
}

/// The metadata region must hold a whole number of rows.
fn validate_meta_size(
    file_size: u64,
    header_size: u64,
    row: &RowLayout,
    dataset: &str,
) -> Result<()> {
    if file_size < header_size {
        return Err(Error::IncompleteRead {
            expected: header_size as usize,
            actual: file_size as usize,
        });
    }
    let extra = (file_size - header_size) % row.row_size as u64;
    if extra != 0 {
        return Err(Error::ExtraMetaBytes {
            extra,
            dataset: dataset.to_string(),
        });
    }
    Ok(())
}

/// Bulk-loads the spatial storage from the mapped rows.
#[allow(clippy::too_many_arguments)]
fn init_spatial_storage<A, S>(
    spatial_adapter: &S,
    storage: &mut S::Storage,
    meta_adapter: &A,
    reader: RowReader<'_>,
    basepath: &Path,
    is_new: bool,
    can_write: bool,
    count: u64,
) -> Result<()>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    let ctx = InitContext {
        basename: basepath,
        is_new,
        can_write,
    };
    let entries = (0..count as usize).map(|i| {
        let uid = i as Uid + 1;
        let meta: A::Metadata = reader.meta(uid);
        let mut value = S::Value::from_uid(uid);
        value.set_data_offset(reader.data_offset(uid));
        (meta_adapter.location(&meta), value)
    });
    spatial_adapter.initialize(storage, &ctx, entries, |uid| reader.meta(uid))
}

/// Data blobs must appear in the index's natural order.
fn check_sorted<A, S>(
    spatial_adapter: &S,
    storage: &S::Storage,
    reader: RowReader<'_>,
    dataset: &str,
) -> Result<()>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    let mut last: Option<u64> = None;
    for (_, value) in spatial_adapter.iter(storage) {
        let offset = value
            .data_offset()
            .unwrap_or_else(|| reader.data_offset(value.uid()));
        if let Some(prev) = last {
            if offset < prev {
                return Err(Error::UnsortedData {
                    last_offset: prev,
                    offset,
                    dataset: dataset.to_string(),
                });
            }
        }
        last = Some(offset);
    }
    Ok(())
}
