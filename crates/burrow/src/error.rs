//! Error and Result types for Burrow dataset operations.

use crate::meta::Uid;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for Burrow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for dataset operations.
///
/// Every variant carries the structured attributes of the failure: the
/// operation or file involved, the dataset basename, and the
/// requested/expected/actual values that explain the mismatch. The OS errno
/// travels inside the wrapped [`std::io::Error`] of the [`Error::Io`]
/// variant.
#[derive(Debug, Error)]
pub enum Error {
    /// A system call failed.
    #[error("I/O error during {op} on {path:?}: {source}")]
    Io {
        /// Name of the failed operation (open, read, write, mmap, ...).
        op: &'static str,
        /// File the operation was acting on, when known.
        path: Option<PathBuf>,
        /// Underlying OS error, carrying the errno.
        source: io::Error,
    },

    /// A read returned fewer bytes than required.
    #[error("incomplete read: expected {expected} bytes, got {actual}")]
    IncompleteRead {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes actually read.
        actual: usize,
    },

    /// A write stored fewer bytes than requested.
    #[error("incomplete write: expected {expected} bytes, wrote {actual}")]
    IncompleteWrite {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes actually written.
        actual: usize,
    },

    /// The meta-file header does not match the canonical build-time header.
    #[error(
        "header mismatch in dataset {dataset} at byte {position}: \
         expected {expected:#04x}, got {actual:#04x}"
    )]
    BaseDataMismatch {
        /// Byte position of the first difference within the header.
        position: usize,
        /// Expected byte value.
        expected: u8,
        /// Stored byte value.
        actual: u8,
        /// Dataset basename.
        dataset: String,
    },

    /// The stored check block does not match the adapter's check data.
    #[error(
        "check data mismatch in dataset {dataset} at byte {position}: \
         expected {expected:#04x}, got {actual:#04x}"
    )]
    CheckDataMismatch {
        /// Byte position of the first difference within the check block.
        position: usize,
        /// Expected byte value.
        expected: u8,
        /// Stored byte value.
        actual: u8,
        /// Dataset basename.
        dataset: String,
    },

    /// The adapter check block exceeds the maximum supported size.
    #[error("check data too big in dataset {dataset}: {actual} bytes, maximum {maximum}")]
    CheckSizeTooBig {
        /// Largest supported check block size in bytes.
        maximum: usize,
        /// Size provided by the adapter.
        actual: usize,
        /// Dataset basename.
        dataset: String,
    },

    /// The metadata region size is not a multiple of the row size.
    #[error("meta file of dataset {dataset} has {extra} extra bytes")]
    ExtraMetaBytes {
        /// Number of leftover bytes.
        extra: u64,
        /// Dataset basename.
        dataset: String,
    },

    /// The data file size is not a multiple of the number of slots.
    #[error("data file of dataset {dataset} has {extra} extra bytes")]
    ExtraSlotBytes {
        /// Number of leftover bytes.
        extra: u64,
        /// Dataset basename.
        dataset: String,
    },

    /// A stored metadata row disagrees with the request that produced it.
    #[error(
        "inconsistent metadata in dataset {dataset} ({context}): \
         expected {expected}, got {actual}"
    )]
    InconsistentMeta {
        /// What disagreed (stored uid, element count, ...).
        context: &'static str,
        /// Expected value.
        expected: u64,
        /// Actual value.
        actual: u64,
        /// Dataset basename.
        dataset: String,
    },

    /// The data offsets do not partition the data file.
    #[error(
        "inconsistent data in dataset {dataset} ({context}): \
         expected {expected}, got {actual}"
    )]
    InconsistentData {
        /// What disagreed (offset, slot size, file size).
        context: &'static str,
        /// Expected value.
        expected: u64,
        /// Actual value.
        actual: u64,
        /// Dataset basename.
        dataset: String,
    },

    /// A persisted spatial index disagrees with the dataset it belongs to.
    #[error(
        "inconsistent index file {path:?}: expected {expected_elements} \
         elements, found {actual_elements}"
    )]
    InconsistentIndex {
        /// Element count expected by the dataset.
        expected_elements: u64,
        /// Element count found in the index file.
        actual_elements: u64,
        /// Path of the index file.
        path: PathBuf,
    },

    /// The spatial index did not fit the mapped file after all resize
    /// attempts.
    #[error(
        "index file {path:?} too big after {attempts} resize attempts \
         (last size {last_size} bytes)"
    )]
    IndexSizeTooBig {
        /// Number of resize attempts performed.
        attempts: usize,
        /// Last file size tried, in bytes.
        last_size: u64,
        /// Path of the index file.
        path: PathBuf,
    },

    /// A bump allocation did not fit the remaining arena space.
    #[error("arena exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted {
        /// Bytes requested by the allocation.
        requested: usize,
        /// Bytes still available in the arena.
        available: usize,
    },

    /// Truncating a dataset without opening it for writing.
    #[error("cannot create dataset {dataset} without write access ({path:?})")]
    CreateWithoutWrite {
        /// Dataset basename.
        dataset: String,
        /// File being created.
        path: PathBuf,
    },

    /// Opening an existing dataset with a non-zero creation size.
    #[error("cannot open existing dataset {dataset} with an explicit size ({path:?})")]
    OpenWithSize {
        /// Dataset basename.
        dataset: String,
        /// File being opened.
        path: PathBuf,
    },

    /// A write path was reached on a read-only dataset.
    #[error("dataset {dataset} is read-only")]
    ReadOnly {
        /// Dataset basename.
        dataset: String,
    },

    /// A descriptor operation was reached on a memory-mapped dataset.
    #[error("dataset {dataset} is memory-mapped")]
    Mmapped {
        /// Dataset basename.
        dataset: String,
    },

    /// A mapped-memory operation was reached on a descriptor-mode dataset.
    #[error("dataset {dataset} is not memory-mapped")]
    NotMmapped {
        /// Dataset basename.
        dataset: String,
    },

    /// Attempted to memory-map a zero-length file.
    #[error("cannot map empty file of dataset {dataset}")]
    EmptyMmap {
        /// Dataset basename.
        dataset: String,
    },

    /// Two dataset files resolve to the same path.
    #[error("duplicate dataset file extension {extension}")]
    ExtensionsEqual {
        /// The clashing extension or path.
        extension: String,
    },

    /// The data file was requested but the dataset was opened without one.
    #[error("dataset {dataset} has no data file")]
    NoData {
        /// Dataset basename.
        dataset: String,
    },

    /// A slot index is out of range.
    #[error("invalid slot {requested} in dataset {dataset}, maximum is {maximum}")]
    InvalidSlot {
        /// Largest valid slot index.
        maximum: usize,
        /// Requested slot index.
        requested: usize,
        /// Dataset basename.
        dataset: String,
    },

    /// The slot count is not valid for the requested operation.
    #[error(
        "invalid number of slots {requested} in dataset {dataset}, \
         expected {expected}"
    )]
    InvalidNumSlots {
        /// Slot count the operation requires.
        expected: usize,
        /// Slot count provided.
        requested: usize,
        /// Dataset basename.
        dataset: String,
    },

    /// A uid is zero or beyond the stored elements.
    #[error("invalid uid {requested} in dataset {dataset}, maximum is {maximum}")]
    InvalidUid {
        /// Largest valid uid.
        maximum: Uid,
        /// Requested uid.
        requested: Uid,
        /// Dataset basename.
        dataset: String,
    },

    /// A rewrite attempted to change the size of a record's data blob.
    #[error(
        "invalid data size in dataset {dataset}: stored {expected} bytes, \
         got {actual}"
    )]
    InvalidDataSize {
        /// Size stored on disk.
        expected: usize,
        /// Size carried by the new metadata.
        actual: usize,
        /// Dataset basename.
        dataset: String,
    },

    /// Data blobs are not laid out in spatial-storage order.
    #[error(
        "unsorted data in dataset {dataset}: offset {offset} follows \
         {last_offset}"
    )]
    UnsortedData {
        /// Offset of the previous element.
        last_offset: u64,
        /// Offset that broke the ordering.
        offset: u64,
        /// Dataset basename.
        dataset: String,
    },

    /// The spatial storage was initialized twice.
    #[error("spatial storage of dataset {dataset} is already initialized")]
    AlreadyInitialized {
        /// Dataset basename.
        dataset: String,
    },

    /// The spatial storage was used before initialization.
    #[error("spatial storage of dataset {dataset} is not initialized")]
    NotInitialized {
        /// Dataset basename.
        dataset: String,
    },

    /// Spatial information was requested from a dataset without an index.
    #[error("no location data available for dataset {dataset}")]
    LocationDataUnavailable {
        /// Dataset basename.
        dataset: String,
    },

    /// An exact-location lookup matched nothing.
    #[error("no element at location {location:?} in dataset {dataset}")]
    EmptyQuery {
        /// Requested location.
        location: Vec<f64>,
        /// Dataset basename.
        dataset: String,
    },

    /// An exact-location lookup matched more than one element.
    #[error(
        "{count} elements at location {location:?} in dataset {dataset}, \
         expected exactly one"
    )]
    MultipleResults {
        /// Requested location.
        location: Vec<f64>,
        /// Number of elements returned.
        count: usize,
        /// Dataset basename.
        dataset: String,
    },

    /// The nearest element is not at the requested location.
    #[error(
        "element location {actual:?} does not match requested location \
         {requested:?} in dataset {dataset}"
    )]
    LocationMismatch {
        /// Requested location.
        requested: Vec<f64>,
        /// Location of the nearest element.
        actual: Vec<f64>,
        /// Dataset basename.
        dataset: String,
    },
}

impl Error {
    /// Returns true if this is an [`Error::Io`] caused by a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Io { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}
