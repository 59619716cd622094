//! The metadata adapter contract between application records and a dataset.

use crate::spatial::SpatialPoint;
use bytemuck::Pod;

/// Unique, positive, 1-based record identifier. Zero is reserved invalid.
pub type Uid = u64;

/// Interfaces a user-defined record type with the dataset.
///
/// The record is a fixed-size plain-data structure ([`Pod`]); the adapter
/// exposes its uid, its point in space, the size of its data blob, and a
/// fixed check byte string that fingerprints the schema. The check block is
/// stored in the file header and refused at open time when it differs, so
/// two builds with different record layouts can never read each other's
/// files silently.
///
/// The point type is shared with the spatial adapter
/// ([`crate::spatial::SpatialIndex::Point`]); the dataset requires the two
/// to be the same type, which pins the number of dimensions and the scalar
/// type at compile time.
pub trait MetaAdapter {
    /// The user record stored in each metadata row.
    type Metadata: Pod;

    /// The spatial point type records are located by.
    type Point: SpatialPoint;

    /// The location of a record in space.
    fn location(&self, meta: &Self::Metadata) -> Self::Point;

    /// The uid stored in a record.
    fn uid(&self, meta: &Self::Metadata) -> Uid;

    /// Stores a uid into a record.
    fn set_uid(&self, meta: &mut Self::Metadata, uid: Uid);

    /// The size in bytes of the record's data blob.
    fn data_size(&self, meta: &Self::Metadata) -> usize;

    /// The schema fingerprint stored in the file header.
    fn check(&self) -> &[u8];

    /// Extension of the metadata file, without the leading dot.
    fn meta_ext(&self) -> &str;

    /// Extension of the data file, without the leading dot.
    fn data_ext(&self) -> &str;
}
