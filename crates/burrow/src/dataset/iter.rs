//! Iterator composition over spatial-storage entries.
//!
//! The spatial adapter produces `(point, value)` streams; the adapters here
//! project them into references to the mapped metadata and data regions.
//! The only variability is how a node value resolves its data offset: a
//! rich value carries the offset, a slim value is a bare uid whose offset
//! is read from the metadata row. That branch lives in
//! [`Dataset::resolve_data_offset`] and nowhere else.

use crate::dataset::Dataset;
use crate::error::Result;
use crate::meta::{MetaAdapter, Uid};
use crate::spatial::{EntryIter, NodeValue, SpatialIndex};
use bytemuck::Zeroable;

/// Iterator over `(metadata, data)` pairs of a mapped dataset.
///
/// Produced by storage-order and query iteration; the optional slot offset
/// shifts every data slice into the selected slot.
pub struct ElementIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    ds: &'a Dataset<A, S>,
    meta_bytes: &'a [u8],
    data_bytes: &'a [u8],
    inner: EntryIter<'a, A::Point, S::Value>,
    slot_offset: u64,
}

impl<'a, A, S> std::fmt::Debug for ElementIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementIter").finish_non_exhaustive()
    }
}

impl<'a, A, S> ElementIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    pub(crate) fn new(
        ds: &'a Dataset<A, S>,
        inner: EntryIter<'a, A::Point, S::Value>,
        slot_offset: u64,
    ) -> Result<Self> {
        let (meta_bytes, data_bytes) = ds.mapped_regions()?;
        Ok(Self {
            ds,
            meta_bytes,
            data_bytes,
            inner,
            slot_offset,
        })
    }
}

impl<'a, A, S> Iterator for ElementIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    type Item = (&'a A::Metadata, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (_, value) = self.inner.next()?;
        let meta = self.ds.resolve_meta(self.meta_bytes, value.uid());
        let offset = self.ds.resolve_data_offset(self.meta_bytes, &value);
        let size = self.ds.meta_adapter().data_size(meta);
        let start = (offset + self.slot_offset) as usize;
        Some((meta, &self.data_bytes[start..start + size]))
    }
}

/// Iterator over metadata references of a mapped dataset.
pub struct MetaIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    ds: &'a Dataset<A, S>,
    meta_bytes: &'a [u8],
    inner: EntryIter<'a, A::Point, S::Value>,
}

impl<'a, A, S> std::fmt::Debug for MetaIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaIter").finish_non_exhaustive()
    }
}

impl<'a, A, S> MetaIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    pub(crate) fn new(
        ds: &'a Dataset<A, S>,
        inner: EntryIter<'a, A::Point, S::Value>,
    ) -> Result<Self> {
        let meta_bytes = ds.mapped_meta_region()?;
        Ok(Self {
            ds,
            meta_bytes,
            inner,
        })
    }
}

impl<'a, A, S> Iterator for MetaIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    type Item = &'a A::Metadata;

    fn next(&mut self) -> Option<Self::Item> {
        let (_, value) = self.inner.next()?;
        Some(self.ds.resolve_meta(self.meta_bytes, value.uid()))
    }
}

/// Sequential metadata reader for descriptor-mode datasets.
///
/// Walks uids from 1 upward, reading each row from the file, and stops at
/// the first uid past the end of the file.
pub struct ReadMetaIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    ds: &'a Dataset<A, S>,
    uid: Uid,
    done: bool,
}

impl<'a, A, S> ReadMetaIter<'a, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    pub(crate) fn new(ds: &'a Dataset<A, S>) -> Self {
        Self {
            ds,
            uid: 1,
            done: false,
        }
    }
}

impl<A, S> Iterator for ReadMetaIter<'_, A, S>
where
    A: MetaAdapter,
    S: SpatialIndex<A::Metadata, Point = A::Point>,
{
    type Item = Result<A::Metadata>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut meta = A::Metadata::zeroed();
        match self.ds.read_element(self.uid, &mut meta) {
            Ok(true) => {
                self.uid += 1;
                Some(Ok(meta))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
