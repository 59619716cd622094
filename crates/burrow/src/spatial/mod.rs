//! The spatial adapter boundary.
//!
//! A dataset accelerates its spatial queries through a pluggable index; any
//! concrete index implements [`SpatialIndex`]. The contract is deliberately
//! narrow: bulk initialization over `(point, value)` entries, in-order
//! iteration, the two query predicates of [`SpatialQuery`], bounds, and an
//! in-order value-update visit used once during dataset creation.
//!
//! Node values are index-based, never pointers: the slim form is a bare
//! [`Uid`], the rich form is an [`ElementRef`] that additionally carries the
//! record's data offset. [`SpatialIndex::STORES_ELEMENT_OFFSETS`] tells the
//! dataset which of the two it is handling, and the iterator layer branches
//! on it exactly once.

pub mod disk;
pub mod mapped;
pub mod multiindex;
pub mod rtree;

use crate::error::Result;
use crate::meta::Uid;
use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Scalar types usable as spatial coordinates.
pub trait Coordinate: Copy + PartialOrd + Debug + Pod + Send + Sync + 'static {
    /// Lossy conversion used for distances and error reporting.
    fn as_f64(self) -> f64;
}

macro_rules! impl_coordinate {
    ($($t:ty),*) => {
        $(impl Coordinate for $t {
            fn as_f64(self) -> f64 {
                self as f64
            }
        })*
    };
}

impl_coordinate!(f32, f64, i32, i64, u32, u64);

/// A point in `D`-dimensional space.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(transparent)]
pub struct Point<S, const D: usize>(pub [S; D]);

// Point is a transparent wrapper over a Pod array.
unsafe impl<S: Coordinate, const D: usize> Zeroable for Point<S, D> {}
unsafe impl<S: Coordinate, const D: usize> Pod for Point<S, D> {}

impl<S: Coordinate, const D: usize> Point<S, D> {
    /// Builds a point from its coordinates.
    pub fn new(coords: [S; D]) -> Self {
        Self(coords)
    }
}

impl<S: Coordinate, const D: usize> From<[S; D]> for Point<S, D> {
    fn from(coords: [S; D]) -> Self {
        Self(coords)
    }
}

/// Operations the engine needs from a point type.
pub trait SpatialPoint: Copy + PartialEq + Debug + Send + Sync + 'static {
    /// The scalar type of each coordinate.
    type Scalar: Coordinate;

    /// Number of spatial dimensions.
    const DIMS: usize;

    /// Coordinate along one axis.
    fn coord(&self, axis: usize) -> Self::Scalar;

    /// Sets the coordinate along one axis.
    fn set_coord(&mut self, axis: usize, value: Self::Scalar);

    /// True if every coordinate of `self` is `<=` the matching coordinate
    /// of `other`.
    fn componentwise_le(&self, other: &Self) -> bool {
        (0..Self::DIMS).all(|axis| self.coord(axis) <= other.coord(axis))
    }

    /// Squared Euclidean distance to another point.
    fn distance2(&self, other: &Self) -> f64 {
        (0..Self::DIMS)
            .map(|axis| self.coord(axis).as_f64() - other.coord(axis).as_f64())
            .map(|d| d * d)
            .sum()
    }

    /// The coordinates as `f64`, for error attribution.
    fn to_f64_vec(&self) -> Vec<f64> {
        (0..Self::DIMS).map(|axis| self.coord(axis).as_f64()).collect()
    }
}

impl<S: Coordinate, const D: usize> SpatialPoint for Point<S, D> {
    type Scalar = S;

    const DIMS: usize = D;

    fn coord(&self, axis: usize) -> S {
        self.0[axis]
    }

    fn set_coord(&mut self, axis: usize, value: S) {
        self.0[axis] = value;
    }
}

/// The query predicates supported uniformly by every spatial adapter.
#[derive(Debug, Clone, Copy)]
pub enum SpatialQuery<P> {
    /// Every element whose point satisfies `min <= point <= max`
    /// coordinate-wise.
    ClosedInterval {
        /// Corner with the smallest coordinates.
        min: P,
        /// Corner with the largest coordinates.
        max: P,
    },
    /// The `k` elements nearest to a reference point, in increasing
    /// distance order.
    Nearest {
        /// The reference point.
        point: P,
        /// Number of neighbors to return.
        k: usize,
    },
}

impl<P> SpatialQuery<P> {
    /// Builds a closed-interval predicate.
    pub fn closed_interval(min: P, max: P) -> Self {
        Self::ClosedInterval { min, max }
    }

    /// Builds a k-nearest-neighbor predicate.
    pub fn nearest(point: P, k: usize) -> Self {
        Self::Nearest { point, k }
    }
}

/// The value stored per node of a spatial index.
///
/// Slim indices store the bare [`Uid`]; rich indices store an
/// [`ElementRef`] whose data offset lets the iterator layer resolve a
/// record's blob without touching the metadata row.
pub trait NodeValue: Copy + Debug + Pod + Send + Sync + 'static {
    /// True when values of this type carry a data offset.
    const CARRIES_OFFSET: bool;

    /// Builds a value for a record that has no data offset assigned yet.
    fn from_uid(uid: Uid) -> Self;

    /// The uid of the record.
    fn uid(&self) -> Uid;

    /// The record's data offset, when this value carries one.
    fn data_offset(&self) -> Option<u64>;

    /// Stores the record's data offset; a no-op for slim values.
    fn set_data_offset(&mut self, offset: u64);
}

impl NodeValue for Uid {
    const CARRIES_OFFSET: bool = false;

    fn from_uid(uid: Uid) -> Self {
        uid
    }

    fn uid(&self) -> Uid {
        *self
    }

    fn data_offset(&self) -> Option<u64> {
        None
    }

    fn set_data_offset(&mut self, _offset: u64) {}
}

/// A record reference carrying the uid and the data offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ElementRef {
    /// The record's uid.
    pub uid: Uid,
    /// Byte offset of the record's blob within a data slot.
    pub data_offset: u64,
}

impl NodeValue for ElementRef {
    const CARRIES_OFFSET: bool = true;

    fn from_uid(uid: Uid) -> Self {
        Self {
            uid,
            data_offset: 0,
        }
    }

    fn uid(&self) -> Uid {
        self.uid
    }

    fn data_offset(&self) -> Option<u64> {
        Some(self.data_offset)
    }

    fn set_data_offset(&mut self, offset: u64) {
        self.data_offset = offset;
    }
}

/// Context handed to a spatial adapter when its storage is initialized.
#[derive(Debug, Clone, Copy)]
pub struct InitContext<'a> {
    /// Dataset basename, for sidecar file naming.
    pub basename: &'a Path,
    /// True when the dataset is being created rather than opened.
    pub is_new: bool,
    /// True when the dataset allows writes.
    pub can_write: bool,
}

/// A lazy stream of `(point, value)` results.
pub type EntryIter<'a, P, V> = Box<dyn Iterator<Item = (P, V)> + 'a>;

/// A pluggable spatial index over `(point, value)` entries.
///
/// The `M` parameter is the user metadata type; plain spatial indices
/// ignore it, composite adapters use it to key secondary indices (see
/// [`multiindex::MultiIndex`]). Storage release happens through `Drop`.
pub trait SpatialIndex<M> {
    /// The point type indexed.
    type Point: SpatialPoint;

    /// The per-node value type.
    type Value: NodeValue;

    /// The storage the index operates on; owned by the dataset.
    type Storage;

    /// True when node values carry their data offset ([`ElementRef`]),
    /// false when they are bare uids resolved through the dataset.
    const STORES_ELEMENT_OFFSETS: bool;

    /// Creates an empty, uninitialized storage.
    fn new_storage(&self) -> Self::Storage;

    /// True if the storage holds no elements.
    fn is_empty(&self, storage: &Self::Storage) -> bool;

    /// Compares two points for exact equality.
    fn points_equal(&self, a: &Self::Point, b: &Self::Point) -> bool {
        a == b
    }

    /// Appends the sidecar files owned by this adapter for a basename.
    fn extra_files(&self, basename: &Path, out: &mut Vec<PathBuf>) {
        let _ = (basename, out);
    }

    /// Bulk-loads the storage from `(point, value)` entries.
    ///
    /// `meta` resolves a uid to its metadata record; plain adapters ignore
    /// it. Disk-backed adapters create or open their sidecar files
    /// according to `ctx`.
    fn initialize<I, F>(
        &self,
        storage: &mut Self::Storage,
        ctx: &InitContext<'_>,
        entries: I,
        meta: F,
    ) -> Result<()>
    where
        I: ExactSizeIterator<Item = (Self::Point, Self::Value)>,
        F: FnMut(Uid) -> M;

    /// The smallest and largest coordinates over all stored points, or
    /// `None` when the storage is empty.
    fn bounds(&self, storage: &Self::Storage) -> Option<(Self::Point, Self::Point)>;

    /// Runs a query, returning a lazy result stream.
    fn query<'a>(
        &'a self,
        storage: &'a Self::Storage,
        query: &SpatialQuery<Self::Point>,
    ) -> Result<EntryIter<'a, Self::Point, Self::Value>>;

    /// Iterates all entries in the index's natural order.
    fn iter<'a>(&'a self, storage: &'a Self::Storage) -> EntryIter<'a, Self::Point, Self::Value>;

    /// Visits every value in natural order, mutably where supported.
    ///
    /// Rich adapters hand out their stored values for in-place update;
    /// slim adapters visit scratch copies, so writes are dropped (their
    /// values are bare uids with nothing to update).
    fn update_in_order(
        &self,
        storage: &mut Self::Storage,
        visit: &mut dyn FnMut(&Self::Point, &mut Self::Value),
    );
}
