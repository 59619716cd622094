//! Burrow - spatially indexed on-disk dataset storage engine.
//!
//! This crate stores a collection of fixed-schema records, each located at
//! a point in N-dimensional space and paired with an opaque data blob, as a
//! metadata/data file pair with a pluggable spatial index on top.
//!
//! # Components
//!
//! - [`Dataset`]: the facade: create from a record sequence, open
//!   existing, access by uid, spatial queries, push/rewrite in descriptor
//!   mode
//! - [`MetaAdapter`]: the contract a user record type implements
//! - [`spatial::rtree::RTree`] / [`spatial::disk::DiskRTree`] /
//!   [`spatial::multiindex::MultiIndex`]: spatial adapters
//!
//! # Example
//!
//! ```rust,ignore
//! use burrow::{Dataset, OpenFlags, OpenMode, SpatialQuery};
//! use burrow::spatial::rtree::RTree;
//!
//! // Create a dataset from records carrying uids 1..=N.
//! let ds = Dataset::create("/data/survey", OpenFlags::empty(), 1,
//!     &records, adapter, RTree::default())?;
//!
//! // Spatial query over the mapped dataset.
//! let hits = ds.query_elements(&SpatialQuery::closed_interval(lo, hi))?;
//! for (meta, blob) in hits {
//!     // ...
//! }
//!
//! // Append more records later, by descriptor.
//! let ds = Dataset::open("/data/survey", OpenMode::WRITE,
//!     OpenFlags::RWP | OpenFlags::ALLOW_UNSORTED, 1, adapter, rtree)?;
//! let uid = ds.push_element_data(&record, &blob)?;
//! ```

#![deny(missing_docs)]

pub mod dataset;
pub mod error;
pub mod fio;
pub mod format;
pub mod meta;
pub mod spatial;

pub use dataset::{Dataset, ElementIter, MetaIter, OpenFlags, OpenMode, ReadMetaIter};
pub use error::{Error, Result};
pub use meta::{MetaAdapter, Uid};
pub use spatial::{ElementRef, Point, SpatialPoint, SpatialQuery};
