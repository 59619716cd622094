//! Composite adapter: a spatial primary plus ordered secondary indices.
//!
//! The primary is any [`SpatialIndex`] (typically an R-tree); the secondary
//! side is a list of named ordered indices keyed by values extracted from
//! the metadata. Spatial operations delegate to the primary unchanged; the
//! secondary side answers closed-interval queries in key space
//! (`lower_bound..=upper_bound` over uids) and reports per-index min/max
//! bounds. Secondary keys must be unique.

use crate::error::{Error, Result};
use crate::meta::Uid;
use crate::spatial::{EntryIter, InitContext, SpatialIndex, SpatialQuery};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// One named secondary index: a key extractor over the metadata.
pub struct OrderedIndexSpec<M, K> {
    /// Name the index can be looked up by.
    pub name: &'static str,
    /// Extracts the key of a record.
    pub extract: fn(&M) -> K,
}

impl<M, K> Clone for OrderedIndexSpec<M, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M, K> Copy for OrderedIndexSpec<M, K> {}

/// Storage of the composite adapter: the primary's storage plus one ordered
/// map per secondary index.
pub struct MultiIndexStorage<St, K> {
    primary: St,
    secondary: Vec<BTreeMap<K, Uid>>,
}

impl<St, K> MultiIndexStorage<St, K> {
    /// The primary adapter's storage.
    pub fn primary(&self) -> &St {
        &self.primary
    }
}

/// A spatial primary adapter wrapped with ordered secondary indices.
pub struct MultiIndex<S, M, K> {
    primary: S,
    specs: Vec<OrderedIndexSpec<M, K>>,
}

impl<S, M, K: Ord + Copy> MultiIndex<S, M, K> {
    /// Wraps a primary adapter with no secondary indices yet.
    pub fn new(primary: S) -> Self {
        Self {
            primary,
            specs: Vec::new(),
        }
    }

    /// Adds a secondary index.
    pub fn with_index(mut self, spec: OrderedIndexSpec<M, K>) -> Self {
        self.specs.push(spec);
        self
    }

    /// Number of secondary indices.
    pub fn index_count(&self) -> usize {
        self.specs.len()
    }

    /// Position of a secondary index by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    /// Closed-interval query in key space over one secondary index.
    ///
    /// Returns the uids of every record whose key satisfies
    /// `min <= key <= max`, in key order.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn key_query<'a, St>(
        &self,
        storage: &'a MultiIndexStorage<St, K>,
        index: usize,
        min: K,
        max: K,
    ) -> Box<dyn Iterator<Item = Uid> + 'a> {
        let map = &storage.secondary[index];
        if min > max {
            return Box::new(std::iter::empty());
        }
        Box::new(map.range(min..=max).map(|(_, &uid)| uid))
    }

    /// Smallest and largest key of one secondary index, or `None` when
    /// empty.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn key_bounds<St>(
        &self,
        storage: &MultiIndexStorage<St, K>,
        index: usize,
    ) -> Option<(K, K)> {
        let map = &storage.secondary[index];
        let (&min, _) = map.first_key_value()?;
        let (&max, _) = map.last_key_value()?;
        Some((min, max))
    }
}

impl<S, M, K> SpatialIndex<M> for MultiIndex<S, M, K>
where
    S: SpatialIndex<M>,
    K: Ord + Copy + Debug + Send + Sync + 'static,
{
    type Point = S::Point;
    type Value = S::Value;
    type Storage = MultiIndexStorage<S::Storage, K>;

    const STORES_ELEMENT_OFFSETS: bool = S::STORES_ELEMENT_OFFSETS;

    fn new_storage(&self) -> Self::Storage {
        MultiIndexStorage {
            primary: self.primary.new_storage(),
            secondary: vec![BTreeMap::new(); self.specs.len()],
        }
    }

    fn is_empty(&self, storage: &Self::Storage) -> bool {
        self.primary.is_empty(&storage.primary)
    }

    fn points_equal(&self, a: &Self::Point, b: &Self::Point) -> bool {
        self.primary.points_equal(a, b)
    }

    fn extra_files(&self, basename: &Path, out: &mut Vec<PathBuf>) {
        self.primary.extra_files(basename, out);
    }

    fn initialize<I, F>(
        &self,
        storage: &mut Self::Storage,
        ctx: &InitContext<'_>,
        entries: I,
        mut meta: F,
    ) -> Result<()>
    where
        I: ExactSizeIterator<Item = (Self::Point, Self::Value)>,
        F: FnMut(Uid) -> M,
    {
        use crate::spatial::NodeValue;

        let entries: Vec<(Self::Point, Self::Value)> = entries.collect();

        let mut secondary = vec![BTreeMap::new(); self.specs.len()];
        for (_, value) in &entries {
            let uid = value.uid();
            let m = meta(uid);
            for (map, spec) in secondary.iter_mut().zip(self.specs.iter()) {
                let key = (spec.extract)(&m);
                if let Some(previous) = map.insert(key, uid) {
                    return Err(Error::InconsistentMeta {
                        context: "duplicate secondary key",
                        expected: previous,
                        actual: uid,
                        dataset: ctx.basename.display().to_string(),
                    });
                }
            }
        }
        storage.secondary = secondary;

        self.primary
            .initialize(&mut storage.primary, ctx, entries.into_iter(), meta)
    }

    fn bounds(&self, storage: &Self::Storage) -> Option<(Self::Point, Self::Point)> {
        self.primary.bounds(&storage.primary)
    }

    fn query<'a>(
        &'a self,
        storage: &'a Self::Storage,
        query: &SpatialQuery<Self::Point>,
    ) -> Result<EntryIter<'a, Self::Point, Self::Value>> {
        self.primary.query(&storage.primary, query)
    }

    fn iter<'a>(&'a self, storage: &'a Self::Storage) -> EntryIter<'a, Self::Point, Self::Value> {
        self.primary.iter(&storage.primary)
    }

    fn update_in_order(
        &self,
        storage: &mut Self::Storage,
        visit: &mut dyn FnMut(&Self::Point, &mut Self::Value),
    ) {
        self.primary.update_in_order(&mut storage.primary, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::rtree::RTree;
    use crate::spatial::Point;
    use std::path::Path;

    type P2 = Point<f32, 2>;

    #[derive(Clone, Copy)]
    struct Rec {
        depth: i64,
    }

    fn index() -> MultiIndex<RTree<P2, Uid>, Rec, i64> {
        MultiIndex::new(RTree::default()).with_index(OrderedIndexSpec {
            name: "depth",
            extract: |r: &Rec| r.depth,
        })
    }

    fn load(
        mi: &MultiIndex<RTree<P2, Uid>, Rec, i64>,
        n: usize,
    ) -> MultiIndexStorage<crate::spatial::rtree::RTreeStorage<P2, Uid>, i64> {
        let mut storage = mi.new_storage();
        let entries: Vec<(P2, Uid)> = (0..n)
            .map(|i| (Point([i as f32, 0.0]), i as Uid + 1))
            .collect();
        let ctx = InitContext {
            basename: Path::new("mi-test"),
            is_new: true,
            can_write: true,
        };
        mi.initialize(&mut storage, &ctx, entries.into_iter(), |uid| Rec {
            depth: uid as i64 * 10,
        })
        .unwrap();
        storage
    }

    #[test]
    fn key_range_returns_matching_uids() {
        let mi = index();
        let storage = load(&mi, 20);
        let idx = mi.index_of("depth").unwrap();
        let uids: Vec<Uid> = mi.key_query(&storage, idx, 30, 50).collect();
        assert_eq!(uids, vec![3, 4, 5]);
    }

    #[test]
    fn key_bounds_are_per_index_extrema() {
        let mi = index();
        let storage = load(&mi, 20);
        assert_eq!(mi.key_bounds(&storage, 0), Some((10, 200)));
    }

    #[test]
    fn inverted_range_is_empty() {
        let mi = index();
        let storage = load(&mi, 5);
        assert_eq!(mi.key_query(&storage, 0, 50, 30).count(), 0);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mi: MultiIndex<RTree<P2, Uid>, Rec, i64> =
            MultiIndex::new(RTree::default()).with_index(OrderedIndexSpec {
                name: "constant",
                extract: |_: &Rec| 7,
            });
        let mut storage = mi.new_storage();
        let entries: Vec<(P2, Uid)> =
            vec![(Point([0.0, 0.0]), 1), (Point([1.0, 0.0]), 2)];
        let ctx = InitContext {
            basename: Path::new("mi-test"),
            is_new: true,
            can_write: true,
        };
        let err = mi
            .initialize(&mut storage, &ctx, entries.into_iter(), |_| Rec { depth: 0 })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InconsistentMeta {
                context: "duplicate secondary key",
                ..
            }
        ));
    }
}
