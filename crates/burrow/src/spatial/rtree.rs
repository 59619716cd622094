//! Packed in-memory R-tree.
//!
//! The tree is bulk-loaded once (sort-tile-recursive packing) and never
//! mutated afterwards, which matches how datasets use their index: one
//! initialization at create/open time, then queries. The layout is three
//! flat arrays (nodes, locations, values) with every node addressing a
//! contiguous range of children, so the disk-backed adapter
//! ([`crate::spatial::disk`]) can persist the same arrays byte-for-byte.
//!
//! Closed-interval queries descend the tree with an explicit stack and test
//! exact containment per entry; k-nearest queries run a best-first search
//! over a binary heap and return exact results in increasing distance
//! order.

use crate::error::Result;
use crate::spatial::{
    Coordinate, EntryIter, InitContext, NodeValue, SpatialIndex, SpatialPoint, SpatialQuery,
};
use crate::meta::Uid;
use bytemuck::{Pod, Zeroable};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::ops::Range;

/// Parameters controlling tree construction.
#[derive(Debug, Clone, Copy)]
pub struct RTreeParams {
    /// Maximum number of children per node.
    pub max_node_entries: usize,
}

impl Default for RTreeParams {
    fn default() -> Self {
        Self {
            max_node_entries: 16,
        }
    }
}

/// One packed tree node: a bounding box over a contiguous child range.
///
/// Leaf nodes address entries, inner nodes address other nodes. The struct
/// is plain data so node arrays serialize as-is; field order keeps it free
/// of padding for every supported point type.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct TreeNode<P> {
    /// Smallest coordinates of the subtree.
    pub min: P,
    /// Largest coordinates of the subtree.
    pub max: P,
    /// First child index (entry index for leaves, node index otherwise).
    pub first: u64,
    /// Number of children.
    pub count: u32,
    /// 1 for leaf nodes.
    pub leaf: u32,
}

unsafe impl<P: Pod> Zeroable for TreeNode<P> {}
unsafe impl<P: Pod> Pod for TreeNode<P> {}

impl<P: SpatialPoint> TreeNode<P> {
    fn children(&self) -> Range<usize> {
        self.first as usize..self.first as usize + self.count as usize
    }

    fn overlaps(&self, min: &P, max: &P) -> bool {
        (0..P::DIMS).all(|axis| {
            self.min.coord(axis) <= max.coord(axis) && min.coord(axis) <= self.max.coord(axis)
        })
    }

    /// Squared distance from a point to this node's box (zero inside).
    fn min_distance2(&self, point: &P) -> f64 {
        (0..P::DIMS)
            .map(|axis| {
                let p = point.coord(axis).as_f64();
                let lo = self.min.coord(axis).as_f64();
                let hi = self.max.coord(axis).as_f64();
                if p < lo {
                    lo - p
                } else if p > hi {
                    p - hi
                } else {
                    0.0
                }
            })
            .map(|d| d * d)
            .sum()
    }
}

fn contains<P: SpatialPoint>(min: &P, max: &P, point: &P) -> bool {
    min.componentwise_le(point) && point.componentwise_le(max)
}

fn bbox_union<P: SpatialPoint>(points: impl Iterator<Item = (P, P)>) -> Option<(P, P)> {
    let mut result: Option<(P, P)> = None;
    for (lo, hi) in points {
        match &mut result {
            None => result = Some((lo, hi)),
            Some((min, max)) => {
                for axis in 0..P::DIMS {
                    if lo.coord(axis) < min.coord(axis) {
                        min.set_coord(axis, lo.coord(axis));
                    }
                    if hi.coord(axis) > max.coord(axis) {
                        max.set_coord(axis, hi.coord(axis));
                    }
                }
            }
        }
    }
    result
}

/// Sort-tile-recursive arrangement: entries end up ordered so consecutive
/// runs of `max_entries` form spatially tight leaves.
fn str_sort<P: SpatialPoint, V>(items: &mut [(P, V)], axis: usize, max_entries: usize) {
    if items.len() <= max_entries || axis >= P::DIMS {
        return;
    }
    items.sort_unstable_by(|a, b| {
        a.0.coord(axis)
            .partial_cmp(&b.0.coord(axis))
            .unwrap_or(Ordering::Equal)
    });
    if axis + 1 == P::DIMS {
        return;
    }
    let leaves = items.len().div_ceil(max_entries);
    let remaining_axes = (P::DIMS - axis) as f64;
    let slabs = (leaves as f64).powf(1.0 / remaining_axes).ceil() as usize;
    let per_slab = items.len().div_ceil(slabs.max(1));
    for chunk in items.chunks_mut(per_slab.max(1)) {
        str_sort(chunk, axis + 1, max_entries);
    }
}

/// Packs entries into the flat node/location/value arrays.
pub(crate) fn build_tree<P: SpatialPoint, V: NodeValue>(
    max_entries: usize,
    mut entries: Vec<(P, V)>,
) -> (Vec<TreeNode<P>>, Vec<P>, Vec<V>) {
    let max_entries = max_entries.max(2);
    if entries.is_empty() {
        return (Vec::new(), Vec::new(), Vec::new());
    }

    str_sort(&mut entries, 0, max_entries);

    let mut locs = Vec::with_capacity(entries.len());
    let mut values = Vec::with_capacity(entries.len());
    for (p, v) in entries {
        locs.push(p);
        values.push(v);
    }

    let mut nodes: Vec<TreeNode<P>> = Vec::new();

    // Leaf level over contiguous entry runs.
    let mut start = 0usize;
    while start < locs.len() {
        let end = (start + max_entries).min(locs.len());
        let (min, max) = bbox_union(locs[start..end].iter().map(|p| (*p, *p)))
            .expect("leaf ranges are non-empty");
        nodes.push(TreeNode {
            min,
            max,
            first: start as u64,
            count: (end - start) as u32,
            leaf: 1,
        });
        start = end;
    }

    // Upper levels group contiguous runs of the previous level.
    let mut level = 0usize..nodes.len();
    while level.len() > 1 {
        let next_start = nodes.len();
        let mut child = level.start;
        while child < level.end {
            let end = (child + max_entries).min(level.end);
            let (min, max) = bbox_union(nodes[child..end].iter().map(|n| (n.min, n.max)))
                .expect("node ranges are non-empty");
            nodes.push(TreeNode {
                min,
                max,
                first: child as u64,
                count: (end - child) as u32,
                leaf: 0,
            });
            child = end;
        }
        level = next_start..nodes.len();
    }

    (nodes, locs, values)
}

/// A borrowed read view over the packed arrays.
///
/// Both the in-memory storage and the disk-mapped storage produce this
/// view, so iteration and queries are implemented once.
pub(crate) struct TreeView<'a, P, V> {
    pub nodes: &'a [TreeNode<P>],
    pub locs: &'a [P],
    pub values: &'a [V],
}

impl<P, V> Clone for TreeView<'_, P, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, V> Copy for TreeView<'_, P, V> {}

impl<'a, P: SpatialPoint, V: NodeValue> TreeView<'a, P, V> {
    pub fn len(&self) -> usize {
        self.locs.len()
    }

    fn root(&self) -> Option<usize> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(self.nodes.len() - 1)
        }
    }

    pub fn bounds(&self) -> Option<(P, P)> {
        self.root().map(|r| (self.nodes[r].min, self.nodes[r].max))
    }

    pub fn iter(&self) -> impl Iterator<Item = (P, V)> + 'a {
        let locs = self.locs;
        let values = self.values;
        locs.iter().copied().zip(values.iter().copied())
    }

    pub fn intersect(&self, min: P, max: P) -> IntersectIter<'a, P, V> {
        IntersectIter {
            view: *self,
            min,
            max,
            node_stack: self.root().into_iter().collect(),
            entry_cursor: 0..0,
        }
    }

    pub fn nearest(&self, point: P, k: usize) -> NearestIter<'a, P, V> {
        let mut heap = BinaryHeap::new();
        if let Some(root) = self.root() {
            heap.push(HeapEntry {
                distance2: self.nodes[root].min_distance2(&point),
                item: HeapItem::Node(root),
            });
        }
        NearestIter {
            view: *self,
            point,
            remaining: k,
            heap,
        }
    }

    pub fn query(&self, query: &SpatialQuery<P>) -> EntryIter<'a, P, V> {
        match query {
            SpatialQuery::ClosedInterval { min, max } => Box::new(self.intersect(*min, *max)),
            SpatialQuery::Nearest { point, k } => Box::new(self.nearest(*point, *k)),
        }
    }
}

/// Lazy closed-interval query: stack-based descent, exact containment per
/// entry.
pub(crate) struct IntersectIter<'a, P, V> {
    view: TreeView<'a, P, V>,
    min: P,
    max: P,
    node_stack: Vec<usize>,
    entry_cursor: Range<usize>,
}

impl<P: SpatialPoint, V: NodeValue> Iterator for IntersectIter<'_, P, V> {
    type Item = (P, V);

    fn next(&mut self) -> Option<(P, V)> {
        loop {
            if let Some(i) = self.entry_cursor.next() {
                let p = self.view.locs[i];
                if contains(&self.min, &self.max, &p) {
                    return Some((p, self.view.values[i]));
                }
                continue;
            }
            let node = self.view.nodes[self.node_stack.pop()?];
            if !node.overlaps(&self.min, &self.max) {
                continue;
            }
            if node.leaf == 1 {
                self.entry_cursor = node.children();
            } else {
                self.node_stack.extend(node.children());
            }
        }
    }
}

enum HeapItem {
    Node(usize),
    Entry(usize),
}

struct HeapEntry {
    distance2: f64,
    item: HeapItem,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance2 == other.distance2
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Distances are finite; invert so the max-heap pops the smallest.
        self.distance2
            .partial_cmp(&other.distance2)
            .unwrap_or(Ordering::Equal)
            .reverse()
    }
}

/// Lazy exact k-nearest query: best-first traversal over a binary heap.
pub(crate) struct NearestIter<'a, P, V> {
    view: TreeView<'a, P, V>,
    point: P,
    remaining: usize,
    heap: BinaryHeap<HeapEntry>,
}

impl<P: SpatialPoint, V: NodeValue> Iterator for NearestIter<'_, P, V> {
    type Item = (P, V);

    fn next(&mut self) -> Option<(P, V)> {
        if self.remaining == 0 {
            return None;
        }
        while let Some(HeapEntry { item, .. }) = self.heap.pop() {
            match item {
                HeapItem::Entry(i) => {
                    self.remaining -= 1;
                    return Some((self.view.locs[i], self.view.values[i]));
                }
                HeapItem::Node(n) => {
                    let node = &self.view.nodes[n];
                    if node.leaf == 1 {
                        for i in node.children() {
                            self.heap.push(HeapEntry {
                                distance2: self.point.distance2(&self.view.locs[i]),
                                item: HeapItem::Entry(i),
                            });
                        }
                    } else {
                        for c in node.children() {
                            self.heap.push(HeapEntry {
                                distance2: self.view.nodes[c].min_distance2(&self.point),
                                item: HeapItem::Node(c),
                            });
                        }
                    }
                }
            }
        }
        None
    }
}

/// The storage of an in-memory packed R-tree.
pub struct RTreeStorage<P, V> {
    pub(crate) nodes: Vec<TreeNode<P>>,
    pub(crate) locs: Vec<P>,
    pub(crate) values: Vec<V>,
}

impl<P, V> Default for RTreeStorage<P, V> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            locs: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<P: SpatialPoint, V: NodeValue> RTreeStorage<P, V> {
    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.locs.len()
    }

    /// True if the storage holds no entries.
    pub fn is_empty(&self) -> bool {
        self.locs.is_empty()
    }

    pub(crate) fn view(&self) -> TreeView<'_, P, V> {
        TreeView {
            nodes: &self.nodes,
            locs: &self.locs,
            values: &self.values,
        }
    }
}

/// In-memory R-tree spatial adapter.
///
/// `V` selects the slim ([`Uid`]) or rich
/// ([`crate::spatial::ElementRef`]) node value form.
pub struct RTree<P, V = Uid> {
    params: RTreeParams,
    _marker: PhantomData<fn() -> (P, V)>,
}

impl<P, V> RTree<P, V> {
    /// Builds the adapter with explicit parameters.
    pub fn new(params: RTreeParams) -> Self {
        Self {
            params,
            _marker: PhantomData,
        }
    }

    /// The construction parameters.
    pub fn params(&self) -> RTreeParams {
        self.params
    }
}

impl<P, V> Default for RTree<P, V> {
    fn default() -> Self {
        Self::new(RTreeParams::default())
    }
}

impl<M, P: SpatialPoint, V: NodeValue> SpatialIndex<M> for RTree<P, V> {
    type Point = P;
    type Value = V;
    type Storage = RTreeStorage<P, V>;

    const STORES_ELEMENT_OFFSETS: bool = V::CARRIES_OFFSET;

    fn new_storage(&self) -> Self::Storage {
        RTreeStorage::default()
    }

    fn is_empty(&self, storage: &Self::Storage) -> bool {
        storage.is_empty()
    }

    fn initialize<I, F>(
        &self,
        storage: &mut Self::Storage,
        _ctx: &InitContext<'_>,
        entries: I,
        _meta: F,
    ) -> Result<()>
    where
        I: ExactSizeIterator<Item = (P, V)>,
        F: FnMut(Uid) -> M,
    {
        let entries: Vec<(P, V)> = entries.collect();
        let (nodes, locs, values) = build_tree(self.params.max_node_entries, entries);
        *storage = RTreeStorage {
            nodes,
            locs,
            values,
        };
        Ok(())
    }

    fn bounds(&self, storage: &Self::Storage) -> Option<(P, P)> {
        storage.view().bounds()
    }

    fn query<'a>(
        &'a self,
        storage: &'a Self::Storage,
        query: &SpatialQuery<P>,
    ) -> Result<EntryIter<'a, P, V>> {
        Ok(storage.view().query(query))
    }

    fn iter<'a>(&'a self, storage: &'a Self::Storage) -> EntryIter<'a, P, V> {
        Box::new(storage.view().iter())
    }

    fn update_in_order(
        &self,
        storage: &mut Self::Storage,
        visit: &mut dyn FnMut(&P, &mut V),
    ) {
        for (loc, value) in storage.locs.iter().zip(storage.values.iter_mut()) {
            visit(loc, value);
        }
    }
}
