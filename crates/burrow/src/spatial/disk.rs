//! Disk-backed R-tree adapters.
//!
//! The packed tree of [`crate::spatial::rtree`] is persisted into a sidecar
//! file (`<basename>.<ext>`, `ridx` by default) through the mapped-file
//! arena. Creation serializes the node/location/value arrays into the
//! arena with the resize-retry loader; opening maps the file read-only and
//! re-borrows the arrays in place, so a reopened dataset pays no index
//! rebuild cost.
//!
//! [`DiskRTree`] is the slim form: nodes carry bare uids and the dataset
//! resolves data offsets through the metadata rows. [`DiskRTreeRich`] keeps
//! the same file format and adds an in-memory value vector indexed by uid,
//! giving rich (offset-carrying) node values without persisting offsets
//! that only settle after the tree is built.

use crate::error::{Error, Result};
use crate::fio::FilePair;
use crate::meta::Uid;
use crate::spatial::mapped::{
    create_with_retry, open_existing, InitializationInfo, MappedArena, MappedFileParams,
};
use crate::spatial::rtree::{build_tree, RTreeParams, TreeNode, TreeView};
use crate::spatial::{
    ElementRef, EntryIter, InitContext, SpatialIndex, SpatialPoint, SpatialQuery,
};
use bytemuck::{Pod, Zeroable};
use memmap2::{Mmap, MmapMut};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::path::{Path, PathBuf};

/// Default extension of the index sidecar file.
pub const DEFAULT_INDEX_EXTENSION: &str = "ridx";

/// Magic bytes identifying a Burrow index sidecar.
const INDEX_MAGIC: [u8; 8] = *b"BRWRIDX1";

/// Current sidecar format version.
const INDEX_VERSION: u32 = 1;

/// The well-known header at the start of the index sidecar.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct ArenaHeader {
    magic: [u8; 8],
    version: u32,
    _reserved: u32,
    num_entries: u64,
    num_nodes: u64,
    nodes_offset: u64,
    locs_offset: u64,
    values_offset: u64,
    used_bytes: u64,
}

const ARENA_HEADER_SIZE: usize = size_of::<ArenaHeader>();

enum IndexMap {
    Empty,
    Writable(MmapMut),
    ReadOnly(Mmap),
}

impl IndexMap {
    fn bytes(&self) -> Option<&[u8]> {
        match self {
            IndexMap::Empty => None,
            IndexMap::Writable(m) => Some(&m[..]),
            IndexMap::ReadOnly(m) => Some(&m[..]),
        }
    }
}

/// Storage of a disk-backed slim R-tree: the mapped sidecar file.
pub struct DiskRTreeStorage<P> {
    map: IndexMap,
    info: InitializationInfo,
    _marker: PhantomData<fn() -> P>,
}

impl<P> Default for DiskRTreeStorage<P> {
    fn default() -> Self {
        Self {
            map: IndexMap::Empty,
            info: InitializationInfo::default(),
            _marker: PhantomData,
        }
    }
}

impl<P: SpatialPoint + Pod> DiskRTreeStorage<P> {
    /// How the sidecar was created: raw size, used bytes, attempts.
    pub fn initialization_info(&self) -> InitializationInfo {
        self.info
    }

    fn header(&self) -> Option<&ArenaHeader> {
        let bytes = self.map.bytes()?;
        Some(bytemuck::from_bytes(&bytes[..ARENA_HEADER_SIZE]))
    }

    pub(crate) fn view(&self) -> Option<TreeView<'_, P, Uid>> {
        let bytes = self.map.bytes()?;
        let header = self.header()?;
        let nodes_len = header.num_nodes as usize * size_of::<TreeNode<P>>();
        let locs_len = header.num_entries as usize * size_of::<P>();
        let values_len = header.num_entries as usize * size_of::<Uid>();
        let nodes_at = header.nodes_offset as usize;
        let locs_at = header.locs_offset as usize;
        let values_at = header.values_offset as usize;
        Some(TreeView {
            nodes: bytemuck::cast_slice(&bytes[nodes_at..nodes_at + nodes_len]),
            locs: bytemuck::cast_slice(&bytes[locs_at..locs_at + locs_len]),
            values: bytemuck::cast_slice(&bytes[values_at..values_at + values_len]),
        })
    }
}

/// Serializes the packed arrays into the arena, header last.
fn serialize_tree<P: SpatialPoint + Pod>(
    arena: &mut MappedArena,
    nodes: &[TreeNode<P>],
    locs: &[P],
    values: &[Uid],
) -> Result<()> {
    let header_at = arena.alloc(ARENA_HEADER_SIZE, 64)?;
    let nodes_at = arena.alloc(std::mem::size_of_val(nodes), align_of::<TreeNode<P>>())?;
    let locs_at = arena.alloc(std::mem::size_of_val(locs), align_of::<P>())?;
    let values_at = arena.alloc(std::mem::size_of_val(values), align_of::<Uid>())?;

    arena
        .bytes_mut(nodes_at, std::mem::size_of_val(nodes))
        .copy_from_slice(bytemuck::cast_slice(nodes));
    arena
        .bytes_mut(locs_at, std::mem::size_of_val(locs))
        .copy_from_slice(bytemuck::cast_slice(locs));
    arena
        .bytes_mut(values_at, std::mem::size_of_val(values))
        .copy_from_slice(bytemuck::cast_slice(values));

    let header = ArenaHeader {
        magic: INDEX_MAGIC,
        version: INDEX_VERSION,
        _reserved: 0,
        num_entries: locs.len() as u64,
        num_nodes: nodes.len() as u64,
        nodes_offset: nodes_at as u64,
        locs_offset: locs_at as u64,
        values_offset: values_at as u64,
        used_bytes: arena.used() as u64,
    };
    arena
        .bytes_mut(header_at, ARENA_HEADER_SIZE)
        .copy_from_slice(bytemuck::bytes_of(&header));
    Ok(())
}

/// Validates a mapped sidecar against the element count the dataset
/// expects.
fn validate_sidecar<P: SpatialPoint + Pod>(
    bytes: &[u8],
    expected_elements: u64,
    path: &Path,
) -> Result<ArenaHeader> {
    let inconsistent = |actual: u64| Error::InconsistentIndex {
        expected_elements,
        actual_elements: actual,
        path: path.to_path_buf(),
    };

    if bytes.len() < ARENA_HEADER_SIZE {
        return Err(inconsistent(0));
    }
    let header: ArenaHeader = bytemuck::pod_read_unaligned(&bytes[..ARENA_HEADER_SIZE]);
    if header.magic != INDEX_MAGIC || header.version != INDEX_VERSION {
        return Err(inconsistent(0));
    }
    if header.num_entries != expected_elements {
        return Err(inconsistent(header.num_entries));
    }

    let fits = |offset: u64, count: u64, item: usize| {
        count
            .checked_mul(item as u64)
            .and_then(|len| offset.checked_add(len))
            .is_some_and(|end| end <= bytes.len() as u64)
    };
    if !fits(header.nodes_offset, header.num_nodes, size_of::<TreeNode<P>>())
        || !fits(header.locs_offset, header.num_entries, size_of::<P>())
        || !fits(header.values_offset, header.num_entries, size_of::<Uid>())
    {
        return Err(inconsistent(header.num_entries));
    }
    Ok(header)
}

/// Disk-backed slim R-tree adapter: nodes carry bare uids.
pub struct DiskRTree<P> {
    tree: RTreeParams,
    file: MappedFileParams,
    extension: String,
    _marker: PhantomData<fn() -> P>,
}

impl<P> DiskRTree<P> {
    /// Builds the adapter with explicit tree and file parameters.
    pub fn new(tree: RTreeParams, file: MappedFileParams) -> Self {
        Self {
            tree,
            file,
            extension: DEFAULT_INDEX_EXTENSION.to_string(),
            _marker: PhantomData,
        }
    }

    /// Overrides the sidecar extension (without the leading dot).
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }

    /// The path of the index sidecar for a dataset basename.
    pub fn index_path(&self, basename: &Path) -> PathBuf {
        FilePair::file_path(basename, &self.extension)
    }
}

impl<P> Default for DiskRTree<P> {
    fn default() -> Self {
        Self::new(RTreeParams::default(), MappedFileParams::default())
    }
}

impl<M, P: SpatialPoint + Pod> SpatialIndex<M> for DiskRTree<P> {
    type Point = P;
    type Value = Uid;
    type Storage = DiskRTreeStorage<P>;

    const STORES_ELEMENT_OFFSETS: bool = false;

    fn new_storage(&self) -> Self::Storage {
        DiskRTreeStorage::default()
    }

    fn is_empty(&self, storage: &Self::Storage) -> bool {
        storage.view().map_or(true, |v| v.len() == 0)
    }

    fn extra_files(&self, basename: &Path, out: &mut Vec<PathBuf>) {
        out.push(self.index_path(basename));
    }

    fn initialize<I, F>(
        &self,
        storage: &mut Self::Storage,
        ctx: &InitContext<'_>,
        entries: I,
        _meta: F,
    ) -> Result<()>
    where
        I: ExactSizeIterator<Item = (P, Uid)>,
        F: FnMut(Uid) -> M,
    {
        let path = self.index_path(ctx.basename);
        if ctx.is_new {
            if !ctx.can_write {
                return Err(Error::ReadOnly {
                    dataset: ctx.basename.display().to_string(),
                });
            }
            let (nodes, locs, values) =
                build_tree(self.tree.max_node_entries, entries.collect());
            let (map, (), info) = create_with_retry(&path, &self.file, |arena| {
                serialize_tree(arena, &nodes, &locs, &values)
            })?;
            storage.map = IndexMap::Writable(map);
            storage.info = info;
        } else {
            let expected = entries.len() as u64;
            let (map, mut info) = open_existing(&path)?;
            let header = validate_sidecar::<P>(&map[..], expected, &path)?;
            info.used_bytes = header.used_bytes as usize;
            storage.map = IndexMap::ReadOnly(map);
            storage.info = info;
        }
        Ok(())
    }

    fn bounds(&self, storage: &Self::Storage) -> Option<(P, P)> {
        storage.view().and_then(|v| v.bounds())
    }

    fn query<'a>(
        &'a self,
        storage: &'a Self::Storage,
        query: &SpatialQuery<P>,
    ) -> Result<EntryIter<'a, P, Uid>> {
        match storage.view() {
            Some(view) => Ok(view.query(query)),
            None => Ok(Box::new(std::iter::empty())),
        }
    }

    fn iter<'a>(&'a self, storage: &'a Self::Storage) -> EntryIter<'a, P, Uid> {
        match storage.view() {
            Some(view) => Box::new(view.iter()),
            None => Box::new(std::iter::empty()),
        }
    }

    fn update_in_order(
        &self,
        storage: &mut Self::Storage,
        visit: &mut dyn FnMut(&P, &mut Uid),
    ) {
        // Slim nodes live in a read-only mapping and carry nothing to
        // update, so the visit sees scratch copies.
        if let Some(view) = storage.view() {
            for (p, uid) in view.iter() {
                let mut scratch = uid;
                visit(&p, &mut scratch);
            }
        }
    }
}

/// Storage of the rich disk adapter: the mapped tree plus the in-memory
/// value vector, indexed by uid.
pub struct DiskRTreeRichStorage<P> {
    slim: DiskRTreeStorage<P>,
    values: Vec<ElementRef>,
}

impl<P> Default for DiskRTreeRichStorage<P> {
    fn default() -> Self {
        Self {
            slim: DiskRTreeStorage::default(),
            values: Vec::new(),
        }
    }
}

impl<P: SpatialPoint + Pod> DiskRTreeRichStorage<P> {
    /// How the sidecar was created: raw size, used bytes, attempts.
    pub fn initialization_info(&self) -> InitializationInfo {
        self.slim.initialization_info()
    }
}

/// Disk-backed R-tree with an in-memory value vector.
///
/// Same sidecar format as [`DiskRTree`]; node values resolve through the
/// vector, so iteration and queries return offset-carrying
/// [`ElementRef`] values without a metadata-row lookup.
pub struct DiskRTreeRich<P> {
    slim: DiskRTree<P>,
}

impl<P> DiskRTreeRich<P> {
    /// Builds the adapter with explicit tree and file parameters.
    pub fn new(tree: RTreeParams, file: MappedFileParams) -> Self {
        Self {
            slim: DiskRTree::new(tree, file),
        }
    }

    /// Overrides the sidecar extension (without the leading dot).
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.slim = self.slim.with_extension(extension);
        self
    }
}

impl<P> Default for DiskRTreeRich<P> {
    fn default() -> Self {
        Self {
            slim: DiskRTree::default(),
        }
    }
}

impl<M, P: SpatialPoint + Pod> SpatialIndex<M> for DiskRTreeRich<P> {
    type Point = P;
    type Value = ElementRef;
    type Storage = DiskRTreeRichStorage<P>;

    const STORES_ELEMENT_OFFSETS: bool = true;

    fn new_storage(&self) -> Self::Storage {
        DiskRTreeRichStorage::default()
    }

    fn is_empty(&self, storage: &Self::Storage) -> bool {
        <DiskRTree<P> as SpatialIndex<M>>::is_empty(&self.slim, &storage.slim)
    }

    fn extra_files(&self, basename: &Path, out: &mut Vec<PathBuf>) {
        <DiskRTree<P> as SpatialIndex<M>>::extra_files(&self.slim, basename, out);
    }

    fn initialize<I, F>(
        &self,
        storage: &mut Self::Storage,
        ctx: &InitContext<'_>,
        entries: I,
        meta: F,
    ) -> Result<()>
    where
        I: ExactSizeIterator<Item = (P, ElementRef)>,
        F: FnMut(Uid) -> M,
    {
        let entries: Vec<(P, ElementRef)> = entries.collect();
        let count = entries.len() as u64;

        let mut values = vec![ElementRef::zeroed(); entries.len()];
        for (_, elem) in &entries {
            if elem.uid == 0 || elem.uid > count {
                return Err(Error::InvalidUid {
                    maximum: count,
                    requested: elem.uid,
                    dataset: ctx.basename.display().to_string(),
                });
            }
            values[(elem.uid - 1) as usize] = *elem;
        }
        storage.values = values;

        let slim_entries = entries.iter().map(|(p, elem)| (*p, elem.uid));
        <DiskRTree<P> as SpatialIndex<M>>::initialize(
            &self.slim,
            &mut storage.slim,
            ctx,
            slim_entries,
            meta,
        )
    }

    fn bounds(&self, storage: &Self::Storage) -> Option<(P, P)> {
        <DiskRTree<P> as SpatialIndex<M>>::bounds(&self.slim, &storage.slim)
    }

    fn query<'a>(
        &'a self,
        storage: &'a Self::Storage,
        query: &SpatialQuery<P>,
    ) -> Result<EntryIter<'a, P, ElementRef>> {
        let values = &storage.values;
        let inner =
            <DiskRTree<P> as SpatialIndex<M>>::query(&self.slim, &storage.slim, query)?;
        Ok(Box::new(
            inner.map(move |(p, uid)| (p, values[(uid - 1) as usize])),
        ))
    }

    fn iter<'a>(&'a self, storage: &'a Self::Storage) -> EntryIter<'a, P, ElementRef> {
        let values = &storage.values;
        let inner = <DiskRTree<P> as SpatialIndex<M>>::iter(&self.slim, &storage.slim);
        Box::new(inner.map(move |(p, uid)| (p, values[(uid - 1) as usize])))
    }

    fn update_in_order(
        &self,
        storage: &mut Self::Storage,
        visit: &mut dyn FnMut(&P, &mut ElementRef),
    ) {
        let DiskRTreeRichStorage { slim, values } = storage;
        if let Some(view) = slim.view() {
            for (p, uid) in view.iter() {
                visit(&p, &mut values[(uid - 1) as usize]);
            }
        }
    }
}
