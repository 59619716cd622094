//! Dataset creation and query benchmarks.

use burrow::spatial::rtree::RTree;
use burrow::{Dataset, MetaAdapter, OpenFlags, Point, SpatialQuery, Uid};
use bytemuck::{Pod, Zeroable};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct BenchMeta {
    uid: u64,
    x: f32,
    y: f32,
    size: u32,
    value: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct BenchAdapter;

impl MetaAdapter for BenchAdapter {
    type Metadata = BenchMeta;
    type Point = Point<f32, 2>;

    fn location(&self, meta: &BenchMeta) -> Point<f32, 2> {
        Point([meta.x, meta.y])
    }
    fn uid(&self, meta: &BenchMeta) -> Uid {
        meta.uid
    }
    fn set_uid(&self, meta: &mut BenchMeta, uid: Uid) {
        meta.uid = uid;
    }
    fn data_size(&self, meta: &BenchMeta) -> usize {
        meta.size as usize
    }
    fn check(&self) -> &[u8] {
        b"uid@u8/x@f4/y@f4/size@u4/value@u4"
    }
    fn meta_ext(&self) -> &str {
        "meta"
    }
    fn data_ext(&self) -> &str {
        "data"
    }
}

type BenchTree = RTree<Point<f32, 2>, Uid>;
type BenchDataset = Dataset<BenchAdapter, BenchTree>;

fn spiral(n: usize) -> Vec<BenchMeta> {
    (1..=n)
        .map(|i| {
            let t = i as f32 / 100.0;
            let r = 100.0 * (n as f32 - 0.8 * i as f32);
            BenchMeta {
                uid: i as u64,
                x: r * t.cos(),
                y: r * t.sin(),
                size: 64,
                value: i as u32,
            }
        })
        .collect()
}

fn bench_create(c: &mut Criterion) {
    let metas = spiral(10_000);
    c.bench_function("create_10k", |b| {
        b.iter(|| {
            let dir = TempDir::new().unwrap();
            let ds = BenchDataset::create(
                dir.path().join("bench"),
                OpenFlags::empty(),
                1,
                black_box(&metas),
                BenchAdapter,
                BenchTree::default(),
            )
            .unwrap();
            black_box(ds.max_elements());
        })
    });
}

fn bench_queries(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let metas = spiral(10_000);
    let ds = BenchDataset::create(
        dir.path().join("bench"),
        OpenFlags::empty(),
        1,
        &metas,
        BenchAdapter,
        BenchTree::default(),
    )
    .unwrap();

    let (min, max) = ds.bounds().unwrap();
    let window = SpatialQuery::closed_interval(
        Point([min.0[0] / 4.0, min.0[1] / 4.0]),
        Point([max.0[0] / 4.0, max.0[1] / 4.0]),
    );
    c.bench_function("interval_query_10k", |b| {
        b.iter(|| {
            let hits: usize = ds.query_metadata(black_box(&window)).unwrap().count();
            black_box(hits)
        })
    });

    let probe = Point([metas[137].x, metas[137].y]);
    c.bench_function("find_element_10k", |b| {
        b.iter(|| {
            let (meta, _) = ds.find_element(black_box(&probe)).unwrap();
            black_box(meta.uid)
        })
    });
}

criterion_group!(benches, bench_create, bench_queries);
criterion_main!(benches);
