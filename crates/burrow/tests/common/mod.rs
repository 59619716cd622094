//! Shared fixture types for the dataset integration tests.
#![allow(dead_code)]

use burrow::spatial::rtree::RTree;
use burrow::{Dataset, MetaAdapter, Point, Uid};
use bytemuck::{Pod, Zeroable};

/// The record type used across the integration suites.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TestMeta {
    pub uid: u64,
    pub x: f32,
    pub y: f32,
    pub size: u32,
    pub value: u32,
}

/// Two-dimensional float point shared by the fixture adapter and indices.
pub type P2 = Point<f32, 2>;

/// Metadata adapter over [`TestMeta`], with overridable extensions so the
/// format tests can provoke filename clashes.
#[derive(Debug, Clone, Copy)]
pub struct TestAdapter {
    pub meta_ext: &'static str,
    pub data_ext: &'static str,
}

impl Default for TestAdapter {
    fn default() -> Self {
        Self {
            meta_ext: "meta",
            data_ext: "data",
        }
    }
}

impl MetaAdapter for TestAdapter {
    type Metadata = TestMeta;
    type Point = P2;

    fn location(&self, meta: &TestMeta) -> P2 {
        Point([meta.x, meta.y])
    }

    fn uid(&self, meta: &TestMeta) -> Uid {
        meta.uid
    }

    fn set_uid(&self, meta: &mut TestMeta, uid: Uid) {
        meta.uid = uid;
    }

    fn data_size(&self, meta: &TestMeta) -> usize {
        meta.size as usize
    }

    fn check(&self) -> &[u8] {
        b"uid@u8/x@f4/y@f4/size@u4/value@u4"
    }

    fn meta_ext(&self) -> &str {
        self.meta_ext
    }

    fn data_ext(&self) -> &str {
        self.data_ext
    }
}

/// Slim in-memory tree over the fixture point type.
pub type TestTree = RTree<P2, Uid>;

/// The dataset specialization used by most suites.
pub type TestDataset = Dataset<TestAdapter, TestTree>;

/// Records on the spiral `100 * (n - 0.8 i) * (cos(i/100), sin(i/100))`
/// with `size_i = 33 i + 1`, uids `1..=n`.
pub fn spiral(n: usize) -> Vec<TestMeta> {
    (1..=n)
        .map(|i| {
            let t = i as f32 / 100.0;
            let r = 100.0 * (n as f32 - 0.8 * i as f32);
            TestMeta {
                uid: i as u64,
                x: r * t.cos(),
                y: r * t.sin(),
                size: 33 * i as u32 + 1,
                value: i as u32,
            }
        })
        .collect()
}

/// Per-axis extrema of a record sequence.
pub fn extrema(metas: &[TestMeta]) -> (P2, P2) {
    let mut min = [f32::INFINITY; 2];
    let mut max = [f32::NEG_INFINITY; 2];
    for m in metas {
        min[0] = min[0].min(m.x);
        min[1] = min[1].min(m.y);
        max[0] = max[0].max(m.x);
        max[1] = max[1].max(m.y);
    }
    (Point(min), Point(max))
}
