//! Header and check-block guards, corruption detection, unlink.

mod common;

use common::{TestAdapter, TestDataset, TestMeta, TestTree};
use burrow::format::{header_size, RowLayout, HEADER_STRUCT_SIZE};
use burrow::{Error, MetaAdapter, OpenFlags, OpenMode};
use std::path::Path;
use tempfile::TempDir;

fn records(n: usize) -> Vec<TestMeta> {
    (1..=n)
        .map(|i| TestMeta {
            uid: i as u64,
            x: i as f32,
            y: -(i as f32),
            size: 24,
            value: i as u32,
        })
        .collect()
}

fn create(base: &Path) {
    TestDataset::create(
        base,
        OpenFlags::empty(),
        1,
        &records(3),
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();
}

fn reopen(base: &Path) -> Result<TestDataset, Error> {
    TestDataset::open(
        base,
        OpenMode::empty(),
        OpenFlags::empty(),
        1,
        TestAdapter::default(),
        TestTree::default(),
    )
}

fn flip_byte(path: &Path, offset: usize) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[offset] ^= 0x5A;
    std::fs::write(path, &bytes).unwrap();
}

#[test]
fn flipped_header_bytes_fail_at_their_position() {
    // Every header byte is load-bearing; probe a few field positions.
    for &position in &[0usize, 5, 17, 20, 24, 29, 35] {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("hdr");
        create(&base);
        flip_byte(&base.with_extension("meta"), position);

        match reopen(&base).unwrap_err() {
            Error::BaseDataMismatch { position: p, .. } => assert_eq!(p, position),
            other => panic!("expected BaseDataMismatch, got {other}"),
        }
    }
}

#[test]
fn flipped_check_bytes_fail_at_their_position() {
    for &position in &[0usize, 5, 32] {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("check");
        create(&base);
        flip_byte(&base.with_extension("meta"), HEADER_STRUCT_SIZE + position);

        match reopen(&base).unwrap_err() {
            Error::CheckDataMismatch { position: p, .. } => assert_eq!(p, position),
            other => panic!("expected CheckDataMismatch, got {other}"),
        }
    }
}

#[test]
fn foreign_schema_is_refused() {
    // Same record layout, different fingerprint: the check block guards
    // against schema drift the byte sizes cannot see.
    #[derive(Debug, Clone, Copy, Default)]
    struct OtherAdapter;

    impl MetaAdapter for OtherAdapter {
        type Metadata = TestMeta;
        type Point = common::P2;

        fn location(&self, meta: &TestMeta) -> common::P2 {
            burrow::Point([meta.x, meta.y])
        }
        fn uid(&self, meta: &TestMeta) -> u64 {
            meta.uid
        }
        fn set_uid(&self, meta: &mut TestMeta, uid: u64) {
            meta.uid = uid;
        }
        fn data_size(&self, meta: &TestMeta) -> usize {
            meta.size as usize
        }
        fn check(&self) -> &[u8] {
            b"uid@u8/x@f4/y@f4/size@u4/other@u4"
        }
        fn meta_ext(&self) -> &str {
            "meta"
        }
        fn data_ext(&self) -> &str {
            "data"
        }
    }

    let dir = TempDir::new().unwrap();
    let base = dir.path().join("schema");
    create(&base);

    let err = burrow::Dataset::<OtherAdapter, burrow::spatial::rtree::RTree<common::P2, u64>>::open(
        &base,
        OpenMode::empty(),
        OpenFlags::empty(),
        1,
        OtherAdapter,
        Default::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::CheckDataMismatch { .. }));
}

#[test]
fn trailing_meta_bytes_are_detected() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("extra");
    create(&base);

    let meta_path = base.with_extension("meta");
    let mut bytes = std::fs::read(&meta_path).unwrap();
    bytes.extend_from_slice(&[0u8; 10]);
    std::fs::write(&meta_path, &bytes).unwrap();

    assert!(matches!(
        reopen(&base).unwrap_err(),
        Error::ExtraMetaBytes { extra: 10, .. }
    ));
}

#[test]
fn truncated_data_file_fails_the_cross_check() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("shortdata");
    create(&base);

    let data_path = base.with_extension("data");
    let len = std::fs::metadata(&data_path).unwrap().len();
    let bytes = std::fs::read(&data_path).unwrap();
    std::fs::write(&data_path, &bytes[..(len - 64) as usize]).unwrap();

    assert!(matches!(
        reopen(&base).unwrap_err(),
        Error::InconsistentData { .. }
    ));
}

#[test]
fn corrupt_clean_bit_is_reported() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("cleanbit");
    create(&base);

    let adapter = TestAdapter::default();
    let row = RowLayout::new::<TestMeta>();
    let first_clean_bit = header_size(adapter.check().len()) as usize + row.clean_bit_at;
    flip_byte(&base.with_extension("meta"), first_clean_bit);

    let ds = reopen(&base).unwrap();
    assert!(ds.is_element_corrupt(1).unwrap());
    assert!(!ds.is_element_clean(1).unwrap());
    assert!(!ds.is_element_dirty(1).unwrap());
    assert_eq!(ds.corrupt_uids().unwrap(), vec![1]);
    assert_eq!(ds.clean_uids().unwrap(), vec![2, 3]);
}

#[test]
fn equal_extensions_are_refused() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("ext");
    let adapter = TestAdapter {
        meta_ext: "bin",
        data_ext: "bin",
    };

    let err = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &records(3),
        adapter,
        TestTree::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ExtensionsEqual { .. }));
}

#[test]
fn unlink_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("unlink");
    create(&base);

    let adapter = TestAdapter::default();
    let tree = TestTree::default();
    TestDataset::unlink(&base, &adapter, &tree).unwrap();
    assert!(!base.with_extension("meta").exists());
    assert!(!base.with_extension("data").exists());
    TestDataset::unlink(&base, &adapter, &tree).unwrap();
}

#[test]
fn missing_dataset_fails_to_open() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("absent");
    let err = reopen(&base).unwrap_err();
    assert!(matches!(err, Error::Io { op: "open", .. }));
}
