//! Descriptor-mode (RWP) push, read and rewrite.

mod common;

use common::{TestAdapter, TestDataset, TestMeta, TestTree};
use burrow::{Error, OpenFlags, OpenMode};
use bytemuck::Zeroable;
use tempfile::TempDir;

fn record(i: u32) -> TestMeta {
    TestMeta {
        uid: 0, // assigned by push
        x: i as f32 * 2.5,
        y: -(i as f32),
        size: 16 + (i % 5) * 8,
        value: i * 7,
    }
}

fn blob(meta: &TestMeta, salt: u8) -> Vec<u8> {
    (0..meta.size as usize)
        .map(|j| (j as u8).wrapping_mul(31).wrapping_add(salt))
        .collect()
}

fn open_rwp(base: &std::path::Path, mode: OpenMode) -> TestDataset {
    TestDataset::open(
        base,
        mode,
        OpenFlags::RWP | OpenFlags::ALLOW_UNSORTED,
        1,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap()
}

#[test]
fn push_reopen_push_reaches_one_hundred() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("push");

    // First session: 50 records.
    let mut written = Vec::new();
    {
        let ds = open_rwp(&base, OpenMode::NEW);
        for i in 0..50u32 {
            let meta = record(i);
            let data = blob(&meta, 1);
            let uid = ds.push_element_data(&meta, &data).unwrap();
            assert_eq!(uid, i as u64 + 1);
            written.push((uid, meta, data));
        }
        ds.sync_metadata().unwrap();
        ds.sync_data().unwrap();
    }

    // Second session: everything reads back, then 50 more.
    {
        let ds = open_rwp(&base, OpenMode::WRITE);
        let mut meta = TestMeta::zeroed();
        let mut data = Vec::new();
        for (uid, want_meta, want_data) in &written {
            assert!(ds.read_element_data(*uid, &mut meta, &mut data, 0).unwrap());
            assert_eq!(meta.uid, *uid);
            assert_eq!(meta.x, want_meta.x);
            assert_eq!(meta.size, want_meta.size);
            assert_eq!(&data, want_data);
        }
        for i in 50..100u32 {
            let meta = record(i);
            let uid = ds.push_element_data(&meta, &blob(&meta, 1)).unwrap();
            assert_eq!(uid, i as u64 + 1);
        }
    }

    // Final session: uids 1..=100 in insertion order.
    let ds = open_rwp(&base, OpenMode::empty());
    let uids: Vec<u64> = ds
        .read_metadata_iter()
        .unwrap()
        .map(|m| m.unwrap().uid)
        .collect();
    assert_eq!(uids, (1..=100).collect::<Vec<_>>());
}

#[test]
fn read_past_the_end_is_clean_eof() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("eof");
    let ds = open_rwp(&base, OpenMode::NEW);

    for i in 0..3u32 {
        ds.push_element(&record(i)).unwrap();
    }

    let mut meta = TestMeta::zeroed();
    assert!(ds.read_element(3, &mut meta).unwrap());
    assert!(!ds.read_element(4, &mut meta).unwrap());
    assert!(matches!(
        ds.read_element(0, &mut meta).unwrap_err(),
        Error::InvalidUid { requested: 0, .. }
    ));
}

#[test]
fn rewrite_preserves_layout_and_refuses_resizes() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("rewrite");
    let ds = open_rwp(&base, OpenMode::NEW);

    for i in 0..10u32 {
        let meta = record(i);
        ds.push_element_data(&meta, &blob(&meta, 1)).unwrap();
    }

    let mut meta = TestMeta::zeroed();
    assert!(ds.read_element(7, &mut meta).unwrap());
    meta.value = 4242;
    let new_data = blob(&meta, 9);
    ds.write_element_data(&meta, &new_data, 0).unwrap();

    let mut back = TestMeta::zeroed();
    let mut data = Vec::new();
    assert!(ds.read_element_data(7, &mut back, &mut data, 0).unwrap());
    assert_eq!(back.value, 4242);
    assert_eq!(data, new_data);

    // Changing the data size of an existing record is refused.
    back.size += 64;
    assert!(matches!(
        ds.write_element(&back).unwrap_err(),
        Error::InvalidDataSize { .. }
    ));

    // Writing a uid that was never pushed is refused.
    let mut unknown = record(3);
    unknown.uid = 99;
    assert!(matches!(
        ds.write_element(&unknown).unwrap_err(),
        Error::InvalidUid { requested: 99, .. }
    ));
}

#[test]
fn bulk_read_stops_at_first_missing_uid() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("bulk");
    let ds = open_rwp(&base, OpenMode::NEW);

    let uids = ds
        .push_elements(&(0..5u32).map(record).collect::<Vec<_>>())
        .unwrap();
    assert_eq!(uids, vec![1, 2, 3, 4, 5]);

    let mut out = Vec::new();
    let read = ds.read_elements(&[1, 2, 3, 9, 4], &mut out).unwrap();
    assert_eq!(read, 3);
    assert_eq!(out.len(), 3);
}

#[test]
fn push_into_multi_slot_dataset_is_refused() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("multislot");

    // Multi-slot datasets are created whole, in mapped mode.
    let metas: Vec<TestMeta> = (0..4u32)
        .map(|i| {
            let mut m = record(i);
            m.uid = i as u64 + 1;
            m
        })
        .collect();
    {
        TestDataset::create(
            &base,
            OpenFlags::empty(),
            3,
            &metas,
            TestAdapter::default(),
            TestTree::default(),
        )
        .unwrap();
    }

    let ds = TestDataset::open(
        &base,
        OpenMode::WRITE,
        OpenFlags::RWP | OpenFlags::ALLOW_UNSORTED,
        3,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();
    assert!(matches!(
        ds.push_element(&record(9)).unwrap_err(),
        Error::InvalidNumSlots {
            expected: 1,
            requested: 3,
            ..
        }
    ));
}

#[test]
fn rwp_without_allow_unsorted_is_refused() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("unsorted");

    let err = TestDataset::open(
        &base,
        OpenMode::NEW,
        OpenFlags::RWP,
        1,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnsortedData { .. }));
}

#[test]
fn pushed_dataset_reopens_mapped_with_queries() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("promote");

    {
        let ds = open_rwp(&base, OpenMode::NEW);
        for i in 0..25u32 {
            let meta = record(i);
            ds.push_element_data(&meta, &blob(&meta, 1)).unwrap();
        }
    }

    // Pushed data follows insertion order, not the index order, so the
    // mapped reopen must allow unsorted data.
    let ds = TestDataset::open(
        &base,
        OpenMode::empty(),
        OpenFlags::ALLOW_UNSORTED,
        1,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();
    assert_eq!(ds.max_elements(), 25);
    let (meta, data) = ds.find_element(&burrow::Point([5.0, -2.0])).unwrap();
    assert_eq!(meta.uid, 3);
    assert_eq!(data, blob(meta, 1));
}
