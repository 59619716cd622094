//! Mapped-mode creation, reopening and bounds.

mod common;

use common::{extrema, spiral, TestAdapter, TestDataset, TestTree};
use burrow::{Error, OpenFlags, OpenMode};
use tempfile::TempDir;

#[test]
fn create_spiral_and_check_bounds() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("spiral");
    let metas = spiral(5000);

    let ds = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &metas,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();

    let (min, max) = ds.bounds().unwrap();
    let (want_min, want_max) = extrema(&metas);
    assert_eq!(min, want_min);
    assert_eq!(max, want_max);
    assert_eq!(ds.max_elements(), 5000);
}

#[test]
fn reopen_returns_identical_metadata() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("reopen");
    let metas = spiral(500);

    {
        TestDataset::create(
            &base,
            OpenFlags::empty(),
            1,
            &metas,
            TestAdapter::default(),
            TestTree::default(),
        )
        .unwrap();
    }

    // Reopening runs the header validation and the offset cross-check.
    let ds = TestDataset::open(
        &base,
        OpenMode::empty(),
        OpenFlags::empty(),
        1,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();

    let mut seen: Vec<_> = ds.iter_metadata().unwrap().copied().collect();
    seen.sort_by_key(|m| m.uid);
    assert_eq!(seen, metas);

    // Every record is reachable by uid, fully written, and its data slice
    // has the advertised size.
    for m in &metas {
        let (meta, data) = ds.element(m.uid).unwrap();
        assert_eq!(meta, m);
        assert_eq!(data.len(), m.size as usize);
        assert!(ds.is_element_clean(m.uid).unwrap());
    }
}

#[test]
fn single_element_dataset_round_trips() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("one");
    let metas = spiral(1);

    let ds = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &metas,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();
    assert_eq!(ds.max_elements(), 1);
    let (min, max) = ds.bounds().unwrap();
    assert_eq!(min, max);
    assert_eq!(ds.element(1).unwrap().0, &metas[0]);
}

#[test]
fn empty_dataset_cannot_be_mapped() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("empty");

    let err = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &[],
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::EmptyMmap { .. }));
}

#[test]
fn mapped_accessors_validate_uids() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("uids");
    let metas = spiral(10);

    let ds = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &metas,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();

    assert!(matches!(
        ds.metadata(0).unwrap_err(),
        Error::InvalidUid { requested: 0, .. }
    ));
    assert!(matches!(
        ds.metadata(11).unwrap_err(),
        Error::InvalidUid {
            maximum: 10,
            requested: 11,
            ..
        }
    ));
    assert!(ds.try_metadata(11).is_none());
    assert!(ds.try_element(3).is_some());
}

#[test]
fn rwp_operations_are_refused_when_mapped() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("guard");
    let metas = spiral(5);

    let ds = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &metas,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();

    let mut out = metas[0];
    assert!(matches!(
        ds.read_element(1, &mut out).unwrap_err(),
        Error::Mmapped { .. }
    ));
    assert!(matches!(
        ds.push_element(&metas[0]).unwrap_err(),
        Error::Mmapped { .. }
    ));
}

#[test]
fn clean_dirty_sentinels_round_trip() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("sentinel");
    let metas = spiral(8);

    let mut ds = TestDataset::create(
        &base,
        OpenFlags::empty(),
        1,
        &metas,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();

    assert_eq!(ds.clean_uids().unwrap().len(), 8);
    assert!(ds.dirty_uids().unwrap().is_empty());

    ds.set_element_dirty(3).unwrap();
    assert!(ds.is_element_dirty(3).unwrap());
    assert!(!ds.is_element_clean(3).unwrap());
    assert!(!ds.is_element_corrupt(3).unwrap());
    assert_eq!(ds.dirty_uids().unwrap(), vec![3]);
    assert_eq!(ds.clean_uids().unwrap().len(), 7);

    ds.set_element_clean(3).unwrap();
    assert_eq!(ds.clean_uids().unwrap().len(), 8);
}

#[test]
fn no_data_dataset_serves_metadata_only() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("nodata");
    let metas = spiral(20);

    {
        TestDataset::create(
            &base,
            OpenFlags::empty(),
            1,
            &metas,
            TestAdapter::default(),
            TestTree::default(),
        )
        .unwrap();
    }

    let ds = TestDataset::open(
        &base,
        OpenMode::empty(),
        OpenFlags::NO_DATA,
        0,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap();

    assert_eq!(ds.iter_metadata().unwrap().count(), 20);
    assert!(matches!(ds.data(1).unwrap_err(), Error::NoData { .. }));
    assert!(matches!(
        ds.iter_elements().unwrap_err(),
        Error::NoData { .. }
    ));

    // NO_DATA requires zero slots.
    let err = TestDataset::open(
        &base,
        OpenMode::empty(),
        OpenFlags::NO_DATA,
        1,
        TestAdapter::default(),
        TestTree::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidNumSlots {
            expected: 0,
            requested: 1,
            ..
        }
    ));
}
