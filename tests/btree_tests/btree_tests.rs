//! B-tree Tests
//!
//! Tests verify:
//! - Random add/del sequences match an in-memory sorted map after reopening
//! - Multi-component tags are stored, replaced and removed whole
//! - Key and tag length limits
//! - Readers keep a consistent view while the writer commits newer revisions
//! - Cancel and no-op commit
//! - A commit that fails on I/O leaves the committed revision untouched

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use tessera::btree::{Btree, TablePath, MAX_KEY_LEN};
use tessera::TesseraError;

fn setup(block_size: usize) -> (TempDir, TablePath) {
    let dir = TempDir::new().unwrap();
    let path = TablePath::new(dir.path(), "postlist_");
    Btree::create(&path, block_size).unwrap();
    (dir, path)
}

fn open_writer(path: &TablePath) -> Btree {
    Btree::open_to_write(path, None).unwrap().unwrap()
}

fn contents(tree: &Btree) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.iter().collect::<tessera::Result<Vec<_>>>().unwrap()
}

/// Put a non-empty directory where the next commit renames its base file
fn occupy_next_base(tree: &Btree) -> PathBuf {
    let target = tree.path().base_file(tree.base_letter().other());
    if target.is_file() {
        fs::remove_file(&target).unwrap();
    }
    fs::create_dir(&target).unwrap();
    fs::write(target.join("occupied"), b"x").unwrap();
    target
}

fn temp_base(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_add_and_find() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);

    assert!(tree.add(b"apple", b"red").unwrap());
    assert!(tree.add(b"banana", b"yellow").unwrap());

    assert!(tree.find_key(b"apple").unwrap());
    assert!(!tree.find_key(b"cherry").unwrap());
    assert_eq!(tree.find_tag(b"banana").unwrap(), Some(b"yellow".to_vec()));
    assert_eq!(tree.find_tag(b"cherry").unwrap(), None);
    assert_eq!(tree.item_count(), 2);
    assert!(tree.is_modified());
}

#[test]
fn test_add_identical_tag_is_unchanged() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"k", b"v").unwrap();
    tree.commit(1).unwrap();

    assert!(!tree.add(b"k", b"v").unwrap());
    assert!(!tree.is_modified());
    assert!(tree.add(b"k", b"w").unwrap());
    assert_eq!(tree.find_tag(b"k").unwrap(), Some(b"w".to_vec()));
    assert_eq!(tree.item_count(), 1);
}

#[test]
fn test_empty_tag() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"empty", b"").unwrap();
    tree.commit(1).unwrap();

    let reader = Btree::open_to_read(&path, None).unwrap();
    assert!(reader.find_key(b"empty").unwrap());
    assert_eq!(reader.find_tag(b"empty").unwrap(), Some(Vec::new()));
}

#[test]
fn test_empty_key() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"", b"root").unwrap();
    tree.add(b"a", b"1").unwrap();
    assert_eq!(tree.find_tag(b"").unwrap(), Some(b"root".to_vec()));
    assert_eq!(contents(&tree)[0], (Vec::new(), b"root".to_vec()));
}

#[test]
fn test_del() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"a", b"1").unwrap();
    tree.add(b"b", b"2").unwrap();

    assert!(tree.del(b"a").unwrap());
    assert!(!tree.del(b"a").unwrap());
    assert!(!tree.del(b"missing").unwrap());
    assert_eq!(tree.item_count(), 1);
    assert_eq!(tree.find_tag(b"a").unwrap(), None);
    assert_eq!(tree.find_tag(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn test_read_only_rejects_writes() {
    let (_dir, path) = setup(2048);
    let mut tree = Btree::open_to_read(&path, None).unwrap();
    assert!(!tree.is_writable());
    assert!(matches!(tree.add(b"k", b"v"), Err(TesseraError::InvalidOperation(_))));
    assert!(matches!(tree.del(b"k"), Err(TesseraError::InvalidOperation(_))));
    assert!(matches!(tree.commit(1), Err(TesseraError::InvalidOperation(_))));
}

// =============================================================================
// Limits Tests
// =============================================================================

#[test]
fn test_key_length_limit() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);

    let longest = vec![b'k'; MAX_KEY_LEN];
    assert!(tree.add(&longest, b"ok").unwrap());
    assert_eq!(tree.find_tag(&longest).unwrap(), Some(b"ok".to_vec()));

    let too_long = vec![b'k'; MAX_KEY_LEN + 1];
    match tree.add(&too_long, b"no") {
        Err(TesseraError::KeyTooLong { len, max }) => {
            assert_eq!(len, 253);
            assert_eq!(max, 252);
        }
        other => panic!("expected KeyTooLong, got {:?}", other),
    }
    assert!(!tree.find_key(&too_long).unwrap());
    assert!(!tree.del(&too_long).unwrap());
    assert_eq!(tree.item_count(), 1);
}

#[test]
fn test_tag_length_limit() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    // 2048-byte blocks hold at most 497 tag bytes per item for a one-byte key
    let tag = vec![0u8; 497 * u16::MAX as usize + 1];
    assert!(matches!(tree.add(b"k", &tag), Err(TesseraError::TagTooLong { .. })));
    assert!(!tree.is_modified());
    assert_eq!(tree.item_count(), 0);
}

// =============================================================================
// Multi-component Tag Tests
// =============================================================================

#[test]
fn test_large_tag_spans_components() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    tree.add(b"a", b"small").unwrap();
    tree.add(b"big", &big).unwrap();
    tree.add(b"c", b"small").unwrap();
    tree.commit(1).unwrap();

    let reader = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(reader.item_count(), 3);
    assert_eq!(reader.find_tag(b"big").unwrap(), Some(big.clone()));
    let keys: Vec<Vec<u8>> = contents(&reader).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"big".to_vec(), b"c".to_vec()]);

    let report = reader.check().unwrap();
    assert_eq!(report.entries, 3);
    assert!(report.items > 3);
}

#[test]
fn test_shrinking_tag_drops_extra_components() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"k", &vec![1u8; 3000]).unwrap();
    tree.add(b"z", b"after").unwrap();
    tree.commit(1).unwrap();
    let items_before = tree.check().unwrap().items;

    tree.add(b"k", b"short").unwrap();
    tree.commit(2).unwrap();

    let report = tree.check().unwrap();
    assert_eq!(report.entries, 2);
    assert_eq!(report.items, 2);
    assert!(items_before > report.items);
    assert_eq!(tree.find_tag(b"k").unwrap(), Some(b"short".to_vec()));
    assert_eq!(tree.find_tag(b"z").unwrap(), Some(b"after".to_vec()));
}

#[test]
fn test_del_removes_every_component() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"k", &vec![9u8; 4000]).unwrap();
    tree.commit(1).unwrap();

    assert!(tree.del(b"k").unwrap());
    tree.commit(2).unwrap();
    let report = tree.check().unwrap();
    assert_eq!(report.entries, 0);
    assert_eq!(report.items, 0);
}

// =============================================================================
// Round-trip Tests
// =============================================================================

#[test]
fn test_random_operations_match_sorted_map() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(42);

    for round in 1..=4u32 {
        for _ in 0..1500 {
            let key = format!("term{:05}", rng.gen_range(0..3000)).into_bytes();
            if rng.gen_bool(0.25) {
                let expected = model.remove(&key).is_some();
                assert_eq!(tree.del(&key).unwrap(), expected);
            } else {
                let len = if rng.gen_bool(0.05) {
                    rng.gen_range(500..2500)
                } else {
                    rng.gen_range(0..60)
                };
                let tag: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                tree.add(&key, &tag).unwrap();
                model.insert(key, tag);
            }
        }
        tree.commit(round).unwrap();

        let reader = Btree::open_to_read(&path, Some(round)).unwrap();
        assert_eq!(reader.item_count(), model.len() as u64);
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(contents(&reader), expected);
        assert_eq!(reader.check().unwrap().entries, model.len() as u64);
    }
}

#[test]
fn test_descending_inserts() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    for i in (0..3000u32).rev() {
        tree.add(format!("{:06}", i).as_bytes(), b"descending").unwrap();
    }
    tree.commit(1).unwrap();

    assert!(tree.level() >= 1);
    let report = tree.check().unwrap();
    assert_eq!(report.entries, 3000);
    assert_eq!(report.leaked_blocks, 0);
    let first = tree.iter().next().unwrap().unwrap();
    assert_eq!(first.0, b"000000".to_vec());
}

#[test]
fn test_early_block_writes_are_committed() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.set_max_dirty_blocks(4);
    for i in 0..2000u32 {
        tree.add(format!("{:06}", (i * 7919) % 2000).as_bytes(), &[3u8; 30]).unwrap();
    }
    tree.commit(1).unwrap();
    drop(tree);

    let reader = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(reader.item_count(), 2000);
    assert_eq!(reader.iter().count(), 2000);
    reader.check().unwrap();
}

// =============================================================================
// Revision Tests
// =============================================================================

#[test]
fn test_reopen_revisions_scenario() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"a", b"1").unwrap();
    tree.add(b"b", b"2").unwrap();
    tree.commit(1).unwrap();
    drop(tree);

    let mut tree = open_writer(&path);
    assert_eq!(tree.find_tag(b"a").unwrap(), Some(b"1".to_vec()));
    tree.del(b"a").unwrap();
    tree.add(b"c", b"3").unwrap();
    tree.commit(2).unwrap();
    drop(tree);

    let at_one = Btree::open_to_read(&path, Some(1)).unwrap();
    assert_eq!(
        contents(&at_one),
        vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())]
    );
    let at_two = Btree::open_to_read(&path, Some(2)).unwrap();
    assert_eq!(
        contents(&at_two),
        vec![(b"b".to_vec(), b"2".to_vec()), (b"c".to_vec(), b"3".to_vec())]
    );
}

#[test]
fn test_reader_survives_two_newer_commits() {
    let (_dir, path) = setup(2048);
    let mut writer = open_writer(&path);
    for i in 0..1000u32 {
        writer.add(format!("k{:05}", i).as_bytes(), b"r1").unwrap();
    }
    writer.commit(1).unwrap();

    let reader = Btree::open_to_read(&path, Some(1)).unwrap();
    let before = contents(&reader);

    for i in 0..1000u32 {
        writer.add(format!("k{:05}", i).as_bytes(), b"r2").unwrap();
    }
    writer.commit(2).unwrap();
    assert_eq!(contents(&reader), before);

    // Revision 3 is being written; revision 1's blocks are still protected
    for i in (0..1000u32).step_by(3) {
        writer.del(format!("k{:05}", i).as_bytes()).unwrap();
    }
    writer.set_max_dirty_blocks(2);
    writer.add(b"k99999", b"r3").unwrap();
    assert_eq!(contents(&reader), before);
    assert_eq!(reader.find_tag(b"k00000").unwrap(), Some(b"r1".to_vec()));

    writer.commit(3).unwrap();
    assert!(matches!(
        Btree::open_to_read(&path, Some(1)),
        Err(TesseraError::RevisionNotAvailable { revision: 1 })
    ));
    let latest = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(latest.find_tag(b"k00001").unwrap(), Some(b"r2".to_vec()));
    assert_eq!(latest.find_tag(b"k00000").unwrap(), None);
}

#[test]
fn test_commit_without_changes_keeps_tree() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    for i in 0..500u32 {
        tree.add(format!("{:04}", i).as_bytes(), b"v").unwrap();
    }
    tree.commit(1).unwrap();
    let root = tree.root_block();
    let level = tree.level();
    let before = contents(&tree);

    tree.commit(2).unwrap();
    assert_eq!(tree.revision(), 2);
    assert_eq!(tree.root_block(), root);

    let reader = Btree::open_to_read(&path, Some(2)).unwrap();
    assert_eq!(reader.root_block(), root);
    assert_eq!(reader.level(), level);
    assert_eq!(contents(&reader), before);
}

#[test]
fn test_cancel_restores_committed_state() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    tree.add(b"keep", b"1").unwrap();
    tree.commit(1).unwrap();
    let root = tree.root_block();

    for i in 0..300u32 {
        tree.add(format!("tmp{:04}", i).as_bytes(), b"x").unwrap();
    }
    tree.del(b"keep").unwrap();
    tree.cancel();

    assert!(!tree.is_modified());
    assert_eq!(tree.root_block(), root);
    assert_eq!(tree.item_count(), 1);
    assert_eq!(contents(&tree), vec![(b"keep".to_vec(), b"1".to_vec())]);

    // The session after cancel still commits cleanly
    tree.add(b"next", b"2").unwrap();
    tree.commit(2).unwrap();
    let report = tree.check().unwrap();
    assert_eq!(report.entries, 2);
    assert_eq!(report.leaked_blocks, 0);
}

#[test]
fn test_deleting_everything_leaves_empty_tree() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    for i in 0..800u32 {
        tree.add(format!("{:04}", i).as_bytes(), &[1u8; 20]).unwrap();
    }
    tree.commit(1).unwrap();
    assert!(tree.level() > 0);

    for i in 0..800u32 {
        assert!(tree.del(format!("{:04}", i).as_bytes()).unwrap());
    }
    tree.commit(2).unwrap();

    assert_eq!(tree.level(), 0);
    assert_eq!(tree.item_count(), 0);
    assert_eq!(tree.iter().count(), 0);
    let report = tree.check().unwrap();
    assert_eq!(report.blocks, 1);
}

// =============================================================================
// Commit Failure Tests
// =============================================================================

#[test]
fn test_failed_commit_keeps_committed_revision() {
    let (_dir, path) = setup(2048);
    let mut tree = open_writer(&path);
    for i in 0..500u32 {
        tree.add(format!("key{:05}", i).as_bytes(), b"committed").unwrap();
    }
    tree.commit(1).unwrap();
    let committed = contents(&tree);
    let reader = Btree::open_to_read(&path, Some(1)).unwrap();

    for i in 500..800u32 {
        tree.add(format!("key{:05}", i).as_bytes(), b"pending").unwrap();
    }
    tree.del(b"key00000").unwrap();
    let target = occupy_next_base(&tree);

    assert!(matches!(tree.commit(2), Err(TesseraError::Io(_))));
    assert_eq!(tree.revision(), 1);
    assert_eq!(tree.item_count(), 500);
    assert!(!tree.is_modified());
    assert_eq!(contents(&tree), committed);
    assert!(!temp_base(&target).exists());
    assert_eq!(contents(&reader), committed);

    // Once the slot is usable the same revision number commits
    fs::remove_dir_all(&target).unwrap();
    assert_eq!(Btree::latest_revision(&path).unwrap(), 1);
    for i in 500..800u32 {
        tree.add(format!("key{:05}", i).as_bytes(), b"pending").unwrap();
    }
    tree.commit(2).unwrap();
    assert_eq!(tree.revision(), 2);
    drop(tree);

    let reopened = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(reopened.revision(), 2);
    assert_eq!(reopened.item_count(), 800);
    assert_eq!(reopened.find_tag(b"key00000").unwrap(), Some(b"committed".to_vec()));
    assert_eq!(reopened.find_tag(b"key00799").unwrap(), Some(b"pending".to_vec()));
    let report = reopened.check().unwrap();
    assert_eq!(report.entries, 800);
    assert_eq!(report.leaked_blocks, 0);
}
