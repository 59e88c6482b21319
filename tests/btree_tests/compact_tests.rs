//! Compaction and Check Tests
//!
//! Tests verify:
//! - Bulk compaction repacks sparse trees without changing their contents
//! - The merge-underfull delete policy keeps fewer leaves than no-merge
//! - Older readers are unaffected by a compacting commit
//! - The checker reports damaged block files

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;
use tessera::btree::{Btree, TablePath};
use tessera::{CompactionPolicy, TesseraError};

fn setup(name: &str) -> (TempDir, TablePath) {
    let dir = TempDir::new().unwrap();
    let path = TablePath::new(dir.path(), name);
    Btree::create(&path, 2048).unwrap();
    (dir, path)
}

fn key(i: u32) -> Vec<u8> {
    format!("doc{:06}", i).into_bytes()
}

/// 5000 entries committed as revision 1, then every key not divisible by 10 deleted as revision 2
fn sparse_tree(path: &TablePath, policy: CompactionPolicy) -> Btree {
    let mut tree = Btree::open_to_write(path, None).unwrap().unwrap();
    tree.set_compaction_policy(policy);
    // Interleaved order keeps blocks half full, the worst case for deletes
    for i in (0..5000u32).step_by(2).chain((1..5000u32).step_by(2)) {
        tree.add(&key(i), &[5u8; 24]).unwrap();
    }
    tree.commit(1).unwrap();
    // Descending, so a leaf's right neighbour is already sparse when it underflows
    for i in (0..5000u32).rev() {
        if i % 10 != 0 {
            tree.del(&key(i)).unwrap();
        }
    }
    tree.commit(2).unwrap();
    tree
}

fn contents(tree: &Btree) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.iter().map(|entry| entry.unwrap()).collect()
}

// =============================================================================
// Bulk Compaction Tests
// =============================================================================

#[test]
fn test_compact_repacks_sparse_tree() {
    let (_dir, path) = setup("postlist_");
    let mut tree = sparse_tree(&path, CompactionPolicy::NoMerge);
    let before = tree.check().unwrap();
    let entries = contents(&tree);
    assert_eq!(entries.len(), 500);

    tree.compact().unwrap();
    assert!(tree.is_modified());
    tree.commit(3).unwrap();

    let after = tree.check().unwrap();
    assert!(after.leaf_blocks < before.leaf_blocks);
    assert!(after.leaf_fill() > before.leaf_fill());
    assert_eq!(after.entries, 500);
    assert_eq!(after.leaked_blocks, 0);
    assert_eq!(contents(&tree), entries);

    let reader = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(reader.revision(), 3);
    assert_eq!(contents(&reader), entries);
}

#[test]
fn test_compact_dense_tree_fills_leaves() {
    let (_dir, path) = setup("record_");
    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();
    for i in (0..4000u32).rev() {
        tree.add(&key(i), b"stored document data").unwrap();
    }
    tree.compact().unwrap();
    tree.commit(1).unwrap();

    let report = tree.check().unwrap();
    assert!(report.leaf_blocks > 20);
    assert!(report.leaf_fill() > 0.9, "fill {}", report.leaf_fill());
    assert_eq!(report.entries, 4000);
}

#[test]
fn test_compact_keeps_multi_component_tags() {
    let (_dir, path) = setup("value_");
    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();
    let big = vec![0xabu8; 6000];
    for i in 0..200u32 {
        let tag = if i % 50 == 0 { big.clone() } else { vec![1u8; 10] };
        tree.add(&key(i), &tag).unwrap();
    }
    tree.compact().unwrap();
    tree.commit(1).unwrap();

    assert_eq!(tree.find_tag(&key(50)).unwrap(), Some(big));
    assert_eq!(tree.check().unwrap().entries, 200);
}

#[test]
fn test_compact_empty_and_read_only() {
    let (_dir, path) = setup("position_");
    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();
    tree.compact().unwrap();
    assert!(!tree.is_modified());

    let mut reader = Btree::open_to_read(&path, None).unwrap();
    assert!(matches!(reader.compact(), Err(TesseraError::InvalidOperation(_))));
}

#[test]
fn test_compact_then_cancel() {
    let (_dir, path) = setup("postlist_");
    let mut tree = sparse_tree(&path, CompactionPolicy::NoMerge);
    let root = tree.root_block();
    let entries = contents(&tree);

    tree.compact().unwrap();
    tree.cancel();
    assert_eq!(tree.root_block(), root);
    assert_eq!(contents(&tree), entries);
    assert_eq!(tree.check().unwrap().leaked_blocks, 0);
}

#[test]
fn test_reader_unaffected_by_compaction() {
    let (_dir, path) = setup("postlist_");
    let mut tree = sparse_tree(&path, CompactionPolicy::NoMerge);
    let reader = Btree::open_to_read(&path, Some(2)).unwrap();
    let expected = contents(&reader);

    tree.compact().unwrap();
    tree.commit(3).unwrap();
    assert_eq!(contents(&reader), expected);
}

// =============================================================================
// Delete Policy Tests
// =============================================================================

#[test]
fn test_merge_underfull_keeps_fewer_leaves() {
    let (_dir_a, plain) = setup("plain_");
    let (_dir_b, merged) = setup("merged_");
    let plain = sparse_tree(&plain, CompactionPolicy::NoMerge);
    let merged = sparse_tree(&merged, CompactionPolicy::MergeUnderfull);

    let plain_report = plain.check().unwrap();
    let merged_report = merged.check().unwrap();
    assert_eq!(plain_report.entries, merged_report.entries);
    assert!(merged_report.leaf_blocks < plain_report.leaf_blocks);
    assert_eq!(merged_report.leaked_blocks, 0);
    assert_eq!(contents(&plain), contents(&merged));
}

#[test]
fn test_merge_underfull_delete_everything() {
    let (_dir, path) = setup("t_");
    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();
    tree.set_compaction_policy(CompactionPolicy::MergeUnderfull);
    for i in 0..3000u32 {
        tree.add(&key(i), &[2u8; 16]).unwrap();
    }
    tree.commit(1).unwrap();
    for i in (0..3000u32).rev() {
        assert!(tree.del(&key(i)).unwrap());
    }
    tree.commit(2).unwrap();
    assert_eq!(tree.item_count(), 0);
    assert_eq!(tree.level(), 0);
    tree.check().unwrap();
}

// =============================================================================
// Checker Tests
// =============================================================================

#[test]
fn test_check_detects_damaged_block() {
    let (_dir, path) = setup("t_");
    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();
    for i in 0..2000u32 {
        tree.add(&key(i), &[8u8; 20]).unwrap();
    }
    tree.commit(1).unwrap();
    let tree = Btree::open_to_read(&path, None).unwrap();
    let root = tree.root_block();
    drop(tree);

    // Overwrite the middle of the root block
    let mut file = OpenOptions::new().write(true).open(path.db_file()).unwrap();
    file.seek(SeekFrom::Start(root as u64 * 2048 + 1024)).unwrap();
    file.write_all(&[0xff; 16]).unwrap();
    drop(file);

    let tree = Btree::open_to_read(&path, None).unwrap();
    assert!(matches!(tree.check(), Err(TesseraError::DatabaseCorrupt(_))));
}
