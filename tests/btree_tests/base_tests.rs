//! Base File Tests
//!
//! Tests verify:
//! - Commits alternate between the A and B slots
//! - A torn or corrupt newest base falls back to the other slot
//! - Missing, invalid and foreign-version bases are reported distinctly
//! - An interrupted commit's base is discarded by the next writer

use std::fs;

use tempfile::TempDir;
use tessera::btree::{BaseLetter, Btree, TablePath, FORMAT_VERSION};
use tessera::TesseraError;

fn setup() -> (TempDir, TablePath) {
    let dir = TempDir::new().unwrap();
    let path = TablePath::new(dir.path(), "t_");
    Btree::create(&path, 2048).unwrap();
    (dir, path)
}

/// Commit revision 1 holding `a`, then revision 2 adding `b`
fn two_revisions(path: &TablePath) {
    let mut tree = Btree::open_to_write(path, None).unwrap().unwrap();
    tree.add(b"a", b"1").unwrap();
    tree.commit(1).unwrap();
    tree.add(b"b", b"2").unwrap();
    tree.commit(2).unwrap();
}

fn slot_revision(path: &TablePath, letter: BaseLetter) -> Option<u32> {
    let file = path.base_file(letter);
    if !file.exists() {
        return None;
    }
    // Only the slot under test is left in place
    let dir = TempDir::new().unwrap();
    let copy = TablePath::new(dir.path(), "p_");
    fs::copy(path.db_file(), copy.db_file()).unwrap();
    fs::copy(&file, copy.base_file(BaseLetter::A)).unwrap();
    Btree::latest_revision(&copy).ok()
}

// =============================================================================
// Slot Rotation Tests
// =============================================================================

#[test]
fn test_create_writes_slot_a_at_revision_zero() {
    let (_dir, path) = setup();
    assert!(Btree::exists(&path));
    assert!(path.base_file(BaseLetter::A).exists());
    assert!(!path.base_file(BaseLetter::B).exists());
    assert_eq!(Btree::latest_revision(&path).unwrap(), 0);

    let tree = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(tree.item_count(), 0);
    assert!(tree.base().fake_root);
    assert_eq!(tree.block_size(), 2048);
}

#[test]
fn test_commits_alternate_slots() {
    let (_dir, path) = setup();
    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();

    tree.add(b"a", b"1").unwrap();
    tree.commit(1).unwrap();
    assert_eq!(slot_revision(&path, BaseLetter::A), Some(0));
    assert_eq!(slot_revision(&path, BaseLetter::B), Some(1));

    tree.add(b"b", b"2").unwrap();
    tree.commit(2).unwrap();
    assert_eq!(slot_revision(&path, BaseLetter::A), Some(2));
    assert_eq!(slot_revision(&path, BaseLetter::B), Some(1));

    assert_eq!(Btree::latest_revision(&path).unwrap(), 2);
}

#[test]
fn test_only_two_revisions_are_kept() {
    let (_dir, path) = setup();
    two_revisions(&path);

    assert!(Btree::open_to_read(&path, Some(1)).is_ok());
    assert!(Btree::open_to_read(&path, Some(2)).is_ok());
    match Btree::open_to_read(&path, Some(0)) {
        Err(TesseraError::RevisionNotAvailable { revision }) => assert_eq!(revision, 0),
        other => panic!("expected RevisionNotAvailable, got {:?}", other),
    }
    assert!(Btree::open_to_write(&path, Some(0)).unwrap().is_none());
}

#[test]
fn test_block_size_is_persisted() {
    let dir = TempDir::new().unwrap();
    let path = TablePath::new(dir.path(), "wide_");
    Btree::create(&path, 16384).unwrap();
    let tree = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(tree.block_size(), 16384);
}

#[test]
fn test_invalid_block_size_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = TablePath::new(dir.path(), "t_");
    assert!(matches!(Btree::create(&path, 3000), Err(TesseraError::Config(_))));
    assert!(matches!(Btree::create(&path, 1024), Err(TesseraError::Config(_))));
    assert!(!Btree::exists(&path));
}

// =============================================================================
// Damaged Slot Tests
// =============================================================================

#[test]
fn test_torn_newest_base_falls_back() {
    let (_dir, path) = setup();
    two_revisions(&path);

    let newest = path.base_file(BaseLetter::A);
    let bytes = fs::read(&newest).unwrap();
    fs::write(&newest, &bytes[..bytes.len() / 2]).unwrap();

    let tree = Btree::open_to_read(&path, None).unwrap();
    assert_eq!(tree.revision(), 1);
    assert_eq!(tree.find_tag(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.find_tag(b"b").unwrap(), None);
}

#[test]
fn test_flipped_byte_in_base_falls_back() {
    let (_dir, path) = setup();
    two_revisions(&path);

    let newest = path.base_file(BaseLetter::A);
    let mut bytes = fs::read(&newest).unwrap();
    bytes[14] ^= 0x55;
    fs::write(&newest, &bytes).unwrap();

    assert_eq!(Btree::latest_revision(&path).unwrap(), 1);
}

#[test]
fn test_missing_bases_is_opening_error() {
    let (_dir, path) = setup();
    fs::remove_file(path.base_file(BaseLetter::A)).unwrap();

    assert!(!Btree::exists(&path));
    assert!(matches!(
        Btree::open_to_read(&path, None),
        Err(TesseraError::DatabaseOpening(_))
    ));
}

#[test]
fn test_invalid_bases_is_corruption() {
    let (_dir, path) = setup();
    two_revisions(&path);
    fs::write(path.base_file(BaseLetter::A), b"garbage").unwrap();
    fs::write(path.base_file(BaseLetter::B), vec![0u8; 64]).unwrap();

    assert!(matches!(
        Btree::open_to_read(&path, None),
        Err(TesseraError::DatabaseCorrupt(_))
    ));
    assert!(matches!(
        Btree::open_to_write(&path, None),
        Err(TesseraError::DatabaseCorrupt(_))
    ));
}

#[test]
fn test_newer_format_version_is_rejected() {
    let (_dir, path) = setup();
    let file = path.base_file(BaseLetter::A);
    let mut bytes = fs::read(&file).unwrap();

    let body_len = bytes.len() - 4;
    bytes[8..12].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
    let crc = crc32fast::hash(&bytes[..body_len]);
    bytes[body_len..].copy_from_slice(&crc.to_le_bytes());
    fs::write(&file, &bytes).unwrap();

    assert!(matches!(
        Btree::open_to_read(&path, None),
        Err(TesseraError::DatabaseVersion(_))
    ));
}

#[test]
fn test_missing_block_file_is_opening_error() {
    let (_dir, path) = setup();
    fs::remove_file(path.db_file()).unwrap();
    assert!(matches!(
        Btree::open_to_read(&path, None),
        Err(TesseraError::DatabaseOpening(_))
    ));
}

// =============================================================================
// Interrupted Commit Tests
// =============================================================================

#[test]
fn test_writer_at_older_revision_discards_newer_base() {
    let (_dir, path) = setup();
    two_revisions(&path);

    // Revision 2 belongs to an apply that did not finish across all tables
    let mut tree = Btree::open_to_write(&path, Some(1)).unwrap().unwrap();
    assert!(!path.base_file(BaseLetter::A).exists());
    assert_eq!(tree.find_tag(b"b").unwrap(), None);

    tree.add(b"c", b"3").unwrap();
    tree.commit(2).unwrap();
    drop(tree);

    let tree = Btree::open_to_read(&path, Some(2)).unwrap();
    assert_eq!(tree.find_tag(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(tree.find_tag(b"b").unwrap(), None);
    assert_eq!(tree.find_tag(b"c").unwrap(), Some(b"3".to_vec()));
    assert!(Btree::open_to_read(&path, Some(1)).is_ok());
}

#[test]
fn test_invalid_other_slot_is_overwritten() {
    let (_dir, path) = setup();
    two_revisions(&path);
    fs::write(path.base_file(BaseLetter::B), b"torn").unwrap();

    let mut tree = Btree::open_to_write(&path, None).unwrap().unwrap();
    assert_eq!(tree.revision(), 2);
    tree.add(b"d", b"4").unwrap();
    tree.commit(3).unwrap();

    assert_eq!(slot_revision(&path, BaseLetter::B), Some(3));
    assert_eq!(Btree::latest_revision(&path).unwrap(), 3);
}
