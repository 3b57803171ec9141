//! Save/load cycles of the three tables through their slot files.

use std::fs;
use std::path::PathBuf;

use lws_tables::{
    ChangeType, ItemType, LocalVersionEntry, LocalVersionTable, MetadataTable, PendingChange,
    PendingChangesTable, SlotFiles, WorkingFolder, WorkspaceProperties,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn rename(committed: &str, target: &str) -> PendingChange {
    let mut pc = PendingChange::new(
        target,
        Some(committed.to_string()),
        ChangeType::RENAME,
        ItemType::Folder,
    );
    pc.version = 3;
    pc
}

fn edit(committed: &str, target: &str) -> PendingChange {
    let mut pc = PendingChange::new(
        target,
        Some(committed.to_string()),
        ChangeType::EDIT,
        ItemType::File,
    );
    pc.version = 3;
    pc
}

#[test]
fn test_tables_survive_save_and_load() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();

    let mut lv = LocalVersionTable::new();
    lv.add(LocalVersionEntry::new_folder("$/P", Some(PathBuf::from("/w/p")), 4));
    lv.add(LocalVersionEntry::new_file("$/P/a.txt", Some(PathBuf::from("/w/p/a.txt")), 4));
    lv.save(dir).unwrap();

    let mut pcs = PendingChangesTable::new();
    pcs.upsert(edit("$/P/a.txt", "$/P/a.txt"));
    pcs.save(dir).unwrap();

    let mut props = WorkspaceProperties::new("ws", "owner");
    props.set_working_folders(vec![WorkingFolder::map("$/P", "/w/p")]);
    props.save(dir).unwrap();

    let lv = LocalVersionTable::load(dir).unwrap();
    assert_eq!(lv.len(), 2);
    assert!(lv.get_by_server("$/p/A.TXT", true).is_some());

    let pcs = PendingChangesTable::load(dir).unwrap();
    assert_eq!(pcs.len(), 1);
    assert_ne!(pcs.client_signature(), lws_tables::pending_changes::INITIAL_SIGNATURE);

    let props = WorkspaceProperties::load(dir).unwrap();
    assert_eq!(props.working_folders.len(), 1);
}

#[test]
fn test_clean_table_is_not_rewritten() {
    let temp = TempDir::new().unwrap();
    let mut lv = LocalVersionTable::new();
    lv.add(LocalVersionEntry::new_file("$/P/a", None, 1));
    lv.save(temp.path()).unwrap();

    let mut loaded = LocalVersionTable::load(temp.path()).unwrap();
    loaded.save(temp.path()).unwrap();
    assert!(!SlotFiles::new(temp.path(), "localversion").backup().exists());
}

#[test]
fn test_corrupt_primary_recovers_from_backup_and_marks_dirty() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let mut pcs = PendingChangesTable::new();
    pcs.upsert(edit("$/P/a", "$/P/a"));
    pcs.save(dir).unwrap();
    pcs.upsert(edit("$/P/b", "$/P/b"));
    pcs.save(dir).unwrap();

    let slots = SlotFiles::new(dir, "pendingchanges");
    fs::write(slots.primary(), b"\x25\x74\x02truncated").unwrap();

    let mut loaded = PendingChangesTable::load(dir).unwrap();
    assert_eq!(loaded.len(), 1);
    loaded.save(dir).unwrap();
    assert_eq!(PendingChangesTable::load(dir).unwrap().len(), 1);
}

// ============================================================================
// Path translation across nested renames
// ============================================================================

fn segment() -> impl Strategy<Value = String> {
    "[a-d]{1,2}"
}

proptest! {
    /// A folder rename with an edit pended beneath it translates both ways.
    #[test]
    fn prop_rename_translation_is_invertible(
        from in segment(),
        to in segment(),
        child in segment(),
        leaf in segment(),
    ) {
        prop_assume!(!from.eq_ignore_ascii_case(&to));
        let committed_dir = format!("$/P/{}", from);
        let target_dir = format!("$/P/{}", to);
        let committed_file = format!("{}/{}/{}", committed_dir, child, leaf);
        let target_file = format!("{}/{}/{}", target_dir, child, leaf);

        let mut pcs = PendingChangesTable::new();
        pcs.upsert(rename(&committed_dir, &target_dir));
        pcs.upsert(edit(&committed_file, &target_file));

        prop_assert_eq!(pcs.target_for(&committed_file), target_file.clone());
        prop_assert_eq!(pcs.committed_for(&target_file), Some(committed_file.clone()));

        let sibling = format!("{}/{}x", committed_dir, child);
        let moved = pcs.target_for(&sibling);
        prop_assert_eq!(pcs.committed_for(&moved), Some(sibling));
    }
}
