//! The public face of one local workspace.
//!
//! Every method is one [`Transaction`]: lock, load, run the engine, save.
//! Baselines the tables stop referencing are deleted after the tables are
//! safely on disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use lws_baseline::{BaselineStore, ContentHash, Uuid};
use lws_config::{log_baseline_warn, log_engine_debug, log_engine_info, Config};
use lws_pathtree::local_path;
use lws_tables::{
    ItemType, LocalItemFlags, LocalVersionEntry, LocalVersionTable, MetadataTable, PendingChange,
    PendingChangesTable, PropertyValue, RowId, WorkingFolder, WorkspaceProperties, ENCODING_FOLDER,
};
use parking_lot::Mutex;

use crate::context::PendContext;
use crate::failure::Failure;
use crate::lock::{WorkspaceLock, WorkspaceLockGuard};
use crate::operation::{ChangeRequest, GetOperation, ItemSpec, PendOutcome};
use crate::query::{self, QueriedChange, QueriedLocalVersion};
use crate::reconcile::{self, ReconcileCache, ReconcileOutcome, ReconcileService};
use crate::transaction::{TableSet, Transaction, TransactionOutcome};
use crate::{pend, rename, undo, Result};

/// The caller's report that it carried out a [`GetOperation`] on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersionUpdateRequest {
    /// Server path of the row: the committed path, or the target path of an
    /// uncommitted item
    pub source_server_item: String,
    pub item_id: i32,
    /// Where the item now is on disk; `None` when it left the disk
    pub target_local_item: Option<PathBuf>,
    /// 0 for uncommitted items
    pub version_local: i32,
    pub item_type: ItemType,
    pub encoding: i32,
    pub length: i64,
    pub hash: Option<ContentHash>,
    pub baseline_file_guid: Option<Uuid>,
    /// Modification time in millis; read from disk when absent
    pub last_modified: Option<i64>,
    pub checkin_date: i64,
    pub properties: Vec<PropertyValue>,
    /// Keep the row flagged deleted instead of dropping it
    pub keep_on_delete: bool,
}

impl LocalVersionUpdateRequest {
    pub fn new(source_server_item: impl Into<String>, target_local_item: Option<PathBuf>, version_local: i32) -> Self {
        Self {
            source_server_item: source_server_item.into(),
            item_id: 0,
            target_local_item,
            version_local,
            item_type: ItemType::File,
            encoding: 0,
            length: -1,
            hash: None,
            baseline_file_guid: None,
            last_modified: None,
            checkin_date: 0,
            properties: Vec::new(),
            keep_on_delete: false,
        }
    }

    /// The acknowledgement of a finished operation.
    pub fn from_operation(op: &GetOperation) -> Self {
        let committed = op.version_server != 0;
        Self {
            source_server_item: if committed {
                op.source_server_item.clone()
            } else {
                op.target_server_item.clone()
            },
            item_id: op.item_id,
            target_local_item: op.target_local_item.clone(),
            version_local: op.version_server,
            item_type: op.item_type,
            encoding: op.encoding,
            length: op.length,
            hash: op.hash,
            baseline_file_guid: op.baseline_file_guid,
            last_modified: None,
            checkin_date: 0,
            properties: op.properties.clone(),
            keep_on_delete: committed && op.change_type.contains(lws_tables::ChangeType::DELETE),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.version_local != 0
    }
}

/// One workspace, identified by name and owner, with its metadata folder
/// and baseline store.
pub struct LocalWorkspace {
    name: String,
    owner: String,
    config: Config,
    metadata_dir: PathBuf,
    baselines: BaselineStore,
    reconcile_cache: Mutex<ReconcileCache>,
}

impl std::fmt::Debug for LocalWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorkspace")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("metadata_dir", &self.metadata_dir)
            .finish()
    }
}

impl LocalWorkspace {
    pub fn open(name: &str, owner: &str, config: Config) -> Result<Self> {
        let metadata_dir = config.workspace_metadata_dir(name, owner);
        fs::create_dir_all(&metadata_dir)?;
        let baselines = BaselineStore::new(metadata_dir.join("baselines"), &config.baseline)?;

        let props = WorkspaceProperties::load(&metadata_dir)?;
        baselines.update_from(props.baseline_folders.clone());

        log_engine_info!("Opened workspace", name = name, owner = owner);
        Ok(Self {
            name: name.to_string(),
            owner: owner.to_string(),
            config,
            metadata_dir,
            baselines,
            reconcile_cache: Mutex::new(ReconcileCache::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub(crate) fn lock_key(&self) -> String {
        format!("{};{}", self.name, self.owner)
    }

    /// Take the workspace lock to run several transactions under it.
    pub fn lock(&self) -> Result<WorkspaceLockGuard> {
        WorkspaceLock::acquire(&self.lock_key(), self.config.lock.yield_on_contention)
    }

    fn engine<T, F>(&self, work: F) -> Result<T>
    where
        T: TransactionOutcome,
        F: FnOnce(&mut PendContext<'_>) -> Result<T>,
    {
        let max_server_path = self.config.limits.max_server_path;
        Transaction::new(self)?.execute(TableSet::ALL, |tables| {
            let mut ctx = tables.context(max_server_path)?;
            work(&mut ctx)
        })
    }

    // ========================================================================
    // Working folders
    // ========================================================================

    pub fn working_folders(&self) -> Result<Vec<WorkingFolder>> {
        Transaction::new(self)?.execute(TableSet::PROPERTIES, |t| Ok(t.properties()?.working_folders.clone()))
    }

    /// Replace the mappings and bring the baseline folders in line with
    /// the new workspace roots.
    pub fn set_working_folders(&self, folders: Vec<WorkingFolder>) -> Result<()> {
        Transaction::new(self)?.execute(TableSet::PROPERTIES, |t| {
            let props = t.properties_mut()?;
            props.set_working_folders(folders);
            let roots = workspace_roots(&props.working_folders);
            self.baselines.maintain(&roots)?;
            props.set_baseline_folders(self.baselines.folders());
            Ok(())
        })
    }

    // ========================================================================
    // Pending changes
    // ========================================================================

    pub fn pend_add(&self, requests: &[ChangeRequest], silent: bool) -> Result<PendOutcome> {
        self.engine(|ctx| Ok(pend::pend_add(ctx, requests, silent)))
    }

    pub fn pend_delete(&self, requests: &[ChangeRequest], silent: bool) -> Result<PendOutcome> {
        self.engine(|ctx| Ok(pend::pend_delete(ctx, requests, silent)))
    }

    pub fn pend_edit(&self, requests: &[ChangeRequest], silent: bool) -> Result<PendOutcome> {
        self.engine(|ctx| Ok(pend::pend_edit(ctx, requests, silent)))
    }

    pub fn pend_property(&self, requests: &[ChangeRequest], silent: bool) -> Result<PendOutcome> {
        self.engine(|ctx| Ok(pend::pend_property(ctx, requests, silent)))
    }

    pub fn pend_rename(&self, requests: &[ChangeRequest], silent: bool) -> Result<PendOutcome> {
        self.engine(|ctx| rename::pend_rename(ctx, requests, silent))
    }

    pub fn undo(&self, specs: &[ItemSpec]) -> Result<PendOutcome> {
        self.engine(|ctx| undo::undo_pending_changes(ctx, specs))
    }

    pub fn query_pending_changes(
        &self,
        specs: &[ItemSpec],
        include_candidates: bool,
    ) -> Result<(Vec<QueriedChange>, Vec<Failure>)> {
        self.engine(|ctx| Ok(query::query_pending_changes(ctx, specs, include_candidates)))
    }

    pub fn query_local_versions(
        &self,
        specs: &[ItemSpec],
        include_deleted: bool,
    ) -> Result<(Vec<QueriedLocalVersion>, Vec<Failure>)> {
        self.engine(|ctx| Ok(query::query_local_versions(ctx, specs, include_deleted)))
    }

    /// Record changes a scanner found on disk but nobody pended yet.
    pub fn add_candidates(&self, candidates: Vec<PendingChange>) -> Result<()> {
        Transaction::new(self)?.execute(TableSet::PENDING_CHANGES, |t| {
            let pc = t.pending_changes_mut()?;
            for candidate in candidates {
                if pc.get_by_target(&candidate.target_server_item).is_none() {
                    pc.add_candidate(candidate);
                }
            }
            Ok(())
        })
    }

    pub fn remove_candidate(&self, target: &str) -> Result<bool> {
        Transaction::new(self)?.execute(TableSet::PENDING_CHANGES, |t| {
            Ok(t.pending_changes_mut()?.remove_candidate(target).is_some())
        })
    }

    // ========================================================================
    // Local versions
    // ========================================================================

    /// Record what the caller did on disk. Rows touched are flagged pending
    /// reconcile.
    pub fn apply_local_version_updates(&self, updates: &[LocalVersionUpdateRequest]) -> Result<()> {
        let (displaced, placed) = Transaction::new(self)?.execute(TableSet::LOCAL_VERSION | TableSet::PENDING_CHANGES, |t| {
            let (lv, pc) = t.items_mut()?;
            Ok(apply_updates(lv, pc, updates))
        })?;
        self.delete_baselines(&displaced);
        self.relocate_baselines(&placed);
        Ok(())
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    pub fn reconcile(&self, service: &dyn ReconcileService, reconcile_missing: bool) -> Result<ReconcileOutcome> {
        let window = self.config.reconcile.freshness_window();
        let mut cache = self.reconcile_cache.lock();
        let (outcome, dropped) = Transaction::new(self)?.execute(
            TableSet::LOCAL_VERSION | TableSet::PENDING_CHANGES,
            |t| {
                let (lv, pc) = t.items_mut()?;
                reconcile::reconcile_tables(lv, pc, service, &mut cache, window, reconcile_missing)
            },
        )?;
        let guids: Vec<Uuid> = dropped.iter().filter_map(|e| e.baseline_file_guid).collect();
        self.delete_baselines(&guids);
        Ok(outcome)
    }

    /// Baselines follow their items to the folder on the item's partition.
    fn relocate_baselines(&self, placed: &[(Uuid, PathBuf)]) {
        for (guid, local) in placed {
            if let Err(e) = self.baselines.relocate(guid, local) {
                let error = e.to_string();
                log_baseline_warn!(
                    "Failed to relocate baseline",
                    guid = tracing::field::display(guid),
                    error = error.as_str()
                );
            }
        }
    }

    fn delete_baselines(&self, guids: &[Uuid]) {
        for guid in guids {
            if let Err(e) = self.baselines.delete(guid) {
                let error = e.to_string();
                log_baseline_warn!(
                    "Failed to delete baseline",
                    guid = tracing::field::display(guid),
                    error = error.as_str()
                );
            }
        }
    }
}

/// Local folders the mappings root the workspace at: mapped folders not
/// nested in another mapped folder.
fn workspace_roots(folders: &[WorkingFolder]) -> Vec<PathBuf> {
    let mapped: Vec<&Path> = folders
        .iter()
        .filter(|wf| !wf.is_cloaked())
        .filter_map(|wf| wf.local_item.as_deref())
        .collect();
    let mut roots: Vec<PathBuf> = Vec::new();
    for local in &mapped {
        let nested = mapped
            .iter()
            .any(|other| !local_path::equals(other, local) && local_path::is_child(other, local));
        if !nested && !roots.iter().any(|r| local_path::equals(r, local)) {
            roots.push(local.to_path_buf());
        }
    }
    roots
}

/// Fold acknowledgements into the local version table. Returns the
/// baselines no row references any more, and where each row still holding
/// a baseline now lives.
fn apply_updates(
    lv: &mut LocalVersionTable,
    pc: &PendingChangesTable,
    updates: &[LocalVersionUpdateRequest],
) -> (Vec<Uuid>, Vec<(Uuid, PathBuf)>) {
    let mut displaced: Vec<Uuid> = Vec::new();
    let mut placed: Vec<(Uuid, PathBuf)> = Vec::new();

    // The batch is one snapshot: rows it rewrites are lifted out first so
    // items trading places do not displace each other
    let existing: Vec<Option<(RowId, LocalVersionEntry)>> = updates
        .iter()
        .map(|u| {
            lv.get_by_server(&u.source_server_item, u.is_committed())
                .map(|(id, e)| (id, e.clone()))
        })
        .collect();
    let applies: Vec<bool> = updates
        .iter()
        .map(|u| {
            u.target_local_item.is_some()
                && (u.is_committed() || pc.get_by_target(&u.source_server_item).is_some())
        })
        .collect();
    for (slot, applies) in existing.iter().zip(&applies) {
        if let (Some((id, _)), true) = (slot, applies) {
            lv.remove(*id, false);
        }
    }

    for ((update, existing), applies) in updates.iter().zip(existing).zip(applies) {
        let Some(local) = &update.target_local_item else {
            if let Some((id, entry)) = existing {
                if update.keep_on_delete {
                    let deleted = entry
                        .with_local_item(None)
                        .with_flag(LocalItemFlags::DELETED, true)
                        .with_flag(LocalItemFlags::PENDING_RECONCILE, true);
                    lv.replace(id, deleted);
                } else {
                    lv.remove(id, true);
                    displaced.extend(entry.baseline_file_guid);
                }
            }
            continue;
        };

        // An uncommitted slot whose pending change was undone meanwhile
        if !applies {
            log_engine_debug!(
                "Ignoring update for an item with no pending change",
                item = update.source_server_item.as_str()
            );
            continue;
        }

        if let Some((_, collision)) = lv.get_by_local(local) {
            displaced.extend(collision.baseline_file_guid);
        }

        let mut entry = if update.item_type == ItemType::Folder || update.encoding == ENCODING_FOLDER {
            LocalVersionEntry::new_folder(&update.source_server_item, Some(local.clone()), update.version_local)
        } else {
            LocalVersionEntry::new_file(&update.source_server_item, Some(local.clone()), update.version_local)
                .with_baseline(update.baseline_file_guid, update.length, update.hash)
        };
        entry.item_id = update.item_id;
        if update.encoding != 0 {
            entry.encoding = update.encoding;
        }
        entry.checkin_date = update.checkin_date;
        entry.properties = update.properties.clone();
        entry.flags.insert(LocalItemFlags::PENDING_RECONCILE);
        if !entry.is_directory() {
            entry.last_modified = update.last_modified.unwrap_or_else(|| modified_millis(local));
        }

        if let Some((_, old)) = &existing {
            if let Some(old_guid) = old.baseline_file_guid {
                let same_content = old.length != -1 && old.length == entry.length && old.hash.is_some() && old.hash == entry.hash;
                match entry.baseline_file_guid {
                    None if same_content => {
                        entry.baseline_file_guid = Some(old_guid);
                    }
                    Some(guid) if guid == old_guid => {}
                    _ => displaced.push(old_guid),
                }
            }
        }

        if let Some(guid) = entry.baseline_file_guid {
            placed.push((guid, local.clone()));
        }
        lv.add(entry);
    }

    // A displaced baseline may have been picked up again by a later update
    displaced.retain(|guid| !lv.iter().any(|(_, e)| e.baseline_file_guid == Some(*guid)));
    displaced.sort();
    displaced.dedup();
    (displaced, placed)
}

fn modified_millis(local: &Path) -> i64 {
    fs::metadata(local)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_config::testing::TestEnvironment;
    use lws_pathtree::RecursionType;
    use lws_tables::{ChangeType, LockLevel};

    fn guid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn table() -> LocalVersionTable {
        let mut lv = LocalVersionTable::new();
        lv.add(
            LocalVersionEntry::new_file("$/P/a.txt", Some("/w/a.txt".into()), 4).with_baseline(
                Some(guid(1)),
                10,
                Some([1; 16]),
            ),
        );
        lv
    }

    #[test]
    fn test_update_replaces_row_and_displaces_old_baseline() {
        let mut lv = table();
        let pc = PendingChangesTable::new();
        let mut update = LocalVersionUpdateRequest::new("$/P/a.txt", Some("/w/a.txt".into()), 5);
        update.baseline_file_guid = Some(guid(2));
        update.length = 12;
        update.hash = Some([2; 16]);
        update.last_modified = Some(7);

        let (displaced, placed) = apply_updates(&mut lv, &pc, &[update]);
        assert_eq!(displaced, vec![guid(1)]);
        assert_eq!(placed, vec![(guid(2), PathBuf::from("/w/a.txt"))]);
        let (_, row) = lv.get_by_server("$/P/a.txt", true).unwrap();
        assert_eq!(row.version, 5);
        assert_eq!(row.baseline_file_guid, Some(guid(2)));
        assert_eq!(row.last_modified, 7);
        assert!(row.is_pending_reconcile());
    }

    #[test]
    fn test_identical_content_keeps_baseline() {
        let mut lv = table();
        let pc = PendingChangesTable::new();
        let mut update = LocalVersionUpdateRequest::new("$/P/a.txt", Some("/w/moved.txt".into()), 4);
        update.length = 10;
        update.hash = Some([1; 16]);

        let (displaced, placed) = apply_updates(&mut lv, &pc, &[update]);
        assert!(displaced.is_empty());
        assert_eq!(placed, vec![(guid(1), PathBuf::from("/w/moved.txt"))]);
        let (_, row) = lv.get_by_local(Path::new("/w/moved.txt")).unwrap();
        assert_eq!(row.baseline_file_guid, Some(guid(1)));
    }

    #[test]
    fn test_delete_update_removes_or_flags() {
        let mut lv = table();
        let pc = PendingChangesTable::new();
        let mut keep = LocalVersionUpdateRequest::new("$/P/a.txt", None, 4);
        keep.keep_on_delete = true;
        let (displaced, placed) = apply_updates(&mut lv, &pc, &[keep]);
        assert!(displaced.is_empty() && placed.is_empty());
        let (_, row) = lv.get_by_server("$/P/a.txt", true).unwrap();
        assert!(row.is_deleted());
        assert!(row.local_item.is_none());

        let drop = LocalVersionUpdateRequest::new("$/P/a.txt", None, 4);
        assert_eq!(apply_updates(&mut lv, &pc, &[drop]).0, vec![guid(1)]);
        assert!(lv.get_any_by_server("$/P/a.txt").is_none());
        assert_eq!(lv.removed_items().len(), 1);
    }

    #[test]
    fn test_uncommitted_update_without_pending_change_is_ignored() {
        let mut lv = LocalVersionTable::new();
        let pc = PendingChangesTable::new();
        let update = LocalVersionUpdateRequest::new("$/P/new.txt", Some("/w/new.txt".into()), 0);
        apply_updates(&mut lv, &pc, &[update]);
        assert!(lv.is_empty());
    }

    #[test]
    fn test_local_path_collision_displaces_other_row() {
        let mut lv = table();
        lv.add(
            LocalVersionEntry::new_file("$/P/b.txt", Some("/w/b.txt".into()), 4).with_baseline(
                Some(guid(3)),
                5,
                Some([3; 16]),
            ),
        );
        let pc = PendingChangesTable::new();
        let mut update = LocalVersionUpdateRequest::new("$/P/a.txt", Some("/w/b.txt".into()), 4);
        update.length = 10;
        update.hash = Some([1; 16]);

        let (displaced, _) = apply_updates(&mut lv, &pc, &[update]);
        assert_eq!(displaced, vec![guid(3)]);
        assert!(lv.get_by_server("$/P/b.txt", true).is_none());
    }

    #[test]
    fn test_workspace_roots_skip_nested_and_cloaked() {
        let folders = vec![
            WorkingFolder::map("$/P", "/w"),
            WorkingFolder::map("$/P/sub", "/w/sub"),
            WorkingFolder::cloak("$/P/bin"),
            WorkingFolder::map("$/Q", "/other"),
            WorkingFolder::map("$/R", "/W"),
        ];
        assert_eq!(
            workspace_roots(&folders),
            vec![PathBuf::from("/w"), PathBuf::from("/other")]
        );
    }

    #[test]
    fn test_workspace_pend_and_query() {
        let env = TestEnvironment::new().unwrap();
        let ws = LocalWorkspace::open(&env.workspace_name(), "me", env.config()).unwrap();
        let root = env.workspace_root.clone();
        ws.set_working_folders(vec![WorkingFolder::map("$/P", &root)]).unwrap();
        assert_eq!(ws.working_folders().unwrap().len(), 1);

        let local = env.create_file("a.txt", b"alpha").unwrap();
        let outcome = ws
            .pend_add(&[ChangeRequest::new(ItemSpec::local(&local, RecursionType::None))], false)
            .unwrap();
        assert!(outcome.is_applied(), "{:?}", outcome);
        let acks: Vec<_> = outcome.operations().iter().map(LocalVersionUpdateRequest::from_operation).collect();
        ws.apply_local_version_updates(&acks).unwrap();

        let (found, failures) = ws
            .query_pending_changes(&[ItemSpec::new("$/P", RecursionType::Full)], false)
            .unwrap();
        assert!(failures.is_empty());
        assert_eq!(found.len(), 1);
        assert!(found[0].change.is_add());
        assert_eq!(found[0].change.lock_level, LockLevel::None);

        let (rows, _) = ws
            .query_local_versions(&[ItemSpec::new("$/P/a.txt", RecursionType::None)], false)
            .unwrap();
        assert_eq!(rows[0].entry.local_item.as_deref(), Some(local.as_path()));
        assert!(!rows[0].entry.is_committed());
    }

    #[test]
    fn test_candidates_round_trip() {
        let env = TestEnvironment::new().unwrap();
        let ws = LocalWorkspace::open(&env.workspace_name(), "me", env.config()).unwrap();
        ws.set_working_folders(vec![WorkingFolder::map("$/P", &env.workspace_root)]).unwrap();
        ws.add_candidates(vec![PendingChange::new("$/P/c.txt", None, ChangeType::ADD, ItemType::File)])
            .unwrap();

        let (found, _) = ws
            .query_pending_changes(&[ItemSpec::new("$/P", RecursionType::Full)], true)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].id.is_none());
        assert!(ws.remove_candidate("$/P/c.txt").unwrap());
        assert!(!ws.remove_candidate("$/P/c.txt").unwrap());
    }
}
