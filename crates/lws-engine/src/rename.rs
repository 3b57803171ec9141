//! Rename and move pends.
//!
//! A rename runs in two passes per item: capture resolves the new target
//! of every affected pending change and validates every affected row
//! against the unchanged tables; apply then re-keys all of them at once.
//! Children without a pending change of their own are never touched: they
//! follow the folder rename through target path translation.

use std::collections::HashMap;
use std::path::PathBuf;

use lws_config::{log_engine_debug, log_engine_info};
use lws_pathtree::server_path;
use lws_tables::{ChangeType, ItemType, LocalItemFlags, Mapping, PendingChange, RowId};

use crate::context::{fold_key, pending_change_for, Batch, ParsedSpec, PendContext};
use crate::failure::{Failure, FailureKind};
use crate::operation::{ChangeRequest, PendOutcome};
use crate::undo;
use crate::Result;

/// Where `source_item` lands when `source_root` is renamed to
/// `target_root`.
///
/// Renaming a whole folder onto an existing folder nests it beneath the
/// target; renaming a wildcard selection moves the matched children only.
/// An item that already sits at the target root stays there.
pub(crate) fn calculate_target_server_item(
    source_root: &str,
    source_item: &str,
    target_root: &str,
    target_is_folder: bool,
    root_included: bool,
) -> String {
    let into_target_root = server_path::equals(source_item, target_root);
    let mut result = target_root.to_string();
    if target_is_folder
        && root_included
        && !server_path::equals(source_root, target_root)
        && !into_target_root
    {
        result = server_path::combine(&result, server_path::file_name(source_root));
    }
    if !server_path::equals(source_item, source_root) && !into_target_root {
        result = server_path::combine(&result, &server_path::make_relative(source_item, source_root));
    }
    result
}

/// One pending change affected by a rename, keyed by the path its lv row
/// is stored under.
#[derive(Debug, Clone)]
struct Affected {
    /// `None` for the main change created by this rename
    id: Option<RowId>,
    pc: PendingChange,
}

/// Outcome of one item's capture pass.
enum Capture {
    Apply,
    Failed(Failure),
    RequiresServer,
}

struct RenameRoots {
    source_root: String,
    target_root: String,
    target_is_folder: bool,
    root_included: bool,
}

impl RenameRoots {
    fn target_of(&self, source_item: &str) -> String {
        calculate_target_server_item(
            &self.source_root,
            source_item,
            &self.target_root,
            self.target_is_folder,
            self.root_included,
        )
    }
}

pub(crate) fn pend_rename(
    ctx: &mut PendContext<'_>,
    requests: &[ChangeRequest],
    silent: bool,
) -> Result<PendOutcome> {
    let mut batch = Batch::default();

    for request in requests {
        let parsed = match ctx.parse_spec(&request.spec) {
            Ok(parsed) => parsed,
            Err(failure) => {
                batch.fail(failure);
                continue;
            }
        };
        let roots = match resolve_roots(ctx, request, &parsed) {
            Ok(roots) => roots,
            Err(failure) => {
                batch.fail(failure);
                continue;
            }
        };

        let items = ctx.expand(&parsed, false);
        if items.is_empty() {
            batch.fail(Failure::new(FailureKind::ItemNotFound, &parsed.item));
            continue;
        }
        for item in items {
            match rename_item(ctx, &roots, item.id, silent, &mut batch)? {
                Capture::Apply => {}
                Capture::Failed(failure) => batch.fail(failure),
                Capture::RequiresServer => {
                    log_engine_info!("Rename requires the server", item = item.target.as_str());
                    return Ok(PendOutcome::RequiresServer);
                }
            }
        }
    }

    log_engine_debug!(
        "Pended renames",
        requests = requests.len(),
        operations = batch.result.operations.len(),
        failures = batch.result.failures.len()
    );
    Ok(batch.finish())
}

fn resolve_roots(
    ctx: &PendContext<'_>,
    request: &ChangeRequest,
    parsed: &ParsedSpec,
) -> std::result::Result<RenameRoots, Failure> {
    let raw_target = request
        .target_item
        .as_deref()
        .ok_or_else(|| Failure::new(FailureKind::InvalidPath, &parsed.item))?;

    let target_root = if server_path::is_server_path(raw_target) {
        if server_path::is_wildcard(raw_target) {
            return Err(Failure::new(FailureKind::WildcardNotAllowed, raw_target));
        }
        server_path::canonicalize(raw_target)
            .map_err(|_| Failure::new(FailureKind::InvalidPath, raw_target))?
    } else {
        let local = PathBuf::from(raw_target);
        if !local.is_absolute() {
            return Err(Failure::new(FailureKind::InvalidPath, raw_target));
        }
        let translated = match ctx.props.local_to_server(&local) {
            Mapping::Mapped(server) => server,
            Mapping::Cloaked => return Err(Failure::new(FailureKind::ItemCloaked, raw_target)),
            Mapping::NotMapped => return Err(Failure::new(FailureKind::ItemNotMapped, raw_target)),
        };
        if server_path::is_wildcard(&translated) {
            return Err(Failure::new(FailureKind::WildcardNotAllowed, raw_target));
        }
        translated
    };

    let target_unrenamed = ctx.pc.committed_for(&target_root);
    let is_move = is_move(ctx, target_unrenamed.as_deref(), &target_root, request.target_item_type);
    let target_is_folder = match request.target_item_type {
        ItemType::Any => is_directory(ctx, &target_root),
        other => other == ItemType::Folder,
    };

    if parsed.pattern.is_some() && !is_move {
        return Err(Failure::new(FailureKind::WildcardNotAllowed, &parsed.item));
    }
    if server_path::depth(&target_root) == 0 {
        return Err(Failure::new(FailureKind::CannotChangeRootFolder, &parsed.root));
    }
    ctx.check_length(&target_root)?;

    Ok(RenameRoots {
        source_root: parsed.root.clone(),
        target_root,
        target_is_folder,
        root_included: parsed.pattern.is_none(),
    })
}

/// Whether the rename target names a folder to move into. An unknown
/// target under a known parent is a plain rename; with neither known it is
/// treated as a folder.
fn is_move(ctx: &PendContext<'_>, committed: Option<&str>, target: &str, specified: ItemType) -> bool {
    if specified != ItemType::Any {
        return specified == ItemType::Folder;
    }
    let key = committed.unwrap_or(target);
    if let Some((_, entry)) = ctx.lv.get_any_by_server(key) {
        return entry.is_directory();
    }
    let parent_known = server_path::parent(key)
        .and_then(|parent| ctx.lv.get_by_server(&parent, true))
        .is_some();
    !parent_known
}

fn is_directory(ctx: &PendContext<'_>, target: &str) -> bool {
    if server_path::is_team_project(target) {
        return true;
    }
    ctx.items_under(target, 0, true)
        .first()
        .is_some_and(|item| item.is_directory)
}

fn rename_item(
    ctx: &mut PendContext<'_>,
    roots: &RenameRoots,
    lv_id: RowId,
    silent: bool,
    batch: &mut Batch,
) -> Result<Capture> {
    let Some(entry) = ctx.lv.get(lv_id).cloned() else {
        return Ok(Capture::Apply);
    };
    let source_committed = entry.server_item.clone();
    let source_current = ctx.target_of(&entry);
    let target_item = roots.target_of(&source_current);
    let target_local = ctx.local_for(&target_item);
    let case_only = server_path::equals(&source_current, &target_item)
        && !server_path::equals_exact(&source_current, &target_item);

    if server_path::depth(&source_current) == 0 {
        return Ok(Capture::Failed(Failure::new(
            FailureKind::CannotChangeRootFolder,
            &source_current,
        )));
    }
    if let Err(failure) = ctx.check_length(&target_item) {
        return Ok(Capture::Failed(failure));
    }

    let folders = &ctx.props.working_folders;
    if folders
        .iter()
        .any(|wf| server_path::equals(&wf.server_item, &source_current))
    {
        return Ok(Capture::Failed(Failure::new(
            FailureKind::RenameWorkingFolder,
            &source_current,
        )));
    }
    if folders
        .iter()
        .any(|wf| server_path::is_child(&source_current, &wf.server_item))
    {
        return Ok(Capture::RequiresServer);
    }

    if !case_only && ctx.pc.get_by_target(&target_item).is_some() {
        return Ok(Capture::Failed(Failure::new(
            FailureKind::ChangeAlreadyPending,
            &target_item,
        )));
    }
    if ctx.pc.recursive_change_type(&target_item).contains(ChangeType::DELETE) {
        return Ok(Capture::Failed(Failure::new(
            FailureKind::PendingParentDelete,
            &target_item,
        )));
    }

    let main = ctx.pc_for_lv(&entry).map(|(id, pc)| (id, pc.clone()));
    if let Some((main_id, pc)) = &main {
        if pc.is_lock() {
            return Ok(Capture::RequiresServer);
        }
        if pc.is_delete() {
            return Ok(Capture::Failed(Failure::new(
                FailureKind::IncompatibleChange,
                &target_item,
            )));
        }

        // Renaming back to the committed name takes the rename out instead
        let unrenamed = server_path::parent(&target_item)
            .and_then(|parent| ctx.pc.committed_for(&parent))
            .map(|parent| server_path::combine(&parent, server_path::file_name(&target_item)));
        let back_home = unrenamed.is_some_and(|u| server_path::equals_exact(&u, &source_committed))
            || server_path::equals_exact(&source_committed, &target_item);
        if back_home && pc.is_rename() {
            return match undo::undo_changes(ctx, &[*main_id], ChangeType::RENAME)? {
                PendOutcome::RequiresServer => Ok(Capture::RequiresServer),
                PendOutcome::Applied(result) => {
                    batch.changed = true;
                    if !silent {
                        batch.extend(result);
                    }
                    Ok(Capture::Apply)
                }
                PendOutcome::Rejected(failures) => {
                    batch.result.failures.extend(failures);
                    Ok(Capture::Apply)
                }
            };
        }
    }

    if !case_only {
        if let Some((_, conflict)) = target_local.as_deref().and_then(|l| ctx.lv.get_by_local(l)) {
            let item = conflict
                .local_item
                .as_ref()
                .map(|l| l.to_string_lossy().into_owned())
                .unwrap_or_else(|| target_item.clone());
            return Ok(Capture::Failed(Failure::new(FailureKind::ItemExists, item)));
        }
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------
    let mut committed: HashMap<String, Affected> = HashMap::new();
    let mut uncommitted: HashMap<String, Affected> = HashMap::new();
    let mut track = |affected: Affected| {
        match affected.pc.committed_server_item.as_deref() {
            Some(c) => committed.insert(fold_key(c), affected),
            None => uncommitted.insert(fold_key(&affected.pc.target_server_item), affected),
        };
    };

    match main {
        None => track(Affected {
            id: None,
            pc: pending_change_for(&entry, &target_item, ChangeType::RENAME),
        }),
        Some((id, pc)) if pc.committed_server_item.is_none() => track(Affected { id: Some(id), pc }),
        Some((id, pc)) => track(Affected {
            id: Some(id),
            pc: pc.with_change_type(pc.change_type | ChangeType::RENAME),
        }),
    }
    if entry.is_directory() {
        for (id, pc) in ctx.pc.query_by_target(&source_current, usize::MAX) {
            if server_path::equals(&pc.target_server_item, &source_current) {
                continue;
            }
            if pc.is_lock() {
                return Ok(Capture::RequiresServer);
            }
            track(Affected {
                id: Some(id),
                pc: pc.clone(),
            });
        }
    }

    // New targets for every affected change
    let retarget = |affected: &Affected| -> String {
        let current = &affected.pc.target_server_item;
        if affected.id.is_none() || server_path::equals_exact(current, &target_item) {
            current.clone()
        } else {
            roots.target_of(current)
        }
    };
    let new_targets: HashMap<String, String> = committed
        .iter()
        .chain(uncommitted.iter())
        .map(|(_, a)| (fold_key(&a.pc.target_server_item), retarget(a)))
        .collect();

    let mut ops = Vec::new();
    for child in ctx.items_under(&source_current, usize::MAX, true) {
        let Some(child_entry) = ctx.lv.get(child.id) else {
            continue;
        };
        let affected = if child_entry.is_committed() {
            committed.get(&fold_key(&child_entry.server_item))
        } else {
            uncommitted.get(&fold_key(&child_entry.server_item))
        };

        let (child_target, mut op) = match affected {
            Some(affected) => {
                if affected.pc.is_lock() {
                    return Ok(Capture::RequiresServer);
                }
                let child_target = new_targets
                    .get(&fold_key(&affected.pc.target_server_item))
                    .cloned()
                    .unwrap_or_else(|| affected.pc.target_server_item.clone());
                let mut op = ctx.operation_for(child_entry, None, &child_target);
                op.pending_change_id = affected.id;
                op.encoding = affected.pc.encoding;
                if child_entry.is_committed() {
                    op.change_type = affected.pc.change_type | ChangeType::RENAME;
                } else {
                    op.change_type = affected.pc.change_type;
                    op.source_server_item = child_target.clone();
                }
                (child_target, op)
            }
            None => {
                let child_target = roots.target_of(&child.target);
                let mut op = ctx.operation_for(child_entry, None, &child_target);
                op.change_type = ChangeType::RENAME;
                (child_target, op)
            }
        };

        if child.is_deleted {
            continue;
        }
        if let Err(failure) = ctx.check_length(&child_target) {
            return Ok(Capture::Failed(failure));
        }
        let child_local = ctx.local_for(&child_target);
        if let Some((_, conflict)) = child_local.as_deref().and_then(|l| ctx.lv.get_by_local(l)) {
            if !server_path::equals(&conflict.server_item, &child_entry.server_item) {
                return Ok(Capture::Failed(Failure::new(FailureKind::ItemExists, &target_item)));
            }
        }
        if child_local.is_none() && op.change_type.contains(ChangeType::EDIT) {
            return Ok(Capture::Failed(Failure::new(
                FailureKind::TargetCloaked,
                &source_current,
            )));
        }
        op.target_local_item = child_local;
        ops.push(op);
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------
    let mut replacements = Vec::new();
    let mut new_main = None;
    let mut moved_adds = Vec::new();
    for affected in committed.into_values().chain(uncommitted.into_values()) {
        let old_target = affected.pc.target_server_item.clone();
        let new_target = new_targets
            .get(&fold_key(&old_target))
            .cloned()
            .unwrap_or_else(|| old_target.clone());
        if affected.pc.committed_server_item.is_none() {
            moved_adds.push((old_target, new_target.clone()));
        }
        let pc = affected.pc.with_target(new_target);
        match affected.id {
            Some(id) => replacements.push((id, pc)),
            None => new_main = Some(pc),
        }
    }
    ctx.pc.replace_many(replacements);
    if let Some(pc) = new_main {
        ctx.pc.upsert(pc);
    }

    // Uncommitted rows live at their target path and move with it
    let mut re_keyed = Vec::new();
    for (old_target, new_target) in &moved_adds {
        if let Some((id, _)) = ctx.lv.get_by_server(old_target, false) {
            if let Some(row) = ctx.lv.remove(id, true) {
                re_keyed.push((row, new_target.clone()));
            }
        }
    }
    for (row, new_target) in re_keyed {
        let local = ctx.local_for(&new_target);
        let row = row
            .with_server_item(new_target)
            .with_local_item(local)
            .with_flag(LocalItemFlags::PENDING_RECONCILE, true);
        ctx.lv.add(row);
    }
    batch.changed = true;

    if !silent {
        for op in ops {
            batch.push_op(op);
        }
    }
    Ok(Capture::Apply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_pathtree::RecursionType;
    use lws_tables::{
        LocalVersionEntry, LocalVersionTable, PendingChangesTable, WorkingFolder,
        WorkspaceProperties,
    };

    use crate::pend::{pend_add, pend_edit};

    struct Fixture {
        props: WorkspaceProperties,
        lv: LocalVersionTable,
        pc: PendingChangesTable,
    }

    impl Fixture {
        fn new() -> Self {
            let mut props = WorkspaceProperties::new("ws", "me");
            props.set_working_folders(vec![WorkingFolder::map("$/P", "/w")]);
            let mut lv = LocalVersionTable::new();
            lv.add(LocalVersionEntry::new_folder("$/P", Some("/w".into()), 1));
            lv.add(LocalVersionEntry::new_folder("$/P/A", Some("/w/A".into()), 1));
            lv.add(LocalVersionEntry::new_file("$/P/A/a.txt", Some("/w/A/a.txt".into()), 1));
            lv.add(LocalVersionEntry::new_folder("$/P/D", Some("/w/D".into()), 1));
            lv.add(LocalVersionEntry::new_file("$/P/b.txt", Some("/w/b.txt".into()), 1));
            lv.add(LocalVersionEntry::new_file("$/P/c.txt", Some("/w/c.txt".into()), 1));
            Self {
                props,
                lv,
                pc: PendingChangesTable::new(),
            }
        }

        fn ctx(&mut self) -> PendContext<'_> {
            PendContext {
                props: &self.props,
                lv: &mut self.lv,
                pc: &mut self.pc,
                max_server_path: 259,
            }
        }
    }

    #[test]
    fn test_calculate_target_server_item() {
        assert_eq!(calculate_target_server_item("$/P/A", "$/P/A", "$/P/B", false, true), "$/P/B");
        assert_eq!(
            calculate_target_server_item("$/P/A", "$/P/A/x", "$/P/B", false, true),
            "$/P/B/x"
        );
        // Existing folder target: nest
        assert_eq!(
            calculate_target_server_item("$/P/A", "$/P/A/x", "$/P/D", true, true),
            "$/P/D/A/x"
        );
        // Wildcard selection moves the children only
        assert_eq!(
            calculate_target_server_item("$/P/A", "$/P/A/x", "$/P/D", true, false),
            "$/P/D/x"
        );
        // Already at the target root
        assert_eq!(
            calculate_target_server_item("$/P", "$/P/Alpha", "$/P/Alpha", true, false),
            "$/P/Alpha"
        );
    }

    #[test]
    fn test_rename_file() {
        let mut fx = Fixture::new();
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/b.txt", "$/P/bb.txt")], false).unwrap();
        assert!(outcome.is_applied(), "{:?}", outcome);
        let (_, pc) = fx.pc.get_by_target("$/P/bb.txt").unwrap();
        assert_eq!(pc.change_type, ChangeType::RENAME);
        assert_eq!(pc.committed_server_item.as_deref(), Some("$/P/b.txt"));
        assert_eq!(fx.pc.target_for("$/P/b.txt"), "$/P/bb.txt");

        let op = &outcome.operations()[0];
        assert_eq!(op.source_local_item.as_deref(), Some(std::path::Path::new("/w/b.txt")));
        assert_eq!(op.target_local_item.as_deref(), Some(std::path::Path::new("/w/bb.txt")));
    }

    #[test]
    fn test_rename_onto_existing_item_fails_without_mutation() {
        let mut fx = Fixture::new();
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/b.txt", "$/P/c.txt")], false).unwrap();
        match outcome {
            PendOutcome::Rejected(failures) => assert_eq!(failures[0].kind, FailureKind::ItemExists),
            other => panic!("unexpected {:?}", other),
        }
        assert!(fx.pc.is_empty());
        assert_eq!(fx.lv.len(), 6);
    }

    #[test]
    fn test_move_into_existing_folder_nests() {
        let mut fx = Fixture::new();
        pend_edit(&mut fx.ctx(), &[ChangeRequest::item("$/P/A/a.txt", RecursionType::None)], true);
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/A", "$/P/D")], false).unwrap();
        assert!(outcome.is_applied(), "{:?}", outcome);

        assert!(fx.pc.get_by_target("$/P/D/A").is_some());
        let (_, child) = fx.pc.get_by_target("$/P/D/A/a.txt").unwrap();
        assert_eq!(child.change_type, ChangeType::EDIT);
        assert_eq!(child.committed_server_item.as_deref(), Some("$/P/A/a.txt"));
        assert_eq!(outcome.operations().len(), 2);
    }

    #[test]
    fn test_rename_pending_add_rekeys_rows() {
        let mut fx = Fixture::new();
        pend_add(
            &mut fx.ctx(),
            &[ChangeRequest::item("$/P/new.txt", RecursionType::None).with_item_type(ItemType::File)],
            true,
        );
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/new.txt", "$/P/newer.txt")], false).unwrap();
        assert!(outcome.is_applied(), "{:?}", outcome);

        let (_, pc) = fx.pc.get_by_target("$/P/newer.txt").unwrap();
        assert!(!pc.is_rename());
        assert!(fx.lv.get_by_server("$/P/new.txt", false).is_none());
        let (_, row) = fx.lv.get_by_server("$/P/newer.txt", false).unwrap();
        assert_eq!(row.local_item.as_deref(), Some(std::path::Path::new("/w/newer.txt")));
    }

    #[test]
    fn test_rename_back_undoes_rename() {
        let mut fx = Fixture::new();
        pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/b.txt", "$/P/bb.txt")], false).unwrap();
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/bb.txt", "$/P/b.txt")], false).unwrap();
        assert!(outcome.is_applied(), "{:?}", outcome);
        assert!(fx.pc.is_empty());
        assert_eq!(fx.pc.target_for("$/P/b.txt"), "$/P/b.txt");
    }

    #[test]
    fn test_rename_working_folder_root() {
        let mut fx = Fixture::new();
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P", "$/Q")], false).unwrap();
        assert_eq!(outcome.failures()[0].kind, FailureKind::RenameWorkingFolder);
    }

    #[test]
    fn test_rename_folder_containing_mapping_requires_server() {
        let mut fx = Fixture::new();
        fx.lv = LocalVersionTable::new();
        fx.lv.add(LocalVersionEntry::new_folder("$/P/X", Some("/w/X".into()), 1));
        fx.lv.add(LocalVersionEntry::new_folder("$/P/X/Y", None, 1));
        fx.props.set_working_folders(vec![
            WorkingFolder::map("$/P", "/w"),
            WorkingFolder::map("$/P/X/Y", "/elsewhere/Y"),
        ]);
        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/X", "$/P/Z")], false).unwrap();
        assert_eq!(outcome, PendOutcome::RequiresServer);
        assert!(fx.pc.is_empty());
    }

    #[test]
    fn test_wildcard_source_requires_folder_target() {
        let mut fx = Fixture::new();
        let outcome = pend_rename(
            &mut fx.ctx(),
            &[ChangeRequest::rename("$/P/*.txt", "$/P/zz.txt")],
            false,
        )
        .unwrap();
        assert_eq!(outcome.failures()[0].kind, FailureKind::WildcardNotAllowed);

        let outcome = pend_rename(&mut fx.ctx(), &[ChangeRequest::rename("$/P/*.txt", "$/P/D")], false).unwrap();
        assert!(outcome.is_applied(), "{:?}", outcome);
        assert!(fx.pc.get_by_target("$/P/D/b.txt").is_some());
        assert!(fx.pc.get_by_target("$/P/D/c.txt").is_some());
    }
}
