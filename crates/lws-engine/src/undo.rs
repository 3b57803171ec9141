//! Undo of pending changes.
//!
//! Undoing a rename moves an item back to its committed path, which can
//! shift other items still under pending renames. When only some of the
//! workspace's renames are undone, the final path of every
//! namespace-changing change is recomputed before anything is touched, and
//! two changes landing on the same path abort the whole undo.

use std::collections::{BTreeMap, HashMap, HashSet};

use lws_config::{log_engine_debug, log_engine_info};
use lws_pathtree::server_path;
use lws_tables::{ChangeType, ItemType, LocalItemFlags, PendingChange, RowId};

use crate::context::{fold_key, PendContext};
use crate::failure::{Failure, FailureKind};
use crate::operation::{GetOperation, ItemSpec, PendOutcome, PendResult};
use crate::query::query_pending_changes;
use crate::{EngineError, Result};

/// A pending change chosen for undo.
#[derive(Debug, Clone)]
struct UndoneChange {
    id: RowId,
    pc: PendingChange,
    /// The bits being taken out
    undone: ChangeType,
    /// Where the item lands once the undo is done
    revert_to: String,
}

impl UndoneChange {
    fn is_undoing(&self, bits: ChangeType) -> bool {
        self.undone.intersects(bits)
    }

    fn is_undoing_recursive(&self) -> bool {
        self.pc.is_folder() && self.is_undoing(ChangeType::RENAME_OR_DELETE)
    }

    fn remaining(&self) -> ChangeType {
        self.pc.change_type - self.undone
    }
}

/// Node of the rename-consistency pass: `source` is where the item lives
/// once every undone rename is reverted, `target` where it lands.
#[derive(Debug, Clone)]
struct RenameNode {
    source: String,
    target: String,
    pc: PendingChange,
    undoing: bool,
}

/// Undo every pending change matched by `specs`.
pub(crate) fn undo_pending_changes(ctx: &mut PendContext<'_>, specs: &[ItemSpec]) -> Result<PendOutcome> {
    let (found, mut failures) = query_pending_changes(ctx, specs, false);
    let ids: Vec<RowId> = found.into_iter().filter_map(|q| q.id).collect();
    if ids.is_empty() {
        return Ok(PendOutcome::from_result(
            PendResult {
                operations: Vec::new(),
                failures,
            },
            false,
        ));
    }
    match undo_changes(ctx, &ids, ChangeType::all())? {
        PendOutcome::Applied(mut result) => {
            failures.append(&mut result.failures);
            result.failures = failures;
            Ok(PendOutcome::Applied(result))
        }
        other => Ok(other),
    }
}

/// Undo the `selective` bits of the pending changes `ids`.
#[tracing::instrument(skip(ctx, ids), level = "debug")]
pub(crate) fn undo_changes(
    ctx: &mut PendContext<'_>,
    ids: &[RowId],
    selective: ChangeType,
) -> Result<PendOutcome> {
    let mut undone: Vec<UndoneChange> = Vec::new();
    let mut by_target: HashMap<String, usize> = HashMap::new();
    let mut undo_rename_count = 0usize;

    for &id in ids {
        let Some(pc) = ctx.pc.get(id).cloned() else {
            continue;
        };
        let bits = pc.change_type & selective;
        if bits.is_empty() {
            continue;
        }
        let change = UndoneChange {
            id,
            revert_to: pc.target_server_item.clone(),
            undone: bits,
            pc,
        };

        if change.is_undoing(ChangeType::LOCK) || (change.is_undoing(ChangeType::RENAME) && change.pc.is_lock()) {
            log_engine_info!(
                "Undo of a lock requires the server",
                item = change.pc.target_server_item.as_str()
            );
            return Ok(PendOutcome::RequiresServer);
        }
        if change.is_undoing(ChangeType::RENAME) {
            undo_rename_count += 1;
            let target = &change.pc.target_server_item;
            if ctx
                .props
                .working_folders
                .iter()
                .any(|wf| server_path::is_child(target, &wf.server_item))
            {
                log_engine_info!("Undo of a rename would move a working folder", item = target.as_str());
                return Ok(PendOutcome::RequiresServer);
            }
        }
        if by_target.contains_key(&fold_key(&change.pc.target_server_item)) {
            continue;
        }
        by_target.insert(fold_key(&change.pc.target_server_item), undone.len());
        undone.push(change);
    }
    if undone.is_empty() {
        return Ok(PendOutcome::Applied(PendResult::default()));
    }

    // Deepest first, so the nearest undone recursive change wins below
    undone.sort_by(|a, b| server_path::compare(&b.pc.target_server_item, &a.pc.target_server_item));
    by_target = undone
        .iter()
        .enumerate()
        .map(|(i, c)| (fold_key(&c.pc.target_server_item), i))
        .collect();

    if undo_rename_count > 0 {
        compute_revert_paths(ctx, &mut undone, &by_target, undo_rename_count)?;
    }

    // ------------------------------------------------------------------
    // Capture: one operation per undone change
    // ------------------------------------------------------------------
    let mut ops: BTreeMap<(String, bool), GetOperation> = BTreeMap::new();
    let mut failures = Vec::new();
    let mut lv_removals = Vec::new();

    for change in &undone {
        ctx.check_length(&change.revert_to)
            .map_err(|_| EngineError::PathTooLong {
                path: change.revert_to.clone(),
            })?;
        let pc = &change.pc;
        let lv_row = ctx.lv_for_pc(pc).map(|(id, e)| (id, e.clone()));

        let mut op = GetOperation {
            target_server_item: change.revert_to.clone(),
            source_server_item: pc.server_item().to_string(),
            ..GetOperation::default()
        };
        if let Some((_, entry)) = &lv_row {
            if !entry.is_deleted() {
                op.source_local_item = entry.local_item.clone();
            }
        }

        if (pc.deletion_id == 0 || change.remaining().contains(ChangeType::UNDELETE))
            && !change.is_undoing(ChangeType::BRANCH)
        {
            let target_local = ctx.local_for(&change.revert_to);
            if lv_row.is_some() {
                op.target_local_item = target_local;
                // Adds are never deleted from disk, even when cloaked
                if pc.is_add() && op.target_local_item.is_none() {
                    op.target_local_item = op.source_local_item.clone();
                }
            } else if target_local.is_some() {
                failures.push(Failure::warning(FailureKind::BaselineUnavailable, &change.revert_to));
            }
        }

        op.encoding = if !pc.is_encoding() {
            pc.encoding
        } else if let Some((_, entry)) = &lv_row {
            entry.encoding
        } else {
            log_engine_info!(
                "Committed encoding unknown, undo requires the server",
                item = pc.target_server_item.as_str()
            );
            return Ok(PendOutcome::RequiresServer);
        };

        op.change_type = change.undone;
        if !change.is_undoing(ChangeType::ADD | ChangeType::BRANCH) {
            for (_, parent) in ctx.pc.parents_of(&pc.target_server_item) {
                let Some(&i) = by_target.get(&fold_key(&parent.target_server_item)) else {
                    continue;
                };
                if parent.is_recursive_change() {
                    op.change_type |= undone[i].undone & ChangeType::RENAME_OR_DELETE;
                }
            }
        }

        op.deletion_id = pc.deletion_id;
        op.item_type = pc.item_type;
        op.pending_change_id = Some(change.id);
        op.item_id = pc.item_id;
        match &lv_row {
            Some((_, entry)) => {
                if entry.is_committed() && !entry.is_directory() {
                    op.baseline_file_guid = entry.baseline_file_guid;
                }
                op.hash = entry.hash;
                op.length = entry.length;
                op.version_local = if entry.is_deleted() { 0 } else { entry.version };
                op.version_server = entry.version;
                op.properties = pc.properties.clone();
            }
            None => op.version_server = pc.version,
        }

        if change.is_undoing(ChangeType::ADD)
            || (change.is_undoing(ChangeType::BRANCH) && op.target_local_item.is_some())
        {
            if let Some((id, _)) = &lv_row {
                lv_removals.push(*id);
            }
        }
        ops.insert((fold_key(&op.source_server_item), pc.is_committed()), op);
    }

    // ------------------------------------------------------------------
    // Capture: items beneath undone recursive changes
    // ------------------------------------------------------------------
    let mut moved: Vec<(String, String)> = Vec::new();
    for change in undone.iter().filter(|c| c.is_undoing_recursive()) {
        let root = &change.pc.target_server_item;
        for item in ctx.items_under(root, usize::MAX, true) {
            let Some(entry) = ctx.lv.get(item.id) else {
                continue;
            };
            let key = (fold_key(&entry.server_item), entry.is_committed());
            if ops.contains_key(&key) {
                continue;
            }
            let current = item.target.clone();
            let new_target = server_path::rebase(&current, root, &change.revert_to);
            ctx.check_length(&new_target)
                .map_err(|_| EngineError::PathTooLong {
                    path: new_target.clone(),
                })?;

            let mut op = GetOperation {
                source_local_item: if entry.is_deleted() {
                    None
                } else {
                    entry.local_item.clone()
                },
                source_server_item: if entry.is_committed() {
                    entry.server_item.clone()
                } else {
                    new_target.clone()
                },
                target_local_item: ctx.local_for(&new_target),
                target_server_item: new_target.clone(),
                encoding: entry.encoding,
                item_type: if entry.is_directory() {
                    ItemType::Folder
                } else {
                    ItemType::File
                },
                properties: entry.properties.clone(),
                item_id: entry.item_id,
                hash: entry.hash,
                length: entry.length,
                version_local: if entry.is_deleted() { 0 } else { entry.version },
                version_server: entry.version,
                ..GetOperation::default()
            };
            if entry.is_committed() && !entry.is_directory() {
                op.baseline_file_guid = entry.baseline_file_guid;
            }

            if !server_path::equals(&current, &new_target) {
                if !entry.is_committed() {
                    op.item_id = 0;
                }
                if let Some((_, pc)) = ctx.pc.get_by_target(&current) {
                    if pc.is_lock() {
                        return Ok(PendOutcome::RequiresServer);
                    }
                    if pc.is_merge() {
                        return Err(EngineError::CannotRenameDueToChildConflict {
                            parent: root.clone(),
                            child: pc.target_server_item.clone(),
                        });
                    }
                    moved.push((current.clone(), new_target.clone()));
                }
            }

            // Still deleted when an enclosing delete stays pending
            let mut still_deleted = false;
            let own = ctx.pc.get_by_target(&current);
            for (_, parent) in own.into_iter().chain(ctx.pc.parents_of(&current)) {
                match by_target.get(&fold_key(&parent.target_server_item)) {
                    None if parent.is_delete() => {
                        still_deleted = true;
                        break;
                    }
                    None => {}
                    Some(&i) => op.change_type |= undone[i].undone & ChangeType::RENAME_OR_DELETE,
                }
            }

            if (!entry.is_deleted() || !still_deleted)
                && (op.target_local_item.is_some() || op.source_local_item.is_some())
            {
                ops.insert(key, op);
            }
        }
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------
    let mut remainders = Vec::new();
    for change in &undone {
        ctx.pc.remove(change.id);
        let remaining = change.remaining();
        if !remaining.is_empty() {
            remainders.push(
                change
                    .pc
                    .with_change_type(remaining)
                    .with_target(change.revert_to.clone()),
            );
        }
    }
    for pc in remainders {
        ctx.pc.upsert(pc);
    }
    for id in lv_removals {
        ctx.lv.remove(id, true);
    }

    let mut re_keyed = Vec::new();
    for (old, new) in &moved {
        let Some(pc) = ctx.pc.remove_by_target(old) else {
            continue;
        };
        let row = if pc.is_committed() {
            None
        } else {
            ctx.lv
                .get_by_server(old, false)
                .map(|(id, _)| id)
                .and_then(|id| ctx.lv.remove(id, true))
        };
        re_keyed.push((pc, row, new.clone()));
    }
    for (pc, row, new) in re_keyed {
        let mut pc = pc.with_target(new.clone());
        if !pc.is_committed() {
            pc.item_id = 0;
        }
        ctx.pc.upsert(pc);
        if let Some(row) = row {
            let local = ctx.local_for(&new);
            let mut row = row
                .with_server_item(new)
                .with_local_item(local)
                .with_flag(LocalItemFlags::PENDING_RECONCILE, true);
            row.item_id = 0;
            ctx.lv.add(row);
        }
    }

    log_engine_debug!(
        "Undid pending changes",
        changes = undone.len(),
        operations = ops.len(),
        warnings = failures.len()
    );
    Ok(PendOutcome::Applied(PendResult {
        operations: ops.into_values().collect(),
        failures,
    }))
}

/// Fill in `revert_to` for every undone change when renames are among
/// them.
fn compute_revert_paths(
    ctx: &PendContext<'_>,
    undone: &mut [UndoneChange],
    by_target: &HashMap<String, usize>,
    undo_rename_count: usize,
) -> Result<()> {
    let undoing_renames: HashSet<String> = undone
        .iter()
        .filter(|c| c.is_undoing(ChangeType::RENAME))
        .map(|c| fold_key(&c.pc.target_server_item))
        .collect();
    let undoing_rename_at = |target: &str| undoing_renames.contains(&fold_key(target));

    let mut total_renames = 0usize;
    let mut remaining_folder_renames: Vec<PendingChange> = Vec::new();
    for (_, pc) in ctx.pc.iter() {
        if !pc.is_rename() {
            continue;
        }
        total_renames += 1;
        if pc.is_recursive_change() && !undoing_rename_at(&pc.target_server_item) {
            remaining_folder_renames.push(pc.clone());
        }
    }

    if undone.len() != ctx.pc.len() {
        // A retained change occupying the committed slot of an undone
        // rename blocks it from moving back
        for change in undone.iter() {
            let pc = &change.pc;
            let Some(committed) = pc.committed_server_item.as_deref() else {
                continue;
            };
            if pc.deletion_id != 0
                || !change.is_undoing(ChangeType::RENAME)
                || server_path::equals(committed, &pc.target_server_item)
            {
                continue;
            }
            for (_, occupant) in ctx.pc.query_by_target(committed, usize::MAX) {
                if !(occupant.is_add() || occupant.is_branch() || occupant.is_rename()) {
                    continue;
                }
                let leaves = by_target
                    .get(&fold_key(&occupant.target_server_item))
                    .is_some_and(|&i| {
                        undone[i].is_undoing(ChangeType::ADD | ChangeType::BRANCH | ChangeType::RENAME)
                    });
                if !leaves {
                    return Err(EngineError::PartialRenameConflict {
                        path: occupant.target_server_item.clone(),
                    });
                }
            }
        }
    }

    if undo_rename_count == total_renames {
        for change in undone.iter_mut() {
            change.revert_to = match change.pc.committed_server_item.as_deref() {
                Some(committed) => committed.to_string(),
                None => ctx
                    .pc
                    .committed_for(&change.pc.target_server_item)
                    .unwrap_or_else(|| change.pc.target_server_item.clone()),
            };
        }
        return Ok(());
    }

    // A retained folder rename must not end up beneath an undone rename
    // nested in it that moves to a shallower path
    for remaining in &remaining_folder_renames {
        let Some(committed) = remaining.committed_server_item.as_deref() else {
            continue;
        };
        for (_, pc) in ctx.pc.query_by_committed(committed, usize::MAX) {
            if !(pc.is_rename() && pc.is_recursive_change()) || !undoing_rename_at(&pc.target_server_item) {
                continue;
            }
            if server_path::depth(&pc.target_server_item) < server_path::depth(&remaining.target_server_item) {
                return Err(EngineError::PartialRenameConflict {
                    path: pc.server_item().to_string(),
                });
            }
        }
    }

    let mut nodes: Vec<RenameNode> = Vec::new();
    let mut node_at: HashMap<String, usize> = HashMap::new();
    for change in undone.iter() {
        node_at.insert(fold_key(&change.pc.target_server_item), nodes.len());
        nodes.push(RenameNode {
            source: change.pc.server_item().to_string(),
            target: change.pc.target_server_item.clone(),
            pc: change.pc.clone(),
            undoing: change.is_undoing(ChangeType::RENAME),
        });
    }
    for (_, pc) in ctx.pc.iter() {
        let key = fold_key(&pc.target_server_item);
        if !(pc.is_rename() || pc.is_add() || pc.is_branch()) || by_target.contains_key(&key) {
            continue;
        }
        node_at.insert(key, nodes.len());
        nodes.push(RenameNode {
            source: pc.server_item().to_string(),
            target: pc.target_server_item.clone(),
            pc: pc.clone(),
            undoing: false,
        });
    }

    let mut renames: Vec<usize> = (0..nodes.len()).filter(|&i| nodes[i].pc.is_rename()).collect();
    renames.sort_by(|&a, &b| server_path::compare(nodes[a].pc.server_item(), nodes[b].pc.server_item()));

    for i in renames {
        let source = nodes[i].source.clone();
        let target = nodes[i].target.clone();
        let undoing = nodes[i].undoing;
        for node in nodes.iter_mut() {
            let shifted = !server_path::equals(&node.source, &node.target)
                || server_path::equals(&node.pc.target_server_item, &node.source);
            if !shifted {
                continue;
            }
            if undoing {
                if server_path::is_child(&target, &node.target) {
                    node.target = server_path::rebase(&node.target, &target, &source);
                }
            } else if server_path::is_child(&source, &node.source) {
                node.source = server_path::rebase(&node.source, &source, &target);
            }
        }
    }

    check_duplicate_targets(&nodes)?;

    for change in undone.iter_mut() {
        if let Some(&i) = node_at.get(&fold_key(&change.pc.target_server_item)) {
            change.revert_to = nodes[i].target.clone();
        }
    }
    Ok(())
}

/// Two nodes ending at the same path is a conflict. Renames of deleted
/// items never take part.
fn check_duplicate_targets(nodes: &[RenameNode]) -> Result<()> {
    let mut sorted: Vec<&RenameNode> = nodes
        .iter()
        .filter(|n| n.pc.deletion_id == 0 || !n.pc.is_rename())
        .collect();
    sorted.sort_by(|a, b| server_path::compare(&a.target, &b.target));
    for pair in sorted.windows(2) {
        if server_path::equals(&pair[0].target, &pair[1].target) {
            return Err(EngineError::PartialRenameConflict {
                path: pair[1].target.clone(),
            });
        }
    }
    Ok(())
}
