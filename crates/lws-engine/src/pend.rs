//! Add, delete, edit and property pends.

use std::collections::HashSet;

use lws_config::log_engine_debug;
use lws_pathtree::{server_path, RecursionType};
use lws_tables::{
    merge_properties, ChangeType, ItemType, LocalItemFlags, LocalVersionEntry, PendingChange,
    PendingChangeFlags, PropertyValue, RowId, ENCODING_BINARY, ENCODING_FOLDER, ENCODING_UNCHANGED,
};

use crate::context::{now_millis, pending_change_for, Batch, ItemView, ParsedSpec, PendContext};
use crate::failure::{Failure, FailureKind};
use crate::operation::{ChangeRequest, PendOutcome};

/// Property key carrying the executable bit.
pub const EXECUTABLE_KEY: &str = "executable";
/// Property key marking a symbolic link.
pub const SYMLINK_KEY: &str = "symlink";

fn is_local_property(prop: &PropertyValue) -> bool {
    prop.name.eq_ignore_ascii_case(EXECUTABLE_KEY) || prop.name.eq_ignore_ascii_case(SYMLINK_KEY)
}

/// Mirror the executable/symlink properties into the row flags.
fn sync_property_flags(pc: &mut PendingChange) {
    for prop in &pc.properties {
        let on = prop
            .value
            .as_deref()
            .is_some_and(|v| !v.eq_ignore_ascii_case("false") && v != "0");
        if prop.name.eq_ignore_ascii_case(EXECUTABLE_KEY) {
            pc.flags.set(PendingChangeFlags::EXECUTABLE, on);
        } else if prop.name.eq_ignore_ascii_case(SYMLINK_KEY) {
            pc.flags.set(PendingChangeFlags::SYMLINK, on);
        }
    }
}

/// Changes a descendant may carry without blocking a folder delete.
fn delete_conflicting_types() -> ChangeType {
    ChangeType::all()
        - ChangeType::ENCODING
        - ChangeType::DELETE
        - ChangeType::BRANCH
        - ChangeType::MERGE
        - ChangeType::LOCK
}

// ============================================================================
// Add
// ============================================================================

pub(crate) fn pend_add(ctx: &mut PendContext<'_>, requests: &[ChangeRequest], silent: bool) -> PendOutcome {
    let mut batch = Batch::default();
    for request in requests {
        if let Err(failure) = add_one(ctx, request, silent, &mut batch) {
            batch.fail(failure);
        }
    }
    log_engine_debug!(
        "Pended adds",
        requests = requests.len(),
        operations = batch.result.operations.len(),
        failures = batch.result.failures.len()
    );
    batch.finish()
}

fn add_one(
    ctx: &mut PendContext<'_>,
    request: &ChangeRequest,
    silent: bool,
    batch: &mut Batch,
) -> Result<(), Failure> {
    let parsed = ctx.parse_spec(&request.spec)?;
    if parsed.pattern.is_some() {
        return Err(Failure::new(FailureKind::WildcardNotAllowed, &parsed.item));
    }
    let target = parsed.root.clone();
    if server_path::depth(&target) == 0 {
        return Err(Failure::new(FailureKind::CannotChangeRootFolder, &target));
    }
    ctx.check_length(&target)?;

    let local = match &parsed.local_root {
        Some(local) => local.clone(),
        None => match ctx.props.server_to_local(&target) {
            lws_tables::Mapping::Mapped(local) => local,
            lws_tables::Mapping::Cloaked => {
                return Err(Failure::new(FailureKind::ItemCloaked, &parsed.item))
            }
            lws_tables::Mapping::NotMapped => {
                return Err(Failure::new(FailureKind::ItemNotMapped, &parsed.item))
            }
        },
    };

    if let Some((pc_id, pc)) = ctx.pc.get_by_target(&target) {
        if !pc.is_add() {
            return Err(Failure::new(FailureKind::ChangeAlreadyPending, &target));
        }
        // Pended already: the existing row wins, encoding included
        if !silent {
            if let Some((_, entry)) = ctx.lv.get_by_server(&target, false) {
                batch.push_op(ctx.operation_for(entry, Some((pc_id, pc)), &target));
            }
        }
        return Ok(());
    }

    let committed_here = ctx
        .lv
        .get_by_local(&local)
        .is_some_and(|(_, e)| e.is_committed() && !e.is_deleted())
        || ctx
            .pc
            .committed_for(&target)
            .and_then(|committed| ctx.lv.get_by_server(&committed, true))
            .is_some_and(|(_, e)| !e.is_deleted());
    if committed_here {
        return Err(Failure::new(FailureKind::ItemExists, &target));
    }
    if ctx.pc.inherited_change_type(&target).contains(ChangeType::DELETE) {
        return Err(Failure::new(FailureKind::PendingParentDelete, &target));
    }

    let item_type = match request.item_type {
        ItemType::Any if local.is_dir() => ItemType::Folder,
        ItemType::Any => ItemType::File,
        other => other,
    };
    let encoding = match (item_type, request.encoding) {
        (ItemType::Folder, _) => ENCODING_FOLDER,
        (_, ENCODING_UNCHANGED) => ENCODING_BINARY,
        (_, encoding) => encoding,
    };

    let mut entry = if item_type == ItemType::Folder {
        LocalVersionEntry::new_folder(&target, Some(local), 0)
    } else {
        LocalVersionEntry::new_file(&target, Some(local), 0)
    };
    entry.encoding = encoding;
    entry.flags.insert(LocalItemFlags::PENDING_RECONCILE);
    entry.properties = request.properties.clone();
    let lv_id = ctx.lv.add(entry);

    let mut change_type = ChangeType::ADD | ChangeType::ENCODING;
    if item_type == ItemType::File {
        change_type |= ChangeType::EDIT;
    }
    if !request.properties.is_empty() {
        change_type |= ChangeType::PROPERTY;
    }
    let mut pc = PendingChange::new(&target, None, change_type, item_type);
    pc.encoding = encoding;
    pc.properties = request.properties.clone();
    pc.creation_date = now_millis();
    sync_property_flags(&mut pc);
    let pc_id = ctx.pc.upsert(pc);
    batch.changed = true;

    if !silent {
        if let Some(entry) = ctx.lv.get(lv_id) {
            let pending = ctx.pc.get(pc_id).map(|pc| (pc_id, pc));
            batch.push_op(ctx.operation_for(entry, pending, &target));
        }
    }
    Ok(())
}

// ============================================================================
// Delete
// ============================================================================

pub(crate) fn pend_delete(ctx: &mut PendContext<'_>, requests: &[ChangeRequest], silent: bool) -> PendOutcome {
    let mut batch = Batch::default();
    let mut seen: HashSet<RowId> = HashSet::new();
    for request in requests {
        if let Err(failure) = delete_one(ctx, request, silent, &mut batch, &mut seen) {
            batch.fail(failure);
        }
    }
    log_engine_debug!(
        "Pended deletes",
        requests = requests.len(),
        operations = batch.result.operations.len(),
        failures = batch.result.failures.len()
    );
    batch.finish()
}

fn delete_one(
    ctx: &mut PendContext<'_>,
    request: &ChangeRequest,
    silent: bool,
    batch: &mut Batch,
    seen: &mut HashSet<RowId>,
) -> Result<(), Failure> {
    let parsed = ctx.parse_spec(&request.spec)?;
    if parsed.pattern.is_none() {
        let root = &parsed.root;
        if server_path::depth(root) == 0 {
            return Err(Failure::new(FailureKind::CannotChangeRootFolder, root));
        }
        ctx.check_length(root)?;
        if ctx.pc.get_by_target(root).is_some_and(|(_, pc)| pc.is_delete()) {
            return Err(Failure::new(FailureKind::PendingDeleteConflict, root));
        }
        if ctx.pc.inherited_change_type(root).contains(ChangeType::DELETE) {
            return Err(Failure::new(FailureKind::PendingParentDelete, root));
        }
    }

    let items = ctx.expand_roots(&parsed, true);
    if items.is_empty() {
        return Err(Failure::new(FailureKind::ItemNotFound, &parsed.item));
    }
    for item in items {
        if !seen.insert(item.id) {
            continue;
        }
        if let Err(failure) = delete_item(ctx, &item, silent, batch, seen) {
            batch.fail(failure);
        }
    }
    Ok(())
}

fn delete_item(
    ctx: &mut PendContext<'_>,
    item: &ItemView,
    silent: bool,
    batch: &mut Batch,
    seen: &mut HashSet<RowId>,
) -> Result<(), Failure> {
    let target = item.target.clone();
    let entry = ctx
        .lv
        .get(item.id)
        .cloned()
        .ok_or_else(|| Failure::new(FailureKind::ItemNotFound, &target))?;
    if server_path::depth(&target) == 0 {
        return Err(Failure::new(FailureKind::CannotChangeRootFolder, &target));
    }

    let pending = ctx.pc_for_lv(&entry).map(|(id, pc)| (id, pc.clone()));
    if let Some((_, pc)) = &pending {
        if pc.is_add() && !pc.is_committed() {
            return delete_pending_add(ctx, &target, silent, batch);
        }
        let mut remaining =
            pc.change_type - ChangeType::LOCK - ChangeType::BRANCH - ChangeType::PROPERTY;
        if pc.is_branch() {
            remaining -= ChangeType::ENCODING | ChangeType::MERGE;
        }
        if pc.is_edit() && entry.is_missing_on_disk() {
            remaining -= ChangeType::EDIT;
        }
        if !remaining.is_empty() {
            return Err(Failure::new(FailureKind::PendingDeleteConflict, &target));
        }
    }

    if entry.is_directory() {
        let conflicting = delete_conflicting_types();
        for (_, child) in ctx.pc.query_by_target(&target, usize::MAX) {
            if server_path::equals(&child.target_server_item, &target) {
                continue;
            }
            let bits = child.change_type & conflicting;
            if bits.is_empty() {
                continue;
            }
            let missing_edit = bits == ChangeType::EDIT
                && ctx.lv_for_pc(child).is_some_and(|(_, e)| e.is_missing_on_disk());
            if !missing_edit {
                return Err(Failure::new(FailureKind::PendingDeleteConflict, &target));
            }
        }
        if entry.is_committed() {
            let renamed_out = ctx
                .pc
                .query_by_committed(&entry.server_item, usize::MAX)
                .any(|(_, pc)| {
                    pc.is_rename()
                        && pc
                            .committed_server_item
                            .as_deref()
                            .is_some_and(|c| !server_path::equals(c, &entry.server_item))
                });
            if renamed_out {
                return Err(Failure::new(FailureKind::PendingChildException, &target));
            }
        }
    }

    if ctx.pc.inherited_change_type(&target).contains(ChangeType::DELETE) {
        return Err(Failure::new(FailureKind::PendingParentDelete, &target));
    }

    // Accepted
    let pc = match pending {
        Some((_, pc)) => pc.with_change_type((pc.change_type | ChangeType::DELETE) - ChangeType::EDIT),
        None => pending_change_for(&entry, &target, ChangeType::DELETE),
    };
    let pc_id = ctx.pc.upsert(pc);
    ctx.pc.remove_candidate(&target);

    if entry.is_directory() {
        let children: Vec<(RowId, PendingChange)> = ctx
            .pc
            .query_by_target(&target, usize::MAX)
            .filter(|(id, _)| *id != pc_id)
            .map(|(id, pc)| (id, pc.clone()))
            .collect();
        for (id, child) in children {
            if child.change_type == ChangeType::DELETE {
                ctx.pc.remove(id);
                continue;
            }
            let mut change_type = child.change_type | ChangeType::DELETE;
            if child.is_edit() && ctx.lv_for_pc(&child).is_some_and(|(_, e)| e.is_missing_on_disk()) {
                change_type -= ChangeType::EDIT;
            }
            ctx.pc.replace(id, child.with_change_type(change_type));
        }
    }
    batch.changed = true;

    if silent {
        return Ok(());
    }
    let pending = ctx.pc.get(pc_id).map(|pc| (pc_id, pc));
    let mut op = ctx.operation_for(&entry, pending, &target);
    op.target_local_item = None;
    batch.push_op(op);

    if entry.is_directory() {
        for (id, child) in ctx.lv.query_by_server(&entry.server_item, usize::MAX, false) {
            if id == item.id || !seen.insert(id) {
                continue;
            }
            let child_target = ctx.target_of(child);
            let mut op = ctx.operation_for(child, None, &child_target);
            op.baseline_file_guid = None;
            op.target_local_item = None;
            op.pending_change_id = None;
            op.change_type = ctx.pc.recursive_change_type(&child_target);
            batch.push_op(op);
        }
    }
    Ok(())
}

/// Deleting a pending add takes the add back out, along with the adds
/// beneath it.
fn delete_pending_add(
    ctx: &mut PendContext<'_>,
    target: &str,
    silent: bool,
    batch: &mut Batch,
) -> Result<(), Failure> {
    let adds: Vec<(RowId, PendingChange)> = ctx
        .pc
        .query_by_target(target, usize::MAX)
        .map(|(id, pc)| (id, pc.clone()))
        .collect();
    if adds.iter().any(|(_, pc)| pc.is_committed() || !(pc.is_add() || pc.is_branch())) {
        return Err(Failure::new(FailureKind::PendingDeleteConflict, target));
    }

    for (id, pc) in adds.into_iter().rev() {
        let removed = ctx.lv.remove_by_server(&pc.target_server_item, false, true);
        ctx.pc.remove(id);
        if silent {
            continue;
        }
        if let Some(entry) = removed {
            let mut op = ctx.operation_for(&entry, None, &pc.target_server_item);
            op.change_type = ChangeType::DELETE;
            op.target_local_item = None;
            batch.push_op(op);
        }
    }
    batch.changed = true;
    Ok(())
}

// ============================================================================
// Edit
// ============================================================================

pub(crate) fn pend_edit(ctx: &mut PendContext<'_>, requests: &[ChangeRequest], silent: bool) -> PendOutcome {
    let mut batch = Batch::default();
    let mut seen: HashSet<RowId> = HashSet::new();
    for request in requests {
        let parsed = match ctx.parse_spec(&request.spec) {
            Ok(parsed) => parsed,
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
            if !seen.insert(item.id) {
                continue;
            }
            if item.is_directory {
                if parsed.recursion == RecursionType::None {
                    batch.fail(Failure::new(FailureKind::NotAllowedOnFolder, &item.target));
                }
                continue;
            }
            if let Err(failure) = edit_item(ctx, request, &item, silent, &mut batch) {
                batch.fail(failure);
            }
        }
    }
    log_engine_debug!(
        "Pended edits",
        requests = requests.len(),
        operations = batch.result.operations.len(),
        failures = batch.result.failures.len()
    );
    batch.finish()
}

fn edit_item(
    ctx: &mut PendContext<'_>,
    request: &ChangeRequest,
    item: &ItemView,
    silent: bool,
    batch: &mut Batch,
) -> Result<(), Failure> {
    let target = &item.target;
    let entry = ctx
        .lv
        .get(item.id)
        .cloned()
        .ok_or_else(|| Failure::new(FailureKind::ItemNotFound, target))?;
    let pending = ctx.pc_for_lv(&entry).map(|(_, pc)| pc.clone());

    if pending.as_ref().is_some_and(PendingChange::is_delete) {
        return Err(Failure::new(FailureKind::IncompatibleChange, target));
    }
    if ctx.pc.recursive_change_type(target).contains(ChangeType::DELETE) {
        return Err(Failure::new(FailureKind::PendingParentDelete, target));
    }
    if pending.as_ref().is_some_and(PendingChange::is_add) && request.encoding == ENCODING_UNCHANGED {
        return Err(Failure::new(FailureKind::IncompatibleChange, target));
    }

    let mut pc = match pending {
        Some(pc) => pc.with_change_type(pc.change_type | ChangeType::EDIT),
        None => pending_change_for(&entry, target, ChangeType::EDIT),
    };
    if request
        .properties
        .iter()
        .any(|p| p.name.eq_ignore_ascii_case(SYMLINK_KEY))
    {
        pc.change_type |= ChangeType::PROPERTY;
        pc.properties = merge_properties(&pc.properties, &request.properties);
        sync_property_flags(&mut pc);
    }
    if request.encoding != ENCODING_UNCHANGED {
        pc.encoding = request.encoding;
        pc.change_type |= ChangeType::ENCODING;
    }
    let pc_id = ctx.pc.upsert(pc);
    batch.changed = true;

    if !silent {
        let pending = ctx.pc.get(pc_id).map(|pc| (pc_id, pc));
        let mut op = ctx.operation_for(&entry, pending, target);
        op.change_type = ctx.pc.recursive_change_type(target);
        batch.push_op(op);
    }
    Ok(())
}

// ============================================================================
// Property
// ============================================================================

pub(crate) fn pend_property(
    ctx: &mut PendContext<'_>,
    requests: &[ChangeRequest],
    silent: bool,
) -> PendOutcome {
    // Only the bits a pending change row can carry are handled offline
    if requests
        .iter()
        .flat_map(|r| r.properties.iter())
        .any(|p| !is_local_property(p))
    {
        log_engine_debug!("Property change requires the server", requests = requests.len());
        return PendOutcome::RequiresServer;
    }

    let mut batch = Batch::default();
    let mut seen: HashSet<RowId> = HashSet::new();
    for request in requests {
        let parsed = match ctx.parse_spec(&request.spec) {
            Ok(parsed) => parsed,
            Err(failure) => {
                batch.fail(failure);
                continue;
            }
        };
        if let Err(failure) = property_spec(ctx, request, &parsed, silent, &mut batch, &mut seen) {
            batch.fail(failure);
        }
    }
    batch.finish()
}

fn property_spec(
    ctx: &mut PendContext<'_>,
    request: &ChangeRequest,
    parsed: &ParsedSpec,
    silent: bool,
    batch: &mut Batch,
    seen: &mut HashSet<RowId>,
) -> Result<(), Failure> {
    let items = ctx.expand(parsed, false);
    if items.is_empty() {
        return Err(Failure::new(FailureKind::ItemNotFound, &parsed.item));
    }
    for item in items {
        if !seen.insert(item.id) {
            continue;
        }
        let Some(entry) = ctx.lv.get(item.id).cloned() else {
            continue;
        };
        let pending = ctx.pc_for_lv(&entry).map(|(_, pc)| pc.clone());
        if pending.as_ref().is_some_and(PendingChange::is_delete) {
            batch.fail(Failure::new(FailureKind::IncompatibleChange, &item.target));
            continue;
        }
        if ctx.pc.recursive_change_type(&item.target).contains(ChangeType::DELETE) {
            batch.fail(Failure::new(FailureKind::PendingParentDelete, &item.target));
            continue;
        }

        let mut pc = match pending {
            Some(pc) => pc.with_change_type(pc.change_type | ChangeType::PROPERTY),
            None => pending_change_for(&entry, &item.target, ChangeType::PROPERTY),
        };
        pc.properties = merge_properties(&pc.properties, &request.properties);
        sync_property_flags(&mut pc);
        let pc_id = ctx.pc.upsert(pc);
        batch.changed = true;

        if !silent {
            let pending = ctx.pc.get(pc_id).map(|pc| (pc_id, pc));
            let mut op = ctx.operation_for(&entry, pending, &item.target);
            op.change_type = ctx.pc.recursive_change_type(&item.target);
            batch.push_op(op);
        }
    }
    Ok(())
}
