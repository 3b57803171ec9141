//! Shared state and helpers for one engine call.
//!
//! A [`PendContext`] borrows the three tables of an open transaction. All
//! lookups that cross the committed/target namespaces go through it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use lws_pathtree::{server_path, RecursionType};
use lws_tables::{
    ChangeType, ItemType, LocalVersionEntry, LocalVersionTable, Mapping, PendingChange,
    PendingChangesTable, RowId, WorkspaceProperties,
};

use crate::failure::{Failure, FailureKind};
use crate::operation::{GetOperation, ItemSpec, PendOutcome, PendResult};

pub(crate) struct PendContext<'t> {
    pub props: &'t WorkspaceProperties,
    pub lv: &'t mut LocalVersionTable,
    pub pc: &'t mut PendingChangesTable,
    pub max_server_path: usize,
}

/// An item spec resolved into the target namespace.
#[derive(Debug, Clone)]
pub(crate) struct ParsedSpec {
    /// The spec as given, for failure records
    pub item: String,
    /// Target server path of the root (the folder holding a wildcard)
    pub root: String,
    /// Local root when the spec was a local path
    pub local_root: Option<PathBuf>,
    pub pattern: Option<String>,
    pub recursion: RecursionType,
}

impl ParsedSpec {
    pub fn is_server_item(&self) -> bool {
        self.local_root.is_none()
    }

    /// Whether a target path falls inside this spec.
    pub fn matches_target(&self, target: &str) -> bool {
        matches_under(&self.root, target, self.pattern.as_deref(), self.recursion)
    }

    /// Whether a local path falls inside this spec.
    pub fn matches_local(&self, local: &Path) -> bool {
        let Some(root) = &self.local_root else {
            return false;
        };
        if !lws_pathtree::local_path::is_child(root, local) {
            return false;
        }
        let depth = local.components().count() - root.components().count();
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match &self.pattern {
            Some(pattern) => {
                depth >= 1
                    && (depth == 1 || self.recursion == RecursionType::Full)
                    && server_path::matches_pattern(&name, pattern)
            }
            None => depth <= self.recursion.depth(),
        }
    }
}

fn matches_under(root: &str, target: &str, pattern: Option<&str>, recursion: RecursionType) -> bool {
    if !server_path::is_child(root, target) {
        return false;
    }
    let depth = server_path::depth(target) - server_path::depth(root);
    match pattern {
        Some(pattern) => {
            depth >= 1
                && (depth == 1 || recursion == RecursionType::Full)
                && server_path::matches_pattern(server_path::file_name(target), pattern)
        }
        None => depth <= recursion.depth(),
    }
}

/// One local version row seen through its target path.
#[derive(Debug, Clone)]
pub(crate) struct ItemView {
    pub id: RowId,
    pub target: String,
    pub is_directory: bool,
    pub is_committed: bool,
    pub is_deleted: bool,
}

impl<'t> PendContext<'t> {
    // ========================================================================
    // Translation
    // ========================================================================

    pub fn local_for(&self, server_item: &str) -> Option<PathBuf> {
        self.props.server_to_local(server_item).mapped()
    }

    /// Target path of an lv row.
    pub fn target_of(&self, entry: &LocalVersionEntry) -> String {
        if entry.is_committed() {
            self.pc.target_for(&entry.server_item)
        } else {
            entry.server_item.clone()
        }
    }

    /// Server path of a local item: its lv row when it has one, the working
    /// folders otherwise.
    pub fn resolve_local(&self, local: &Path) -> Mapping<String> {
        if let Some((_, entry)) = self.lv.get_by_local(local) {
            return Mapping::Mapped(self.target_of(entry));
        }
        self.props.local_to_server(local)
    }

    pub fn pc_for_lv(&self, entry: &LocalVersionEntry) -> Option<(RowId, &PendingChange)> {
        if entry.is_committed() {
            self.pc.get_by_committed(&entry.server_item)
        } else {
            self.pc.get_by_target(&entry.server_item)
        }
    }

    pub fn lv_for_pc(&self, pc: &PendingChange) -> Option<(RowId, &LocalVersionEntry)> {
        match &pc.committed_server_item {
            Some(committed) => self.lv.get_by_server(committed, true),
            None => self.lv.get_by_server(&pc.target_server_item, false),
        }
    }

    pub fn check_length(&self, server_item: &str) -> Result<(), Failure> {
        if server_path::server_length(server_item) > self.max_server_path {
            return Err(Failure::new(FailureKind::RepositoryPathTooLong, server_item));
        }
        Ok(())
    }

    // ========================================================================
    // Item specs
    // ========================================================================

    pub fn parse_spec(&self, spec: &ItemSpec) -> Result<ParsedSpec, Failure> {
        let raw = spec.item.trim();
        if server_path::is_server_path(raw) {
            let canonical = server_path::canonicalize(raw)
                .map_err(|_| Failure::new(FailureKind::InvalidPath, raw))?;
            let (root, pattern) = if server_path::is_wildcard(&canonical) {
                let parent = server_path::parent(&canonical)
                    .ok_or_else(|| Failure::new(FailureKind::InvalidPath, raw))?;
                (parent, Some(server_path::file_name(&canonical).to_string()))
            } else {
                (canonical, None)
            };
            return Ok(ParsedSpec {
                item: raw.to_string(),
                root,
                local_root: None,
                pattern,
                recursion: spec.recursion,
            });
        }

        let path = PathBuf::from(raw);
        if !path.is_absolute() {
            return Err(Failure::new(FailureKind::InvalidPath, raw));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (local_root, pattern) = if name.contains('*') || name.contains('?') {
            let parent = path
                .parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| Failure::new(FailureKind::InvalidPath, raw))?;
            (parent, Some(name))
        } else {
            (path, None)
        };
        let root = match self.resolve_local(&local_root) {
            Mapping::Mapped(server) => server,
            Mapping::Cloaked => return Err(Failure::new(FailureKind::ItemCloaked, raw)),
            Mapping::NotMapped => return Err(Failure::new(FailureKind::ItemNotMapped, raw)),
        };
        Ok(ParsedSpec {
            item: raw.to_string(),
            root,
            local_root: Some(local_root),
            pattern,
            recursion: spec.recursion,
        })
    }

    /// Rows matched by a parsed spec, in target order.
    pub fn expand(&self, parsed: &ParsedSpec, include_deleted: bool) -> Vec<ItemView> {
        let depth = match (&parsed.pattern, parsed.recursion) {
            (Some(_), RecursionType::Full) => usize::MAX,
            (Some(_), _) => 1,
            (None, recursion) => recursion.depth(),
        };
        self.items_under(&parsed.root, depth, include_deleted)
            .into_iter()
            .filter(|item| parsed.matches_target(&item.target))
            .collect()
    }

    /// Top-most rows matched by a spec: rows beneath another matched
    /// folder are dropped.
    pub fn expand_roots(&self, parsed: &ParsedSpec, include_deleted: bool) -> Vec<ItemView> {
        let mut roots: Vec<ItemView> = Vec::new();
        for item in self.expand(parsed, include_deleted) {
            let covered = roots
                .iter()
                .any(|r| r.is_directory && server_path::is_child(&r.target, &item.target));
            if !covered {
                roots.push(item);
            }
        }
        roots
    }

    /// Every lv row whose target path is at or beneath `target`, down to
    /// `depth` levels, in target order.
    pub fn items_under(&self, target: &str, depth: usize, include_deleted: bool) -> Vec<ItemView> {
        let base_depth = server_path::depth(target);
        let within = |t: &str| {
            server_path::is_child(target, t) && server_path::depth(t) - base_depth <= depth
        };
        let scan_depth = if self.pc.has_renames() { usize::MAX } else { depth };

        let mut seen: HashSet<RowId> = HashSet::new();
        let mut items = Vec::new();
        let mut push = |id: RowId, entry: &LocalVersionEntry, t: String, items: &mut Vec<ItemView>| {
            if seen.insert(id) {
                items.push(ItemView {
                    id,
                    target: t,
                    is_directory: entry.is_directory(),
                    is_committed: entry.is_committed(),
                    is_deleted: entry.is_deleted(),
                });
            }
        };

        if let Some(committed) = self.pc.committed_for(target) {
            for (id, entry) in self.lv.query_by_server(&committed, scan_depth, include_deleted) {
                if !entry.is_committed() {
                    continue;
                }
                let t = self.pc.target_for(&entry.server_item);
                if within(&t) {
                    push(id, entry, t, &mut items);
                }
            }
        }

        // Items renamed into the subtree from elsewhere
        if self.pc.has_renames() {
            for (_, pc) in self.pc.query_by_target(target, depth) {
                let Some(committed) = pc.committed_server_item.as_deref() else {
                    continue;
                };
                if !pc.is_rename() {
                    continue;
                }
                for (id, entry) in self.lv.query_by_server(committed, usize::MAX, include_deleted) {
                    if !entry.is_committed() {
                        continue;
                    }
                    let t = self.pc.target_for(&entry.server_item);
                    if within(&t) {
                        push(id, entry, t, &mut items);
                    }
                }
            }
        }

        for (id, entry) in self.lv.query_by_server(target, depth, include_deleted) {
            if !entry.is_committed() {
                push(id, entry, entry.server_item.clone(), &mut items);
            }
        }

        items.sort_by(|a, b| server_path::compare(&a.target, &b.target));
        items
    }

    // ========================================================================
    // Building rows and operations
    // ========================================================================

    pub fn operation_for(
        &self,
        entry: &LocalVersionEntry,
        pending: Option<(RowId, &PendingChange)>,
        target: &str,
    ) -> GetOperation {
        GetOperation {
            source_server_item: entry.server_item.clone(),
            target_server_item: target.to_string(),
            source_local_item: if entry.is_deleted() {
                None
            } else {
                entry.local_item.clone()
            },
            target_local_item: self.local_for(target),
            change_type: pending.map(|(_, pc)| pc.change_type).unwrap_or_default(),
            item_type: if entry.is_directory() {
                ItemType::Folder
            } else {
                ItemType::File
            },
            item_id: entry.item_id,
            version_local: if entry.is_deleted() { 0 } else { entry.version },
            version_server: entry.version,
            encoding: pending.map(|(_, pc)| pc.encoding).unwrap_or(entry.encoding),
            hash: entry.hash,
            length: entry.length,
            baseline_file_guid: entry.baseline_file_guid,
            pending_change_id: pending.map(|(id, _)| id),
            deletion_id: pending.map(|(_, pc)| pc.deletion_id).unwrap_or(0),
            properties: pending
                .filter(|(_, pc)| pc.is_property())
                .map(|(_, pc)| pc.properties.clone())
                .unwrap_or_else(|| entry.properties.clone()),
        }
    }
}

/// A fresh pending change for an lv row now at `target`.
pub(crate) fn pending_change_for(entry: &LocalVersionEntry, target: &str, change_type: ChangeType) -> PendingChange {
    let item_type = if entry.is_directory() {
        ItemType::Folder
    } else {
        ItemType::File
    };
    let committed = entry.is_committed().then(|| entry.server_item.clone());
    let mut pc = PendingChange::new(target, committed, change_type, item_type);
    pc.version = entry.version;
    pc.item_id = entry.item_id;
    pc.encoding = entry.encoding;
    pc.hash = entry.hash;
    pc.creation_date = now_millis();
    pc
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Case-folded key for de-duplicating server paths.
pub(crate) fn fold_key(server_item: &str) -> String {
    server_path::segments(server_item)
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("/")
}

/// Accumulates the operations and failures of one batch.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub result: PendResult,
    /// Whether any table was mutated
    pub changed: bool,
    seen: HashSet<String>,
}

impl Batch {
    pub fn fail(&mut self, failure: Failure) {
        self.result.failures.push(failure);
    }

    /// Record an operation unless one for the same target was already
    /// recorded.
    pub fn push_op(&mut self, op: GetOperation) {
        if self.seen.insert(fold_key(&op.target_server_item)) {
            self.result.operations.push(op);
        }
    }

    pub fn extend(&mut self, result: PendResult) {
        for op in result.operations {
            self.push_op(op);
        }
        self.result.failures.extend(result.failures);
    }

    pub fn finish(self) -> PendOutcome {
        PendOutcome::from_result(self.result, self.changed)
    }
}
