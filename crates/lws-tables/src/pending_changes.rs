//! Pending changes table.
//!
//! Every row is indexed twice: by its target path (where the item appears
//! now) and by its committed path (where the server last saw it). The two
//! trees together translate any path across the pending renames:
//! [`PendingChangesTable::target_for`] forward and
//! [`PendingChangesTable::committed_for`] backward.
//!
//! Candidate changes (detected but not pended) live in their own tree and
//! are persisted with the `CANDIDATE` flag.

use std::collections::BTreeMap;
use std::path::Path;

use bitflags::bitflags;
use lws_baseline::{ContentHash, Uuid};
use lws_pathtree::{server_path, PathTree, SubTreeOptions};

use crate::change_type::{ChangeType, ItemType, LockLevel, PropertyValue, ENCODING_FOLDER};
use crate::format::{TableReader, TableWriter};
use crate::slots::MetadataTable;
use crate::{Result, RowId};

const MAGIC: u16 = 0x7425;
const SCHEMA_V1: u8 = 1;
const SCHEMA_V2: u8 = 2;

/// Signature of a workspace with no pending changes.
pub const INITIAL_SIGNATURE: Uuid = Uuid::nil();

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PendingChangeFlags: u8 {
        const CANDIDATE = 1 << 0;
        const EXECUTABLE = 1 << 1;
        const SYMLINK = 1 << 2;
    }
}

/// One pending change. Like local version rows these are values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub target_server_item: String,
    /// `None` for adds and branches
    pub committed_server_item: Option<String>,
    pub branch_from_item: Option<String>,
    pub version: i32,
    pub branch_from_version: i32,
    pub change_type: ChangeType,
    pub item_type: ItemType,
    pub encoding: i32,
    pub lock_level: LockLevel,
    pub item_id: i32,
    pub creation_date: i64,
    pub deletion_id: i32,
    pub hash: Option<ContentHash>,
    pub flags: PendingChangeFlags,
    pub properties: Vec<PropertyValue>,
}

impl PendingChange {
    pub fn new(
        target_server_item: impl Into<String>,
        committed_server_item: Option<String>,
        change_type: ChangeType,
        item_type: ItemType,
    ) -> Self {
        Self {
            target_server_item: target_server_item.into(),
            committed_server_item,
            branch_from_item: None,
            version: 0,
            branch_from_version: 0,
            change_type,
            item_type,
            encoding: if item_type == ItemType::Folder {
                ENCODING_FOLDER
            } else {
                crate::change_type::ENCODING_BINARY
            },
            lock_level: LockLevel::None,
            item_id: 0,
            creation_date: 0,
            deletion_id: 0,
            hash: None,
            flags: PendingChangeFlags::empty(),
            properties: Vec::new(),
        }
    }

    pub fn is_add(&self) -> bool {
        self.change_type.contains(ChangeType::ADD)
    }

    pub fn is_edit(&self) -> bool {
        self.change_type.contains(ChangeType::EDIT)
    }

    pub fn is_delete(&self) -> bool {
        self.change_type.contains(ChangeType::DELETE)
    }

    pub fn is_rename(&self) -> bool {
        self.change_type.contains(ChangeType::RENAME)
    }

    pub fn is_branch(&self) -> bool {
        self.change_type.contains(ChangeType::BRANCH)
    }

    pub fn is_merge(&self) -> bool {
        self.change_type.contains(ChangeType::MERGE)
    }

    pub fn is_lock(&self) -> bool {
        self.change_type.contains(ChangeType::LOCK)
    }

    pub fn is_property(&self) -> bool {
        self.change_type.contains(ChangeType::PROPERTY)
    }

    pub fn is_encoding(&self) -> bool {
        self.change_type.contains(ChangeType::ENCODING)
    }

    pub fn is_candidate(&self) -> bool {
        self.flags.contains(PendingChangeFlags::CANDIDATE)
    }

    pub fn is_committed(&self) -> bool {
        self.version != 0
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }

    /// Folder rename or delete: applies to every descendant.
    pub fn is_recursive_change(&self) -> bool {
        self.is_folder() && self.change_type.intersects(ChangeType::RENAME_OR_DELETE)
    }

    /// Committed path, or the target for uncommitted items.
    pub fn server_item(&self) -> &str {
        self.committed_server_item
            .as_deref()
            .unwrap_or(&self.target_server_item)
    }

    pub fn with_change_type(&self, change_type: ChangeType) -> Self {
        Self {
            change_type,
            ..self.clone()
        }
    }

    pub fn with_target(&self, target: impl Into<String>) -> Self {
        Self {
            target_server_item: target.into(),
            ..self.clone()
        }
    }

    fn write(&self, w: &mut TableWriter) {
        w.str(&self.target_server_item);
        w.opt_str(self.committed_server_item.as_deref());
        w.opt_str(self.branch_from_item.as_deref());
        w.i32(self.version);
        w.i32(self.branch_from_version);
        w.u32(self.change_type.bits());
        w.u8(self.item_type.to_byte());
        w.i32(self.encoding);
        w.u8(self.lock_level.to_byte());
        w.i32(self.item_id);
        w.i64(self.creation_date);
        w.i32(self.deletion_id);
        if self.item_type == ItemType::File {
            w.hash(self.hash.as_ref());
        }
        w.u8(self.flags.bits());
        w.properties(&self.properties);
    }

    fn read(r: &mut TableReader<'_>, schema: u8) -> Result<Self> {
        let target_server_item = r.str()?;
        let committed_server_item = r.opt_str()?;
        let branch_from_item = r.opt_str()?;
        let version = r.i32()?;
        let branch_from_version = r.i32()?;
        let change_type = ChangeType::from_bits_truncate(r.u32()?);
        let raw_type = r.u8()?;
        let item_type = ItemType::from_byte(raw_type)
            .ok_or_else(|| r.invalid(format!("unknown item type {}", raw_type)))?;
        let encoding = r.i32()?;
        let raw_lock = r.u8()?;
        let lock_level = LockLevel::from_byte(raw_lock)
            .ok_or_else(|| r.invalid(format!("unknown lock level {}", raw_lock)))?;
        let item_id = r.i32()?;
        let creation_date = r.i64()?;
        let deletion_id = r.i32()?;
        let hash = if item_type == ItemType::File {
            r.hash()?
        } else {
            None
        };
        let (flags, properties) = if schema >= SCHEMA_V2 {
            let flags = PendingChangeFlags::from_bits_truncate(r.u8()?);
            (flags, r.properties()?)
        } else {
            (PendingChangeFlags::empty(), Vec::new())
        };
        Ok(Self {
            target_server_item,
            committed_server_item,
            branch_from_item,
            version,
            branch_from_version,
            change_type,
            item_type,
            encoding,
            lock_level,
            item_id,
            creation_date,
            deletion_id,
            hash,
            flags,
            properties,
        })
    }
}

#[derive(Debug, Default)]
pub struct PendingChangesTable {
    rows: BTreeMap<RowId, PendingChange>,
    next_id: u64,
    by_target: PathTree<RowId>,
    by_committed: PathTree<RowId>,
    candidates: PathTree<PendingChange>,
    client_signature: Uuid,
    base_signature: Uuid,
    rename_count: usize,
    dirty: bool,
}

impl PendingChangesTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: RowId) -> Option<&PendingChange> {
        self.rows.get(&id)
    }

    /// Rows in target path order.
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &PendingChange)> + '_ {
        self.by_target
            .iter()
            .filter_map(move |(_, id)| self.rows.get(id).map(|pc| (*id, pc)))
    }

    /// Rows in committed path order (uncommitted rows are skipped).
    pub fn iter_by_committed(&self) -> impl Iterator<Item = (RowId, &PendingChange)> + '_ {
        self.by_committed
            .iter()
            .filter_map(move |(_, id)| self.rows.get(id).map(|pc| (*id, pc)))
    }

    pub fn get_by_target(&self, target: &str) -> Option<(RowId, &PendingChange)> {
        let id = *self.by_target.get(target)?;
        self.rows.get(&id).map(|pc| (id, pc))
    }

    pub fn get_by_committed(&self, committed: &str) -> Option<(RowId, &PendingChange)> {
        let id = *self.by_committed.get(committed)?;
        self.rows.get(&id).map(|pc| (id, pc))
    }

    pub fn query_by_target<'a>(
        &'a self,
        target: &str,
        depth: usize,
    ) -> impl Iterator<Item = (RowId, &'a PendingChange)> + 'a {
        self.by_target
            .subtree(target, SubTreeOptions::WITH_ROOT, depth)
            .filter_map(|node| node.value.copied())
            .filter_map(move |id| self.rows.get(&id).map(|pc| (id, pc)))
    }

    pub fn query_by_committed<'a>(
        &'a self,
        committed: &str,
        depth: usize,
    ) -> impl Iterator<Item = (RowId, &'a PendingChange)> + 'a {
        self.by_committed
            .subtree(committed, SubTreeOptions::WITH_ROOT, depth)
            .filter_map(|node| node.value.copied())
            .filter_map(move |id| self.rows.get(&id).map(|pc| (id, pc)))
    }

    /// Whether any pending change sits strictly beneath `target`.
    pub fn has_changes_below(&self, target: &str) -> bool {
        self.by_target
            .subtree(target, SubTreeOptions::CHILDREN, usize::MAX)
            .any(|n| n.value.is_some())
    }

    pub fn has_renames(&self) -> bool {
        self.rename_count > 0
    }

    /// Changes on the strict ancestors of `target`, nearest first.
    pub fn parents_of<'a>(&'a self, target: &str) -> impl Iterator<Item = (RowId, &'a PendingChange)> + 'a {
        let own_depth = server_path::depth(target);
        self.by_target
            .ancestors(target, false)
            .filter(move |node| node.depth < own_depth)
            .filter_map(|node| node.value.copied())
            .filter_map(move |id| self.rows.get(&id).map(|pc| (id, pc)))
    }

    /// Rename/delete bits `target` inherits from enclosing folder changes.
    pub fn inherited_change_type(&self, target: &str) -> ChangeType {
        self.parents_of(target)
            .filter(|(_, pc)| pc.is_recursive_change())
            .fold(ChangeType::empty(), |acc, (_, pc)| {
                acc | (pc.change_type & ChangeType::RENAME_OR_DELETE)
            })
    }

    /// The item's own change type plus what it inherits.
    pub fn recursive_change_type(&self, target: &str) -> ChangeType {
        let own = self
            .get_by_target(target)
            .map(|(_, pc)| pc.change_type)
            .unwrap_or(ChangeType::empty());
        own | self.inherited_change_type(target)
    }

    /// Where an item committed at `committed` appears now.
    pub fn target_for(&self, committed: &str) -> String {
        match self.by_committed.get_nearest(committed) {
            Some((_, id)) => match self.rows.get(id) {
                Some(pc) => {
                    let from = pc.committed_server_item.as_deref().unwrap_or(committed);
                    server_path::rebase(committed, from, &pc.target_server_item)
                }
                None => committed.to_string(),
            },
            None => committed.to_string(),
        }
    }

    /// Where the server last saw the item now at `target`. `None` when the
    /// item is (or lies beneath) an uncommitted add or branch.
    pub fn committed_for(&self, target: &str) -> Option<String> {
        let Some((_, id)) = self.by_target.get_nearest(target) else {
            return Some(target.to_string());
        };
        let pc = self.rows.get(id)?;
        let committed = pc.committed_server_item.as_deref()?;
        Some(server_path::rebase(target, &pc.target_server_item, committed))
    }

    /// Insert or update the row at `pc.target_server_item`. A different row
    /// at the same committed path is dropped. Pending a change on a path
    /// removes its candidate.
    pub fn upsert(&mut self, pc: PendingChange) -> RowId {
        if self.candidates.take(&pc.target_server_item).is_some() {
            self.dirty = true;
        }
        if let Some(&id) = self.by_target.get(&pc.target_server_item) {
            self.replace(id, pc);
            return id;
        }
        if let Some(committed) = &pc.committed_server_item {
            if let Some(&other) = self.by_committed.get(committed) {
                self.remove(other);
            }
        }
        let id = RowId(self.next_id);
        self.next_id += 1;
        self.index(id, &pc);
        self.rows.insert(id, pc);
        self.dirty = true;
        id
    }

    /// Store a new version of row `id`, re-indexing if its paths changed.
    /// Rows already occupying the new paths are dropped.
    pub fn replace(&mut self, id: RowId, pc: PendingChange) {
        let Some(old) = self.rows.remove(&id) else {
            return;
        };
        self.unindex(id, &old);
        if let Some(&other) = self.by_target.get(&pc.target_server_item) {
            self.remove(other);
        }
        if let Some(committed) = &pc.committed_server_item {
            if let Some(&other) = self.by_committed.get(committed) {
                self.remove(other);
            }
        }
        self.index(id, &pc);
        self.rows.insert(id, pc);
        self.dirty = true;
    }

    /// Re-key several rows at once. Every old row is unindexed before any
    /// new one is indexed, so the batch may swap paths among its own rows.
    /// Rows outside the batch that occupy a new path are dropped.
    pub fn replace_many(&mut self, updates: Vec<(RowId, PendingChange)>) {
        let mut live = Vec::with_capacity(updates.len());
        for (id, pc) in updates {
            if let Some(old) = self.rows.remove(&id) {
                self.unindex(id, &old);
                live.push((id, pc));
            }
        }
        for (id, pc) in live {
            if let Some(&other) = self.by_target.get(&pc.target_server_item) {
                self.remove(other);
            }
            if let Some(committed) = &pc.committed_server_item {
                if let Some(&other) = self.by_committed.get(committed) {
                    self.remove(other);
                }
            }
            self.index(id, &pc);
            self.rows.insert(id, pc);
        }
        self.dirty = true;
    }

    pub fn remove(&mut self, id: RowId) -> Option<PendingChange> {
        let pc = self.rows.remove(&id)?;
        self.unindex(id, &pc);
        self.dirty = true;
        Some(pc)
    }

    pub fn remove_by_target(&mut self, target: &str) -> Option<PendingChange> {
        let (id, _) = self.get_by_target(target)?;
        self.remove(id)
    }

    /// Replace every non-candidate row with `pcs`.
    pub fn replace_pending_changes(&mut self, pcs: Vec<PendingChange>) {
        self.rows.clear();
        self.by_target.clear();
        self.by_committed.clear();
        self.rename_count = 0;
        self.dirty = true;
        for pc in pcs {
            if pc.is_candidate() {
                self.add_candidate(pc);
            } else {
                self.upsert(pc);
            }
        }
    }

    fn index(&mut self, id: RowId, pc: &PendingChange) {
        self.by_target.set(&pc.target_server_item, id);
        if let Some(committed) = &pc.committed_server_item {
            self.by_committed.set(committed, id);
        }
        if pc.is_rename() {
            self.rename_count += 1;
        }
    }

    fn unindex(&mut self, id: RowId, pc: &PendingChange) {
        if self.by_target.get(&pc.target_server_item) == Some(&id) {
            self.by_target.take(&pc.target_server_item);
        }
        if let Some(committed) = &pc.committed_server_item {
            if self.by_committed.get(committed) == Some(&id) {
                self.by_committed.take(committed);
            }
        }
        if pc.is_rename() {
            self.rename_count = self.rename_count.saturating_sub(1);
        }
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    pub fn add_candidate(&mut self, mut pc: PendingChange) {
        pc.flags.insert(PendingChangeFlags::CANDIDATE);
        let target = pc.target_server_item.clone();
        self.candidates.set(&target, pc);
        self.dirty = true;
    }

    pub fn remove_candidate(&mut self, target: &str) -> Option<PendingChange> {
        let removed = self.candidates.take(target);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn query_candidates<'a>(
        &'a self,
        path: &str,
        depth: usize,
    ) -> impl Iterator<Item = &'a PendingChange> + 'a {
        self.candidates
            .subtree(path, SubTreeOptions::WITH_ROOT, depth)
            .filter_map(|node| node.value)
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    // ========================================================================
    // Signatures
    // ========================================================================

    pub fn client_signature(&self) -> Uuid {
        self.client_signature
    }

    pub fn set_client_signature(&mut self, signature: Uuid) {
        if self.client_signature != signature {
            self.client_signature = signature;
            self.dirty = true;
        }
    }

    pub fn base_signature(&self) -> Uuid {
        self.base_signature
    }
}

impl MetadataTable for PendingChangesTable {
    const NAME: &'static str = "pendingchanges";

    fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let mut r = TableReader::new(bytes, path);
        let schema = r.header(MAGIC, &[SCHEMA_V1, SCHEMA_V2])?;
        let signature = Uuid::from_bytes(r.bytes16()?);
        let count = r.count()?;

        let mut table = PendingChangesTable::new();
        for _ in 0..count {
            let pc = PendingChange::read(&mut r, schema)?;
            if pc.is_candidate() {
                table.add_candidate(pc);
            } else {
                table.upsert(pc);
            }
        }
        let found = table.len() + table.candidate_count();
        if found != count {
            return Err(r.invalid(format!(
                "row count mismatch: header says {}, found {}",
                count, found
            )));
        }
        table.client_signature = signature;
        table.base_signature = signature;
        table.dirty = false;
        Ok(table)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = TableWriter::new();
        w.u16(MAGIC);
        w.u8(SCHEMA_V2);
        w.bytes16(self.client_signature.as_bytes());
        w.i32((self.rows.len() + self.candidates.len()) as i32);
        for (_, pc) in self.iter() {
            pc.write(&mut w);
        }
        for (_, pc) in self.candidates.iter() {
            pc.write(&mut w);
        }
        Ok(w.into_bytes())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// A save that changed the table without a new server signature gets a
    /// fresh client signature, so the next reconcile cannot be skipped.
    fn before_save(&mut self) {
        if self.client_signature == self.base_signature {
            self.client_signature = if self.rows.is_empty() {
                INITIAL_SIGNATURE
            } else {
                Uuid::new_v4()
            };
        }
        self.base_signature = self.client_signature;
    }
}
