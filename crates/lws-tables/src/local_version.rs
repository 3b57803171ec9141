//! Local version table: what the server last told us about each item.
//!
//! Rows are keyed by (server path, committed). A committed row (version
//! != 0) and an uncommitted row for the same path may coexist while a
//! pending add overlays a committed slot. A second index maps the folded
//! local path to the row that owns it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use lws_baseline::{ContentHash, Uuid};
use lws_pathtree::{local_path, PathTree, SubTreeOptions};

use crate::change_type::{PropertyValue, ENCODING_BINARY, ENCODING_FOLDER};
use crate::format::{TableReader, TableWriter};
use crate::pending_changes::PendingChangesTable;
use crate::slots::MetadataTable;
use crate::{Result, RowId};

const MAGIC: u16 = 0xA7CC;
const SCHEMA: u8 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LocalItemFlags: u8 {
        const PENDING_RECONCILE = 1 << 0;
        const MISSING_ON_DISK = 1 << 1;
        const DELETED = 1 << 2;
        const SCANNED = 1 << 3;
        const SYMLINK = 1 << 4;
        const EXECUTABLE = 1 << 5;
    }
}

/// One local version row. Rows are values: mutate by building a new one
/// with the `with_*` helpers and handing it back to the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersionEntry {
    pub server_item: String,
    /// `None` when the item is not realized on disk
    pub local_item: Option<PathBuf>,
    /// 0 for uncommitted items
    pub version: i32,
    pub item_id: i32,
    pub encoding: i32,
    pub length: i64,
    pub hash: Option<ContentHash>,
    pub baseline_file_guid: Option<Uuid>,
    pub last_modified: i64,
    pub checkin_date: i64,
    pub properties: Vec<PropertyValue>,
    pub flags: LocalItemFlags,
}

impl LocalVersionEntry {
    pub fn new_file(server_item: impl Into<String>, local_item: Option<PathBuf>, version: i32) -> Self {
        Self {
            server_item: server_item.into(),
            local_item,
            version,
            item_id: 0,
            encoding: ENCODING_BINARY,
            length: -1,
            hash: None,
            baseline_file_guid: None,
            last_modified: 0,
            checkin_date: 0,
            properties: Vec::new(),
            flags: LocalItemFlags::empty(),
        }
    }

    pub fn new_folder(server_item: impl Into<String>, local_item: Option<PathBuf>, version: i32) -> Self {
        Self {
            encoding: ENCODING_FOLDER,
            ..Self::new_file(server_item, local_item, version)
        }
    }

    pub fn is_committed(&self) -> bool {
        self.version != 0
    }

    pub fn is_directory(&self) -> bool {
        self.encoding == ENCODING_FOLDER
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(LocalItemFlags::DELETED)
    }

    pub fn is_pending_reconcile(&self) -> bool {
        self.flags.contains(LocalItemFlags::PENDING_RECONCILE)
    }

    pub fn is_missing_on_disk(&self) -> bool {
        self.flags.contains(LocalItemFlags::MISSING_ON_DISK)
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline_file_guid.is_some()
    }

    pub fn with_server_item(&self, server_item: impl Into<String>) -> Self {
        Self {
            server_item: server_item.into(),
            ..self.clone()
        }
    }

    pub fn with_local_item(&self, local_item: Option<PathBuf>) -> Self {
        Self {
            local_item,
            ..self.clone()
        }
    }

    pub fn with_flag(&self, flag: LocalItemFlags, on: bool) -> Self {
        let mut next = self.clone();
        next.flags.set(flag, on);
        next
    }

    pub fn with_baseline(&self, guid: Option<Uuid>, length: i64, hash: Option<ContentHash>) -> Self {
        Self {
            baseline_file_guid: guid,
            length,
            hash,
            ..self.clone()
        }
    }

    fn write(&self, w: &mut TableWriter) {
        w.u8(self.flags.bits());
        w.str(&self.server_item);
        w.opt_str(self.local_item.as_deref().map(|p| p.to_string_lossy()).as_deref());
        w.i32(self.version);
        w.i32(self.item_id);
        w.i64(self.last_modified);
        w.i32(self.encoding);
        w.i64(self.checkin_date);
        if !self.is_directory() {
            w.i64(self.length);
            w.hash(self.hash.as_ref());
            w.bool(self.baseline_file_guid.is_some());
            if let Some(guid) = &self.baseline_file_guid {
                w.bytes16(guid.as_bytes());
            }
        }
        w.properties(&self.properties);
    }

    fn read(r: &mut TableReader<'_>) -> Result<Self> {
        let flags = LocalItemFlags::from_bits_truncate(r.u8()?);
        let server_item = r.str()?;
        let local_item = r.opt_str()?.map(PathBuf::from);
        let version = r.i32()?;
        let item_id = r.i32()?;
        let last_modified = r.i64()?;
        let encoding = r.i32()?;
        let checkin_date = r.i64()?;
        let (length, hash, baseline_file_guid) = if encoding != ENCODING_FOLDER {
            let length = r.i64()?;
            let hash = r.hash()?;
            let guid = if r.bool()? {
                Some(Uuid::from_bytes(r.bytes16()?))
            } else {
                None
            };
            (length, hash, guid)
        } else {
            (-1, None, None)
        };
        let properties = r.properties()?;
        Ok(Self {
            server_item,
            local_item,
            version,
            item_id,
            encoding,
            length,
            hash,
            baseline_file_guid,
            last_modified,
            checkin_date,
            properties,
            flags,
        })
    }
}

/// What the server must learn about one row during reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVersionUpdate {
    pub source_server_item: String,
    pub item_id: i32,
    /// `None` tells the server the item is not on disk
    pub target_local_item: Option<PathBuf>,
    pub local_version: i32,
    pub is_committed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct ServerSlot {
    committed: Option<RowId>,
    uncommitted: Option<RowId>,
}

impl ServerSlot {
    fn get(&self, committed: bool) -> Option<RowId> {
        if committed {
            self.committed
        } else {
            self.uncommitted
        }
    }

    fn set(&mut self, committed: bool, id: Option<RowId>) {
        if committed {
            self.committed = id;
        } else {
            self.uncommitted = id;
        }
    }

    fn ids(self) -> impl Iterator<Item = RowId> {
        self.committed.into_iter().chain(self.uncommitted)
    }
}

#[derive(Debug, Default)]
pub struct LocalVersionTable {
    rows: BTreeMap<RowId, LocalVersionEntry>,
    next_id: u64,
    by_server: PathTree<ServerSlot>,
    by_local: BTreeMap<String, RowId>,
    /// Rows removed since the last reconcile that the server still knows
    removed: Vec<LocalVersionEntry>,
    dirty: bool,
}

impl LocalVersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: RowId) -> Option<&LocalVersionEntry> {
        self.rows.get(&id)
    }

    /// Rows in server path order, committed before uncommitted.
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &LocalVersionEntry)> + '_ {
        self.by_server
            .iter()
            .flat_map(|(_, slot)| slot.ids())
            .filter_map(move |id| self.rows.get(&id).map(|e| (id, e)))
    }

    pub fn get_by_server(&self, server_item: &str, committed: bool) -> Option<(RowId, &LocalVersionEntry)> {
        let id = self.by_server.get(server_item)?.get(committed)?;
        self.rows.get(&id).map(|e| (id, e))
    }

    /// Committed row first, else the uncommitted one.
    pub fn get_any_by_server(&self, server_item: &str) -> Option<(RowId, &LocalVersionEntry)> {
        self.get_by_server(server_item, true)
            .or_else(|| self.get_by_server(server_item, false))
    }

    pub fn get_by_local(&self, local_item: &Path) -> Option<(RowId, &LocalVersionEntry)> {
        let id = *self.by_local.get(&local_path::fold(local_item))?;
        self.rows.get(&id).map(|e| (id, e))
    }

    /// Rows at and beneath `server_item`, down to `depth` levels.
    pub fn query_by_server<'a>(
        &'a self,
        server_item: &str,
        depth: usize,
        include_deleted: bool,
    ) -> impl Iterator<Item = (RowId, &'a LocalVersionEntry)> + 'a {
        self.by_server
            .subtree(server_item, SubTreeOptions::WITH_ROOT, depth)
            .filter_map(|node| node.value.copied())
            .flat_map(ServerSlot::ids)
            .filter_map(move |id| self.rows.get(&id).map(|e| (id, e)))
            .filter(move |(_, e)| include_deleted || !e.is_deleted())
    }

    /// Rows whose local path is `local_item` or beneath it.
    pub fn query_by_local<'a>(
        &'a self,
        local_item: &Path,
        depth: usize,
    ) -> impl Iterator<Item = (RowId, &'a LocalVersionEntry)> + 'a {
        let key = local_path::fold(local_item);
        let prefix = if key.ends_with('/') {
            key.clone()
        } else {
            format!("{}/", key)
        };
        let prefix_len = prefix.len();
        let exact = self.by_local.get(&key).copied();
        let below = self
            .by_local
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
            .filter(move |(k, _)| k[prefix_len..].matches('/').count() < depth)
            .map(|(_, id)| *id);
        exact
            .into_iter()
            .chain(below)
            .filter_map(move |id| self.rows.get(&id).map(|e| (id, e)))
    }

    /// Insert a row. A row already at the same (server path, committed)
    /// slot is replaced in place and keeps its id; a different row owning
    /// the same local path is dropped.
    pub fn add(&mut self, entry: LocalVersionEntry) -> RowId {
        if let Some(id) = self
            .by_server
            .get(&entry.server_item)
            .and_then(|s| s.get(entry.is_committed()))
        {
            self.replace(id, entry);
            return id;
        }
        self.drop_local_conflict(entry.local_item.as_deref(), None);
        let id = RowId(self.next_id);
        self.next_id += 1;
        self.index(id, &entry);
        self.rows.insert(id, entry);
        self.dirty = true;
        id
    }

    /// Store a new version of row `id`, re-indexing if its paths changed.
    pub fn replace(&mut self, id: RowId, entry: LocalVersionEntry) {
        let Some(old) = self.rows.remove(&id) else {
            return;
        };
        self.unindex(id, &old);
        if let Some(other) = self
            .by_server
            .get(&entry.server_item)
            .and_then(|s| s.get(entry.is_committed()))
        {
            self.remove(other, false);
        }
        self.drop_local_conflict(entry.local_item.as_deref(), Some(id));
        self.index(id, &entry);
        self.rows.insert(id, entry);
        self.dirty = true;
    }

    /// Remove row `id`. With `record_removed` the server is told about it at
    /// the next reconcile.
    pub fn remove(&mut self, id: RowId, record_removed: bool) -> Option<LocalVersionEntry> {
        let entry = self.rows.remove(&id)?;
        self.unindex(id, &entry);
        if record_removed {
            self.removed.push(entry.clone());
        }
        self.dirty = true;
        Some(entry)
    }

    pub fn remove_by_server(
        &mut self,
        server_item: &str,
        committed: bool,
        record_removed: bool,
    ) -> Option<LocalVersionEntry> {
        let (id, _) = self.get_by_server(server_item, committed)?;
        self.remove(id, record_removed)
    }

    fn drop_local_conflict(&mut self, local_item: Option<&Path>, keep: Option<RowId>) {
        let Some(local) = local_item else {
            return;
        };
        if let Some(&other) = self.by_local.get(&local_path::fold(local)) {
            if Some(other) != keep {
                self.remove(other, false);
            }
        }
    }

    fn index(&mut self, id: RowId, entry: &LocalVersionEntry) {
        let committed = entry.is_committed();
        self.by_server.modify(&entry.server_item, |slot| {
            let mut slot = slot.unwrap_or_default();
            slot.set(committed, Some(id));
            Some(slot)
        });
        if let Some(local) = &entry.local_item {
            self.by_local.insert(local_path::fold(local), id);
        }
    }

    fn unindex(&mut self, id: RowId, entry: &LocalVersionEntry) {
        let committed = entry.is_committed();
        self.by_server.modify(&entry.server_item, |slot| {
            let mut slot = slot?;
            if slot.get(committed) == Some(id) {
                slot.set(committed, None);
            }
            (slot.committed.is_some() || slot.uncommitted.is_some()).then_some(slot)
        });
        if let Some(local) = &entry.local_item {
            let key = local_path::fold(local);
            if self.by_local.get(&key) == Some(&id) {
                self.by_local.remove(&key);
            }
        }
    }

    // ========================================================================
    // Reconcile support
    // ========================================================================

    pub fn pending_reconcile_count(&self) -> usize {
        self.rows.values().filter(|e| e.is_pending_reconcile()).count()
    }

    pub fn removed_items(&self) -> &[LocalVersionEntry] {
        &self.removed
    }

    pub fn mark_pending_reconcile(&mut self, id: RowId) {
        if let Some(entry) = self.rows.get_mut(&id) {
            if !entry.is_pending_reconcile() {
                entry.flags.insert(LocalItemFlags::PENDING_RECONCILE);
                self.dirty = true;
            }
        }
    }

    /// Collect the updates the server needs. The returned flag is true when
    /// no row was ever reconciled, meaning the server should clear its copy
    /// first. Rows backing pending changes are flagged pending reconcile.
    pub fn updates_for_reconcile(
        &mut self,
        pcs: &PendingChangesTable,
        reconcile_missing: bool,
    ) -> (Vec<LocalVersionUpdate>, bool) {
        let mut clear = true;
        let mut updates = Vec::new();
        let mut sent: HashSet<RowId> = HashSet::new();

        for (&id, entry) in &self.rows {
            if !entry.is_pending_reconcile() {
                clear = false;
            }
            if entry.is_pending_reconcile() || (reconcile_missing && entry.is_missing_on_disk()) {
                updates.push(update_for(entry, reconcile_missing));
                sent.insert(id);
            }
        }

        for removed in &self.removed {
            if self
                .get_by_server(&removed.server_item, removed.is_committed())
                .is_none()
            {
                updates.push(LocalVersionUpdate {
                    source_server_item: removed.server_item.clone(),
                    item_id: removed.item_id,
                    target_local_item: None,
                    local_version: removed.version,
                    is_committed: removed.is_committed(),
                });
            }
        }

        let backing: Vec<RowId> = pcs
            .iter()
            .filter_map(|(_, pc)| match &pc.committed_server_item {
                Some(committed) => self.get_by_server(committed, true),
                None => self.get_by_server(&pc.target_server_item, false),
            })
            .map(|(id, _)| id)
            .filter(|id| !sent.contains(id))
            .collect();
        for id in backing {
            self.mark_pending_reconcile(id);
            if let Some(entry) = self.rows.get(&id) {
                updates.push(update_for(entry, reconcile_missing));
                sent.insert(id);
            }
        }

        (updates, clear)
    }

    /// Clear every pending-reconcile flag and the removed list. With
    /// `remove_missing`, rows missing on disk are dropped and returned so the
    /// caller can delete their baselines.
    pub fn mark_as_reconciled(&mut self, remove_missing: bool) -> Vec<LocalVersionEntry> {
        let missing: Vec<RowId> = if remove_missing {
            self.rows
                .iter()
                .filter(|(_, e)| e.is_missing_on_disk())
                .map(|(id, _)| *id)
                .collect()
        } else {
            Vec::new()
        };
        let dropped = missing
            .into_iter()
            .filter_map(|id| self.remove(id, false))
            .collect();
        for entry in self.rows.values_mut() {
            entry.flags.remove(LocalItemFlags::PENDING_RECONCILE);
        }
        self.removed.clear();
        self.dirty = true;
        dropped
    }

    /// Every row as an update, for a server that lost its copy.
    pub fn replay_updates(&self, reconcile_missing: bool) -> Vec<LocalVersionUpdate> {
        self.rows.values().map(|e| update_for(e, reconcile_missing)).collect()
    }

    /// Drop the rows flagged deleted at or beneath `server_item`.
    pub fn remove_deleted_under(&mut self, server_item: &str) -> Vec<LocalVersionEntry> {
        let ids: Vec<RowId> = self
            .query_by_server(server_item, usize::MAX, true)
            .filter(|(_, e)| e.is_deleted())
            .map(|(id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id, false)).collect()
    }
}

fn update_for(entry: &LocalVersionEntry, reconcile_missing: bool) -> LocalVersionUpdate {
    let hidden = entry.is_deleted() || (reconcile_missing && entry.is_missing_on_disk());
    LocalVersionUpdate {
        source_server_item: entry.server_item.clone(),
        item_id: entry.item_id,
        target_local_item: if hidden { None } else { entry.local_item.clone() },
        local_version: entry.version,
        is_committed: entry.is_committed(),
    }
}

impl MetadataTable for LocalVersionTable {
    const NAME: &'static str = "localversion";

    fn decode(bytes: &[u8], path: &Path) -> Result<Self> {
        let mut r = TableReader::new(bytes, path);
        r.header(MAGIC, &[SCHEMA])?;
        let _any_pending = r.bool()?;
        let count = r.count()?;
        let mut table = LocalVersionTable::new();
        for _ in 0..count {
            let entry = LocalVersionEntry::read(&mut r)?;
            table.add(entry);
        }
        if table.len() != count {
            return Err(r.invalid(format!(
                "row count mismatch: header says {}, found {} distinct rows",
                count,
                table.len()
            )));
        }
        let removed = r.count()?;
        for _ in 0..removed {
            table.removed.push(LocalVersionEntry::read(&mut r)?);
        }
        table.dirty = false;
        Ok(table)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut w = TableWriter::new();
        w.u16(MAGIC);
        w.u8(SCHEMA);
        w.bool(self.rows.values().any(|e| e.is_pending_reconcile()));
        w.i32(self.rows.len() as i32);
        for (_, entry) in self.iter() {
            entry.write(&mut w);
        }
        w.i32(self.removed.len() as i32);
        for entry in &self.removed {
            entry.write(&mut w);
        }
        Ok(w.into_bytes())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(server: &str, local: &str, version: i32) -> LocalVersionEntry {
        LocalVersionEntry::new_file(server, Some(PathBuf::from(local)), version)
    }

    #[test]
    fn test_committed_and_uncommitted_coexist() {
        let mut t = LocalVersionTable::new();
        t.add(file("$/P/a.txt", "/w/a.txt", 5));
        t.add(LocalVersionEntry::new_file("$/P/a.txt", None, 0));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get_by_server("$/p/A.TXT", true).unwrap().1.version, 5);
        assert_eq!(t.get_by_server("$/P/a.txt", false).unwrap().1.version, 0);
        assert_eq!(t.get_any_by_server("$/P/a.txt").unwrap().1.version, 5);
    }

    #[test]
    fn test_add_same_slot_keeps_row_id() {
        let mut t = LocalVersionTable::new();
        let id = t.add(file("$/P/a.txt", "/w/a.txt", 5));
        let again = t.add(file("$/P/a.txt", "/w/a.txt", 6));
        assert_eq!(id, again);
        assert_eq!(t.get(id).unwrap().version, 6);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_local_conflict_drops_old_owner() {
        let mut t = LocalVersionTable::new();
        t.add(file("$/P/a.txt", "/w/a.txt", 5));
        t.add(file("$/P/b.txt", "/w/a.txt", 3));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get_by_local(Path::new("/W/A.txt")).unwrap().1.server_item, "$/P/b.txt");
    }

    #[test]
    fn test_replace_rekeys_paths() {
        let mut t = LocalVersionTable::new();
        let id = t.add(file("$/P/a.txt", "/w/a.txt", 5));
        let moved = t.get(id).unwrap().with_server_item("$/P/b.txt").with_local_item(Some("/w/b.txt".into()));
        t.replace(id, moved);
        assert!(t.get_by_server("$/P/a.txt", true).is_none());
        assert!(t.get_by_local(Path::new("/w/a.txt")).is_none());
        assert_eq!(t.get_by_local(Path::new("/w/b.txt")).unwrap().0, id);
    }

    #[test]
    fn test_queries_respect_depth() {
        let mut t = LocalVersionTable::new();
        t.add(LocalVersionEntry::new_folder("$/P", Some("/w".into()), 1));
        t.add(file("$/P/a.txt", "/w/a.txt", 1));
        t.add(LocalVersionEntry::new_folder("$/P/d", Some("/w/d".into()), 1));
        t.add(file("$/P/d/b.txt", "/w/d/b.txt", 1));
        t.add(file("$/P-x/c.txt", "/w-x/c.txt", 1));

        assert_eq!(t.query_by_server("$/P", usize::MAX, false).count(), 4);
        assert_eq!(t.query_by_server("$/P", 1, false).count(), 3);
        assert_eq!(t.query_by_local(Path::new("/w"), usize::MAX).count(), 4);
        assert_eq!(t.query_by_local(Path::new("/w"), 1).count(), 3);
        assert_eq!(t.query_by_local(Path::new("/w"), 0).count(), 1);
    }

    #[test]
    fn test_deleted_rows_hidden_unless_requested() {
        let mut t = LocalVersionTable::new();
        let e = LocalVersionEntry::new_file("$/P/gone", None, 4).with_flag(LocalItemFlags::DELETED, true);
        t.add(e);
        assert_eq!(t.query_by_server("$/P", usize::MAX, false).count(), 0);
        assert_eq!(t.query_by_server("$/P", usize::MAX, true).count(), 1);
        assert_eq!(t.remove_deleted_under("$/P").len(), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn test_updates_for_reconcile_clear_flag() {
        let mut t = LocalVersionTable::new();
        t.add(file("$/P/a", "/w/a", 1).with_flag(LocalItemFlags::PENDING_RECONCILE, true));
        let pcs = PendingChangesTable::new();
        let (updates, clear) = t.updates_for_reconcile(&pcs, false);
        assert!(clear);
        assert_eq!(updates.len(), 1);

        t.add(file("$/P/b", "/w/b", 1));
        let (updates, clear) = t.updates_for_reconcile(&pcs, false);
        assert!(!clear);
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn test_removed_items_reported_until_reconciled() {
        let mut t = LocalVersionTable::new();
        t.add(file("$/P/a", "/w/a", 1));
        t.remove_by_server("$/P/a", true, true);
        let (updates, _) = t.updates_for_reconcile(&PendingChangesTable::new(), false);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].target_local_item, None);

        t.mark_as_reconciled(false);
        assert!(t.removed_items().is_empty());
    }

    #[test]
    fn test_mark_as_reconciled_drops_missing() {
        let mut t = LocalVersionTable::new();
        t.add(file("$/P/a", "/w/a", 1).with_flag(LocalItemFlags::MISSING_ON_DISK, true));
        t.add(file("$/P/b", "/w/b", 1).with_flag(LocalItemFlags::PENDING_RECONCILE, true));
        let dropped = t.mark_as_reconciled(true);
        assert_eq!(dropped.len(), 1);
        assert_eq!(t.pending_reconcile_count(), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_encode_decode() {
        let mut t = LocalVersionTable::new();
        let guid = Uuid::new_v4();
        t.add(LocalVersionEntry::new_folder("$/P", Some("/w".into()), 1));
        t.add(file("$/P/a", "/w/a", 7).with_baseline(Some(guid), 12, Some([7u8; 16])));
        t.add(file("$/P/gone", "/w/gone", 3));
        t.remove_by_server("$/P/gone", true, true);

        let bytes = t.encode().unwrap();
        let loaded = LocalVersionTable::decode(&bytes, Path::new("lv")).unwrap();
        assert_eq!(loaded.len(), 2);
        let (_, a) = loaded.get_by_server("$/P/a", true).unwrap();
        assert_eq!(a.baseline_file_guid, Some(guid));
        assert_eq!(a.hash, Some([7u8; 16]));
        assert_eq!(a.length, 12);
        assert_eq!(loaded.removed_items().len(), 1);
        assert!(!loaded.is_dirty());
    }
}
