//! Read-only queries over the pending changes and local version tables.

use std::collections::HashSet;

use lws_pathtree::{server_path, RecursionType};
use lws_tables::{LocalVersionEntry, PendingChange, RowId};

use crate::context::{fold_key, ParsedSpec, PendContext};
use crate::failure::{Failure, FailureKind};
use crate::operation::ItemSpec;

/// A pending change matched by a query. Candidates have no row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueriedChange {
    pub id: Option<RowId>,
    pub change: PendingChange,
}

/// A local version row seen through its current target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueriedLocalVersion {
    pub target_server_item: String,
    pub entry: LocalVersionEntry,
}

pub(crate) fn query_pending_changes(
    ctx: &PendContext<'_>,
    specs: &[ItemSpec],
    include_candidates: bool,
) -> (Vec<QueriedChange>, Vec<Failure>) {
    let mut found: Vec<QueriedChange> = Vec::new();
    let mut seen_rows: HashSet<RowId> = HashSet::new();
    let mut seen_candidates: HashSet<String> = HashSet::new();
    let mut failures = Vec::new();

    for spec in specs {
        let parsed = match ctx.parse_spec(spec) {
            Ok(parsed) => parsed,
            Err(failure) => {
                failures.push(failure);
                continue;
            }
        };

        let mut matched = false;
        for (id, pc) in matching_rows(ctx, &parsed) {
            matched = true;
            if seen_rows.insert(id) {
                found.push(QueriedChange {
                    id: Some(id),
                    change: pc.clone(),
                });
            }
        }
        if include_candidates {
            for pc in matching_candidates(ctx, &parsed) {
                matched = true;
                if seen_candidates.insert(fold_key(&pc.target_server_item)) {
                    found.push(QueriedChange {
                        id: None,
                        change: pc.clone(),
                    });
                }
            }
        }
        if !matched {
            failures.push(Failure::new(FailureKind::ItemNotCheckedOut, &parsed.item));
        }
    }

    found.sort_by(|a, b| {
        server_path::compare(&a.change.target_server_item, &b.change.target_server_item)
    });
    (found, failures)
}

fn depth_of(parsed: &ParsedSpec) -> usize {
    match (&parsed.pattern, parsed.recursion) {
        (Some(_), RecursionType::Full) => usize::MAX,
        (Some(_), _) => 1,
        (None, recursion) => recursion.depth(),
    }
}

fn matching_rows<'c>(ctx: &'c PendContext<'_>, parsed: &ParsedSpec) -> Vec<(RowId, &'c PendingChange)> {
    if parsed.is_server_item() || (parsed.recursion == RecursionType::None && parsed.pattern.is_none()) {
        if !parsed.is_server_item() {
            if let Some(local) = &parsed.local_root {
                if let Some((_, entry)) = ctx.lv.get_by_local(local) {
                    return ctx.pc_for_lv(entry).into_iter().collect();
                }
            }
        }
        return ctx
            .pc
            .query_by_target(&parsed.root, depth_of(parsed))
            .filter(|(_, pc)| parsed.matches_target(&pc.target_server_item))
            .collect();
    }

    // Local specs reaching below their root match by where each change
    // lands on disk
    ctx.pc
        .iter()
        .filter(|(_, pc)| {
            ctx.local_for(&pc.target_server_item)
                .is_some_and(|local| parsed.matches_local(&local))
        })
        .collect()
}

fn matching_candidates<'c>(ctx: &'c PendContext<'_>, parsed: &ParsedSpec) -> Vec<&'c PendingChange> {
    ctx.pc
        .query_candidates(&parsed.root, depth_of(parsed))
        .filter(|pc| parsed.matches_target(&pc.target_server_item))
        .collect()
}

pub(crate) fn query_local_versions(
    ctx: &PendContext<'_>,
    specs: &[ItemSpec],
    include_deleted: bool,
) -> (Vec<QueriedLocalVersion>, Vec<Failure>) {
    let mut found = Vec::new();
    let mut seen: HashSet<RowId> = HashSet::new();
    let mut failures = Vec::new();

    for spec in specs {
        let parsed = match ctx.parse_spec(spec) {
            Ok(parsed) => parsed,
            Err(failure) => {
                failures.push(failure);
                continue;
            }
        };
        let items = ctx.expand(&parsed, include_deleted);
        if items.is_empty() {
            failures.push(Failure::new(FailureKind::ItemNotFound, &parsed.item));
            continue;
        }
        for item in items {
            if !seen.insert(item.id) {
                continue;
            }
            if let Some(entry) = ctx.lv.get(item.id) {
                found.push(QueriedLocalVersion {
                    target_server_item: item.target,
                    entry: entry.clone(),
                });
            }
        }
    }

    found.sort_by(|a, b| server_path::compare(&a.target_server_item, &b.target_server_item));
    (found, failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_tables::{
        ChangeType, ItemType, LocalVersionTable, PendingChangesTable, WorkingFolder,
        WorkspaceProperties,
    };

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
            lv.add(LocalVersionEntry::new_file("$/P/A/a.cs", Some("/w/A/a.cs".into()), 1));
            lv.add(LocalVersionEntry::new_file("$/P/A/b.txt", Some("/w/A/b.txt".into()), 1));
            lv.add(LocalVersionEntry::new_file("$/P/x.cs", Some("/w/x.cs".into()), 1));

            let mut pc = PendingChangesTable::new();
            let mut edit = PendingChange::new("$/P/A/a.cs", Some("$/P/A/a.cs".into()), ChangeType::EDIT, ItemType::File);
            edit.version = 1;
            pc.upsert(edit);
            let mut moved = PendingChange::new("$/P/A/y.cs", Some("$/P/x.cs".into()), ChangeType::RENAME, ItemType::File);
            moved.version = 1;
            pc.upsert(moved);
            pc.add_candidate(PendingChange::new("$/P/A/new.cs", None, ChangeType::ADD, ItemType::File));
            Self { props, lv, pc }
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

    fn targets(found: &[QueriedChange]) -> Vec<&str> {
        found.iter().map(|q| q.change.target_server_item.as_str()).collect()
    }

    #[test]
    fn test_recursive_query_finds_items_moved_in() {
        let mut fx = Fixture::new();
        let ctx = fx.ctx();
        let (found, failures) = query_pending_changes(&ctx, &[ItemSpec::new("$/P/A", RecursionType::Full)], false);
        assert!(failures.is_empty());
        assert_eq!(targets(&found), vec!["$/P/A/a.cs", "$/P/A/y.cs"]);
    }

    #[test]
    fn test_candidates_only_when_asked() {
        let mut fx = Fixture::new();
        let ctx = fx.ctx();
        let (found, _) = query_pending_changes(&ctx, &[ItemSpec::new("$/P/A/*.cs", RecursionType::None)], true);
        assert_eq!(targets(&found), vec!["$/P/A/a.cs", "$/P/A/new.cs", "$/P/A/y.cs"]);
        assert!(found.iter().any(|q| q.id.is_none()));
    }

    #[test]
    fn test_local_spec_resolves_through_rows() {
        let mut fx = Fixture::new();
        let ctx = fx.ctx();
        let (found, _) = query_pending_changes(&ctx, &[ItemSpec::new("/w/A/a.cs", RecursionType::None)], false);
        assert_eq!(targets(&found), vec!["$/P/A/a.cs"]);

        let (found, _) = query_pending_changes(&ctx, &[ItemSpec::new("/w/A", RecursionType::Full)], false);
        assert_eq!(targets(&found), vec!["$/P/A/a.cs", "$/P/A/y.cs"]);
    }

    #[test]
    fn test_unmatched_spec_reports_not_checked_out() {
        let mut fx = Fixture::new();
        let ctx = fx.ctx();
        let (found, failures) = query_pending_changes(&ctx, &[ItemSpec::new("$/P/A/b.txt", RecursionType::None)], false);
        assert!(found.is_empty());
        assert_eq!(failures[0].kind, FailureKind::ItemNotCheckedOut);
    }

    #[test]
    fn test_local_versions_by_target() {
        let mut fx = Fixture::new();
        let ctx = fx.ctx();
        let (found, failures) = query_local_versions(&ctx, &[ItemSpec::new("$/P/A", RecursionType::OneLevel)], false);
        assert!(failures.is_empty());
        let targets: Vec<&str> = found.iter().map(|q| q.target_server_item.as_str()).collect();
        assert_eq!(targets, vec!["$/P/A", "$/P/A/a.cs", "$/P/A/b.txt", "$/P/A/y.cs"]);
        assert_eq!(found[3].entry.server_item, "$/P/x.cs");
    }
}
