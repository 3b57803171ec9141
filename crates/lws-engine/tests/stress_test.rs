use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use lws_config::testing::TestEnvironment;
use lws_engine::{ChangeRequest, ItemSpec, LocalVersionUpdateRequest, LocalWorkspace, TableSet, Transaction};
use lws_pathtree::RecursionType;
use lws_tables::{ItemType, WorkingFolder};
use proptest::prelude::*;

fn open(env: &TestEnvironment) -> LocalWorkspace {
    let ws = LocalWorkspace::open(&env.workspace_name(), "me", env.config()).unwrap();
    ws.set_working_folders(vec![WorkingFolder::map("$/P", &env.workspace_root)])
        .unwrap();
    let mut root = LocalVersionUpdateRequest::new("$/P", Some(env.workspace_root.clone()), 1);
    root.item_type = ItemType::Folder;
    ws.apply_local_version_updates(&[root]).unwrap();
    ws
}

#[test]
fn stress_concurrent_adds() {
    const THREAD_COUNT: usize = 8;
    const ITERATIONS: usize = 10;

    let env = TestEnvironment::new().unwrap();
    let ws = Arc::new(open(&env));
    for t in 0..THREAD_COUNT {
        for i in 0..ITERATIONS {
            env.create_file(&format!("t{}/f{}.txt", t, i), b"x").unwrap();
        }
    }

    let barrier = Arc::new(Barrier::new(THREAD_COUNT));
    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|t| {
            let ws = ws.clone();
            let b = barrier.clone();
            let locals: Vec<_> = (0..ITERATIONS).map(|i| env.local(&format!("t{}/f{}.txt", t, i))).collect();
            thread::spawn(move || {
                b.wait();
                for local in locals {
                    let outcome = ws
                        .pend_add(&[ChangeRequest::new(ItemSpec::local(local, RecursionType::None))], true)
                        .unwrap();
                    assert!(outcome.is_applied(), "{:?}", outcome);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let (found, _) = ws
        .query_pending_changes(&[ItemSpec::new("$/P", RecursionType::Full)], false)
        .unwrap();
    assert_eq!(found.len(), THREAD_COUNT * ITERATIONS);
}

#[test]
fn stress_holder_yields_to_waiter() {
    let env = TestEnvironment::new().unwrap();
    let ws = Arc::new(open(&env));
    let holder_started = Arc::new(Barrier::new(2));
    let waiter_done = Arc::new(AtomicBool::new(false));
    let holder_transactions = Arc::new(AtomicUsize::new(0));

    let holder = {
        let ws = ws.clone();
        let started = holder_started.clone();
        let done = waiter_done.clone();
        let count = holder_transactions.clone();
        thread::spawn(move || {
            let mut guard = ws.lock().unwrap();
            started.wait();
            let deadline = Instant::now() + Duration::from_secs(10);
            while !done.load(Ordering::SeqCst) && Instant::now() < deadline {
                Transaction::with_lock(&ws, &mut guard)
                    .unwrap()
                    .execute(TableSet::PENDING_CHANGES, |t| Ok(t.pending_changes()?.is_empty()))
                    .unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    holder_started.wait();
    let local = env.create_file("w.txt", b"w").unwrap();
    let outcome = ws
        .pend_add(&[ChangeRequest::new(ItemSpec::local(local, RecursionType::None))], true)
        .unwrap();
    waiter_done.store(true, Ordering::SeqCst);
    holder.join().unwrap();

    assert!(outcome.is_applied());
    assert!(holder_transactions.load(Ordering::SeqCst) >= 1);
}

#[test]
fn stress_single_writer_exclusion() {
    const THREAD_COUNT: usize = 8;
    const ITERATIONS: usize = 20;

    let env = TestEnvironment::new().unwrap();
    let ws = Arc::new(open(&env));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREAD_COUNT));

    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|t| {
            let ws = ws.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            let b = barrier.clone();
            thread::spawn(move || {
                let write = |tables: &mut lws_engine::Tables| -> lws_engine::Result<bool> {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(1));
                    let empty = tables.pending_changes()?.is_empty();
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(empty)
                };
                b.wait();
                if t % 2 == 0 {
                    for _ in 0..ITERATIONS {
                        Transaction::new(&ws)
                            .unwrap()
                            .execute(TableSet::PENDING_CHANGES, write)
                            .unwrap();
                    }
                } else {
                    let mut guard = ws.lock().unwrap();
                    for _ in 0..ITERATIONS {
                        Transaction::with_lock(&ws, &mut guard)
                            .unwrap()
                            .execute(TableSet::PENDING_CHANGES, write)
                            .unwrap();
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(active.load(Ordering::SeqCst), 0);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

const NAMES: [&str; 4] = ["a", "b", "c", "d"];

fn server(name: &str) -> String {
    format!("$/P/{}.txt", name)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any sequence of renames among a few files undoes back to the start.
    #[test]
    fn prop_renames_undo_to_start(moves in prop::collection::vec((0usize..4, 0usize..6), 1..8)) {
        let env = TestEnvironment::new().unwrap();
        let ws = open(&env);
        for name in &NAMES[..3] {
            let local = env.create_file(&format!("{}.txt", name), name.as_bytes()).unwrap();
            ws.apply_local_version_updates(&[LocalVersionUpdateRequest::new(server(name), Some(local), 1)])
                .unwrap();
        }
        let spec = [ItemSpec::new("$/P", RecursionType::Full)];
        let (before, _) = ws.query_local_versions(&spec, false).unwrap();

        for (from, to) in moves {
            let target = if to < NAMES.len() { server(NAMES[to]) } else { format!("$/P/n{}.txt", to) };
            let outcome = ws
                .pend_rename(&[ChangeRequest::rename(server(NAMES[from]), target)], false)
                .unwrap();
            let acks: Vec<_> = outcome.operations().iter().map(LocalVersionUpdateRequest::from_operation).collect();
            ws.apply_local_version_updates(&acks).unwrap();

            let (found, _) = ws.query_pending_changes(&spec, false).unwrap();
            let mut targets: Vec<_> = found.iter().map(|q| q.change.target_server_item.to_lowercase()).collect();
            let total = targets.len();
            targets.dedup();
            prop_assert_eq!(targets.len(), total);
        }

        let undone = ws.undo(&spec).unwrap();
        let acks: Vec<_> = undone.operations().iter().map(LocalVersionUpdateRequest::from_operation).collect();
        ws.apply_local_version_updates(&acks).unwrap();

        let (found, _) = ws.query_pending_changes(&spec, false).unwrap();
        prop_assert!(found.is_empty());
        let (after, _) = ws.query_local_versions(&spec, false).unwrap();
        let key = |rows: &Vec<lws_engine::QueriedLocalVersion>| -> Vec<(String, Option<std::path::PathBuf>)> {
            rows.iter().map(|r| (r.target_server_item.clone(), r.entry.local_item.clone())).collect()
        };
        prop_assert_eq!(key(&before), key(&after));
    }
}
