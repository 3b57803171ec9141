//! Process-wide exclusive lock per workspace.
//!
//! Locks live in a registry keyed by workspace. A holder that asked for
//! yielding hands the lock to queued waiters between transactions: it
//! releases, waits until a waiter has taken the lock (or none is left),
//! then queues up again.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use lws_config::{log_lock_debug, log_lock_trace};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::{EngineError, Result};

static LOCKS: Lazy<DashMap<String, Arc<LockCell>>> = Lazy::new(DashMap::new);

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    waiters: usize,
    /// Bumped on every acquisition
    generation: u64,
}

#[derive(Debug, Default)]
struct LockCell {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl LockCell {
    fn lock(&self, key: &str) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            return Err(EngineError::Reentrant(key.to_string()));
        }
        if state.owner.is_some() {
            log_lock_trace!("Waiting for workspace lock", workspace = key);
        }
        state.waiters += 1;
        while state.owner.is_some() {
            self.changed.wait(&mut state);
        }
        state.waiters -= 1;
        state.owner = Some(me);
        state.generation += 1;
        self.changed.notify_all();
        Ok(())
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        state.owner = None;
        self.changed.notify_all();
    }
}

/// Registry entry point.
pub struct WorkspaceLock;

impl WorkspaceLock {
    /// Block until the lock for `key` is ours. Fails with `Reentrant` when
    /// the calling thread already holds it.
    pub fn acquire(key: &str, request_yield: bool) -> Result<WorkspaceLockGuard> {
        let cell = LOCKS
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockCell::default()))
            .clone();
        cell.lock(key)?;
        log_lock_debug!("Workspace lock acquired", workspace = key);
        Ok(WorkspaceLockGuard {
            cell,
            key: key.to_string(),
            request_yield,
        })
    }

    /// Whether any thread currently holds the lock for `key`.
    pub fn is_held(key: &str) -> bool {
        LOCKS
            .get(key)
            .is_some_and(|cell| cell.state.lock().owner.is_some())
    }
}

/// Held workspace lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct WorkspaceLockGuard {
    cell: Arc<LockCell>,
    key: String,
    request_yield: bool,
}

impl WorkspaceLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn has_waiters(&self) -> bool {
        self.cell.state.lock().waiters > 0
    }

    /// Give queued waiters a turn, then take the lock back. Returns whether
    /// the lock actually changed hands.
    pub fn yield_to_waiters(&mut self) -> bool {
        if !self.request_yield {
            return false;
        }
        let me = thread::current().id();
        let mut state = self.cell.state.lock();
        if state.waiters == 0 {
            return false;
        }
        let generation = state.generation;
        state.owner = None;
        self.cell.changed.notify_all();
        log_lock_debug!("Yielding workspace lock", workspace = self.key.as_str());

        while state.generation == generation && state.waiters > 0 {
            self.cell.changed.wait(&mut state);
        }
        state.waiters += 1;
        while state.owner.is_some() {
            self.cell.changed.wait(&mut state);
        }
        state.waiters -= 1;
        state.owner = Some(me);
        state.generation += 1;
        self.cell.changed.notify_all();
        state.generation != generation + 1
    }
}

impl Drop for WorkspaceLockGuard {
    fn drop(&mut self) {
        self.cell.unlock();
        log_lock_trace!("Workspace lock released", workspace = self.key.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_reentrant_acquire_fails() {
        let _guard = WorkspaceLock::acquire("lock-test-reentrant", false).unwrap();
        assert!(matches!(
            WorkspaceLock::acquire("lock-test-reentrant", false),
            Err(EngineError::Reentrant(_))
        ));
    }

    #[test]
    fn test_release_on_drop() {
        {
            let _guard = WorkspaceLock::acquire("lock-test-drop", false).unwrap();
            assert!(WorkspaceLock::is_held("lock-test-drop"));
        }
        assert!(!WorkspaceLock::is_held("lock-test-drop"));
        let _again = WorkspaceLock::acquire("lock-test-drop", false).unwrap();
    }

    #[test]
    fn test_second_thread_waits() {
        let guard = WorkspaceLock::acquire("lock-test-wait", false).unwrap();
        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let handle = thread::spawn(move || {
            let _g = WorkspaceLock::acquire("lock-test-wait", false).unwrap();
            flag.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn test_yield_without_waiters_is_noop() {
        let mut guard = WorkspaceLock::acquire("lock-test-noop", true).unwrap();
        assert!(!guard.has_waiters());
        assert!(!guard.yield_to_waiters());
    }

    #[test]
    fn test_yield_hands_lock_to_waiter() {
        let mut guard = WorkspaceLock::acquire("lock-test-yield", true).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = thread::spawn(move || {
            let _g = WorkspaceLock::acquire("lock-test-yield", false).unwrap();
            flag.store(true, Ordering::SeqCst);
        });
        while !guard.has_waiters() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(guard.yield_to_waiters());
        assert!(ran.load(Ordering::SeqCst));
        handle.join().unwrap();
    }
}
