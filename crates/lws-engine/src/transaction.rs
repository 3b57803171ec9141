//! Explicit transaction handle over the workspace tables.
//!
//! A transaction holds (or borrows) the workspace lock, loads the requested
//! tables in the fixed order properties → local version → pending changes,
//! runs one unit of work and saves in reverse order. A unit of work that
//! fails or asks for the server leaves every table untouched on disk: the
//! in-memory copies are simply dropped.
//!
//! A thread runs at most one transaction at a time, whatever the workspace.

use std::cell::Cell;

use bitflags::bitflags;
use lws_config::{log_tables_debug, log_tables_warn};
use lws_tables::{LocalVersionTable, MetadataTable, PendingChangesTable, WorkspaceProperties};

use crate::context::PendContext;
use crate::lock::{WorkspaceLock, WorkspaceLockGuard};
use crate::operation::PendOutcome;
use crate::reconcile::ReconcileOutcome;
use crate::workspace::LocalWorkspace;
use crate::{EngineError, Result};

bitflags! {
    /// Tables a transaction opens.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TableSet: u8 {
        const PROPERTIES = 1 << 0;
        const LOCAL_VERSION = 1 << 1;
        const PENDING_CHANGES = 1 << 2;

        const ALL = Self::PROPERTIES.bits() | Self::LOCAL_VERSION.bits() | Self::PENDING_CHANGES.bits();
    }
}

/// The tables opened by one transaction.
#[derive(Debug, Default)]
pub struct Tables {
    properties: Option<WorkspaceProperties>,
    local_version: Option<LocalVersionTable>,
    pending_changes: Option<PendingChangesTable>,
}

impl Tables {
    pub fn opened(&self) -> TableSet {
        let mut set = TableSet::empty();
        set.set(TableSet::PROPERTIES, self.properties.is_some());
        set.set(TableSet::LOCAL_VERSION, self.local_version.is_some());
        set.set(TableSet::PENDING_CHANGES, self.pending_changes.is_some());
        set
    }

    pub fn properties(&self) -> Result<&WorkspaceProperties> {
        self.properties
            .as_ref()
            .ok_or(EngineError::TableNotOpen("properties"))
    }

    pub fn properties_mut(&mut self) -> Result<&mut WorkspaceProperties> {
        self.properties
            .as_mut()
            .ok_or(EngineError::TableNotOpen("properties"))
    }

    pub fn local_version(&self) -> Result<&LocalVersionTable> {
        self.local_version
            .as_ref()
            .ok_or(EngineError::TableNotOpen("localversion"))
    }

    pub fn local_version_mut(&mut self) -> Result<&mut LocalVersionTable> {
        self.local_version
            .as_mut()
            .ok_or(EngineError::TableNotOpen("localversion"))
    }

    pub fn pending_changes(&self) -> Result<&PendingChangesTable> {
        self.pending_changes
            .as_ref()
            .ok_or(EngineError::TableNotOpen("pendingchanges"))
    }

    pub fn pending_changes_mut(&mut self) -> Result<&mut PendingChangesTable> {
        self.pending_changes
            .as_mut()
            .ok_or(EngineError::TableNotOpen("pendingchanges"))
    }

    /// Borrow both item tables at once.
    pub fn items_mut(&mut self) -> Result<(&mut LocalVersionTable, &mut PendingChangesTable)> {
        let lv = self
            .local_version
            .as_mut()
            .ok_or(EngineError::TableNotOpen("localversion"))?;
        let pc = self
            .pending_changes
            .as_mut()
            .ok_or(EngineError::TableNotOpen("pendingchanges"))?;
        Ok((lv, pc))
    }

    /// Borrow all three tables at once for the engine.
    pub(crate) fn context(&mut self, max_server_path: usize) -> Result<PendContext<'_>> {
        let props = self
            .properties
            .as_ref()
            .ok_or(EngineError::TableNotOpen("properties"))?;
        let lv = self
            .local_version
            .as_mut()
            .ok_or(EngineError::TableNotOpen("localversion"))?;
        let pc = self
            .pending_changes
            .as_mut()
            .ok_or(EngineError::TableNotOpen("pendingchanges"))?;
        Ok(PendContext {
            props,
            lv,
            pc,
            max_server_path,
        })
    }
}

/// Whether a finished unit of work should be persisted.
pub trait TransactionOutcome {
    fn commits(&self) -> bool {
        true
    }
}

impl TransactionOutcome for PendOutcome {
    fn commits(&self) -> bool {
        !matches!(self, PendOutcome::RequiresServer)
    }
}

impl TransactionOutcome for () {}
impl TransactionOutcome for bool {}
impl TransactionOutcome for ReconcileOutcome {}
impl<T> TransactionOutcome for Vec<T> {}
impl<T> TransactionOutcome for Option<T> {}
impl<A, B> TransactionOutcome for (A, B) {}

thread_local! {
    static IN_TRANSACTION: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a transaction until dropped.
struct ActiveTransaction;

impl ActiveTransaction {
    fn enter(key: &str) -> Result<Self> {
        IN_TRANSACTION.with(|active| {
            if active.replace(true) {
                Err(EngineError::Reentrant(key.to_string()))
            } else {
                Ok(Self)
            }
        })
    }
}

impl Drop for ActiveTransaction {
    fn drop(&mut self) {
        let _ = IN_TRANSACTION.try_with(|active| active.set(false));
    }
}

enum LockHold<'l> {
    Owned(WorkspaceLockGuard),
    Borrowed(&'l mut WorkspaceLockGuard),
}

/// One unit of work against a workspace's tables.
pub struct Transaction<'w> {
    workspace: &'w LocalWorkspace,
    lock: LockHold<'w>,
    _active: ActiveTransaction,
}

impl<'w> Transaction<'w> {
    /// Take the workspace lock for the duration of this transaction.
    pub fn new(workspace: &'w LocalWorkspace) -> Result<Self> {
        let key = workspace.lock_key();
        let active = ActiveTransaction::enter(&key)?;
        let guard = WorkspaceLock::acquire(&key, false)?;
        Ok(Self {
            workspace,
            lock: LockHold::Owned(guard),
            _active: active,
        })
    }

    /// Run under a lock the caller already holds across several
    /// transactions. When this transaction ends, queued waiters get a turn.
    pub fn with_lock(workspace: &'w LocalWorkspace, guard: &'w mut WorkspaceLockGuard) -> Result<Self> {
        let active = ActiveTransaction::enter(guard.key())?;
        Ok(Self {
            workspace,
            lock: LockHold::Borrowed(guard),
            _active: active,
        })
    }

    /// Open `tables`, run `work`, and save on success. Queued waiters get
    /// their turn afterwards whether or not the work succeeded.
    pub fn execute<T, F>(mut self, tables: TableSet, work: F) -> Result<T>
    where
        T: TransactionOutcome,
        F: FnOnce(&mut Tables) -> Result<T>,
    {
        let result = self.run(tables, work);

        let guard = match &mut self.lock {
            LockHold::Owned(guard) => guard,
            LockHold::Borrowed(guard) => &mut **guard,
        };
        if guard.has_waiters() {
            guard.yield_to_waiters();
        }
        result
    }

    fn run<T, F>(&self, tables: TableSet, work: F) -> Result<T>
    where
        T: TransactionOutcome,
        F: FnOnce(&mut Tables) -> Result<T>,
    {
        let workspace = self.workspace;
        let dir = workspace.metadata_dir();
        let mut opened = Tables::default();
        if tables.contains(TableSet::PROPERTIES) {
            let mut props = WorkspaceProperties::load(dir)?;
            if props.name.is_empty() {
                props = WorkspaceProperties::new(workspace.name(), workspace.owner());
            }
            opened.properties = Some(props);
        }
        if tables.contains(TableSet::LOCAL_VERSION) {
            opened.local_version = Some(LocalVersionTable::load(dir)?);
        }
        if tables.contains(TableSet::PENDING_CHANGES) {
            opened.pending_changes = Some(PendingChangesTable::load(dir)?);
        }

        match work(&mut opened) {
            Ok(value) if value.commits() => Self::save(&mut opened, dir).map(|()| value),
            Ok(value) => {
                log_tables_debug!(
                    "Transaction aborted, tables discarded",
                    workspace = workspace.name()
                );
                Ok(value)
            }
            Err(e) => {
                let error = e.to_string();
                log_tables_warn!(
                    "Transaction failed, tables discarded",
                    workspace = workspace.name(),
                    error = error.as_str()
                );
                Err(e)
            }
        }
    }

    fn save(tables: &mut Tables, dir: &std::path::Path) -> Result<()> {
        if let Some(pc) = tables.pending_changes.as_mut() {
            pc.save(dir)?;
        }
        if let Some(lv) = tables.local_version.as_mut() {
            lv.save(dir)?;
        }
        if let Some(props) = tables.properties.as_mut() {
            props.save(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lws_config::testing::TestEnvironment;
    use lws_tables::{ChangeType, ItemType, PendingChange};

    fn workspace(env: &TestEnvironment) -> LocalWorkspace {
        LocalWorkspace::open(&env.workspace_name(), "me", env.config()).unwrap()
    }

    #[test]
    fn test_saves_on_success() {
        let env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| {
                t.pending_changes_mut()?.upsert(PendingChange::new(
                    "$/P/a",
                    None,
                    ChangeType::ADD,
                    ItemType::File,
                ));
                Ok(())
            })
            .unwrap();

        let count = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| Ok(vec![t.pending_changes()?.len()]))
            .unwrap();
        assert_eq!(count, vec![1]);
    }

    #[test]
    fn test_discards_on_error() {
        let env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        let result: Result<()> = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| {
                t.pending_changes_mut()?.upsert(PendingChange::new(
                    "$/P/a",
                    None,
                    ChangeType::ADD,
                    ItemType::File,
                ));
                Err(EngineError::Canceled)
            });
        assert!(result.is_err());

        let empty = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| Ok(t.pending_changes()?.is_empty()))
            .unwrap();
        assert!(empty);
    }

    #[test]
    fn test_discards_when_server_required() {
        let env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        let outcome = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| {
                t.pending_changes_mut()?.upsert(PendingChange::new(
                    "$/P/a",
                    None,
                    ChangeType::ADD,
                    ItemType::File,
                ));
                Ok(PendOutcome::RequiresServer)
            })
            .unwrap();
        assert_eq!(outcome, PendOutcome::RequiresServer);

        let empty = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| Ok(t.pending_changes()?.is_empty()))
            .unwrap();
        assert!(empty);
    }

    #[test]
    fn test_unopened_table_is_an_error() {
        let env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        let result = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PROPERTIES, |t| Ok(vec![t.local_version()?.len()]));
        assert!(matches!(result, Err(EngineError::TableNotOpen("localversion"))));
    }

    #[test]
    fn test_nested_transaction_is_rejected() {
        let env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        let result = Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PROPERTIES, |_| Transaction::new(&ws).map(|_| ()));
        assert!(matches!(result, Err(EngineError::Reentrant(_))));
    }

    #[test]
    fn test_nested_transaction_on_other_workspace_is_rejected() {
        let env = TestEnvironment::new().unwrap();
        let other_env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        let other = workspace(&other_env);
        let result = Transaction::new(&ws).unwrap().execute(TableSet::PROPERTIES, |_| {
            Transaction::new(&other)?.execute(TableSet::PROPERTIES, |_| Ok(()))
        });
        assert!(matches!(result, Err(EngineError::Reentrant(_))));
        assert!(!WorkspaceLock::is_held(&other.lock_key()));

        // Both work again once the outer one is done.
        Transaction::new(&other)
            .unwrap()
            .execute(TableSet::PROPERTIES, |_| Ok(()))
            .unwrap();
        Transaction::new(&ws)
            .unwrap()
            .execute(TableSet::PROPERTIES, |_| Ok(()))
            .unwrap();
    }

    #[test]
    fn test_failed_save_still_yields_to_waiters() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        let env = TestEnvironment::new().unwrap();
        let ws = workspace(&env);
        let mut guard = ws.lock().unwrap();
        let key = guard.key().to_string();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let waiter = std::thread::spawn(move || {
            let _g = WorkspaceLock::acquire(&key, false).unwrap();
            flag.store(true, Ordering::SeqCst);
        });
        while !guard.has_waiters() {
            std::thread::sleep(Duration::from_millis(1));
        }

        // A directory where the table file goes makes the save fail.
        std::fs::create_dir_all(ws.metadata_dir().join("pendingchanges.tf3")).unwrap();
        let result = Transaction::with_lock(&ws, &mut guard)
            .unwrap()
            .execute(TableSet::PENDING_CHANGES, |t| {
                t.pending_changes_mut()?.upsert(PendingChange::new(
                    "$/P/a",
                    None,
                    ChangeType::ADD,
                    ItemType::File,
                ));
                Ok(())
            });
        assert!(result.is_err());
        assert!(ran.load(Ordering::SeqCst));
        drop(guard);
        waiter.join().unwrap();
    }
}
