//! # lws-engine
//!
//! The pending-change engine of a local workspace.
//!
//! Every operation runs inside a [`Transaction`]: the workspace lock is
//! taken, the tables it needs are loaded in a fixed order, the engine
//! mutates them in memory and the transaction either saves all of them or
//! none.
//!
//! ```text
//! LocalWorkspace::pend_rename(requests)
//!   └── Transaction (lock → properties → local version → pending changes)
//!         └── rename::pend_rename(&mut PendContext, ..)
//!               ├── capture: resolve items, validate, build new rows
//!               └── apply:   replace_many(rows)
//! ```
//!
//! Operations return a [`PendOutcome`]: applied with the list of
//! [`GetOperation`]s the caller must carry out on disk, rejected with one
//! [`Failure`] per request, or a request to redo the whole batch online.

mod context;
mod failure;
mod lock;
mod operation;
mod pend;
mod query;
mod reconcile;
mod rename;
mod transaction;
mod undo;
mod workspace;

pub use failure::{Failure, FailureKind, Severity};
pub use lock::{WorkspaceLock, WorkspaceLockGuard};
pub use operation::{ChangeRequest, GetOperation, ItemSpec, PendOutcome, PendResult};
pub use pend::{EXECUTABLE_KEY, SYMLINK_KEY};
pub use query::{QueriedChange, QueriedLocalVersion};
pub use reconcile::{
    ReconcileCache, ReconcileOutcome, ReconcileRequest, ReconcileResult, ReconcileService,
};
pub use transaction::{TableSet, Tables, Transaction, TransactionOutcome};
pub use workspace::{LocalVersionUpdateRequest, LocalWorkspace};

use std::io;

use thiserror::Error;

/// Errors that abort a whole engine call
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Table error: {0}")]
    Tables(#[from] lws_tables::TableError),

    #[error("Baseline error: {0}")]
    Baseline(#[from] lws_baseline::BaselineError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Undo would leave two items at {path}")]
    PartialRenameConflict { path: String },

    #[error("Cannot move {child} under {parent}: it has a pending merge")]
    CannotRenameDueToChildConflict { parent: String, child: String },

    #[error("Server path too long: {path}")]
    PathTooLong { path: String },

    #[error("Workspace lock already held by this thread: {0}")]
    Reentrant(String),

    #[error("Table {0} was not opened by this transaction")]
    TableNotOpen(&'static str),

    #[error("Transaction already executed")]
    AlreadyExecuted,

    #[error("Reconcile failed with {} failure(s)", .0.len())]
    ReconcileFailed(Vec<Failure>),

    #[error("Operation canceled")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
