//! # lws-tables
//!
//! The persistent tables behind a local workspace:
//!
//! - [`LocalVersionTable`]: last-known server state of every item on disk
//! - [`PendingChangesTable`]: changes pended but not yet checked in
//! - [`WorkspaceProperties`]: working folders and baseline folders
//!
//! Each table is an arena of immutable rows addressed by a stable
//! [`RowId`], indexed by path trees. Tables are persisted through a
//! three-slot rotation (`.tf1` primary, `.tf2` backup, `.tf3` in progress)
//! so that a crash mid-save never loses the last good copy.

pub mod change_type;
pub mod format;
pub mod local_version;
pub mod pending_changes;
pub mod properties;
pub mod slots;

pub use change_type::{
    merge_properties, ChangeType, ItemType, LockLevel, PropertyValue, ENCODING_BINARY,
    ENCODING_FOLDER, ENCODING_UNCHANGED,
};
pub use local_version::{LocalItemFlags, LocalVersionEntry, LocalVersionTable, LocalVersionUpdate};
pub use pending_changes::{PendingChange, PendingChangeFlags, PendingChangesTable};
pub use properties::{Mapping, WorkingFolder, WorkingFolderKind, WorkspaceProperties};
pub use slots::{MetadataTable, SlotFiles};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or saving tables
#[derive(Error, Debug)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid table {}: {reason}", path.display())]
    InvalidTable { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Path error: {0}")]
    Path(#[from] lws_pathtree::PathError),
}

pub type Result<T> = std::result::Result<T, TableError>;

/// Stable key of a row inside a table arena.
///
/// Updating a row keeps its key; only removal retires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(pub u64);
