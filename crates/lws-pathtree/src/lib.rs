//! # lws-pathtree
//!
//! Sparse, prefix-ordered tree keyed by hierarchical paths.
//!
//! Both metadata tables of a local workspace index their rows through a
//! [`PathTree`]: exact lookups, nearest-first ancestor walks (used for
//! forward/backward rename translation) and depth-bounded sub-tree walks
//! (used by recursive pend/undo/query).
//!
//! ## Ordering
//!
//! ```text
//! $/
//! └── $/Proj
//!     ├── $/Proj/a          # parents precede children
//!     │   └── $/Proj/a/x
//!     └── $/Proj/a.b        # segment-wise, case-insensitive
//! ```
//!
//! Walks are plain iterators: callers stop early with `break`/`find`
//! and restart by cloning the iterator.

pub mod local_path;
pub mod server_path;
mod tree;

pub use tree::{Ancestors, PathTree, SubTree, SubTreeOptions, TreeNode};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by path parsing and tree mutation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Not a server path: {0}")]
    NotServerPath(String),

    #[error("Invalid path segment in {0}")]
    InvalidSegment(String),

    #[error("A node with the same key already exists: {0}")]
    DuplicateKey(String),
}

pub type Result<T> = std::result::Result<T, PathError>;

/// How far below an item a request reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecursionType {
    /// The item itself
    #[default]
    None,
    /// The item and its immediate children
    OneLevel,
    /// The item and every descendant
    Full,
}

impl RecursionType {
    /// Depth bound for a sub-tree walk rooted at the item.
    pub fn depth(self) -> usize {
        match self {
            RecursionType::None => 0,
            RecursionType::OneLevel => 1,
            RecursionType::Full => usize::MAX,
        }
    }
}
