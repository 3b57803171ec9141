//! # lws-baseline
//!
//! Baseline storage for the local workspace engine.
//!
//! A baseline is the pristine content of a workspace file as last fetched
//! from the server. Baselines are keyed by a GUID and live in a `.lws`
//! folder at the root of each mapped partition, falling back to the
//! workspace metadata directory when no partition folder is usable.
//!
//! ## Directory Layout
//!
//! ```text
//! /work/.lws/
//! └── 0..15/                               # guid byte 0 mod 16
//!     └── 3f2504e0-4f89-11d3-9a0c-0305e82c3301.gz   # compressed
//!     └── 3f2504e0-4f89-11d3-9a0c-0305e82c3301.rw   # raw
//! ```
//!
//! Content is verified against a 16-byte hash (truncated BLAKE3) and the
//! uncompressed length when it is copied back into the workspace.

mod folder;
mod store;
mod workers;

pub use folder::{BaselineFolder, BaselineFolderState, BASELINE_FOLDER_NAME, PARTITION_COUNT};
pub use store::{BaselineStore, MaintenanceReport, StoredBaseline};
pub use uuid::Uuid;
pub use workers::{
    BaselineDownloader, BaselineRequest, BaselineWorkers, BatchReport, CancelToken,
};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Content hash recorded for every baseline (16 bytes).
pub type ContentHash = [u8; 16];

/// Length marker meaning "do not check the length".
pub const UNKNOWN_LENGTH: i64 = -1;

/// Errors that can occur during baseline operations
#[derive(Error, Debug)]
pub enum BaselineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Baseline missing for {}", target.display())]
    Missing { target: PathBuf },

    #[error("Baseline corrupt for {}: {reason}", target.display())]
    Corrupt { target: PathBuf, reason: String },

    #[error("Baseline processing canceled")]
    Canceled,

    #[error("Thread pool error: {0}")]
    ThreadPool(String),
}

pub type Result<T> = std::result::Result<T, BaselineError>;

/// Compute the content hash of the given bytes.
#[inline]
pub fn compute_hash(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Convert a hash to its hex string representation.
#[inline]
pub fn hash_to_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}

/// Incremental content hasher used while streaming baselines.
#[derive(Default)]
pub struct ContentHasher(blake3::Hasher);

impl ContentHasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(&self) -> ContentHash {
        let full = self.0.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&full.as_bytes()[..16]);
        out
    }
}
