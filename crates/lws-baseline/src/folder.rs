//! Baseline folders: one per mapped partition.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// Name of a baseline folder. Collisions try `.lws1` through `.lws15`.
pub const BASELINE_FOLDER_NAME: &str = ".lws";

/// Number of fan-out subdirectories in each baseline folder.
pub const PARTITION_COUNT: u8 = 16;

const MAX_NAME_PERMUTATIONS: u32 = 15;

pub(crate) const COMPRESSED_EXT: &str = "gz";
pub(crate) const RAW_EXT: &str = "rw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaselineFolderState {
    /// Not yet checked against the file system
    Unknown,
    /// Exists and may hold baselines
    Valid,
    /// Missing on disk, or no longer parented by a workspace root
    Stale,
}

/// A `.lws` folder holding the baselines of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineFolder {
    /// Partition (volume or mount point) served by this folder
    pub partition: PathBuf,
    /// Absolute path of the folder itself
    pub path: PathBuf,
    pub state: BaselineFolderState,
}

impl BaselineFolder {
    pub fn new(partition: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            partition: partition.into(),
            path: path.into(),
            state: BaselineFolderState::Unknown,
        }
    }

    /// Create a baseline folder inside `local_folder`, picking the first free
    /// name among `.lws`, `.lws1` .. `.lws15`.
    pub fn create(partition: impl Into<PathBuf>, local_folder: &Path) -> Result<Self> {
        for i in 0..=MAX_NAME_PERMUTATIONS {
            let name = if i == 0 {
                BASELINE_FOLDER_NAME.to_string()
            } else {
                format!("{}{}", BASELINE_FOLDER_NAME, i)
            };
            let candidate = local_folder.join(name);
            if candidate.exists() {
                continue;
            }
            ensure_layout(&candidate)?;
            return Ok(Self {
                partition: partition.into(),
                path: candidate,
                state: BaselineFolderState::Valid,
            });
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free baseline folder name in {}", local_folder.display()),
        )
        .into())
    }

    /// Re-check the folder against disk and return the new state.
    pub fn refresh_state(&mut self) -> BaselineFolderState {
        self.state = if self.path.is_dir() {
            BaselineFolderState::Valid
        } else {
            BaselineFolderState::Stale
        };
        self.state
    }

    pub fn is_valid(&self) -> bool {
        self.state == BaselineFolderState::Valid
    }

    /// Path of a baseline in this folder, without extension.
    pub fn path_from_guid(&self, guid: &Uuid) -> PathBuf {
        path_from_guid(&self.path, guid)
    }
}

/// `<root>/<guid[0] % 16>/<guid>` (no extension).
pub(crate) fn path_from_guid(root: &Path, guid: &Uuid) -> PathBuf {
    let bucket = guid.as_bytes()[0] % PARTITION_COUNT;
    root.join(bucket.to_string()).join(guid.hyphenated().to_string())
}

/// Create a folder and its fan-out subdirectories.
pub(crate) fn ensure_layout(root: &Path) -> Result<()> {
    for bucket in 0..PARTITION_COUNT {
        fs::create_dir_all(root.join(bucket.to_string()))?;
    }
    Ok(())
}
