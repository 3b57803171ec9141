//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated metadata root (table files, fallback baselines)
//! - A local folder to map into a workspace
//! - A `Config` pointing at both
//!
//! # Usage
//!
//! ```ignore
//! use lws_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let file = env.create_file("src/a.txt", b"hello").unwrap();
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root for per-workspace metadata folders
    pub metadata_root: PathBuf,
    /// Local folder mapped into the test workspace
    pub workspace_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let metadata_root = root.join("metadata");
        let workspace_root = root.join(format!("ws{}", test_id));

        std::fs::create_dir_all(&metadata_root)?;
        std::fs::create_dir_all(&workspace_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            metadata_root,
            workspace_root,
            test_id,
        })
    }

    /// Unique workspace name for this environment
    pub fn workspace_name(&self) -> String {
        format!("test-ws-{}", self.test_id)
    }

    /// Config whose metadata root points into this environment
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.metadata.root = self.metadata_root.clone();
        cfg.baseline.threads = Some(2);
        cfg.baseline.download_threads = Some(2);
        cfg
    }

    /// Local path for a workspace-relative item
    pub fn local(&self, relative_path: &str) -> PathBuf {
        self.workspace_root.join(relative_path)
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.local(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.local(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.metadata_root.exists());
        assert!(env.workspace_root.exists());
    }

    #[test]
    fn test_environment_is_unique() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.workspace_name(), env2.workspace_name());
        assert_ne!(env1.workspace_root, env2.workspace_root);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("src/a.txt", b"hello").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_config_points_into_environment() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.metadata.root, env.metadata_root);
    }
}
