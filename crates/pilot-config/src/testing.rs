//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated "original" tree standing in for production files
//! - A private shadow root and append-log root
//!
//! # Usage
//!
//! ```ignore
//! use pilot_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let original = env.create_file("data/table.db", b"ABCDEFGH").unwrap();
//!     // env.shadow_root and env.log_root are empty and private to this test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique roots
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Stand-in for the production tree
    pub original_root: PathBuf,
    /// Shadow copies mirror the original tree here
    pub shadow_root: PathBuf,
    /// Append logs mirror the original tree here
    pub log_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let original_root = root.join("original");
        let shadow_root = root.join("shadow");
        let log_root = root.join("append_log");

        std::fs::create_dir_all(&original_root)?;
        std::fs::create_dir_all(&shadow_root)?;
        std::fs::create_dir_all(&log_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            original_root,
            shadow_root,
            log_root,
            test_id,
        })
    }

    /// Create an original file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.original_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create an original directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.original_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Path inside the original tree, whether or not it exists
    pub fn original_path(&self, relative_path: &str) -> PathBuf {
        self.original_root.join(relative_path)
    }

    /// Config pointing every root at this environment
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.fs.shadow_root = self.shadow_root.clone();
        cfg.fs.log_root = self.log_root.clone();
        cfg.coordination.host_identifier = Some(format!("test-host-{}", self.test_id));
        cfg.pilot.wait_timeout_secs = 5;
        cfg.pilot.poll_interval_ms = 10;
        cfg.pilot.interrupt_grace_ms = 20;
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
