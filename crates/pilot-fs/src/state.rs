//! Per-file shadow state: where the copy and the log live, and whether the
//! copy has been materialized yet.
//!
//! Every method here is called with the [`GlobalFsLock`](crate::GlobalFsLock)
//! held; the state itself does no locking.

use crate::operation::{decode_all, FileOperation, OpType};
use crate::shadow_fs::ShadowRoots;
use crate::{FsError, Result};
use pilot_config::{log_fs_debug, log_fs_info, log_fs_warn};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ShadowFileState {
    original_path: PathBuf,
    reconstructed_path: PathBuf,
    append_log_path: PathBuf,
    /// True while the original is the base and writes go to the log.
    exist_before_pilot: bool,
    /// Mirror of the log on disk, in append order
    operations: Vec<FileOperation>,
}

impl ShadowFileState {
    /// Build the state for an absolute original path, picking up any log
    /// left by an earlier run.
    pub fn new(original_path: &Path, roots: &ShadowRoots) -> Result<Self> {
        let reconstructed_path = roots.shadow_path(original_path);
        let append_log_path = roots.log_path(original_path);
        let materialized = reconstructed_path.is_file();
        let mut state = Self {
            original_path: original_path.to_path_buf(),
            exist_before_pilot: !materialized && original_path.is_file(),
            reconstructed_path,
            append_log_path,
            operations: Vec::new(),
        };

        if state.append_log_path.exists() {
            if materialized {
                // Rebuild finished but the log was not removed.
                log_fs_warn!("Removing stale append log", log = %state.append_log_path.display());
                fs::remove_file(&state.append_log_path)
                    .map_err(|e| FsError::shadow_io(&state.append_log_path, e))?;
            } else if state.exist_before_pilot {
                state.operations = state.load_operations()?;
                log_fs_info!(
                    "Recovered pending append log",
                    path = %state.original_path.display(),
                    operations = state.operations.len()
                );
            }
        }
        Ok(state)
    }

    /// State for a file that only exists in the shadow tree.
    pub(crate) fn created(original_path: &Path, roots: &ShadowRoots) -> Self {
        Self {
            original_path: original_path.to_path_buf(),
            reconstructed_path: roots.shadow_path(original_path),
            append_log_path: roots.log_path(original_path),
            exist_before_pilot: false,
            operations: Vec::new(),
        }
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub fn reconstructed_path(&self) -> &Path {
        &self.reconstructed_path
    }

    pub fn append_log_path(&self) -> &Path {
        &self.append_log_path
    }

    pub fn exist_before_pilot(&self) -> bool {
        self.exist_before_pilot
    }

    pub fn operations(&self) -> &[FileOperation] {
        &self.operations
    }

    /// Whether the file is visible at all (original base or shadow copy).
    pub fn exists(&self) -> bool {
        if self.exist_before_pilot {
            self.original_path.is_file()
        } else {
            self.reconstructed_path.is_file()
        }
    }

    /// Append one operation to the on-disk log.
    pub fn record_operation(&mut self, operation: FileOperation) -> Result<()> {
        let log = &self.append_log_path;
        if let Some(parent) = log.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::shadow_io(log, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(|e| FsError::shadow_io(log, e))?;
        let mut writer = BufWriter::new(file);
        operation.encode_into(&mut writer)?;
        writer.flush().map_err(|e| FsError::shadow_io(log, e))?;

        log_fs_debug!(
            "Appended operation to log",
            path = %self.original_path.display(),
            op = ?operation.op,
            offset = operation.offset,
            len = operation.len()
        );
        self.operations.push(operation);
        Ok(())
    }

    /// Size the file would have after a rebuild, computed without one.
    pub fn logical_size(&self) -> Result<u64> {
        if !self.exist_before_pilot {
            return fs::metadata(&self.reconstructed_path)
                .map(|m| m.len())
                .map_err(|e| FsError::shadow_io(&self.reconstructed_path, e));
        }
        let base = fs::metadata(&self.original_path)
            .map(|m| m.len())
            .map_err(|e| FsError::shadow_io(&self.original_path, e))?;
        Ok(self.operations.iter().fold(base, |len, op| match op.op {
            OpType::Write => len.max(op.offset + op.len() as u64),
            OpType::Truncate => len.min(op.offset),
        }))
    }

    /// Read the log back from disk. A missing log is an empty log.
    pub fn load_operations(&self) -> Result<Vec<FileOperation>> {
        match fs::read(&self.append_log_path) {
            Ok(bytes) => decode_all(&bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(FsError::shadow_io(&self.append_log_path, e)),
        }
    }

    /// True while unmaterialized with a non-empty log on disk.
    pub fn has_pending_log(&self) -> bool {
        self.exist_before_pilot
            && fs::metadata(&self.append_log_path)
                .map(|m| m.len() > 0)
                .unwrap_or(false)
    }

    /// Materialize: copy the original, replay the log in order, then drop
    /// the log and switch the state to the reconstructed copy.
    ///
    /// The copy is assembled next to its final location and renamed into
    /// place, so a failure never leaves a half-built reconstructed file.
    pub fn rebuild_from_log(&mut self) -> Result<()> {
        let operations = self.load_operations()?;
        log_fs_debug!(
            "Rebuilding shadow copy from log",
            path = %self.original_path.display(),
            operations = operations.len()
        );

        let target = &self.reconstructed_path;
        let staging = staging_path(target);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::shadow_io(parent, e))?;
        }
        let build = || -> std::io::Result<u64> {
            fs::copy(&self.original_path, &staging)?;
            let mut file = OpenOptions::new().read(true).write(true).open(&staging)?;
            for operation in &operations {
                operation.apply(&mut file)?;
            }
            file.sync_all()?;
            let len = file.metadata()?.len();
            drop(file);
            fs::rename(&staging, target)?;
            Ok(len)
        };
        let len = match build() {
            Ok(len) => len,
            Err(e) => {
                let _ = fs::remove_file(&staging);
                return Err(FsError::shadow_io(target, e));
            }
        };

        match fs::remove_file(&self.append_log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::shadow_io(&self.append_log_path, e)),
        }
        self.exist_before_pilot = false;
        self.operations.clear();

        log_fs_info!(
            "Shadow copy materialized",
            path = %self.original_path.display(),
            replayed = operations.len(),
            bytes = len
        );
        Ok(())
    }

    /// Create an empty shadow copy for a file that did not exist before.
    pub(crate) fn create_empty(&mut self) -> Result<()> {
        let target = &self.reconstructed_path;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::shadow_io(parent, e))?;
        }
        File::create(target).map_err(|e| FsError::shadow_io(target, e))?;
        self.discard_log()?;
        self.exist_before_pilot = false;
        Ok(())
    }

    /// Remove the shadow copy and the log.
    pub(crate) fn discard(&mut self) -> Result<()> {
        match fs::remove_file(&self.reconstructed_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FsError::shadow_io(&self.reconstructed_path, e)),
        }
        self.discard_log()
    }

    fn discard_log(&mut self) -> Result<()> {
        self.operations.clear();
        match fs::remove_file(&self.append_log_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::shadow_io(&self.append_log_path, e)),
        }
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".rebuild");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_config::testing::TestEnvironment;

    fn roots(env: &TestEnvironment) -> ShadowRoots {
        ShadowRoots::new(&env.shadow_root, &env.log_root)
    }

    #[test]
    fn test_new_state_for_existing_file() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("a/b.txt", b"hello").unwrap();
        let state = ShadowFileState::new(&original, &roots(&env)).unwrap();
        assert!(state.exist_before_pilot());
        assert!(!state.has_pending_log());
        assert!(state.exists());
        assert!(state.reconstructed_path().starts_with(&env.shadow_root));
        assert!(state
            .append_log_path()
            .to_string_lossy()
            .ends_with("a/b.txt.log"));
    }

    #[test]
    fn test_rebuild_replays_log() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("data.bin", b"ABCDEFGH").unwrap();
        let mut state = ShadowFileState::new(&original, &roots(&env)).unwrap();
        state.record_operation(FileOperation::write(0, b"12")).unwrap();
        state.record_operation(FileOperation::write(3, b"99")).unwrap();
        assert!(state.has_pending_log());
        assert_eq!(state.load_operations().unwrap().len(), 2);

        state.rebuild_from_log().unwrap();
        assert_eq!(fs::read(state.reconstructed_path()).unwrap(), b"12C99FGH");
        assert!(!state.append_log_path().exists());
        assert!(!state.exist_before_pilot());
        assert_eq!(fs::read(&original).unwrap(), b"ABCDEFGH");
    }

    #[test]
    fn test_recovers_log_from_previous_run() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("r.txt", b"0123").unwrap();
        {
            let mut state = ShadowFileState::new(&original, &roots(&env)).unwrap();
            state.record_operation(FileOperation::truncate(2)).unwrap();
        }
        let state = ShadowFileState::new(&original, &roots(&env)).unwrap();
        assert_eq!(state.operations().len(), 1);
        assert!(state.has_pending_log());
    }

    #[test]
    fn test_stale_log_removed_when_copy_exists() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("s.txt", b"abc").unwrap();
        let roots = roots(&env);
        let mut state = ShadowFileState::new(&original, &roots).unwrap();
        state.record_operation(FileOperation::write(0, b"x")).unwrap();
        fs::create_dir_all(state.reconstructed_path().parent().unwrap()).unwrap();
        fs::write(state.reconstructed_path(), b"xbc").unwrap();

        let state = ShadowFileState::new(&original, &roots).unwrap();
        assert!(!state.exist_before_pilot());
        assert!(!state.append_log_path().exists());
    }

    #[test]
    fn test_rebuild_failure_is_shadow_io() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("gone.txt", b"abc").unwrap();
        let mut state = ShadowFileState::new(&original, &roots(&env)).unwrap();
        state.record_operation(FileOperation::write(0, b"x")).unwrap();
        fs::remove_file(&original).unwrap();

        assert!(matches!(
            state.rebuild_from_log(),
            Err(FsError::ShadowIo { .. })
        ));
        assert!(state.exist_before_pilot());
        assert!(state.append_log_path().exists());
    }
}
