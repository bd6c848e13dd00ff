//! Shadow filesystem front door.

use crate::channel::ShadowFileChannel;
use crate::global_lock::{GlobalFsGuard, GlobalFsLock};
use crate::operation::FileOperation;
use crate::state::ShadowFileState;
use crate::{FsError, Result};
use pilot_config::path::{absolutize, log_path_under, mirror_under};
use pilot_config::{log_fs_debug, log_fs_info, Config};
use pilot_context::PilotId;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Where shadow copies and append logs are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRoots {
    pub shadow_root: PathBuf,
    pub log_root: PathBuf,
}

impl ShadowRoots {
    pub fn new(shadow_root: impl Into<PathBuf>, log_root: impl Into<PathBuf>) -> Self {
        Self {
            shadow_root: shadow_root.into(),
            log_root: log_root.into(),
        }
    }

    pub fn shadow_path(&self, original: &Path) -> PathBuf {
        mirror_under(&self.shadow_root, original)
    }

    pub fn log_path(&self, original: &Path) -> PathBuf {
        log_path_under(&self.log_root, original)
    }

    /// Roots private to one pilot: `<root>/pilot-<id>` on both sides.
    pub fn for_pilot(&self, pilot: PilotId) -> Self {
        let scope = format!("pilot-{pilot}");
        Self::new(self.shadow_root.join(&scope), self.log_root.join(&scope))
    }

    fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.shadow_root) || path.starts_with(&self.log_root)
    }
}

impl From<&Config> for ShadowRoots {
    fn from(config: &Config) -> Self {
        Self::new(&config.fs.shadow_root, &config.fs.log_root)
    }
}

/// Open flags, same meaning as [`std::fs::OpenOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowOpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

impl ShadowOpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn create_new(mut self, create_new: bool) -> Self {
        self.create_new = create_new;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.write || self.append
    }

    pub(crate) fn to_std(self) -> fs::OpenOptions {
        let mut options = fs::OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .truncate(self.truncate)
            .create(self.create)
            .create_new(self.create_new);
        options
    }
}

/// A file handle picked by execution mode: the real file for live code,
/// a shadow channel for dry runs.
#[derive(Debug)]
pub enum RoutedFile {
    Live(File),
    Shadow(ShadowFileChannel),
}

impl RoutedFile {
    pub fn is_shadow(&self) -> bool {
        matches!(self, RoutedFile::Shadow(_))
    }
}

impl Read for RoutedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RoutedFile::Live(file) => file.read(buf),
            RoutedFile::Shadow(channel) => Read::read(channel, buf),
        }
    }
}

impl Write for RoutedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            RoutedFile::Live(file) => file.write(buf),
            RoutedFile::Shadow(channel) => Write::write(channel, buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            RoutedFile::Live(file) => file.flush(),
            RoutedFile::Shadow(channel) => Write::flush(channel),
        }
    }
}

impl Seek for RoutedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            RoutedFile::Live(file) => file.seek(pos),
            RoutedFile::Shadow(channel) => Seek::seek(channel, pos),
        }
    }
}

/// Shadow view over the whole filesystem, shared through `Arc`.
///
/// A view built with [`ShadowFs::for_pilot`] keeps its copies and logs in
/// a subtree of its own, so one dry run never sees another's writes.
/// [`ShadowFs::end_pilot`] throws the view's state away.
#[derive(Debug)]
pub struct ShadowFs {
    roots: ShadowRoots,
    /// Unscoped roots; nothing under them is a valid original path.
    reserved: ShadowRoots,
    pilot: Option<PilotId>,
    lock: GlobalFsLock,
}

impl ShadowFs {
    pub fn new(roots: ShadowRoots) -> Result<Arc<Self>> {
        Self::build(roots.clone(), roots, None)
    }

    pub fn for_pilot(roots: ShadowRoots, pilot: PilotId) -> Result<Arc<Self>> {
        Self::build(roots.for_pilot(pilot), roots, Some(pilot))
    }

    fn build(roots: ShadowRoots, reserved: ShadowRoots, pilot: Option<PilotId>) -> Result<Arc<Self>> {
        fs::create_dir_all(&roots.shadow_root)?;
        fs::create_dir_all(&roots.log_root)?;
        Ok(Arc::new(Self {
            roots,
            reserved,
            pilot,
            lock: GlobalFsLock::new(),
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::new(ShadowRoots::from(config))
    }

    pub fn roots(&self) -> &ShadowRoots {
        &self.roots
    }

    pub fn pilot(&self) -> Option<PilotId> {
        self.pilot
    }

    pub fn global_lock(&self) -> &GlobalFsLock {
        &self.lock
    }

    pub(crate) fn lock(&self) -> GlobalFsGuard<'_> {
        self.lock.lock()
    }

    fn absolute(&self, path: &Path) -> Result<PathBuf> {
        let abs = absolutize(path)?;
        if self.reserved.contains(&abs) {
            return Err(FsError::InvalidPath(abs));
        }
        if abs.file_name().is_none() {
            return Err(FsError::InvalidPath(abs));
        }
        Ok(abs)
    }

    /// Shadow location of `path`.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let abs = self.absolute(path.as_ref())?;
        Ok(self.roots.shadow_path(&abs))
    }

    /// Snapshot of the tracked state for `path`, if any.
    pub fn state_of(&self, path: impl AsRef<Path>) -> Option<ShadowFileState> {
        let abs = self.absolute(path.as_ref()).ok()?;
        self.lock().state(&abs).cloned()
    }

    /// Open a file in the shadow view.
    pub fn open(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        options: ShadowOpenOptions,
    ) -> Result<ShadowFileChannel> {
        let abs = self.absolute(path.as_ref())?;
        let mut table = self.lock();

        let creating = options.create || options.create_new;
        if hidden_parent(&table, &abs) {
            return Err(FsError::NotFound(abs));
        }
        if table.is_deleted(&abs) && !creating {
            return Err(FsError::Deleted(abs));
        }
        if table.is_deleted(&abs) {
            table.insert(ShadowFileState::created(&abs, &self.roots));
        } else if table.state(&abs).is_none() {
            table.insert(ShadowFileState::new(&abs, &self.roots)?);
        }
        let state = table.state_mut(&abs)?;

        if state.exists() {
            if options.create_new {
                return Err(FsError::AlreadyExists(abs));
            }
            if options.truncate && options.is_writable() {
                if state.exist_before_pilot() {
                    state.record_operation(FileOperation::truncate(0))?;
                } else {
                    File::create(state.reconstructed_path())
                        .map_err(|e| FsError::shadow_io(state.reconstructed_path(), e))?;
                }
            }
        } else if creating {
            state.create_empty()?;
            log_fs_debug!("Created file in shadow tree", path = %abs.display());
        } else {
            return Err(FsError::NotFound(abs));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let channel = ShadowFileChannel::new(Arc::clone(self), abs, options, state, Arc::clone(&closed))?;
        table.track_channel(channel.path(), &closed);
        Ok(channel)
    }

    /// Channels opened on `path` that are still open.
    pub fn open_channels(&self, path: impl AsRef<Path>) -> Result<usize> {
        let abs = self.absolute(path.as_ref())?;
        Ok(self.lock().open_channels(&abs))
    }

    /// Close every channel opened on `path`. Returns how many were open.
    pub fn close_shadow_channels(&self, path: impl AsRef<Path>) -> Result<usize> {
        let abs = self.absolute(path.as_ref())?;
        Ok(self.lock().close_channels(&abs))
    }

    pub fn close_all_shadow_channels(&self) -> usize {
        self.lock().close_all_channels()
    }

    /// Drop everything this view recorded: open channels are closed, the
    /// path table is cleared and copies and logs are removed from disk.
    /// The view stays usable and starts again from the original tree.
    pub fn end_pilot(&self) -> Result<()> {
        let mut table = self.lock();
        let closed = table.close_all_channels();
        let tracked = table.len();
        table.clear();
        for root in [&self.roots.shadow_root, &self.roots.log_root] {
            match fs::remove_dir_all(root) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::shadow_io(root, e)),
            }
            if self.pilot.is_none() {
                fs::create_dir_all(root).map_err(|e| FsError::shadow_io(root, e))?;
            }
        }
        log_fs_info!(
            "Shadow state discarded",
            pilot = ?self.pilot,
            channels = closed,
            files = tracked
        );
        Ok(())
    }

    /// Create an empty file. Fails if `path` is already visible.
    pub fn create_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let abs = self.absolute(path.as_ref())?;
        let mut table = self.lock();
        if hidden_parent(&table, &abs) {
            return Err(FsError::NotFound(abs));
        }
        if self.visible(&table, &abs)? {
            return Err(FsError::AlreadyExists(abs));
        }
        let state = table.insert(ShadowFileState::created(&abs, &self.roots));
        state.create_empty()?;
        log_fs_debug!("Created file in shadow tree", path = %abs.display());
        Ok(())
    }

    pub fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let abs = self.absolute(path.as_ref())?;
        let shadow = self.roots.shadow_path(&abs);
        let mut table = self.lock();
        fs::create_dir_all(&shadow).map_err(|e| FsError::shadow_io(&shadow, e))?;
        for ancestor in abs.ancestors() {
            table.clear_deleted(ancestor);
        }
        log_fs_debug!("Created directory in shadow tree", path = %abs.display());
        Ok(())
    }

    /// Hide `path` from the shadow view and drop its copy and log.
    pub fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        let abs = self.absolute(path.as_ref())?;
        let mut table = self.lock();
        if !self.visible(&table, &abs)? {
            return Err(FsError::NotFound(abs));
        }
        if let Some(mut state) = table.remove(&abs) {
            state.discard()?;
        } else {
            let shadow = self.roots.shadow_path(&abs);
            let removed = if shadow.is_dir() {
                fs::remove_dir(&shadow)
            } else {
                fs::remove_file(&shadow)
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::shadow_io(&shadow, e)),
            }
        }
        table.mark_deleted(&abs);
        log_fs_debug!("Deleted in shadow tree", path = %abs.display());
        Ok(())
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> Result<bool> {
        let abs = self.absolute(path.as_ref())?;
        let table = self.lock();
        self.visible(&table, &abs)
    }

    fn visible(&self, table: &GlobalFsGuard<'_>, abs: &Path) -> Result<bool> {
        if abs.ancestors().any(|p| table.is_deleted(p)) {
            return Ok(false);
        }
        if let Some(state) = table.state(abs) {
            return Ok(state.exists());
        }
        Ok(self.roots.shadow_path(abs).exists() || abs.exists())
    }

    /// Entries of `dir` in the shadow view: the original directory merged
    /// with the shadow directory, minus deleted entries. Paths are returned
    /// in the original namespace, sorted.
    pub fn list_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let abs = self.absolute(dir.as_ref())?;
        let table = self.lock();
        if !self.visible(&table, &abs)? {
            return Err(FsError::NotFound(abs));
        }

        let mut names: BTreeSet<OsString> = BTreeSet::new();
        let shadow = self.roots.shadow_path(&abs);
        for source in [abs.as_path(), shadow.as_path()] {
            match fs::read_dir(source) {
                Ok(entries) => {
                    for entry in entries {
                        names.insert(entry?.file_name());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(names
            .into_iter()
            .map(|name| abs.join(name))
            .filter(|path| !table.is_deleted(path))
            .filter(|path| table.state(path).map_or(true, |state| state.exists()))
            .collect())
    }

    /// Open `path` for the calling thread's execution mode.
    pub fn route(self: &Arc<Self>, path: impl AsRef<Path>, options: ShadowOpenOptions) -> Result<RoutedFile> {
        if pilot_context::is_dry_run() {
            self.open(path, options).map(RoutedFile::Shadow)
        } else {
            Ok(RoutedFile::Live(options.to_std().open(path)?))
        }
    }
}

/// Some ancestor of `abs` was deleted in the shadow view and not recreated.
fn hidden_parent(table: &GlobalFsGuard<'_>, abs: &Path) -> bool {
    abs.ancestors().skip(1).any(|p| table.is_deleted(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilot_config::testing::TestEnvironment;
    use pilot_context::{with_mode, ExecutionMode, PilotId};

    fn shadow_fs(env: &TestEnvironment) -> Arc<ShadowFs> {
        ShadowFs::new(ShadowRoots::new(&env.shadow_root, &env.log_root)).unwrap()
    }

    #[test]
    fn test_resolve_mirrors_original() {
        let env = TestEnvironment::new().unwrap();
        let fs = shadow_fs(&env);
        let original = env.original_path("a/b/c.txt");
        let resolved = fs.resolve(&original).unwrap();
        assert!(resolved.starts_with(&env.shadow_root));
        assert!(resolved.ends_with("original/a/b/c.txt"));
    }

    #[test]
    fn test_pilot_roots_are_disjoint() {
        let roots = ShadowRoots::new("/shadow", "/logs");
        let first = roots.for_pilot(PilotId(1));
        let second = roots.for_pilot(PilotId(2));
        assert_eq!(first.shadow_root, Path::new("/shadow/pilot-1"));
        assert_eq!(second.log_root, Path::new("/logs/pilot-2"));
        let original = Path::new("/data/file");
        assert_ne!(first.shadow_path(original), second.shadow_path(original));
    }

    #[test]
    fn test_scoped_view_rejects_other_pilot_trees() {
        let env = TestEnvironment::new().unwrap();
        let roots = ShadowRoots::new(&env.shadow_root, &env.log_root);
        let fs = ShadowFs::for_pilot(roots.clone(), PilotId(3)).unwrap();
        assert_eq!(fs.pilot(), Some(PilotId(3)));
        let foreign = roots.for_pilot(PilotId(4)).shadow_root.join("x");
        assert!(matches!(fs.resolve(foreign), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn test_paths_inside_roots_rejected() {
        let env = TestEnvironment::new().unwrap();
        let fs = shadow_fs(&env);
        assert!(matches!(
            fs.resolve(env.shadow_root.join("x")),
            Err(FsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_create_delete_and_exists() {
        let env = TestEnvironment::new().unwrap();
        let fs = shadow_fs(&env);
        let path = env.original_path("new.txt");

        assert!(!fs.exists(&path).unwrap());
        fs.create_file(&path).unwrap();
        assert!(fs.exists(&path).unwrap());
        assert!(!path.exists());
        assert!(matches!(fs.create_file(&path), Err(FsError::AlreadyExists(_))));

        fs.delete(&path).unwrap();
        assert!(!fs.exists(&path).unwrap());
        assert!(matches!(fs.delete(&path), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_delete_hides_original_without_touching_it() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("keep.txt", b"data").unwrap();
        let fs = shadow_fs(&env);

        fs.delete(&original).unwrap();
        assert!(!fs.exists(&original).unwrap());
        assert!(original.exists());
        assert!(matches!(
            fs.open(&original, ShadowOpenOptions::new().read(true)),
            Err(FsError::Deleted(_))
        ));

        let mut channel = fs
            .open(&original, ShadowOpenOptions::new().write(true).create(true))
            .unwrap();
        assert_eq!(channel.size().unwrap(), 0);
        channel.close().unwrap();
        assert!(fs.exists(&original).unwrap());
        assert_eq!(std::fs::read(&original).unwrap(), b"data");
    }

    #[test]
    fn test_list_dir_merges_and_filters() {
        let env = TestEnvironment::new().unwrap();
        env.create_file("dir/a.txt", b"a").unwrap();
        env.create_file("dir/b.txt", b"b").unwrap();
        let fs = shadow_fs(&env);
        let dir = env.original_path("dir");

        fs.create_file(dir.join("c.txt")).unwrap();
        fs.delete(dir.join("a.txt")).unwrap();
        fs.create_dir_all(dir.join("sub")).unwrap();

        let listed = fs.list_dir(&dir).unwrap();
        assert_eq!(
            listed,
            vec![dir.join("b.txt"), dir.join("c.txt"), dir.join("sub")]
        );
    }

    #[test]
    fn test_open_missing_without_create() {
        let env = TestEnvironment::new().unwrap();
        let fs = shadow_fs(&env);
        assert!(matches!(
            fs.open(env.original_path("nope"), ShadowOpenOptions::new().read(true)),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_route_follows_mode() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("routed.txt", b"live").unwrap();
        let fs = shadow_fs(&env);
        let options = ShadowOpenOptions::new().write(true).truncate(true);

        {
            let _scope = with_mode(ExecutionMode::dry_run(PilotId(1), "h"));
            let mut file = fs.route(&original, options).unwrap();
            assert!(file.is_shadow());
            file.write_all(b"shadow").unwrap();
        }
        assert_eq!(std::fs::read(&original).unwrap(), b"live");

        let mut file = fs.route(&original, options).unwrap();
        assert!(!file.is_shadow());
        file.write_all(b"real").unwrap();
        drop(file);
        assert_eq!(std::fs::read(&original).unwrap(), b"real");
    }
}
