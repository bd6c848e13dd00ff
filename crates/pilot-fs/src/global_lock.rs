//! The one lock every shadow-filesystem state transition goes through.

use crate::state::ShadowFileState;
use crate::{FsError, Result};
use parking_lot::{FairMutex, FairMutexGuard};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shadow path table: per-file state, the paths deleted in the shadow
/// view and the close flags of every channel opened on a path. Keys are
/// absolute, normalized original paths.
#[derive(Debug, Default)]
pub struct PathTable {
    states: HashMap<PathBuf, ShadowFileState>,
    deleted: HashSet<PathBuf>,
    channels: HashMap<PathBuf, Vec<Weak<AtomicBool>>>,
}

impl PathTable {
    pub fn state(&self, original: &Path) -> Option<&ShadowFileState> {
        self.states.get(original)
    }

    pub fn state_mut(&mut self, original: &Path) -> Result<&mut ShadowFileState> {
        if self.deleted.contains(original) {
            return Err(FsError::Deleted(original.to_path_buf()));
        }
        self.states
            .get_mut(original)
            .ok_or_else(|| FsError::NotFound(original.to_path_buf()))
    }

    pub(crate) fn insert(&mut self, state: ShadowFileState) -> &mut ShadowFileState {
        let key = state.original_path().to_path_buf();
        self.deleted.remove(&key);
        match self.states.entry(key) {
            Entry::Occupied(mut slot) => {
                slot.insert(state);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(state),
        }
    }

    pub(crate) fn remove(&mut self, original: &Path) -> Option<ShadowFileState> {
        self.states.remove(original)
    }

    pub fn is_deleted(&self, original: &Path) -> bool {
        self.deleted.contains(original)
    }

    pub(crate) fn mark_deleted(&mut self, original: &Path) {
        self.deleted.insert(original.to_path_buf());
    }

    pub(crate) fn clear_deleted(&mut self, original: &Path) {
        self.deleted.remove(original);
    }

    pub(crate) fn track_channel(&mut self, original: &Path, closed: &Arc<AtomicBool>) {
        let open = self.channels.entry(original.to_path_buf()).or_default();
        open.retain(|flag| is_open(flag));
        open.push(Arc::downgrade(closed));
    }

    /// Channels on `original` that are still open.
    pub fn open_channels(&self, original: &Path) -> usize {
        self.channels
            .get(original)
            .map_or(0, |open| open.iter().filter(|flag| is_open(flag)).count())
    }

    /// Close every channel on `original`; returns how many were open.
    pub(crate) fn close_channels(&mut self, original: &Path) -> usize {
        self.channels
            .remove(original)
            .map_or(0, |open| close_flags(&open))
    }

    pub(crate) fn close_all_channels(&mut self) -> usize {
        self.channels
            .drain()
            .map(|(_, open)| close_flags(&open))
            .sum()
    }

    /// Forget every state and deletion mark.
    pub(crate) fn clear(&mut self) {
        self.states.clear();
        self.deleted.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

fn is_open(flag: &Weak<AtomicBool>) -> bool {
    flag.upgrade()
        .is_some_and(|closed| !closed.load(Ordering::Acquire))
}

fn close_flags(open: &[Weak<AtomicBool>]) -> usize {
    open.iter()
        .filter_map(Weak::upgrade)
        .filter(|closed| !closed.swap(true, Ordering::AcqRel))
        .count()
}

pub type GlobalFsGuard<'a> = FairMutexGuard<'a, PathTable>;

/// Fair, coarse lock around the [`PathTable`]. Waiters are served in
/// arrival order so a burst of shadow opens cannot starve a rebuild.
#[derive(Debug, Default)]
pub struct GlobalFsLock {
    table: FairMutex<PathTable>,
}

impl GlobalFsLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> GlobalFsGuard<'_> {
        self.table.lock()
    }

    pub fn try_lock_for(&self, timeout: Duration) -> Option<GlobalFsGuard<'_>> {
        self.table.try_lock_for(timeout)
    }

    pub fn is_locked(&self) -> bool {
        self.table.is_locked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow_fs::ShadowRoots;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_while_held() {
        let lock = Arc::new(GlobalFsLock::new());
        let guard = lock.lock();
        assert!(lock.is_locked());
        let other = lock.clone();
        let got = thread::spawn(move || other.try_lock_for(Duration::from_millis(20)).is_some())
            .join()
            .unwrap();
        assert!(!got);
        drop(guard);
        assert!(lock.try_lock_for(Duration::from_millis(20)).is_some());
    }

    #[test]
    fn test_deleted_paths_hide_state() {
        let roots = ShadowRoots::new("/shadow", "/logs");
        let lock = GlobalFsLock::new();
        let mut table = lock.lock();
        let path = Path::new("/data/x");
        table.insert(ShadowFileState::created(path, &roots));
        assert!(table.state_mut(path).is_ok());

        table.mark_deleted(path);
        assert!(matches!(table.state_mut(path), Err(FsError::Deleted(_))));
        table.clear_deleted(path);
        assert!(table.state(path).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_channel_flags_close_once() {
        let lock = GlobalFsLock::new();
        let mut table = lock.lock();
        let path = Path::new("/data/y");
        let first = Arc::new(AtomicBool::new(false));
        let second = Arc::new(AtomicBool::new(false));
        table.track_channel(path, &first);
        table.track_channel(path, &second);
        assert_eq!(table.open_channels(path), 2);

        second.store(true, Ordering::Release);
        assert_eq!(table.open_channels(path), 1);
        assert_eq!(table.close_channels(path), 1);
        assert!(first.load(Ordering::Acquire));
        assert_eq!(table.open_channels(path), 0);
        assert_eq!(table.close_channels(path), 0);

        let dropped = Arc::new(AtomicBool::new(false));
        table.track_channel(path, &dropped);
        drop(dropped);
        assert_eq!(table.close_all_channels(), 0);
    }
}
