//! One shadow view per pilot.
//!
//! Dry runs of different pilots must not see each other's writes, and a
//! finished pilot must leave nothing behind for the next one. The
//! workspace hands out a [`ShadowFs`] scoped to each pilot and tears it
//! down when the pilot ends.

use crate::shadow_fs::{RoutedFile, ShadowFs, ShadowOpenOptions, ShadowRoots};
use crate::{FsError, Result};
use parking_lot::Mutex;
use pilot_config::{log_fs_debug, Config};
use pilot_context::{self as context, PilotId};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
pub struct ShadowWorkspace {
    roots: ShadowRoots,
    pilots: Mutex<HashMap<PilotId, Arc<ShadowFs>>>,
}

impl ShadowWorkspace {
    pub fn new(roots: ShadowRoots) -> Result<Arc<Self>> {
        fs::create_dir_all(&roots.shadow_root)?;
        fs::create_dir_all(&roots.log_root)?;
        Ok(Arc::new(Self {
            roots,
            pilots: Mutex::new(HashMap::new()),
        }))
    }

    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        Self::new(ShadowRoots::from(config))
    }

    pub fn roots(&self) -> &ShadowRoots {
        &self.roots
    }

    /// View of `pilot`, created on first use.
    pub fn for_pilot(&self, pilot: PilotId) -> Result<Arc<ShadowFs>> {
        let mut pilots = self.pilots.lock();
        if let Some(fs) = pilots.get(&pilot) {
            return Ok(Arc::clone(fs));
        }
        let fs = ShadowFs::for_pilot(self.roots.clone(), pilot)?;
        pilots.insert(pilot, Arc::clone(&fs));
        log_fs_debug!("Opened shadow view", pilot = %pilot);
        Ok(fs)
    }

    /// View of the pilot bound to the calling thread.
    pub fn current(&self) -> Result<Arc<ShadowFs>> {
        let pilot = context::current_pilot().ok_or(FsError::NoPilot)?;
        self.for_pilot(pilot)
    }

    /// Pilots with a live view, in id order.
    pub fn active_pilots(&self) -> Vec<PilotId> {
        let mut pilots: Vec<_> = self.pilots.lock().keys().copied().collect();
        pilots.sort();
        pilots
    }

    /// Open `path` for the calling thread: the real file for live code, the
    /// current pilot's shadow view for a dry run.
    pub fn route(&self, path: impl AsRef<Path>, options: ShadowOpenOptions) -> Result<RoutedFile> {
        if context::is_dry_run() {
            self.current()?.route(path, options)
        } else {
            Ok(RoutedFile::Live(options.to_std().open(path)?))
        }
    }

    /// Discard everything `pilot` wrote. Also removes a subtree left by an
    /// earlier process. Returns whether there was anything to discard.
    pub fn end_pilot(&self, pilot: PilotId) -> Result<bool> {
        let view = self.pilots.lock().remove(&pilot);
        if let Some(fs) = view {
            fs.end_pilot()?;
            return Ok(true);
        }
        let scoped = self.roots.for_pilot(pilot);
        let mut removed = false;
        for root in [&scoped.shadow_root, &scoped.log_root] {
            match fs::remove_dir_all(root) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(FsError::shadow_io(root, e)),
            }
        }
        Ok(removed)
    }
}
