//! Random-access handle onto a shadow file.
//!
//! Until a file is materialized the channel reads the original through a
//! read-only handle and turns every write into a logged [`FileOperation`].
//! The first call that needs the real bytes while a log is pending (read,
//! `size`, `truncate`, `position`) rebuilds the copy under the
//! [`GlobalFsLock`](crate::GlobalFsLock), after which the channel works on
//! the reconstructed file directly.

use crate::operation::FileOperation;
use crate::shadow_fs::{ShadowFs, ShadowOpenOptions};
use crate::state::ShadowFileState;
use crate::{FsError, Result};
use pilot_config::log_fs_warn;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
enum Delegate {
    /// Not materialized; the original is opened on first read.
    Original(Option<File>),
    Reconstructed(File),
}

#[derive(Debug)]
pub struct ShadowFileChannel {
    fs: Arc<ShadowFs>,
    path: PathBuf,
    options: ShadowOpenOptions,
    delegate: Delegate,
    position: u64,
    /// First shadow I/O failure; every later call reports it again.
    failure: Option<(io::ErrorKind, String)>,
    /// Shared with the path table so the filesystem can close the channel.
    closed: Arc<AtomicBool>,
}

impl ShadowFileChannel {
    pub(crate) fn new(
        fs: Arc<ShadowFs>,
        path: PathBuf,
        options: ShadowOpenOptions,
        state: &ShadowFileState,
        closed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let delegate = if state.exist_before_pilot() {
            Delegate::Original(None)
        } else {
            Delegate::Reconstructed(open_reconstructed(state)?)
        };
        Ok(Self {
            fs,
            path,
            options,
            delegate,
            position: 0,
            failure: None,
            closed,
        })
    }

    /// Original-namespace path this channel was opened for.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read at `offset` without moving the position.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        if !self.options.read {
            return Err(not_opened_for("reading"));
        }
        let fs = Arc::clone(&self.fs);
        let mut table = fs.lock();
        let state = table.state_mut(&self.path)?;
        let result = self
            .materialize(state)
            .and_then(|()| self.read_delegate(state, buf, offset));
        self.track(result)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        let fs = Arc::clone(&self.fs);
        let mut table = fs.lock();
        let state = table.state_mut(&self.path)?;
        if self.options.append {
            self.position = self.track(state.logical_size())?;
        }
        let offset = self.position;
        let n = self.write_locked(state, buf, offset)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Write at `offset` without moving the position.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        let fs = Arc::clone(&self.fs);
        let mut table = fs.lock();
        let state = table.state_mut(&self.path)?;
        self.write_locked(state, buf, offset)
    }

    fn write_locked(&mut self, state: &mut ShadowFileState, buf: &[u8], offset: u64) -> Result<usize> {
        if !self.options.is_writable() {
            return Err(not_opened_for("writing"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let result = if state.exist_before_pilot() {
            state.record_operation(FileOperation::write(offset, buf))
        } else {
            self.attach(state).and_then(|()| {
                let file = self.reconstructed()?;
                file.write_all_at(buf, offset)
                    .map_err(|e| FsError::shadow_io(state.reconstructed_path(), e))
            })
        };
        self.track(result)?;
        Ok(buf.len())
    }

    /// Current position. Materializes a file with a pending log.
    pub fn position(&mut self) -> Result<u64> {
        self.check_open()?;
        let fs = Arc::clone(&self.fs);
        let mut table = fs.lock();
        let state = table.state_mut(&self.path)?;
        let result = self.materialize(state);
        self.track(result)?;
        Ok(self.position)
    }

    /// Move the position. Positions past the end are allowed; a later write
    /// there leaves a hole, as with a regular file.
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        self.check_open()?;
        self.position = position;
        Ok(())
    }

    pub fn size(&mut self) -> Result<u64> {
        self.check_open()?;
        let fs = Arc::clone(&self.fs);
        let mut table = fs.lock();
        let state = table.state_mut(&self.path)?;
        let result = self.materialize(state).and_then(|()| {
            let path = if state.exist_before_pilot() {
                state.original_path()
            } else {
                state.reconstructed_path()
            };
            path.metadata()
                .map(|m| m.len())
                .map_err(|e| FsError::shadow_io(path, e))
        });
        self.track(result)
    }

    /// Shrink to `size` bytes. Growing is a no-op. The position is clamped
    /// to the new size.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        self.check_open()?;
        if !self.options.is_writable() {
            return Err(not_opened_for("writing"));
        }
        let fs = Arc::clone(&self.fs);
        let mut table = fs.lock();
        let state = table.state_mut(&self.path)?;

        let result = if state.exist_before_pilot() && !state.has_pending_log() {
            state.record_operation(FileOperation::truncate(size))
        } else {
            self.materialize(state).and_then(|()| {
                let file = self.reconstructed()?;
                let shrink = || -> io::Result<()> {
                    if size < file.metadata()?.len() {
                        file.set_len(size)?;
                    }
                    Ok(())
                };
                shrink().map_err(|e| FsError::shadow_io(state.reconstructed_path(), e))
            })
        };
        self.track(result)?;
        self.position = self.position.min(size);
        Ok(())
    }

    /// Flush a materialized copy to disk. Logged writes are already
    /// flushed when they are recorded.
    pub fn sync(&mut self) -> Result<()> {
        self.check_open()?;
        if let Delegate::Reconstructed(file) = &self.delegate {
            let result = file
                .sync_data()
                .map_err(|e| FsError::shadow_io(self.fs.roots().shadow_path(&self.path), e));
            self.track(result)?;
        }
        Ok(())
    }

    /// Release the delegate. Closing twice is a no-op; any other call on a
    /// closed channel fails with [`FsError::Closed`], including a channel
    /// closed through [`ShadowFs::close_shadow_channels`].
    pub fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.delegate = Delegate::Original(None);
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(FsError::Closed(self.path.clone()));
        }
        if let Some((kind, message)) = &self.failure {
            return Err(FsError::shadow_io(&self.path, io::Error::new(*kind, message.clone())));
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(FsError::ShadowIo { path, source }) = &result {
            if self.failure.is_none() {
                log_fs_warn!(
                    "Shadow I/O failed, channel is unusable",
                    path = %path.display(),
                    error = %source
                );
                self.failure = Some((source.kind(), source.to_string()));
            }
        }
        result
    }

    /// Rebuild if a log is pending, then point the delegate at whatever
    /// now holds the bytes.
    fn materialize(&mut self, state: &mut ShadowFileState) -> Result<()> {
        if state.has_pending_log() {
            state.rebuild_from_log()?;
        }
        self.attach(state)
    }

    /// Switch to the reconstructed copy once some channel materialized it.
    fn attach(&mut self, state: &ShadowFileState) -> Result<()> {
        if !state.exist_before_pilot() {
            if let Delegate::Original(_) = self.delegate {
                self.delegate = Delegate::Reconstructed(open_reconstructed(state)?);
            }
        }
        Ok(())
    }

    fn reconstructed(&self) -> Result<&File> {
        match &self.delegate {
            Delegate::Reconstructed(file) => Ok(file),
            Delegate::Original(_) => Err(FsError::Closed(self.path.clone())),
        }
    }

    fn read_delegate(&mut self, state: &ShadowFileState, buf: &mut [u8], offset: u64) -> Result<usize> {
        let (file, path) = match &mut self.delegate {
            Delegate::Reconstructed(file) => (&*file, state.reconstructed_path()),
            Delegate::Original(slot) => {
                let path = state.original_path();
                if slot.is_none() {
                    *slot = Some(File::open(path).map_err(|e| FsError::shadow_io(path, e))?);
                }
                match slot {
                    Some(file) => (&*file, path),
                    None => return Ok(0),
                }
            }
        };
        file.read_at(buf, offset)
            .map_err(|e| FsError::shadow_io(path, e))
    }
}

fn open_reconstructed(state: &ShadowFileState) -> Result<File> {
    let path = state.reconstructed_path();
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| FsError::shadow_io(path, e))
}

fn not_opened_for(what: &str) -> FsError {
    FsError::Io(io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("channel not opened for {what}"),
    ))
}

impl Read for ShadowFileChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(ShadowFileChannel::read(self, buf)?)
    }
}

impl Write for ShadowFileChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(ShadowFileChannel::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ShadowFileChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size()?.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.set_position(target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow_fs::ShadowRoots;
    use pilot_config::testing::TestEnvironment;
    use std::fs;

    fn setup(content: &[u8]) -> (TestEnvironment, Arc<ShadowFs>, PathBuf) {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("file.bin", content).unwrap();
        let fs = ShadowFs::new(ShadowRoots::new(&env.shadow_root, &env.log_root)).unwrap();
        (env, fs, original)
    }

    fn rw() -> ShadowOpenOptions {
        ShadowOpenOptions::new().read(true).write(true)
    }

    #[test]
    fn test_writes_are_logged_until_read() {
        let (_env, fs, original) = setup(b"ABCDEFGH");
        let mut channel = fs.open(&original, rw()).unwrap();
        channel.write(b"12").unwrap();
        channel.set_position(3).unwrap();
        channel.write(b"99").unwrap();

        let state = fs.state_of(&original).unwrap();
        assert!(state.exist_before_pilot());
        assert_eq!(state.operations().len(), 2);
        assert!(!state.reconstructed_path().exists());

        channel.set_position(0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"12C99FGH");
        assert!(!fs.state_of(&original).unwrap().exist_before_pilot());
        assert_eq!(fs::read(&original).unwrap(), b"ABCDEFGH");
    }

    #[test]
    fn test_read_without_log_uses_original() {
        let (_env, fs, original) = setup(b"hello");
        let mut channel = fs.open(&original, ShadowOpenOptions::new().read(true)).unwrap();
        assert_eq!(channel.size().unwrap(), 5);
        let mut out = String::new();
        Read::read_to_string(&mut channel, &mut out).unwrap();
        assert_eq!(out, "hello");
        assert!(!fs.resolve(&original).unwrap().exists());
    }

    #[test]
    fn test_truncate_without_log_is_logged() {
        let (_env, fs, original) = setup(b"0123456789");
        let mut channel = fs.open(&original, rw()).unwrap();
        channel.set_position(8).unwrap();
        channel.truncate(4).unwrap();
        assert_eq!(channel.position().unwrap(), 4);
        assert_eq!(channel.size().unwrap(), 4);
        let mut buf = Vec::new();
        channel.set_position(0).unwrap();
        Read::read_to_end(&mut channel, &mut buf).unwrap();
        assert_eq!(buf, b"0123");
    }

    #[test]
    fn test_append_positions_at_end() {
        let (_env, fs, original) = setup(b"abc");
        let mut channel = fs
            .open(&original, ShadowOpenOptions::new().read(true).append(true))
            .unwrap();
        channel.write(b"de").unwrap();
        channel.set_position(0).unwrap();
        channel.write(b"f").unwrap();
        assert_eq!(channel.size().unwrap(), 6);
        let mut buf = [0u8; 6];
        channel.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abcdef");
    }

    #[test]
    fn test_open_with_truncate_logs_truncate() {
        let (_env, fs, original) = setup(b"old contents");
        let mut channel = fs
            .open(&original, ShadowOpenOptions::new().read(true).write(true).truncate(true))
            .unwrap();
        assert_eq!(fs.state_of(&original).unwrap().operations().len(), 1);
        assert_eq!(channel.size().unwrap(), 0);
        assert_eq!(fs::read(&original).unwrap(), b"old contents");
    }

    #[test]
    fn test_second_channel_sees_first_channel_writes() {
        let (_env, fs, original) = setup(b"aaaa");
        let mut writer = fs.open(&original, rw()).unwrap();
        let mut reader = fs.open(&original, ShadowOpenOptions::new().read(true)).unwrap();
        writer.write_at(b"bb", 1).unwrap();

        let mut buf = [0u8; 4];
        reader.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abba");

        writer.write_at(b"c", 3).unwrap();
        reader.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abbc");
    }

    #[test]
    fn test_closed_channel_rejects_calls() {
        let (_env, fs, original) = setup(b"x");
        let mut channel = fs.open(&original, rw()).unwrap();
        channel.close().unwrap();
        channel.close().unwrap();
        assert!(!channel.is_open());
        assert!(matches!(channel.size(), Err(FsError::Closed(_))));
        assert!(matches!(channel.write(b"y"), Err(FsError::Closed(_))));
    }

    #[test]
    fn test_closed_channel_reports_closed_after_delete() {
        let (_env, fs, original) = setup(b"x");
        let mut channel = fs.open(&original, rw()).unwrap();
        channel.close().unwrap();
        fs.delete(&original).unwrap();
        assert!(matches!(channel.write(b"y"), Err(FsError::Closed(_))));
        assert!(matches!(channel.write_at(b"y", 0), Err(FsError::Closed(_))));
    }

    #[test]
    fn test_filesystem_can_close_open_channels() {
        let (_env, fs, original) = setup(b"abc");
        let mut writer = fs.open(&original, rw()).unwrap();
        let mut reader = fs.open(&original, ShadowOpenOptions::new().read(true)).unwrap();
        assert_eq!(fs.open_channels(&original).unwrap(), 2);

        reader.close().unwrap();
        assert_eq!(fs.open_channels(&original).unwrap(), 1);
        assert_eq!(fs.close_shadow_channels(&original).unwrap(), 1);
        assert!(!writer.is_open());
        assert!(matches!(writer.write(b"z"), Err(FsError::Closed(_))));
        assert_eq!(fs.open_channels(&original).unwrap(), 0);

        let mut reopened = fs.open(&original, rw()).unwrap();
        reopened.write(b"z").unwrap();
        assert_eq!(fs.close_all_shadow_channels(), 1);
        assert!(!reopened.is_open());
    }

    #[test]
    fn test_failed_rebuild_is_sticky() {
        let (_env, fs, original) = setup(b"abc");
        let mut channel = fs.open(&original, rw()).unwrap();
        channel.write(b"z").unwrap();
        fs::remove_file(&original).unwrap();

        let mut buf = [0u8; 3];
        assert!(matches!(channel.read(&mut buf), Err(FsError::ShadowIo { .. })));
        assert!(matches!(channel.set_position(0), Err(FsError::ShadowIo { .. })));
    }

    #[test]
    fn test_read_only_channel_rejects_writes() {
        let (_env, fs, original) = setup(b"abc");
        let mut channel = fs.open(&original, ShadowOpenOptions::new().read(true)).unwrap();
        assert!(matches!(channel.write(b"x"), Err(FsError::Io(_))));
        assert!(fs.state_of(&original).unwrap().operations().is_empty());
    }
}
