//! Buffered sequential streams on top of [`RoutedFile`].

use crate::shadow_fs::{RoutedFile, ShadowFs, ShadowOpenOptions};
use crate::{FsError, Result};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
enum Inner {
    Writer(BufWriter<RoutedFile>),
    Reader(BufReader<RoutedFile>),
}

/// Output or input stream that lands in the shadow tree for dry runs and
/// on the real file otherwise.
#[derive(Debug)]
pub struct ShadowFileStream {
    path: PathBuf,
    inner: Inner,
}

impl ShadowFileStream {
    /// Open for writing, creating the file or truncating it.
    pub fn create(fs: &Arc<ShadowFs>, path: impl AsRef<Path>) -> Result<Self> {
        let options = ShadowOpenOptions::new().write(true).create(true).truncate(true);
        Self::writer(fs, path.as_ref(), options)
    }

    /// Open for writing at the end of the file, creating it if needed.
    pub fn append(fs: &Arc<ShadowFs>, path: impl AsRef<Path>) -> Result<Self> {
        let options = ShadowOpenOptions::new().append(true).create(true);
        Self::writer(fs, path.as_ref(), options)
    }

    pub fn open_read(fs: &Arc<ShadowFs>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs.route(path, ShadowOpenOptions::new().read(true))?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Inner::Reader(BufReader::new(file)),
        })
    }

    fn writer(fs: &Arc<ShadowFs>, path: &Path, options: ShadowOpenOptions) -> Result<Self> {
        let file = fs.route(path, options)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Inner::Writer(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_shadow(&self) -> bool {
        match &self.inner {
            Inner::Writer(w) => w.get_ref().is_shadow(),
            Inner::Reader(r) => r.get_ref().is_shadow(),
        }
    }

    /// Flush buffered bytes and release the underlying handle.
    pub fn close(self) -> Result<()> {
        let file = match self.inner {
            Inner::Writer(writer) => writer.into_inner().map_err(|e| FsError::Io(e.into_error()))?,
            Inner::Reader(reader) => reader.into_inner(),
        };
        match file {
            RoutedFile::Shadow(mut channel) => channel.close(),
            RoutedFile::Live(_) => Ok(()),
        }
    }
}

impl Write for ShadowFileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Writer(w) => w.write(buf),
            Inner::Reader(_) => Err(wrong_direction("writing")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::Writer(w) => w.flush(),
            Inner::Reader(_) => Ok(()),
        }
    }
}

impl Read for ShadowFileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::Reader(r) => r.read(buf),
            Inner::Writer(_) => Err(wrong_direction("reading")),
        }
    }
}

fn wrong_direction(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("stream not opened for {what}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadow_fs::ShadowRoots;
    use pilot_config::testing::TestEnvironment;
    use pilot_context::{with_mode, ExecutionMode, PilotId};

    fn dry_run() -> ExecutionMode {
        ExecutionMode::dry_run(PilotId(3), "stream-host")
    }

    #[test]
    fn test_shadow_stream_leaves_original_alone() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("out.txt", b"before").unwrap();
        let fs = ShadowFs::new(ShadowRoots::new(&env.shadow_root, &env.log_root)).unwrap();
        let _scope = with_mode(dry_run());

        let mut out = ShadowFileStream::append(&fs, &original).unwrap();
        assert!(out.is_shadow());
        out.write_all(b" after").unwrap();
        out.close().unwrap();

        let mut text = String::new();
        let mut input = ShadowFileStream::open_read(&fs, &original).unwrap();
        input.read_to_string(&mut text).unwrap();
        assert_eq!(text, "before after");
        assert_eq!(std::fs::read(&original).unwrap(), b"before");
    }

    #[test]
    fn test_create_replaces_contents() {
        let env = TestEnvironment::new().unwrap();
        let original = env.create_file("c.txt", b"long old contents").unwrap();
        let fs = ShadowFs::new(ShadowRoots::new(&env.shadow_root, &env.log_root)).unwrap();
        let _scope = with_mode(dry_run());

        let mut out = ShadowFileStream::create(&fs, &original).unwrap();
        out.write_all(b"new").unwrap();
        out.flush().unwrap();
        out.close().unwrap();

        let mut input = ShadowFileStream::open_read(&fs, &original).unwrap();
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"new");
        assert!(input.write(b"x").is_err());
    }

    #[test]
    fn test_live_stream_writes_real_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.original_path("live.txt");
        let fs = ShadowFs::new(ShadowRoots::new(&env.shadow_root, &env.log_root)).unwrap();

        let mut out = ShadowFileStream::create(&fs, &path).unwrap();
        assert!(!out.is_shadow());
        out.write_all(b"live").unwrap();
        out.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"live");
    }
}
