//! Path helpers for the shadow tree layout.
//!
//! Original files are keyed by their absolute, lexically normalized path. The
//! shadow root and the append-log root both mirror the original directory
//! structure underneath themselves.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Make `path` absolute against the current directory and fold `.`/`..`
/// components without touching the filesystem.
///
/// The target does not need to exist, which matters for files that are only
/// created inside the shadow tree.
pub fn absolutize(path: impl AsRef<Path>) -> io::Result<PathBuf> {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize_lexically(&joined))
}

/// Fold `.` and `..` components. `..` never climbs above the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

/// Mirror an absolute original path underneath `root`.
///
/// `/data/sub/file.txt` under `/shadow` becomes `/shadow/data/sub/file.txt`.
pub fn mirror_under(root: impl AsRef<Path>, absolute_original: impl AsRef<Path>) -> PathBuf {
    let relative: PathBuf = absolute_original
        .as_ref()
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    root.as_ref().join(relative)
}

/// Append-log location for an original file: mirrored under `log_root` with a
/// `.log` suffix added to the file name.
pub fn log_path_under(log_root: impl AsRef<Path>, absolute_original: impl AsRef<Path>) -> PathBuf {
    let mirrored = mirror_under(log_root, absolute_original);
    let mut name = mirrored
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("root"));
    name.push(".log");
    mirrored.with_file_name(name)
}
