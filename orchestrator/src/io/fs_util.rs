//! Small filesystem helpers shared by the stores.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Write `contents` to `path` atomically: temp file in the same directory,
/// `fsync`, then rename over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut file =
        File::create(&tmp_path).with_context(|| format!("create temp {}", tmp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write temp {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp {}", tmp_path.display()))?;
    drop(file);

    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    sync_dir(parent)
}

/// Serialize `value` as pretty JSON (trailing newline) and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push(b'\n');
    write_atomic(path, &buf)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Fsync `dir` so a rename or link inside it survives a crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle =
            File::open(dir).with_context(|| format!("open directory {}", dir.display()))?;
        handle
            .sync_all()
            .with_context(|| format!("sync directory {}", dir.display()))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}
