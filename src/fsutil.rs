//! Small file-system helpers shared by the stages.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Remove everything inside `dir` and make sure it exists afterwards.
pub fn clear_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();
            let is_dir = entry.file_type().map_err(|e| Error::io(&path, e))?.is_dir();
            if is_dir {
                fs::remove_dir_all(&path).map_err(|e| Error::io(&path, e))?;
            } else {
                fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
            }
        }
        Ok(())
    } else {
        create_dir(dir)
    }
}

pub fn create_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

pub fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::io(path, e))
}

/// Write `data` to `path`, creating parent directories.
pub fn write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, data).map_err(|e| Error::io(path, e))
}

pub fn copy(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        create_dir(parent)?;
    }
    fs::copy(from, to).map(|_| ()).map_err(|e| Error::io(from, e))
}

/// All regular files below `root` as `(relative path with '/' separators, absolute path)`,
/// sorted by relative path.
pub fn walk_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| Error::io(entry.path(), std::io::ErrorKind::InvalidInput.into()))?;
        files.push((to_logical(rel), entry.into_path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

/// Relative path rendered with forward slashes, the form used by index documents.
pub fn to_logical(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent directory of a logical path (`""` for the root).
pub fn logical_parent(logical: &str) -> &str {
    logical.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Directory entry that is the on-disk form of a stem: `stem/` or `stem.<ext>`.
/// A bare `stem` file never matches; every materialized file carries an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StemMatch {
    Dir(PathBuf),
    File { path: PathBuf, ext: String },
}

/// Find every entry of `dir` that claims `stem`.
pub fn find_stem(dir: &Path, stem: &str) -> Result<Vec<StemMatch>> {
    let mut found = Vec::new();
    let exact = dir.join(stem);
    if exact.is_dir() {
        found.push(StemMatch::Dir(exact));
    }
    let prefix = format!("{stem}.");
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(ext) = name.strip_prefix(&prefix) {
            if !ext.contains('.') && entry.path().is_file() {
                found.push(StemMatch::File { path: entry.path(), ext: ext.to_ascii_lowercase() });
            }
        }
    }
    Ok(found)
}
