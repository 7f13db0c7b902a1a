//! Cache root handle.
//!
//! Everything persisted between runs lives under one directory:
//!
//! ```text
//! <root>/stats/<fingerprint>.json.gz        statistics cache entries
//! <root>/observations/<md5(gage)>.json      observation cache records
//! ```
//!
//! The directory may be shared by several processes. Files are only ever created or replaced
//! whole, never modified in place: a writer prepares a hidden temporary file in the same
//! directory and renames it over the final name, so a reader sees either the previous complete
//! file or the new complete file.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EnsembleError;

const STATS_DIR: &str = "stats";
const OBSERVATIONS_DIR: &str = "observations";

/// Prefix of temporary files. Files with this prefix are never read as cache content.
pub(crate) const TEMP_PREFIX: &str = ".partial-";

/// Handle to an opened cache directory.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheRoot {
    root: PathBuf,
}

impl CacheRoot {
    /// Open a cache directory, creating it and its subdirectories if necessary.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, EnsembleError> {
        let root = root.into();
        for dir in [root.join(STATS_DIR), root.join(OBSERVATIONS_DIR)] {
            std::fs::create_dir_all(&dir).map_err(|source| EnsembleError::CacheIo {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(CacheRoot { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Directory of statistics cache entries.
    pub fn stats_dir(&self) -> PathBuf {
        self.root.join(STATS_DIR)
    }

    /// Directory of observation cache records.
    pub fn observations_dir(&self) -> PathBuf {
        self.root.join(OBSERVATIONS_DIR)
    }
}

/// Replace the file at `path` with `data` atomically.
///
/// The temporary file is created next to `path` so the final rename stays on one file system.
/// Concurrent writers each use their own temporary file; the last rename wins.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Whether a directory entry is an unfinished temporary file.
pub(crate) fn is_temporary(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = CacheRoot::open(dir.path().join("cache")).unwrap();
        assert!(root.stats_dir().is_dir());
        assert!(root.observations_dir().is_dir());
        // Opening again is fine.
        CacheRoot::open(root.path()).unwrap();
    }

    #[test]
    fn open_fails_below_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let err = CacheRoot::open(&file).unwrap_err();
        assert!(matches!(err, EnsembleError::CacheIo { .. }));
    }

    #[test]
    fn write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        write_atomic(&path, b"old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(b"new".to_vec(), std::fs::read(&path).unwrap());
        // No temporary files are left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert_eq!(vec![path], names);
    }

    #[test]
    fn temporary_names() {
        assert!(is_temporary(Path::new("/cache/stats/.partial-abc123")));
        assert!(!is_temporary(Path::new("/cache/stats/abc.json.gz")));
    }
}
