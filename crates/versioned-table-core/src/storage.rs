//! Local file helpers backing the file-based change log.
//!
//! The file change log keeps one directory per table under a root:
//!
//! - `<root>/T<id>/CURRENT` records the number of committed changes.
//! - `<root>/T<id>/0000000000.json` holds change number `0`, and so on.
//! - `<root>/T<id>/SEQUENCE` records the highest reserved row id.
//!
//! This module owns the primitives used by that layout: atomic
//! write-then-rename replacement, create-only-if-absent writes for change
//! files, reads that classify a missing file separately from other I/O
//! failures, and directory listing.

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root directory of a file-backed change log.
#[derive(Clone, Debug)]
pub struct LogLocation {
    root: PathBuf,
}

impl LogLocation {
    /// Creates a location rooted at a local directory.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn join(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }
}

/// Wrapper around local filesystem errors.
#[derive(Debug)]
pub struct BackendError(io::Error);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local I/O error: {}", self.0)
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.0)
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The path already exists when creation was requested with create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// Any other local I/O error.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

fn classify(err: io::Error, path: &Path) -> StorageError {
    let path = path.display().to_string();
    let kind = err.kind();
    let source = BackendError(err);
    let backtrace = Backtrace::capture();
    match kind {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source,
            backtrace,
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source,
            backtrace,
        },
        _ => StorageError::OtherIo {
            path,
            source,
            backtrace,
        },
    }
}

async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| classify(e, parent))?;
    }
    Ok(())
}

/// Removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Replace `rel_path` atomically: write a sibling temp file, sync it, rename it into place.
pub async fn write_atomic(
    location: &LogLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let tmp_path = abs.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());

    {
        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| classify(e, &tmp_path))?;
        file.write_all(contents)
            .await
            .map_err(|e| classify(e, &tmp_path))?;
        file.sync_all()
            .await
            .map_err(|e| classify(e, &tmp_path))?;
    }

    fs::rename(&tmp_path, &abs)
        .await
        .map_err(|e| classify(e, &abs))?;
    guard.disarm();
    Ok(())
}

/// Create a new file at `rel_path`, failing with `AlreadyExists` if it is present.
///
/// Change files use this so each change number is written exactly once.
pub async fn write_new(
    location: &LogLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    let abs = location.join(rel_path);
    create_parent_dir(&abs).await?;

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&abs)
        .await
        .map_err(|e| classify(e, &abs))?;

    file.write_all(contents)
        .await
        .map_err(|e| classify(e, &abs))?;
    file.sync_all().await.map_err(|e| classify(e, &abs))?;
    Ok(())
}

/// Read `rel_path` into a string; a missing file is `StorageError::NotFound`.
pub async fn read_to_string(location: &LogLocation, rel_path: &Path) -> StorageResult<String> {
    let abs = location.join(rel_path);
    fs::read_to_string(&abs)
        .await
        .map_err(|e| classify(e, &abs))
}

/// List the names of the directories directly under `rel_path`.
///
/// A missing directory yields an empty list.
pub async fn list_dir_names(location: &LogLocation, rel_path: &Path) -> StorageResult<Vec<String>> {
    let abs = location.join(rel_path);
    let mut entries = match fs::read_dir(&abs).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(classify(e, &abs)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| classify(e, &abs))? {
        let is_dir = entry
            .file_type()
            .await
            .map_err(|e| classify(e, &entry.path()))?
            .is_dir();
        if is_dir {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    // ==================== Storage tests ====================

    #[tokio::test]
    async fn write_atomic_replaces_contents_and_leaves_no_temp_file() -> TestResult {
        let tmp = TempDir::new()?;
        let location = LogLocation::local(tmp.path());
        let rel = Path::new("T1/CURRENT");

        write_atomic(&location, rel, b"1\n").await?;
        write_atomic(&location, rel, b"2\n").await?;

        assert_eq!(read_to_string(&location, rel).await?, "2\n");
        assert!(!tmp.path().join("T1/CURRENT.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn write_new_refuses_to_overwrite() -> TestResult {
        let tmp = TempDir::new()?;
        let location = LogLocation::local(tmp.path());
        let rel = Path::new("T1/0000000000.json");

        write_new(&location, rel, b"{}").await?;
        let second = write_new(&location, rel, b"{}").await;

        assert!(matches!(second, Err(StorageError::AlreadyExists { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn read_missing_file_is_not_found() -> TestResult {
        let tmp = TempDir::new()?;
        let location = LogLocation::local(tmp.path());

        let result = read_to_string(&location, Path::new("T9/CURRENT")).await;

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn list_dir_names_returns_sorted_directories_only() -> TestResult {
        let tmp = TempDir::new()?;
        let location = LogLocation::local(tmp.path());
        write_new(&location, Path::new("T2/CURRENT"), b"0").await?;
        write_new(&location, Path::new("T1/CURRENT"), b"0").await?;
        write_new(&location, Path::new("stray.txt"), b"x").await?;

        let names = list_dir_names(&location, Path::new("")).await?;

        assert_eq!(names, vec!["T1".to_string(), "T2".to_string()]);
        assert!(list_dir_names(&location, Path::new("missing")).await?.is_empty());
        Ok(())
    }
}
