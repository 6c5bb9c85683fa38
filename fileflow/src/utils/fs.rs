//! Filesystem helpers shared across modules.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error("creating directory", path, e))
}

/// Ensure a directory exists (synchronous variant).
pub fn ensure_dir_all_sync(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error("creating directory", path, e))
}

/// Per-job scratch directory under the temp root.
pub fn job_dir(temp_root: &Path, job_id: &str) -> PathBuf {
    temp_root.join(job_id)
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_quiet(path: &Path) -> bool {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed directory");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
            false
        }
    }
}

/// Remove a file, treating "already gone" as success.
pub async fn remove_file_quiet(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

/// Remove every entry directly under `root`. Returns how many were removed.
pub async fn clear_dir(root: &Path) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error("listing", root, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("listing", root, e))?
    {
        let path = entry.path();
        let ok = match entry.file_type().await {
            Ok(ft) if ft.is_dir() => remove_dir_quiet(&path).await,
            _ => remove_file_quiet(&path).await,
        };
        if ok {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clear_dir_removes_nested_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("job-a").join("inner");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("part.bin"), b"x").unwrap();
        std::fs::write(tmp.path().join("stray.tmp"), b"y").unwrap();

        let removed = clear_dir(tmp.path()).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clear_missing_dir_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(clear_dir(&tmp.path().join("nope")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_quiet_on_missing_paths() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(remove_dir_quiet(&tmp.path().join("missing")).await);
        assert!(remove_file_quiet(&tmp.path().join("missing.bin")).await);
    }
}
