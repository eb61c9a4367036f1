//! Whole-file persistence: atomic rewrite and advisory write locks.

use crate::error::StoreError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Read a file, treating a missing file as `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Replace `path` with `bytes` so that readers see either the old or the
/// new content, never a partial write.
///
/// The data goes to a uniquely named temp file in the same directory,
/// is synced, then renamed over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = File::create(&tmp_path).map_err(|e| StoreError::io(&tmp_path, e))?;
    if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(&tmp_path, e));
    }
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Remove a file, returning whether it existed.
pub fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Exclusive advisory lock on `<file>.lock`, released on drop.
///
/// Held around every read-modify-write of a store file so that two
/// processes serialize their mutations.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock for `target` is held.
    pub fn acquire(target: &Path) -> Result<Self, StoreError> {
        let path = lock_path(target);
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StoreError::io(&path, e))?;
        tracing::trace!(lock = %path.display(), "store lock acquired");

        Ok(Self { file, path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

/// Sibling lock file path: `faces.csv` → `faces.csv.lock`.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    target.with_file_name(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("table.csv");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_atomic_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/table.csv");
        write_atomic(&path, b"x").unwrap();
        assert_eq!(read_optional(&path).unwrap().as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_read_optional_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("absent.csv")).unwrap().is_none());
    }

    #[test]
    fn test_remove_if_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gone.csv");
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(lock_path(Path::new("/data/faces.csv")), PathBuf::from("/data/faces.csv.lock"));
    }

    #[test]
    fn test_lock_reacquire_after_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("faces.csv");
        {
            let _lock = FileLock::acquire(&target).unwrap();
        }
        let _again = FileLock::acquire(&target).unwrap();
        assert!(lock_path(&target).exists());
    }
}
