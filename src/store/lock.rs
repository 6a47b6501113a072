use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{DocRolesError, Result};

/// Exclusive lock held for the duration of a live pipeline run.
/// The lock is released when the value is dropped.
pub struct RunLock {
    _file: File,
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

impl RunLock {
    /// Acquire the lock or fail immediately if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.try_lock_exclusive()
            .map_err(|_| DocRolesError::Locked(path.display().to_string()))?;
        Ok(Self { _file: file })
    }
}

/// True when some process currently holds the lock at `path`.
pub fn is_held(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            file.unlock()?;
            Ok(false)
        }
        Err(_) => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("run.lock");

        let lock = RunLock::acquire(&lock_path).unwrap();
        assert!(RunLock::acquire(&lock_path).is_err());
        assert!(is_held(&lock_path).unwrap());

        drop(lock);
        assert!(!is_held(&lock_path).unwrap());
        let _lock = RunLock::acquire(&lock_path).unwrap();
    }

    #[test]
    fn missing_lock_file_is_not_held() {
        let dir = tempdir().unwrap();
        assert!(!is_held(&dir.path().join("absent.lock")).unwrap());
    }
}
