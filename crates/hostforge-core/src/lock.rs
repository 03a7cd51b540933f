//! Run lock: one orchestrator invocation per target at a time.
//!
//! Held with `flock(LOCK_EX)` on `var/lib/hostforge/run.lock` for the
//! lifetime of the returned guard; the kernel releases it if the process dies.

use crate::error::{HostforgeError, Result};
use fs2::FileExt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns [`HostforgeError::Locked`] when another run holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(HostforgeError::Locked(path.display().to_string()));
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        lock.write_owner()?;
        tracing::debug!(path = %path.display(), "acquired run lock");
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_owner(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        writeln!(self.file, "{}", std::process::id())?;
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("var/lib/hostforge/run.lock");
        let first = RunLock::acquire(&path).unwrap();
        let second = RunLock::acquire(&path);
        assert!(matches!(second, Err(HostforgeError::Locked(_))));
        drop(first);
        RunLock::acquire(&path).unwrap();
    }

    #[test]
    fn lock_file_records_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        let _lock = RunLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }
}
