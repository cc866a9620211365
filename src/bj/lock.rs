use crate::bj::error::JobError;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

/// Advisory exclusive lock on a path, backed by `flock(2)`.
///
/// The lock belongs to the open file description, so two `FileLock`s on the same
/// path exclude each other even inside one process. Dropping a held lock releases it.
/// The parent directory must exist; the lock file itself is created on demand.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    held: Option<Flock<File>>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: None,
        }
    }

    /// Open and lock `path`, blocking until the lock is granted.
    pub fn locked(path: impl Into<PathBuf>) -> Result<Self, JobError> {
        let mut lock = Self::new(path);
        lock.acquire()?;
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&mut self) -> Result<(), JobError> {
        if self.held.is_some() {
            return Ok(());
        }
        let mut file = self.open()?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusive) {
                Ok(locked) => {
                    self.held = Some(locked);
                    return Ok(());
                }
                Err((f, Errno::EINTR)) => file = f,
                Err((_, e)) => {
                    return Err(JobError::Lock {
                        path: self.path.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Non-blocking variant of [`FileLock::acquire`]. Returns `Ok(false)` when another
    /// holder has the lock.
    pub fn try_acquire(&mut self) -> Result<bool, JobError> {
        if self.held.is_some() {
            return Ok(true);
        }
        let file = self.open()?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => {
                self.held = Some(locked);
                Ok(true)
            }
            Err((_, Errno::EAGAIN)) => Ok(false),
            Err((_, e)) => Err(JobError::Lock {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    pub fn release(&mut self) -> Result<(), JobError> {
        let Some(locked) = self.held.take() else {
            return Ok(());
        };
        match locked.unlock() {
            Ok(_file) => Ok(()),
            // The descriptor is closed when the failed guard drops, which releases the lock anyway.
            Err((_guard, e)) => Err(JobError::Lock {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    pub fn is_held_by_me(&self) -> bool {
        self.held.is_some()
    }

    /// The locked file, for callers that read or write the lock file's own content.
    pub(crate) fn file_mut(&mut self) -> Option<&mut File> {
        self.held.as_deref_mut()
    }

    fn open(&self) -> Result<File, JobError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o660)
            .open(&self.path)
            .map_err(|e| JobError::io("open lock file", &self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_and_release_toggle_is_held() {
        let dir = TempDir::new().unwrap();
        let mut lock = FileLock::new(dir.path().join("a.lock"));
        assert!(!lock.is_held_by_me());
        lock.acquire().unwrap();
        assert!(lock.is_held_by_me());
        assert!(dir.path().join("a.lock").exists());
        lock.release().unwrap();
        assert!(!lock.is_held_by_me());
        lock.release().unwrap();
    }

    #[test]
    fn second_holder_cannot_take_held_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.lock");
        let first = FileLock::locked(&path).unwrap();
        let mut second = FileLock::new(&path);
        assert!(!second.try_acquire().unwrap());
        drop(first);
        assert!(second.try_acquire().unwrap());
        assert!(second.is_held_by_me());
    }

    #[test]
    fn acquire_fails_when_parent_is_missing() {
        let dir = TempDir::new().unwrap();
        let mut lock = FileLock::new(dir.path().join("missing").join("c.lock"));
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, JobError::Io { .. }), "{err}");
    }
}
