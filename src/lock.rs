//! Cross-process exclusive access to one exchange log.
//!
//! Lock file: `<log path>.lock`, zero bytes. Its holder also keeps an
//! advisory OS lock on the open handle, so a sidecar whose owner crashed is
//! reclaimable: the OS lock is gone even though the file is not.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;

use crate::{config::LockConfig, error::EngineError};

pub fn lock_path_for(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    log_path.with_file_name(name)
}

/// A held lock. Released by [`LogLock::release`] or on drop.
#[derive(Debug)]
pub struct LogLock {
    log_path: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
}

impl LogLock {
    /// Acquires the lock for `log_path`, retrying with exponential backoff.
    pub async fn acquire(log_path: &Path, policy: LockConfig) -> Result<Self, EngineError> {
        let lock_path = lock_path_for(log_path);
        let attempts = policy.attempts.max(1);
        let max_backoff = Duration::from_millis(policy.max_backoff_ms.max(policy.initial_backoff_ms));
        let mut backoff = Duration::from_millis(policy.initial_backoff_ms);

        for attempt in 1..=attempts {
            let candidate = lock_path.clone();
            let acquired = tokio::task::spawn_blocking(move || try_acquire_blocking(&candidate))
                .await
                .map_err(|err| EngineError::task("acquire log lock", err))?
                .map_err(|source| EngineError::Lock {
                    path: lock_path.clone(),
                    source,
                })?;

            if let Some(file) = acquired {
                tracing::debug!(lock = %lock_path.display(), attempt, "acquired log lock");
                return Ok(Self {
                    log_path: log_path.to_path_buf(),
                    lock_path,
                    file: Some(file),
                });
            }

            if attempt < attempts {
                tracing::debug!(
                    lock = %lock_path.display(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "log lock busy; backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        Err(EngineError::LockContended {
            path: log_path.to_path_buf(),
            attempts,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Unlink before unlocking so a waiter that grabs the old handle sees
        // the path is gone.
        if let Err(err) = std::fs::remove_file(&self.lock_path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(lock = %self.lock_path.display(), "failed to remove lock file: {err}");
        }
        let _ = FileExt::unlock(&file);
    }
}

impl Drop for LogLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind()
}

/// `Ok(None)` means someone else holds the lock right now.
fn try_acquire_blocking(lock_path: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        // Never unlink here: between create_new and the OS lock another
        // acquirer may have reclaimed this sidecar and now owns it. An
        // unlocked leftover is reclaimed as stale on the next attempt.
        Ok(file) => match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err),
        },
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => reclaim_if_stale(lock_path),
        Err(err) => Err(err),
    }
}

fn reclaim_if_stale(lock_path: &Path) -> io::Result<Option<File>> {
    let existing = match OpenOptions::new().read(true).write(true).open(lock_path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    match existing.try_lock_exclusive() {
        Ok(()) if still_linked(&existing, lock_path) => {
            tracing::warn!(lock = %lock_path.display(), "reclaiming stale lock file");
            Ok(Some(existing))
        }
        Ok(()) => {
            let _ = FileExt::unlock(&existing);
            Ok(None)
        }
        Err(err) if is_contended(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn still_linked(handle: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt as _;

    match (handle.metadata(), std::fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_handle: &File, path: &Path) -> bool {
    path.exists()
}
