// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Cross-process advisory lock around the session metadata index.
//!
//! `mkdir` is atomic on every platform the desktop shell ships to, so a lock
//! directory doubles as the mutex.  Contention is rare (one core instance per
//! workspace; the shell touches the index only on session management), so a
//! short bounded busy-wait is acceptable.  A lock directory left behind by a
//! crashed process is reclaimed once it is older than [`STALE_AFTER`].

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::warn;

/// Total time budget spent retrying before giving up.
const RETRY_BUDGET: Duration = Duration::from_millis(30);
/// Pause between attempts.
const RETRY_STEP: Duration = Duration::from_millis(3);
/// A lock older than this is assumed to belong to a dead process.
const STALE_AFTER: Duration = Duration::from_secs(30);

/// RAII guard for the metadata lock.  Dropping releases the lock on every
/// exit path, including early returns and panics.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock at `path`, retrying within [`RETRY_BUDGET`].
    ///
    /// Returns `None` when the budget is exhausted; callers proceed without
    /// the lock and log, because a metadata write must never wedge a turn.
    pub async fn acquire(path: &Path) -> Option<DirLock> {
        let deadline = SystemTime::now() + RETRY_BUDGET;
        loop {
            match std::fs::create_dir(path) {
                Ok(()) => return Some(DirLock { path: path.to_path_buf() }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        warn!(path = %path.display(), "releasing stale metadata lock");
                        let _ = std::fs::remove_dir(path);
                        continue;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "metadata lock unavailable");
                    return None;
                }
            }
            if SystemTime::now() >= deadline {
                warn!(path = %path.display(), "metadata lock busy; giving up");
                return None;
            }
            tokio::time::sleep(RETRY_STEP).await;
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.path);
    }
}

fn is_stale(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > STALE_AFTER)
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_creates_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sessions.lock");
        {
            let lock = DirLock::acquire(&lock_path).await.unwrap();
            assert!(lock_path.is_dir());
            drop(lock);
        }
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sessions.lock");
        let _held = DirLock::acquire(&lock_path).await.unwrap();
        // A fresh lock directory is not stale, so the second acquire must
        // exhaust its retry budget and give up.
        assert!(DirLock::acquire(&lock_path).await.is_none());
    }

    #[tokio::test]
    async fn stale_lock_is_forcibly_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("sessions.lock");
        std::fs::create_dir(&lock_path).unwrap();
        // Backdate the directory past the stale threshold.
        let old = SystemTime::now() - Duration::from_secs(120);
        let times = std::fs::FileTimes::new().set_modified(old);
        let f = std::fs::File::open(&lock_path).unwrap();
        f.set_times(times).unwrap();

        let lock = DirLock::acquire(&lock_path).await;
        assert!(lock.is_some(), "stale lock should be reclaimed");
    }
}
