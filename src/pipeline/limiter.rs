//! At most one active run at a time.
//!
//! Inside a process the limit is a one-permit semaphore. The lock file
//! extends it to every process pointing at the same file: the file is created
//! exclusively on acquire and removed when the permit drops. A lock whose
//! holder process is gone is treated as stale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::RunPolicy;
use crate::error::{DbtflowError, ErrorCode, Result};

/// Contents of a run lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLockInfo {
    pub run_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl RunLockInfo {
    fn holder(&self) -> String {
        format!("run {} (pid {}) since {}", self.run_id, self.pid, self.acquired_at)
    }
}

/// Removes the lock file when dropped
#[derive(Debug)]
pub struct RunLockFile {
    path: PathBuf,
}

impl RunLockFile {
    /// Create the lock file exclusively. A lock left behind by a process that
    /// no longer exists is removed and the attempt repeated once.
    pub fn acquire(path: &Path, run_id: Uuid) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| lock_error(path, e))?;
        }

        let info = RunLockInfo {
            run_id,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        let mut stale_removed = false;
        let mut file = loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(file) => break file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = Self::read_info(path);
                    if let Some(stale) = holder.as_ref().filter(|h| !is_process_running(h.pid)) {
                        if !stale_removed {
                            tracing::warn!(
                                "Removing stale run lock {} ({} is no longer running)",
                                path.display(),
                                stale.holder()
                            );
                            match std::fs::remove_file(path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => return Err(lock_error(path, e)),
                            }
                            stale_removed = true;
                            continue;
                        }
                    }

                    let holder = holder.map(|h| h.holder());
                    tracing::warn!(
                        "Run lock {} is held by {}",
                        path.display(),
                        holder.as_deref().unwrap_or("an unknown run")
                    );
                    return Err(DbtflowError::RunInProgress { holder });
                }
                Err(e) => return Err(lock_error(path, e)),
            }
        };

        let contents = serde_json::to_string_pretty(&info).map_err(|e| lock_error(path, e))?;
        if let Err(e) = file.write_all(contents.as_bytes()) {
            let _ = std::fs::remove_file(path);
            return Err(lock_error(path, e));
        }

        tracing::debug!("Acquired run lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read_info(path: &Path) -> Option<RunLockInfo> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl Drop for RunLockFile {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove run lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Whether `pid` names a live process. Permission errors mean it exists.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Without a cheap liveness check every holder counts as running
#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    true
}

fn lock_error(
    path: &Path,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> DbtflowError {
    DbtflowError::config_with_code(ErrorCode::RUN_LOCK_FAILED, "cannot create run lock")
        .with_path(path)
        .with_source(source)
}

/// How often a queued run checks whether the lock file was released
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the whole duration of a run
#[derive(Debug)]
pub struct RunPermit {
    _permit: OwnedSemaphorePermit,
    _lock: Option<RunLockFile>,
}

#[derive(Debug, Clone)]
pub struct RunLimiter {
    semaphore: Arc<Semaphore>,
    policy: RunPolicy,
    lock_file: Option<PathBuf>,
}

impl RunLimiter {
    pub fn new(policy: RunPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            policy,
            lock_file: None,
        }
    }

    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_file = Some(path.into());
        self
    }

    /// Under `Reject`, fails fast with `RunInProgress`; under `Queue`, waits
    /// for the active run to finish, in this process or in any other process
    /// sharing the lock file.
    pub async fn acquire(&self, run_id: Uuid) -> Result<RunPermit> {
        let permit = match self.policy {
            RunPolicy::Reject => Arc::clone(&self.semaphore)
                .try_acquire_owned()
                .map_err(|_| DbtflowError::RunInProgress { holder: None })?,
            RunPolicy::Queue => {
                if self.semaphore.available_permits() == 0 {
                    tracing::info!("Another run is active; waiting for it to finish");
                }
                Arc::clone(&self.semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| DbtflowError::RunInProgress { holder: None })?
            }
        };

        let lock = match &self.lock_file {
            Some(path) => Some(self.acquire_lock_file(path, run_id).await?),
            None => None,
        };

        Ok(RunPermit {
            _permit: permit,
            _lock: lock,
        })
    }

    async fn acquire_lock_file(&self, path: &Path, run_id: Uuid) -> Result<RunLockFile> {
        let mut waiting = false;
        loop {
            match RunLockFile::acquire(path, run_id) {
                Err(DbtflowError::RunInProgress { holder }) if self.policy == RunPolicy::Queue => {
                    if !waiting {
                        tracing::info!(
                            "Waiting for {} to release {}",
                            holder.as_deref().unwrap_or("another run"),
                            path.display()
                        );
                        waiting = true;
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                other => return other,
            }
        }
    }
}

impl Default for RunLimiter {
    fn default() -> Self {
        Self::new(RunPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reject_second_permit() {
        let limiter = RunLimiter::new(RunPolicy::Reject);
        let first = limiter.acquire(Uuid::new_v4()).await.unwrap();

        let err = limiter.acquire(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DbtflowError::RunInProgress { .. }));

        drop(first);
        assert!(limiter.acquire(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let limiter = RunLimiter::new(RunPolicy::Queue);
        let first = limiter.acquire(Uuid::new_v4()).await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(Uuid::new_v4()).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        assert!(waiting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_lock_file_created_and_removed() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("locks").join("run.lock");
        let limiter = RunLimiter::new(RunPolicy::Reject).with_lock_file(&path);

        let run_id = Uuid::new_v4();
        let permit = limiter.acquire(run_id).await.unwrap();
        let info: RunLockInfo =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(info.run_id, run_id);
        assert_eq!(info.pid, std::process::id());

        drop(permit);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_foreign_lock_file_rejects_run() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.lock");
        let foreign = RunLockFile::acquire(&path, Uuid::new_v4()).unwrap();

        // A separate limiter stands in for another process
        let limiter = RunLimiter::new(RunPolicy::Reject).with_lock_file(&path);
        match limiter.acquire(Uuid::new_v4()).await.unwrap_err() {
            DbtflowError::RunInProgress { holder } => {
                assert!(holder.unwrap().contains(&std::process::id().to_string()));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // The semaphore permit was released along with the failed attempt
        drop(foreign);
        assert!(limiter.acquire(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_waits_for_foreign_lock_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.lock");
        let foreign = RunLockFile::acquire(&path, Uuid::new_v4()).unwrap();

        let limiter = RunLimiter::new(RunPolicy::Queue).with_lock_file(&path);
        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(Uuid::new_v4()).await.map(|_| ()) })
        };
        tokio::time::sleep(LOCK_POLL_INTERVAL * 3).await;
        assert!(!waiting.is_finished());

        drop(foreign);
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("queued run should start once the lock is released")
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_of_dead_process_is_replaced() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        assert!(!is_process_running(dead_pid));

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.lock");
        let stale = RunLockInfo {
            run_id: Uuid::new_v4(),
            pid: dead_pid,
            acquired_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let run_id = Uuid::new_v4();
        let lock = RunLockFile::acquire(&path, run_id).unwrap();
        let info: RunLockInfo =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(info.run_id, run_id);
        assert_eq!(info.pid, std::process::id());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_unreadable_lock_is_not_treated_as_stale() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run.lock");
        std::fs::write(&path, "{}").unwrap();

        let err = RunLockFile::acquire(&path, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DbtflowError::RunInProgress { holder: None }));
        assert!(path.exists());
    }
}
