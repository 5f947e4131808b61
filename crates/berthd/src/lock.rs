//! Single-flight build lock backed by a lock file.
//!
//! The file is created with `create_new`, so exactly one holder wins. It
//! records the holder's pid and start time and is removed when the guard is
//! dropped. A lock whose holder is no longer running, or that is older than
//! `stale_after`, belongs to a build that died without cleaning up and is
//! broken.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Contents of a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BuildLock {
    path: PathBuf,
    stale_after: Duration,
}

impl BuildLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, or `None` while another build holds it.
    pub fn try_acquire(&self) -> io::Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // second pass only after breaking a stale lock
        for _ in 0..2 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        started_at: Utc::now(),
                    };
                    let guard = LockGuard {
                        path: self.path.clone(),
                    };
                    file.write_all(&serde_json::to_vec(&info)?)?;
                    file.sync_all()?;
                    return Ok(Some(guard));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !self.is_stale()? {
                        return Ok(None);
                    }
                    warn!(path = %self.path.display(), "breaking stale build lock");
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Current holder, if the lock file exists and is readable.
    pub fn holder(&self) -> io::Result<Option<LockInfo>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_slice(&raw).ok())
    }

    fn is_stale(&self) -> io::Result<bool> {
        let age = match self.holder()? {
            Some(info) if !process_alive(info.pid) => {
                warn!(pid = info.pid, "build lock holder is gone");
                return Ok(true);
            }
            Some(info) => (Utc::now() - info.started_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
            // unreadable or half-written: fall back to the file's mtime
            None => match fs::metadata(&self.path) {
                Ok(meta) => SystemTime::now()
                    .duration_since(meta.modified()?)
                    .unwrap_or(Duration::ZERO),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(e),
            },
        };
        Ok(age > self.stale_after)
    }
}

/// Whether `pid` names a running process. Without procfs only age decides.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// Held lock; dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release build lock");
            }
        }
    }
}
