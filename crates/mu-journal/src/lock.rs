//! Process-scoped writer lock: one runtime per repo store directory.
//!
//! The lock is a JSON file naming its owner. Acquisition is fail-fast when
//! the recorded pid is still alive; a dead pid means a crashed predecessor
//! and the lock is replaced with a warning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{JournalError, Result};

pub const LOCK_FILE: &str = "writer.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub owner_id: String,
    pub pid: u32,
    pub host: String,
    pub repo_root: String,
    pub acquired_at_ms: i64,
}

/// Held writer lock. Dropping without [`WriterLock::release`] leaves the
/// file behind; the next acquisition treats it as stale once the pid dies.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

impl WriterLock {
    /// Acquire the lock for `store_dir`, failing with `WriterLockBusy` when a
    /// live owner exists.
    pub fn acquire(store_dir: &Path, repo_root: &str, now_ms: i64) -> Result<Self> {
        std::fs::create_dir_all(store_dir)?;
        let path = store_dir.join(LOCK_FILE);

        if let Some(existing) = read_owner(&path)? {
            if pid_alive(existing.pid) {
                return Err(JournalError::WriterLockBusy {
                    path: path.display().to_string(),
                    pid: existing.pid,
                    owner_id: existing.owner_id,
                });
            }
            warn!(
                pid = existing.pid,
                owner_id = %existing.owner_id,
                "replacing stale writer lock (owner process is gone)"
            );
        }

        let owner = LockOwner {
            owner_id: format!("writer-{}", Uuid::new_v4()),
            pid: std::process::id(),
            host: hostname(),
            repo_root: repo_root.to_string(),
            acquired_at_ms: now_ms,
        };
        std::fs::write(&path, serde_json::to_string(&owner)?)?;
        info!(owner_id = %owner.owner_id, path = %path.display(), "writer lock acquired");

        Ok(Self {
            path,
            owner,
            released: false,
        })
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Every serialized mutation asserts hold before touching the stores.
    pub fn assert_held(&self) -> Result<()> {
        if self.released {
            return Err(JournalError::WriterLockNotHeld);
        }
        match read_owner(&self.path)? {
            Some(owner) if owner.owner_id == self.owner.owner_id => Ok(()),
            _ => Err(JournalError::WriterLockNotHeld),
        }
    }

    /// Release explicitly on shutdown.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(owner_id = %self.owner.owner_id, "writer lock released");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_owner(path: &Path) -> Result<Option<LockOwner>> {
    match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(owner) => Ok(Some(owner)),
            Err(e) => {
                // An unreadable lock file cannot prove a live owner.
                warn!(path = %path.display(), error = %e, "unparseable writer lock treated as stale");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Signal 0 probes for existence without touching the process.
fn pid_alive(pid: u32) -> bool {
    // Guard the cast: a pid that cannot exist must not become a negative
    // pid_t, which kill(2) would interpret as a process group.
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}
