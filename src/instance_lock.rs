//! Single-instance guard backed by a PID file.
//!
//! A lock record naming a live process blocks startup. A record naming a dead
//! process (or holding garbage) is stale and gets replaced. There is no
//! heartbeat: process existence is the only liveness signal.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::error::LockError;

const LOCK_FILE_NAME: &str = "tts-server-rs.pid";
const CLAIM_ATTEMPTS: usize = 3;

static SIBLING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Default lock location: the runtime dir, falling back to the cache dir.
pub fn default_lock_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(LOCK_FILE_NAME)
}

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: bool,
}

impl InstanceLock {
    /// Take the lock at `path`, clearing a stale record first.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        // The record is written in full under a private name, then linked
        // into place. hard_link fails if the target exists, like O_EXCL.
        let staging = sibling(path, "new");
        fs::write(&staging, std::process::id().to_string()).map_err(io_err)?;
        let claimed = claim(path, &staging);
        if let Err(e) = remove_if_exists(&staging) {
            warn!("Failed to remove {}: {e}", staging.display());
        }
        claimed?;

        info!("Instance lock acquired at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock record. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match remove_if_exists(&self.path) {
            Ok(()) => info!("Instance lock released"),
            Err(e) => warn!("Failed to remove lock file {}: {e}", self.path.display()),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn claim(path: &Path, staging: &Path) -> Result<(), LockError> {
    let io_err = |source| LockError::Io {
        path: path.display().to_string(),
        source,
    };

    for _ in 0..CLAIM_ATTEMPTS {
        match fs::hard_link(staging, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_err(e)),
        }

        let Some(pid) = read_pid(path).map_err(io_err)? else {
            continue;
        };
        if pid != std::process::id() && is_process_alive(pid) {
            return Err(LockError::AlreadyRunning {
                pid,
                path: path.display().to_string(),
            });
        }
        warn!(
            "Removing stale lock file {} (process {pid} no longer running)",
            path.display()
        );
        retire_stale(path, pid).map_err(io_err)?;
    }

    Err(LockError::AlreadyRunning {
        pid: read_pid(path).ok().flatten().unwrap_or(0),
        path: path.display().to_string(),
    })
}

/// Move a stale record out of the way without touching a fresh one.
///
/// The record is renamed aside first, so it can be checked after the move.
/// If another starter replaced it in the meantime, it is linked back.
fn retire_stale(path: &Path, stale_pid: u32) -> std::io::Result<()> {
    let aside = sibling(path, "stale");
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }

    let moved = read_pid(&aside)?;
    if moved != Some(stale_pid) {
        debug!("Lock record changed while clearing it, restoring");
        match fs::hard_link(&aside, path) {
            Err(e) if e.kind() != ErrorKind::AlreadyExists => {
                remove_if_exists(&aside)?;
                return Err(e);
            }
            _ => {}
        }
    }
    remove_if_exists(&aside)
}

/// A per-process, per-call name next to the lock file.
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let seq = SIBLING_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{tag}.{}.{seq}", std::process::id()));
    path.with_file_name(name)
}

/// Read the recorded PID. Unparseable content counts as stale (PID 0 is
/// never alive here), a missing file as no record.
fn read_pid(path: &Path) -> Result<Option<u32>, std::io::Error> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.trim().parse().unwrap_or(0))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_if_exists(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // Signal 0 only checks existence. EPERM means it exists but is not ours.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    // No portable existence check; trust any non-zero record.
    pid != 0
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().expect("spawn true");
        let pid = child.id();
        child.wait().expect("wait true");
        pid
    }

    #[test]
    fn acquires_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        let mut lock = InstanceLock::acquire(&path).unwrap();
        let recorded = fs::read_to_string(&path).unwrap();
        assert_eq!(recorded, std::process::id().to_string());

        lock.release();
        assert!(!path.exists());
        lock.release();
    }

    #[test]
    fn live_owner_blocks_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        // PID 1 always exists.
        fs::write(&path, "1").unwrap();

        match InstanceLock::acquire(&path) {
            Err(LockError::AlreadyRunning { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
    }

    #[test]
    fn dead_owner_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, dead_pid().to_string()).unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn garbage_record_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "not a pid\n").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn fresh_record_survives_late_stale_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        let dead = dead_pid();

        // Both starters saw the dead record; the winner has since replaced it.
        fs::write(&path, "1").unwrap();
        retire_stale(&path, dead).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
        match InstanceLock::acquire(&path) {
            Err(LockError::AlreadyRunning { pid, .. }) => assert_eq!(pid, 1),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn stale_cleanup_tolerates_vanished_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        retire_stale(&path, dead_pid()).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn drop_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.pid");
        {
            let _lock = InstanceLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
