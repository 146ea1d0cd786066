//! Per-box advisory lock held while a state directory is mutated.
//!
//! The lock is a `flock(LOCK_EX | LOCK_NB)` on `<state_root>/.lock`. The
//! kernel releases it when the holder exits, so a crashed holder never needs
//! manual cleanup; the pid written into the file is diagnostic only.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::{BoxError, StateDirectory};

pub struct LockGuard {
    state_root: PathBuf,
    path: PathBuf,
    file: Flock<File>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("state_root", &self.state_root)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Take the lock for `state_root` without waiting.
    pub fn acquire(state_root: &Path) -> Result<Self, BoxError> {
        if !state_root.is_dir() {
            return Err(BoxError::not_found(state_root.display()));
        }
        let path = StateDirectory::new(state_root).lock();

        // A concurrent release may unlink the file we opened; retry once on a
        // fresh inode before giving up.
        for _ in 0..2 {
            if let Some(guard) = Self::try_acquire(state_root, &path)? {
                return Ok(guard);
            }
        }
        Err(BoxError::Busy {
            state_root: state_root.to_path_buf(),
            pid: read_pid(&path),
        })
    }

    fn try_acquire(state_root: &Path, path: &Path) -> Result<Option<Self>, BoxError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| BoxError::io(path, e))?;

        let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                let pid = read_pid(path);
                debug!(path = %path.display(), ?pid, "lock:busy");
                return Err(BoxError::Busy {
                    state_root: state_root.to_path_buf(),
                    pid,
                });
            }
            Err((_, errno)) => return Err(BoxError::io(path, io::Error::from(errno))),
        };

        if !same_inode(&locked, path) {
            debug!(path = %path.display(), "lock:file replaced while locking, retrying");
            return Ok(None);
        }

        let mut file: &File = &locked;
        let mut previous = String::new();
        let _ = file.read_to_string(&mut previous);
        if let Ok(pid) = previous.trim().parse::<u32>()
            && pid != std::process::id()
            && !pid_alive(pid)
        {
            warn!(path = %path.display(), pid, "lock:reclaimed stale lock");
        }

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .map_err(|e| BoxError::io(path, e))?;

        debug!(path = %path.display(), "lock:acquired");
        Ok(Some(Self {
            state_root: state_root.to_path_buf(),
            path: path.to_path_buf(),
            file: locked,
        }))
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    /// Whether this guard protects `state_root`.
    pub fn covers(&self, state_root: &Path) -> bool {
        self.state_root == state_root
    }

    /// Follow the locked directory after it was renamed to `state_root`.
    pub(crate) fn rebase(&mut self, state_root: &Path) {
        self.state_root = state_root.to_path_buf();
        self.path = StateDirectory::new(state_root).lock();
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Once the state root has been retired or replaced, the path is gone
        // or names a newer holder's file; only our own inode is ours to unlink.
        if same_inode(&self.file, &self.path)
            && let Err(e) = fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "lock:failed to remove lock file");
        }
        debug!(path = %self.path.display(), "lock:released");
    }
}

fn same_inode(file: &File, path: &Path) -> bool {
    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(current)) => held.ino() == current.ino() && held.dev() == current.dev(),
        _ => false,
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check if a process exists without signalling it.
fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
