use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::warn;

/// Exclusive lock on daemon.pid, held for the daemon's lifetime. The flock,
/// not the file's presence, decides whether an instance is running: a
/// present-but-unlocked pid file is stale by definition, which closes the
/// race window around leftover sockets from a crashed daemon.
#[derive(Debug)]
pub struct PidLock {
    _file: Flock<fs::File>,
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed opening {}", path.display()))?;

        let mut previous = String::new();
        let _ = file.read_to_string(&mut previous);
        let previous_pid = previous.trim().parse::<i32>().ok();

        let locked =
            Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
                match previous_pid {
                    Some(pid) => anyhow!("daemon already running (pid {pid}): {errno}"),
                    None => anyhow!("daemon already running: {errno}"),
                }
            })?;

        if let Some(pid) = previous_pid
            && pid_alive(pid)
        {
            // We got the lock, so whatever the old pid points at never held
            // it. Recycled pid or a crashed instance's leftover.
            warn!(pid, "stale pid file pointed at a live process");
        }

        locked
            .set_len(0)
            .with_context(|| format!("failed truncating {}", path.display()))?;
        (&*locked)
            .write_all(std::process::id().to_string().as_bytes())
            .with_context(|| format!("failed writing {}", path.display()))?;
        locked
            .sync_all()
            .with_context(|| format!("failed syncing {}", path.display()))?;

        Ok(Self {
            _file: locked,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}
