//! PID file that marks a running daemon.
//!
//! The file holds the daemon's process id as decimal text. A file naming a
//! process that no longer exists is stale and is removed on lookup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;

/// Daemon PID file at a fixed path.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The PID file inside the user state directory.
    pub fn in_state_dir() -> Self {
        Self::new(state_dir().join("uibridged.pid"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in the file, if it exists and parses.
    pub fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    /// Records the current process, creating parent directories.
    pub fn claim(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, process::id().to_string())
    }

    pub fn release(&self) {
        let _ = fs::remove_file(&self.path);
    }

    /// Pid of the live daemon, clearing a stale file.
    pub fn live_pid(&self) -> Option<u32> {
        let pid = self.read()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            self.release();
            None
        }
    }
}

/// Directory for the PID and log files.
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("uibridge")
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence without delivering anything
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
