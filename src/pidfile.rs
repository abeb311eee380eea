//! PID-file based single instancing.
//!
//! The owning process keeps a POSIX advisory write lock on the whole file
//! for its entire lifetime; liveness checks are a read-lock probe plus
//! `kill`. The file holds the decimal pid followed by a newline.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use tracing::{debug, info};

use crate::error::PidFileError;

/// Result of [`signal`]: who (if anyone) holds the pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// No pid file at the given path.
    NoPidFile,
    /// Pid file exists but no live process holds its lock.
    NotRunning,
    /// The signal (or probe) reached the recorded pid.
    Delivered(Pid),
}

fn set_lock(fd: RawFd, kind: libc::c_short) -> bool {
    let mut lock = libc::flock {
        l_type: kind,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) == 0 }
}

fn read_pid(file: &mut File) -> Option<i32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.split_whitespace().next()?.parse().ok()
}

fn create_exclusive(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
}

/// Allocates the pid file at `path` for the current process.
///
/// Parent directories are created when absent. An existing file is probed:
/// if its content cannot be parsed, records our own pid, or a write lock can
/// be taken, the file is stale and is replaced; otherwise
/// [`PidFileError::AlreadyRunning`] carries the recorded pid.
///
/// On success the locked descriptor is intentionally leaked so the advisory
/// lock persists until the process exits; `FD_CLOEXEC` is set so exec'd
/// children do not inherit it.
pub fn allocate(path: &Path) -> Result<(), PidFileError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| PidFileError::io(path, e))?;
    }

    let file = match create_exclusive(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let mut existing = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| PidFileError::io(path, e))?;

            let pid = read_pid(&mut existing);
            let stale = match pid {
                None => true,
                Some(pid) => {
                    pid == unistd::getpid().as_raw()
                        || set_lock(existing.as_raw_fd(), libc::F_WRLCK as libc::c_short)
                }
            };

            if !stale {
                return Err(PidFileError::AlreadyRunning {
                    pid: pid.unwrap_or(0),
                });
            }

            info!(
                "Removing stale pid file for pid <{}>.",
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
            );
            drop(existing);
            fs::remove_file(path).map_err(|e| PidFileError::io(path, e))?;

            // failure to re-create is fatal; no third chance
            create_exclusive(path).map_err(|e| PidFileError::io(path, e))?
        }
        Err(e) => return Err(PidFileError::io(path, e)),
    };

    if !set_lock(file.as_raw_fd(), libc::F_WRLCK as libc::c_short) {
        return Err(PidFileError::io(path, io::Error::last_os_error()));
    }

    let mut file = file;
    writeln!(file, "{}", unistd::getpid().as_raw())
        .and_then(|_| file.flush())
        .map_err(|e| PidFileError::io(path, e))?;

    unsafe {
        libc::fcntl(file.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
    }

    // the descriptor stays open for the process lifetime to keep the lock
    let _ = file.into_raw_fd();
    debug!("Allocated pid file {:?}.", path);
    Ok(())
}

/// Sends `signo` to the process recorded in the pid file at `path`.
///
/// `None` probes liveness without delivering a signal. A successful read
/// lock means the recorded holder is gone; `ESRCH` from `kill` means the
/// same.
pub fn signal(path: &Path, signo: Option<Signal>) -> Result<SignalOutcome, PidFileError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(SignalOutcome::NoPidFile);
        }
        Err(e) => return Err(PidFileError::io(path, e)),
    };

    if set_lock(file.as_raw_fd(), libc::F_RDLCK as libc::c_short) {
        // nobody holds the write lock, the owner is gone
        return Ok(SignalOutcome::NotRunning);
    }

    let pid = read_pid(&mut file).ok_or_else(|| {
        PidFileError::io(
            path,
            io::Error::new(io::ErrorKind::InvalidData, "unparseable pid"),
        )
    })?;
    let pid = Pid::from_raw(pid);

    match signal::kill(pid, signo) {
        Ok(()) => Ok(SignalOutcome::Delivered(pid)),
        Err(Errno::ESRCH) => Ok(SignalOutcome::NotRunning),
        Err(e) => Err(PidFileError::Kill(io::Error::from_raw_os_error(e as i32))),
    }
}

/// RAII pid file: retries allocation for a bounded time and unlinks the file
/// on drop.
pub struct ScopedPidFile {
    path: PathBuf,
}

impl ScopedPidFile {
    /// Single allocation attempt.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        allocate(&path)?;
        Ok(Self { path })
    }

    /// Retries [`allocate`] for up to `wait` (polling every `check_period`)
    /// before giving up with the last error.
    pub fn with_retry(
        path: impl Into<PathBuf>,
        wait: Duration,
        check_period: Duration,
    ) -> Result<Self, PidFileError> {
        let path = path.into();
        let deadline = Instant::now() + wait;
        loop {
            match allocate(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => std::thread::sleep(check_period),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedPidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_records_own_pid() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("sub/dir/test.pid");

        allocate(&path).expect("allocate pid file");

        let content = fs::read_to_string(&path).expect("read pid file");
        assert_eq!(
            content,
            format!("{}\n", unistd::getpid().as_raw()),
            "decimal pid followed by newline"
        );
    }

    #[test]
    fn allocate_replaces_garbage_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("garbage.pid");
        fs::write(&path, "not a pid\n").expect("seed garbage");

        allocate(&path).expect("stale file should be replaced");

        let content = fs::read_to_string(&path).expect("read pid file");
        assert_eq!(content.trim(), unistd::getpid().as_raw().to_string());
    }

    #[test]
    fn signal_missing_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("absent.pid");
        let outcome = signal(&path, None).expect("probe");
        assert_eq!(outcome, SignalOutcome::NoPidFile);
    }

    #[test]
    fn signal_unlocked_file_reports_not_running() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("dead.pid");
        // a pid file nobody locks: the holder is gone
        fs::write(&path, "999999\n").expect("seed pid file");

        let outcome = signal(&path, None).expect("probe");
        assert_eq!(outcome, SignalOutcome::NotRunning);
    }

    #[test]
    fn scoped_pid_file_unlinks_on_drop() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("scoped.pid");

        {
            let scoped = ScopedPidFile::new(&path).expect("allocate");
            assert!(scoped.path().exists());
        }
        assert!(!path.exists(), "pid file removed on drop");
    }
}
