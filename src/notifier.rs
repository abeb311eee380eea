//! One-shot packet pipe between a parent and a forked child.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;

use crate::error::NotifierError;
use crate::runnable::Runnable;

/// Unidirectional packet pipe.
///
/// Opened with `O_DIRECT` so each write up to `PIPE_BUF` arrives as one
/// packet. `slave` writes in one process, `master` reads in the other; both
/// honour the supplied [`Runnable`] while retrying `EINTR`.
pub struct PipeNotifier {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
}

impl PipeNotifier {
    pub fn new() -> Result<Self, NotifierError> {
        let (read_fd, write_fd) = unistd::pipe2(OFlag::O_DIRECT)
            .map_err(|e| NotifierError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(Self { read_fd, write_fd })
    }

    /// Reads one packet. Must run in a different process than [`slave`].
    ///
    /// [`slave`]: PipeNotifier::slave
    pub fn master(&self, running: &mut dyn Runnable) -> Result<Vec<u8>, NotifierError> {
        let mut buffer = vec![0u8; libc::PIPE_BUF];
        loop {
            match unistd::read(self.read_fd.as_raw_fd(), &mut buffer) {
                Ok(count) => {
                    buffer.truncate(count);
                    return Ok(buffer);
                }
                Err(Errno::EINTR) => {
                    if !running.is_running() {
                        return Err(NotifierError::Interrupted("reading from"));
                    }
                }
                Err(e) => {
                    return Err(NotifierError::Io(std::io::Error::from_raw_os_error(
                        e as i32,
                    )));
                }
            }
        }
    }

    /// Writes one packet. Must run in a different process than [`master`].
    ///
    /// Rejects payloads larger than `PIPE_BUF`: those would no longer be
    /// written atomically.
    ///
    /// [`master`]: PipeNotifier::master
    pub fn slave(&self, data: &[u8], running: &mut dyn Runnable) -> Result<(), NotifierError> {
        if data.len() > libc::PIPE_BUF {
            return Err(NotifierError::TooLarge {
                size: data.len(),
                max: libc::PIPE_BUF,
            });
        }

        loop {
            match unistd::write(&self.write_fd, data) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => {
                    if !running.is_running() {
                        return Err(NotifierError::Interrupted("writing to"));
                    }
                }
                Err(e) => {
                    return Err(NotifierError::Io(std::io::Error::from_raw_os_error(
                        e as i32,
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always;

    impl Runnable for Always {
        fn is_running(&mut self) -> bool {
            true
        }
        fn stop(&mut self) {}
    }

    #[test]
    fn round_trips_one_packet() {
        let notifier = PipeNotifier::new().expect("create pipe");
        notifier
            .slave(b"ready 1234", &mut Always)
            .expect("write packet");
        let packet = notifier.master(&mut Always).expect("read packet");
        assert_eq!(packet, b"ready 1234");
    }

    #[test]
    fn rejects_oversized_payload() {
        let notifier = PipeNotifier::new().expect("create pipe");
        let payload = vec![b'x'; libc::PIPE_BUF + 1];
        match notifier.slave(&payload, &mut Always) {
            Err(NotifierError::TooLarge { size, max }) => {
                assert_eq!(size, libc::PIPE_BUF + 1);
                assert_eq!(max, libc::PIPE_BUF);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }
}
