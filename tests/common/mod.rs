#![allow(dead_code)]

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use svckit::config::{ConfigContext, Configurable};
use svckit::ctrl::CtrlCommand;
use svckit::error::ServiceError;
use svckit::reactor::EventLoop;
use svckit::service::{Cleanup, ServiceHandler};

/// Signals are process-wide; tests that raise them must not overlap.
pub fn signal_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Recording service implementation used to observe scaffold callbacks.
#[derive(Default)]
pub struct TestHandler {
    pub rotated: Vec<PathBuf>,
    pub signals: Vec<i32>,
}

impl TestHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Configurable for TestHandler {
    fn configure(&mut self, _ctx: &ConfigContext) -> Result<(), ServiceError> {
        Ok(())
    }
}

impl ServiceHandler for TestHandler {
    fn start(&mut self, _events: &mut EventLoop) -> Result<Cleanup, ServiceError> {
        Ok(Cleanup::none())
    }

    fn run(&mut self, _events: &mut EventLoop) -> i32 {
        0
    }

    fn stat(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "connections: 0")
    }

    fn monitor(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Status: idle")
    }

    fn ctrl(&mut self, cmd: &CtrlCommand, out: &mut dyn Write) -> io::Result<bool> {
        match cmd.verb.as_str() {
            "ping" => {
                writeln!(out, "pong {}", cmd.args.join(" "))?;
                Ok(true)
            }
            "boom" => Err(io::Error::other("deliberate failure")),
            "help" => {
                writeln!(out, "ping           replies with pong")?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn log_rotated(&mut self, log_file: &Path) {
        self.rotated.push(log_file.to_path_buf());
    }

    fn signal(&mut self, signo: i32) {
        self.signals.push(signo);
    }
}

/// Polls the event loop until `cond` holds or five seconds pass. Returns
/// whether the condition was observed.
pub fn drive_until(
    events: &mut EventLoop,
    handler: &mut TestHandler,
    mut cond: impl FnMut(&TestHandler) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        events.process(handler);
        if cond(handler) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Polls the event loop until `process()` reports termination.
pub fn drive_until_terminated(events: &mut EventLoop, handler: &mut TestHandler) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if events.process(handler) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
