//! Single-threaded polled signal/event core.
//!
//! One [`EventLoop`] per process, owned by the main thread. `process()`
//! drains pending signals and control-socket work without blocking and
//! reports whether the caller should terminate. The user's `run()` is
//! expected to call [`EventLoop::is_running`] once per loop iteration.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use nix::unistd::{self, Pid};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use tracing::{debug, error, info};

use crate::ctrl::{CtrlEndpoint, CtrlServer};
use crate::error::CtrlServerError;
use crate::program::{LogSink, ProgramInfo};
use crate::service::ServiceHandler;
use crate::shmem::{SharedFlags, SharedMemory, Terminator};

/// Slots in the terminator set; cooperating descendants beyond this are not
/// expected.
const TERMINATOR_SLOTS: usize = 32;

static ATFORK: Once = Once::new();
static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);
static CTRL_ACCEPTOR_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn atfork_child() {
    // only the main process serves the control channel
    FORK_GENERATION.fetch_add(1, Ordering::SeqCst);
    let fd = CTRL_ACCEPTOR_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

fn register_atfork() {
    ATFORK.call_once(|| unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child));
    });
}

/// The signal/control event loop plus the shared termination region.
pub struct EventLoop {
    signals: Signals,
    // keeps the anonymous shared mapping alive; flags and terminator point
    // into it
    _mem: SharedMemory,
    shared: SharedFlags,
    terminator: Terminator,
    this_terminated: bool,
    last_log_rotate: u64,
    last_stat: u64,
    main_pid: Pid,
    ctrl: Option<CtrlServer>,
    fork_generation: u64,
    info: ProgramInfo,
    sink: Arc<LogSink>,
}

impl EventLoop {
    /// Creates the shared region and registers the core signal set
    /// (SIGTERM, SIGINT, SIGHUP, SIGUSR1).
    ///
    /// Must run in the main process before any fork of processes that
    /// should observe the shared flags.
    pub fn new(info: ProgramInfo, sink: Arc<LogSink>) -> io::Result<Self> {
        let mut mem = SharedMemory::new(4096)?;
        let shared = SharedFlags::create(&mut mem);
        let terminator = Terminator::create(&mut mem, TERMINATOR_SLOTS)?;
        let signals = Signals::new([SIGTERM, SIGINT, SIGHUP, SIGUSR1])?;

        Ok(Self {
            signals,
            _mem: mem,
            shared,
            terminator,
            this_terminated: false,
            last_log_rotate: 0,
            last_stat: 0,
            main_pid: unistd::getpid(),
            ctrl: None,
            fork_generation: FORK_GENERATION.load(Ordering::SeqCst),
            info,
            sink,
        })
    }

    /// Binds the control endpoint and arranges for forked children to drop
    /// the acceptor.
    pub fn attach_ctrl(&mut self, endpoint: CtrlEndpoint) -> Result<(), CtrlServerError> {
        let server = CtrlServer::bind(endpoint, self.main_pid)?;
        if let Some(fd) = server.acceptor_fd() {
            CTRL_ACCEPTOR_FD.store(fd, Ordering::SeqCst);
        }
        register_atfork();
        self.ctrl = Some(server);
        Ok(())
    }

    /// Listening address of a TCP control endpoint (after binding port 0).
    pub fn ctrl_local_addr(&self) -> Option<SocketAddr> {
        self.ctrl.as_ref().and_then(|c| c.local_addr())
    }

    /// Registers an additional signal; occurrences are forwarded to the
    /// handler's `signal` hook.
    pub fn register_signal(&mut self, signo: i32) -> io::Result<()> {
        self.signals.add_signal(signo)
    }

    /// Adds (or removes) `pid` — self when `None` — to the set of processes
    /// whose termination signal terminates the whole daemon.
    pub fn global_terminate(&self, value: bool, pid: Option<Pid>) {
        if value {
            self.terminator.add(pid);
        } else {
            self.terminator.remove(pid);
        }
    }

    /// True when the current process is in the terminator set.
    pub fn is_global_terminator(&self) -> bool {
        self.terminator.find_self()
    }

    /// Requests global termination, observable by every participant at its
    /// next `process()` tick.
    pub fn terminate(&self) {
        self.shared.set_terminated();
    }

    /// The shared event cells.
    pub fn flags(&self) -> &SharedFlags {
        &self.shared
    }

    /// Drains pending events and reports whether the caller should keep
    /// running. Convenience inverse of [`EventLoop::process`].
    pub fn is_running(&mut self, handler: &mut dyn ServiceHandler) -> bool {
        !self.process(handler)
    }

    /// Polls pending signals and control-connection work, reacts to event
    /// counters, and returns true when this process should terminate.
    /// Never blocks.
    pub fn process(&mut self, handler: &mut dyn ServiceHandler) -> bool {
        self.drain_signals(handler);
        self.check_fork();

        if let Some(ctrl) = &mut self.ctrl {
            ctrl.poll(handler, &self.shared, &self.info);
        }

        // log-rotate request
        let value = self.shared.log_rotate_event();
        if value != self.last_log_rotate {
            if let Some(log_file) = self.sink.path() {
                info!("Logrotate: <{}>.", log_file.display());
                if let Err(e) = self.sink.reopen() {
                    error!("Cannot reopen log file: {e}");
                }
                info!(
                    "Service {}-{}: log rotated.",
                    self.info.name, self.info.version
                );
                handler.log_rotated(&log_file);
            }
            self.last_log_rotate = value;
        }

        // statistics request; processed only in the main process
        let value = self.shared.stat_event();
        if value != self.last_stat && unistd::getpid() == self.main_pid {
            let mut out = Vec::new();
            match handler.stat(&mut out) {
                Ok(()) => info!(
                    "{} statistics:\n{}",
                    self.info.identity,
                    String::from_utf8_lossy(&out)
                ),
                Err(e) => error!("Statistics hook failed: {e}"),
            }
            self.last_stat = value;
        }

        self.shared.terminated() || self.this_terminated
    }

    fn drain_signals(&mut self, handler: &mut dyn ServiceHandler) {
        let pending: Vec<i32> = self.signals.pending().collect();
        for signo in pending {
            debug!("Received signal: <{signo}>.");
            match signo {
                SIGTERM | SIGINT => {
                    info!("Terminate signal: <{signo}>.");
                    self.mark_terminated();
                }
                SIGHUP => self.shared.bump_log_rotate(),
                SIGUSR1 => self.shared.bump_stat(),
                other => handler.signal(other),
            }
        }
    }

    fn mark_terminated(&mut self) {
        self.this_terminated = true;

        if self.terminator.find_self() {
            info!("Global terminate.");
            self.shared.set_terminated();
        } else {
            info!("Local terminate.");
        }
    }

    /// After a fork the child must not serve the control channel; the
    /// acceptor descriptor was closed by the atfork handler, here the child
    /// sheds the server state on its first tick.
    fn check_fork(&mut self) {
        let generation = FORK_GENERATION.load(Ordering::SeqCst);
        if generation != self.fork_generation {
            self.fork_generation = generation;
            if let Some(ctrl) = self.ctrl.take() {
                debug!("Dropping control server in forked child.");
                ctrl.dismantle_after_fork();
            }
        }
    }
}
