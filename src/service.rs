//! Lifecycle driver: turns a [`ServiceHandler`] into a well-behaved UNIX
//! daemon.
//!
//! Startup order: configure → management-signal path / duplicate-instance
//! probe → optional double-fork daemonization → pid file → event core →
//! persona switch → user `start()` → run loop. Every exit path logs the
//! final status.

use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::unistd::{self, ForkResult};
use tracing::{debug, error, info, warn};

use crate::config::{
    ConfigContext, Configurable, DaemonizeConfig, GenericConfig, SigDef, SignalVerb,
    configure_program,
};
use crate::ctrl::{CtrlCommand, CtrlEndpoint};
use crate::error::{ImmediateExit, ServiceError};
use crate::persona::{self, Persona, PersonaSwitchMode};
use crate::pidfile::{self, SignalOutcome};
use crate::program::Program;
use crate::reactor::EventLoop;

/// Teardown token returned by [`ServiceHandler::start`]; its drop is the
/// teardown action, run when the service goes down.
pub struct Cleanup(Option<Box<dyn FnOnce()>>);

impl Cleanup {
    pub fn new(teardown: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(teardown)))
    }

    /// Nothing to tear down.
    pub fn none() -> Self {
        Self(None)
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if let Some(teardown) = self.0.take() {
            teardown();
        }
    }
}

/// The capability set a user service presents to the scaffold.
///
/// Everything except `configure`, `start` and `run` has a sensible default.
pub trait ServiceHandler: Configurable {
    /// Called before (possible) daemonization.
    fn pre_daemonize(&mut self, daemonize: bool) {
        let _ = daemonize;
    }

    /// Runs under the original persona; picks the setuid/setgid variant.
    fn pre_persona_switch(&mut self) -> PersonaSwitchMode {
        PersonaSwitchMode::SetRealId
    }

    /// Runs under the new persona after the switch.
    fn post_persona_switch(&mut self, persona: &Persona) {
        let _ = persona;
    }

    /// Brings the service up. The returned [`Cleanup`] is dropped when the
    /// service goes down.
    fn start(&mut self, events: &mut EventLoop) -> Result<Cleanup, ServiceError>;

    /// The service main loop; must call `events.is_running(self)` often
    /// enough to observe termination and event requests. The return value
    /// becomes the process exit code.
    fn run(&mut self, events: &mut EventLoop) -> i32;

    /// Renders service statistics (the `stat` control verb and SIGUSR1).
    fn stat(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "Service provides no statistics.")
    }

    /// Appends to the `monitor` control verb output.
    fn monitor(&self, out: &mut dyn Write) -> io::Result<()> {
        let _ = out;
        Ok(())
    }

    /// Handles a non-built-in control command; false means "not
    /// implemented". Also invoked for `help` to append user help text.
    fn ctrl(&mut self, cmd: &CtrlCommand, out: &mut dyn Write) -> io::Result<bool> {
        let _ = (cmd, out);
        Ok(false)
    }

    /// Called after the log file has been rotated.
    fn log_rotated(&mut self, log_file: &Path) {
        let _ = log_file;
    }

    /// Called when a user-registered signal occurs.
    fn signal(&mut self, signo: i32) {
        warn!(
            "You've registered custom handling for signal <{signo}> but forgot \
             to implement the signal hook."
        );
    }
}

static DAEMONIZE_NOCLOSE: AtomicBool = AtomicBool::new(false);
static DAEMONIZE_FINISH_RUN: AtomicBool = AtomicBool::new(false);
static NOTIFIER_FD: AtomicI32 = AtomicI32::new(-1);
static FINISH_SINK: OnceLock<Arc<crate::program::LogSink>> = OnceLock::new();

/// Completes daemonization: stdin to /dev/null, stdout/stderr tied to the
/// log, console logging off, starter processes released.
fn daemonize_finish(sink: &Arc<crate::program::LogSink>) {
    if DAEMONIZE_FINISH_RUN.swap(true, Ordering::SeqCst) {
        return;
    }

    if !DAEMONIZE_NOCLOSE.load(Ordering::SeqCst) {
        match fs::File::options().read(true).write(true).open("/dev/null") {
            Ok(null) => {
                let null_fd = null.as_raw_fd();
                let log_fd = sink.raw_fd().unwrap_or(null_fd);
                unsafe {
                    libc::dup2(null_fd, libc::STDIN_FILENO);
                    libc::dup2(log_fd, libc::STDOUT_FILENO);
                    libc::dup2(log_fd, libc::STDERR_FILENO);
                }
            }
            Err(e) => error!("Cannot open /dev/null: {e}"),
        }
    }

    sink.set_console(false);

    // releases the starter parents waiting on the notifier pipe
    let fd = NOTIFIER_FD.swap(-1, Ordering::SeqCst);
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

extern "C" fn daemonize_atfork_child() {
    // a worker fork finishes daemonization for the whole tree
    if !DAEMONIZE_FINISH_RUN.load(Ordering::SeqCst)
        && let Some(sink) = FINISH_SINK.get()
    {
        debug!("Finishing daemonization in forked worker.");
        daemonize_finish(sink);
    }
}

fn wait_for_child_initialization(fd: RawFd) -> bool {
    let mut buffer = [0u8; 1024];
    loop {
        match unistd::read(fd, &mut buffer) {
            // silent close: the descendant generation is up
            Ok(0) => return true,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                error!("Failed to read from notifier pipe: {e}");
                return false;
            }
        }
    }
}

fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    unistd::pipe().map_err(|e| io::Error::from_raw_os_error(e as i32))
}

/// Double-forks into the background.
///
/// Returns only in the final grandchild; the starter and intermediate
/// processes wait on their descendant's notifier pipe and leave with
/// `_exit` (no destructors run on those paths).
fn daemonize(identity: &str, config: &DaemonizeConfig) -> io::Result<()> {
    if !config.nochdir
        && let Err(e) = unistd::chdir("/")
    {
        warn!("Cannot cd to /: {e}.");
    }

    let (r1, w1) = make_pipe()?;
    let (r2, w2) = make_pipe()?;

    match unsafe { unistd::fork() }.map_err(|e| io::Error::from_raw_os_error(e as i32))? {
        ForkResult::Parent { .. } => {
            // starter process
            drop(w1);
            drop(r2);
            drop(w2);

            if !wait_for_child_initialization(r1.as_raw_fd()) {
                error!("Child process failed.");
                unsafe { libc::_exit(libc::EXIT_FAILURE) }
            }
            info!("Service {identity} running at background.");
            unsafe { libc::_exit(libc::EXIT_SUCCESS) }
        }
        ForkResult::Child => {
            if unistd::setsid().is_err() {
                error!("Unable to become a session leader: {}", io::Error::last_os_error());
                unsafe { libc::_exit(libc::EXIT_FAILURE) }
            }

            match unsafe { unistd::fork() } {
                Err(e) => {
                    error!("Failed secondary fork: {e}");
                    unsafe { libc::_exit(libc::EXIT_FAILURE) }
                }
                Ok(ForkResult::Parent { .. }) => {
                    // intermediate process; its exit closes the starter's pipe
                    drop(w2);
                    if !wait_for_child_initialization(r2.as_raw_fd()) {
                        error!("Child process failed.");
                        unsafe { libc::_exit(libc::EXIT_FAILURE) }
                    }
                    unsafe { libc::_exit(libc::EXIT_SUCCESS) }
                }
                Ok(ForkResult::Child) => {
                    // the daemonized process
                    drop(r1);
                    drop(w1);
                    drop(r2);
                    NOTIFIER_FD.store(w2.into_raw_fd(), Ordering::SeqCst);

                    if unsafe { libc::pthread_atfork(None, None, Some(daemonize_atfork_child)) }
                        != 0
                    {
                        error!("Atfork registration failed: {}", io::Error::last_os_error());
                        unsafe { libc::_exit(libc::EXIT_FAILURE) }
                    }
                    Ok(())
                }
            }
        }
    }
}

/// Exit code of the management-signal path.
fn send_signal(pidfile: &Path, def: SigDef) -> i32 {
    debug!("About to send signal <{:?}> to running process.", def.verb);

    match def.verb {
        SignalVerb::Stop if def.timeout.is_some_and(|t| t > 0) => {
            wait_for_stop(pidfile, def.timeout.unwrap_or(0))
        }
        SignalVerb::Status => process_status(pidfile),
        verb => match pidfile::signal(pidfile, verb.signal()) {
            Ok(SignalOutcome::Delivered(_)) => libc::EXIT_SUCCESS,
            Ok(_) => 1,
            Err(e) => {
                error!("Cannot signal running instance: <{e}>.");
                3
            }
        },
    }
}

/// Repeats SIGTERM every 100 ms until the instance is gone or the deadline
/// passes. 0 stopped, 1 was not running, 2 timeout, 3 I/O error.
fn wait_for_stop(pidfile: &Path, seconds: u64) -> i32 {
    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut first = true;
    loop {
        match pidfile::signal(pidfile, SignalVerb::Stop.signal()) {
            Ok(SignalOutcome::Delivered(_)) => {}
            // fail if the process is not running during the first test;
            // OK if it was running but finished now
            Ok(_) => return if first { 1 } else { 0 },
            Err(e) => {
                error!("Cannot signal running instance: <{e}>.");
                return 3;
            }
        }

        if Instant::now() >= deadline {
            // was running but cannot stop in the given time
            return 2;
        }
        std::thread::sleep(Duration::from_millis(100));
        first = false;
    }
}

/// 0 running, 1 pid file present but not running, 3 not running, 4
/// indeterminate.
fn process_status(pidfile: &Path) -> i32 {
    match pidfile::signal(pidfile, None) {
        Ok(SignalOutcome::Delivered(_)) => 0,
        Ok(SignalOutcome::NotRunning) => 1,
        Ok(SignalOutcome::NoPidFile) => 3,
        Err(e) => {
            error!("Cannot signal running instance: <{e}>.");
            4
        }
    }
}

fn pre_config_hook(
    identity: &str,
    generic: &GenericConfig,
    _ctx: &ConfigContext,
) -> Result<(), ImmediateExit> {
    if let Some(def) = generic.signal {
        // just send a signal to the running instance and leave
        let Some(pidfile) = &generic.pidfile else {
            error!("Pid file must be specified to send signal.");
            return Err(ImmediateExit::new(libc::EXIT_FAILURE));
        };
        return Err(ImmediateExit::new(send_signal(pidfile, def)));
    }

    // normal startup sanity check
    if let Some(pidfile) = &generic.pidfile {
        match pidfile::signal(pidfile, None) {
            Ok(SignalOutcome::Delivered(pid)) => {
                error!("Service {identity} is already running with pid <{pid}>.");
                return Err(ImmediateExit::new(libc::EXIT_FAILURE));
            }
            Ok(_) => {}
            Err(e) => {
                error!("Cannot check pid file: {e}");
                return Err(ImmediateExit::new(libc::EXIT_FAILURE));
            }
        }
    }
    Ok(())
}

/// The service entry point.
///
/// ```no_run
/// use svckit::program::Program;
/// use svckit::service::Service;
/// # use svckit::service::{Cleanup, ServiceHandler};
/// # use svckit::config::{ConfigContext, Configurable};
/// # use svckit::reactor::EventLoop;
/// # use svckit::error::ServiceError;
/// # struct Echo;
/// # impl Configurable for Echo {
/// #     fn configure(&mut self, _: &ConfigContext) -> Result<(), ServiceError> { Ok(()) }
/// # }
/// # impl ServiceHandler for Echo {
/// #     fn start(&mut self, _: &mut EventLoop) -> Result<Cleanup, ServiceError> {
/// #         Ok(Cleanup::none())
/// #     }
/// #     fn run(&mut self, events: &mut EventLoop) -> i32 {
/// #         while events.is_running(self) {
/// #             std::thread::sleep(std::time::Duration::from_millis(100));
/// #         }
/// #         0
/// #     }
/// # }
/// let mut handler = Echo;
/// Service::new(Program::new("echod", "1.0")).main(&mut handler);
/// ```
pub struct Service {
    program: Program,
    default_config: Option<PathBuf>,
}

impl Service {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            default_config: None,
        }
    }

    /// Config file used when none is given on the command line.
    pub fn with_default_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_config = Some(path.into());
        self
    }

    /// Runs the service and exits the process with its code.
    pub fn main(self, handler: &mut dyn ServiceHandler) -> ! {
        let code = self.run(handler);
        std::process::exit(code)
    }

    /// Runs the service with the process command line.
    pub fn run(self, handler: &mut dyn ServiceHandler) -> i32 {
        let argv: Vec<String> = std::env::args().collect();
        self.run_with_args(handler, argv)
    }

    /// Runs the service with an explicit argument vector.
    pub fn run_with_args(mut self, handler: &mut dyn ServiceHandler, argv: Vec<String>) -> i32 {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::prctl(libc::PR_SET_NAME, c"main".as_ptr());
        }

        let identity = self.program.identity();
        let default_config = self.default_config.clone();

        let configured = match configure_program(
            &mut self.program,
            handler,
            argv,
            default_config.as_deref(),
            true,
            |generic, ctx| pre_config_hook(&identity, generic, ctx),
        ) {
            Ok(configured) => configured,
            Err(exit) => return exit.code,
        };
        let generic = configured.generic;

        info!("Service {identity} starting.");

        // notify that we are (possibly) about to daemonize
        handler.pre_daemonize(generic.daemonize.enabled);

        if generic.daemonize.enabled {
            info!("Forking to background.");
            DAEMONIZE_NOCLOSE.store(generic.daemonize.noclose, Ordering::SeqCst);
            let _ = FINISH_SINK.set(self.program.sink());

            if let Err(e) = daemonize(&identity, &generic.daemonize) {
                error!("Failed to fork: {e}");
                return libc::EXIT_FAILURE;
            }
            info!("Running in background.");
        }

        if let Some(path) = &generic.pidfile {
            if let Err(e) = pidfile::allocate(path) {
                error!("Cannot allocate pid file: {e}");
                return libc::EXIT_FAILURE;
            }
            // stale socket from a previous life
            if let Some(ctrl) = &generic.ctrl {
                let _ = fs::remove_file(&ctrl.path);
            }
        }

        // the event core binds the control socket before the persona switch
        let mut events = match EventLoop::new(self.program.info(), self.program.sink()) {
            Ok(events) => events,
            Err(e) => {
                error!("Cannot start signal handling: {e}");
                return libc::EXIT_FAILURE;
            }
        };
        if let Some(ctrl) = generic.ctrl.clone()
            && let Err(e) = events.attach_ctrl(CtrlEndpoint::Unix(ctrl))
        {
            error!("{e}");
            return libc::EXIT_FAILURE;
        }

        {
            let mode = handler.pre_persona_switch();
            let sink = self.program.sink();
            let persona = match persona::switch_persona(&generic.persona, mode, |uid, gid| {
                if let Err(e) = sink.chown(uid, gid) {
                    warn!("Cannot change log file owner: {e}");
                }
            }) {
                Ok(persona) => persona,
                Err(e) => {
                    error!("{e}");
                    return libc::EXIT_FAILURE;
                }
            };

            if generic.persona.login_env
                && let Err(e) = persona::apply_login_env(&persona)
            {
                error!("{e}");
                return libc::EXIT_FAILURE;
            }
            handler.post_persona_switch(&persona);
        }

        // we are the one that terminates the whole daemon
        events.global_terminate(true, None);

        let cleanup = match handler.start(&mut events) {
            Ok(cleanup) => cleanup,
            Err(ServiceError::Exit(exit)) => {
                if generic.daemonize.enabled {
                    error!("Startup exits with exit status: {}.", exit.code);
                }
                return exit.code;
            }
            Err(e) => {
                error!("Service startup failed: {e}");
                return libc::EXIT_FAILURE;
            }
        };

        if !events.is_running(handler) {
            info!("Terminated during startup.");
            return libc::EXIT_FAILURE;
        }

        if generic.daemonize.enabled {
            daemonize_finish(&self.program.sink());
        }

        let code = handler.run(&mut events);

        drop(cleanup);
        drop(events);

        if code != 0 {
            error!("Terminated with error {code}.");
        } else {
            info!("Normal shutdown.");
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn status_without_pid_file() {
        let temp = tempdir().expect("tempdir");
        let pidfile = temp.path().join("absent.pid");
        assert_eq!(process_status(&pidfile), 3);
    }

    #[test]
    fn status_with_dead_pid_file() {
        let temp = tempdir().expect("tempdir");
        let pidfile = temp.path().join("dead.pid");
        fs::write(&pidfile, "999999\n").expect("seed pid file");
        assert_eq!(process_status(&pidfile), 1);
    }

    #[test]
    fn stop_not_running_returns_one() {
        let temp = tempdir().expect("tempdir");
        let pidfile = temp.path().join("absent.pid");

        let plain = send_signal(
            &pidfile,
            SigDef {
                verb: SignalVerb::Stop,
                timeout: None,
            },
        );
        assert_eq!(plain, 1);

        // stop/0 behaves identically to plain stop
        let zero_wait = send_signal(
            &pidfile,
            SigDef {
                verb: SignalVerb::Stop,
                timeout: Some(0),
            },
        );
        assert_eq!(zero_wait, plain);
    }

    #[test]
    fn waiting_stop_on_missing_instance_fails_first_test() {
        let temp = tempdir().expect("tempdir");
        let pidfile = temp.path().join("absent.pid");
        assert_eq!(wait_for_stop(&pidfile, 1), 1);
    }

    #[test]
    fn cleanup_runs_teardown_once() {
        use std::sync::atomic::AtomicUsize;
        static RUNS: AtomicUsize = AtomicUsize::new(0);

        {
            let _cleanup = Cleanup::new(|| {
                RUNS.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);

        drop(Cleanup::none());
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }
}
