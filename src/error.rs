use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Control-flow sentinel that unwinds configuration and startup helpers into
/// a clean process exit code.
#[derive(Debug, Clone, Copy, Error)]
#[error("exit with status {code}")]
pub struct ImmediateExit {
    /// The process exit code to report.
    pub code: i32,
}

impl ImmediateExit {
    pub fn new(code: i32) -> Self {
        Self { code }
    }
}

/// Returns an `Err(ImmediateExit)` for use with `?` in configure paths.
pub fn immediate_exit<T>(code: i32) -> Result<T, ImmediateExit> {
    Err(ImmediateExit::new(code))
}

/// Errors raised while building the service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Command line did not parse.
    #[error("{0}")]
    Parse(String),

    /// A config or response file could not be read.
    #[error("cannot read {path:?}: {source}")]
    FileRead {
        /// Path of the offending file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A config file line was not `key = value`.
    #[error("{path:?}:{line}: malformed config entry")]
    Malformed {
        /// Path of the offending file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
    },

    /// An option value failed validation.
    #[error("invalid value for {option}: {reason}")]
    BadValue {
        /// Dotted option name.
        option: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Errors raised by the PID file manager.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Another live process holds the pid file's write lock.
    #[error("already running with pid <{pid}>")]
    AlreadyRunning {
        /// Pid recorded in the locked file.
        pid: i32,
    },

    /// Pid file I/O failed.
    #[error("pid file {path:?}: {source}")]
    Io {
        /// Path of the pid file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Signal delivery to the recorded pid failed.
    #[error("cannot deliver signal to running instance: {0}")]
    Kill(#[source] io::Error),
}

impl PidFileError {
    pub(crate) fn io(path: &std::path::Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Errors raised while switching the process persona.
#[derive(Debug, Error)]
pub enum PersonaError {
    /// Requested user does not exist.
    #[error("there is no user <{0}> present on the system")]
    NoSuchUser(String),

    /// Requested group does not exist.
    #[error("there is no group <{0}> present on the system")]
    NoSuchGroup(String),

    /// A setuid/setgid family call failed.
    #[error("cannot {what}: {source}")]
    Switch {
        /// Which step failed (e.g. "switch to gid <...>").
        what: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// Errors raised by the control-channel server.
#[derive(Debug, Error)]
pub enum CtrlServerError {
    /// Binding the listening socket failed.
    #[error("cannot bind control socket {endpoint}: {source}")]
    Bind {
        /// Socket path or TCP address.
        endpoint: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Adjusting ownership or permissions of the socket path failed.
    #[error("cannot apply {what} to control socket {path:?}: {source}")]
    Ownership {
        /// "owner", "group" or "mode".
        what: &'static str,
        /// Socket path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// A remote control command was answered with an `error: ` line.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct CtrlCommandError {
    /// Text following the `error: ` prefix.
    pub reason: String,
}

/// Errors raised by the synchronous control client.
#[derive(Debug, Error)]
pub enum CtrlClientError {
    /// Could not reach the server.
    #[error("unable to connect to {endpoint}: {source}; is the server running?")]
    Connect {
        /// Socket path or TCP address.
        endpoint: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The server reported a command failure.
    #[error(transparent)]
    Command(#[from] CtrlCommandError),

    /// Connection I/O failed mid-command.
    #[error("control connection I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The server closed the connection before the response terminator.
    #[error("connection closed before response was complete")]
    UnexpectedEof,

    /// A `ctrl://` URI could not be parsed.
    #[error("invalid control URI {uri}: {reason}")]
    BadUri {
        /// The offending URI.
        uri: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// Errors raised by the packet pipe notifier.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// Payload exceeds the atomic pipe write limit.
    #[error("notification string too large ({size} > PIPE_BUF({max}))")]
    TooLarge {
        /// Rejected payload size.
        size: usize,
        /// PIPE_BUF on this platform.
        max: usize,
    },

    /// The owning runnable stopped while a transfer was being retried.
    #[error("interrupted while {0} notification pipe")]
    Interrupted(&'static str),

    /// Pipe I/O failed.
    #[error("notification pipe I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by user service hooks to the lifecycle driver.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Free-form startup failure.
    #[error("{0}")]
    Message(String),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Request to exit with a specific status without logging an error.
    #[error(transparent)]
    Exit(#[from] ImmediateExit),
}

impl ServiceError {
    /// Shorthand for a free-form message.
    pub fn msg(text: impl Into<String>) -> Self {
        Self::Message(text.into())
    }
}
