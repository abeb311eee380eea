//! Runtime scaffold for long-running UNIX services and companion
//! command-line tools.
//!
//! A user-supplied service implementation (start / run / stop hooks)
//! becomes a well-behaved daemon with a uniform operational surface:
//! configuration from command line and files, double-fork daemonization,
//! PID-file single instancing, persona switching, POSIX signal handling,
//! log rotation and an authenticated control channel.

#![warn(unused_crate_dependencies)]

/// Synchronous control-channel client.
pub mod client;

/// Scaffold for one-shot command-line tools.
pub mod cmdline;

/// Command-line and config-file option surface.
pub mod config;

/// Control-channel server engine and handshake.
pub mod ctrl;

/// Errors.
pub mod error;

/// Packet pipe notifier for fork handshakes.
pub mod notifier;

/// Persona capture and switching.
pub mod persona;

/// PID-file single instancing.
pub mod pidfile;

/// Program identity, uptime and logging.
pub mod program;

/// Polled signal/control event core.
pub mod reactor;

/// Run-state probing.
pub mod runnable;

/// Service lifecycle driver.
pub mod service;

/// Shared termination region.
pub mod shmem;
