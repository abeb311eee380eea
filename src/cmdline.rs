//! Thin scaffold for one-shot command-line tools.
//!
//! Reuses the configuration and logging machinery of the service driver but
//! skips daemonization, pid files, signal handling and the control channel.

use std::path::PathBuf;

use tracing::error;

use crate::config::{Configurable, configure_program};
use crate::program::Program;

/// A one-shot tool: configuration plus a `run` body.
pub trait CmdlineHandler: Configurable {
    /// The tool body; the return value becomes the process exit code.
    fn run(&mut self) -> i32;
}

/// Entry point for command-line tools.
pub struct Cmdline {
    program: Program,
    default_config: Option<PathBuf>,
}

impl Cmdline {
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

    /// Runs the tool and exits the process with its code.
    pub fn main(self, handler: &mut dyn CmdlineHandler) -> ! {
        let code = self.run(handler);
        std::process::exit(code)
    }

    /// Runs the tool with the process command line.
    pub fn run(self, handler: &mut dyn CmdlineHandler) -> i32 {
        let argv: Vec<String> = std::env::args().collect();
        self.run_with_args(handler, argv)
    }

    /// Runs the tool with an explicit argument vector.
    pub fn run_with_args(mut self, handler: &mut dyn CmdlineHandler, argv: Vec<String>) -> i32 {
        let default_config = self.default_config.clone();
        if let Err(exit) = configure_program(
            &mut self.program,
            handler,
            argv,
            default_config.as_deref(),
            false,
            |_, _| Ok(()),
        ) {
            return exit.code;
        }

        let code = handler.run();
        if code != 0 {
            error!("Terminated with error {code}.");
        }
        code
    }
}
