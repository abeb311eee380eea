//! Configuration surface shared by services and command-line tools.
//!
//! The command line and any number of `key = value` config files are merged
//! into one option namespace: command line wins, then the first occurrence
//! across config files. Generic options (logging, daemonizing, pid file,
//! control socket, persona, management signals) are validated here into a
//! [`GenericConfig`] record; everything else stays accessible to the user
//! service through the [`ConfigContext`].

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, ArgMatches, Command};
use nix::sys::signal::Signal;
use tracing::warn;

use crate::error::{ConfigError, ImmediateExit, ServiceError, immediate_exit};
use crate::persona::PersonaConfig;
use crate::program::{HelpPrinter, LogConfig, LogMaskArg, Program, SHOW_LICENCE_INFO};

/// Capability set every scaffolded program exposes to the configurator.
pub trait Configurable {
    /// Adds program-specific options to the command definition.
    fn configuration(&self, cmd: Command) -> Command {
        cmd
    }

    /// Receives the merged configuration. Called once, after logging is up.
    fn configure(&mut self, ctx: &ConfigContext) -> Result<(), ServiceError>;

    /// Prints help for `what`; empty `what` asks for the program
    /// description. False when `what` is not supported.
    fn help(&self, out: &mut dyn Write, what: &str) -> io::Result<bool> {
        let _ = (out, what);
        Ok(false)
    }

    /// Topics for `--help-<topic>` and `--help-all`.
    fn list_helps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Custom help printer; `None` falls back to [`Configurable::help`] and
    /// [`Configurable::list_helps`].
    fn help_printer(&self) -> Option<Box<dyn HelpPrinter>> {
        None
    }
}

/// Ordered `key = value` pairs collected from config files.
///
/// Lookup returns the first occurrence, matching the "first config file
/// wins" contract.
#[derive(Debug, Default, Clone)]
pub struct ConfigFileValues {
    entries: Vec<(String, String)>,
}

impl ConfigFileValues {
    pub fn push(&mut self, key: String, value: String) {
        self.entries.push((key, value));
    }

    /// First value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded for `key`, in order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The merged option namespace handed to user `configure` hooks.
pub struct ConfigContext {
    matches: ArgMatches,
    files: ConfigFileValues,
}

impl ConfigContext {
    pub fn matches(&self) -> &ArgMatches {
        &self.matches
    }

    pub fn files(&self) -> &ConfigFileValues {
        &self.files
    }

    /// Looks `key` up on the command line first, then in config files.
    pub fn value(&self, key: &str) -> Option<String> {
        if let Ok(Some(value)) = self.matches.try_get_one::<String>(key) {
            return Some(value.clone());
        }
        self.files.get(key).map(str::to_string)
    }

    /// All values for a repeatable option, command line first.
    pub fn values(&self, key: &str) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(Some(values)) = self.matches.try_get_many::<String>(key) {
            out.extend(values.cloned());
        }
        out.extend(self.files.get_all(key).into_iter().map(str::to_string));
        out
    }

    /// Presence flag; only meaningful for command-line switches.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.matches.try_get_one::<bool>(key), Ok(Some(true)))
    }

    pub fn has(&self, key: &str) -> bool {
        self.value(key).is_some() || self.flag(key)
    }
}

/// Daemonization request.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonizeConfig {
    pub enabled: bool,
    pub nochdir: bool,
    pub noclose: bool,
}

/// UNIX control socket placement and ownership.
#[derive(Debug, Clone)]
pub struct CtrlSocketConfig {
    pub path: PathBuf,
    pub user: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

/// Management action requested with `--signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalVerb {
    Stop,
    Logrotate,
    Stat,
    Status,
}

impl SignalVerb {
    /// Signal delivered for the verb; `None` is the liveness probe.
    pub fn signal(self) -> Option<Signal> {
        match self {
            SignalVerb::Stop => Some(Signal::SIGTERM),
            SignalVerb::Logrotate => Some(Signal::SIGHUP),
            SignalVerb::Stat => Some(Signal::SIGUSR1),
            SignalVerb::Status => None,
        }
    }
}

/// Parsed `--signal verb[/seconds]`.
#[derive(Debug, Clone, Copy)]
pub struct SigDef {
    pub verb: SignalVerb,
    /// Seconds to wait for termination; only valid for `stop`.
    pub timeout: Option<u64>,
}

pub(crate) fn parse_sigdef(name: &str, spec: &str) -> Result<SigDef, ImmediateExit> {
    let (verb, timeout) = match spec.split_once('/') {
        Some((verb, timeout)) => (verb, Some(timeout)),
        None => (spec, None),
    };

    let verb = match verb {
        "stop" => SignalVerb::Stop,
        "logrotate" => SignalVerb::Logrotate,
        "stat" => SignalVerb::Stat,
        "status" => SignalVerb::Status,
        other => {
            eprintln!("{name}: unrecognized signal: <{other}>");
            return immediate_exit(3);
        }
    };

    let timeout = match timeout {
        None => None,
        Some(raw) => {
            if verb != SignalVerb::Stop {
                eprintln!("{name}: ignoring timeout specification for signal <{raw}>");
                None
            } else {
                match raw.parse::<u64>() {
                    Ok(seconds) => Some(seconds),
                    Err(_) => {
                        eprintln!("{name}: invalid timeout specification ({raw})");
                        return immediate_exit(3);
                    }
                }
            }
        }
    };

    Ok(SigDef { verb, timeout })
}

/// The validated record the lifecycle engine consumes.
#[derive(Debug, Clone, Default)]
pub struct GenericConfig {
    pub daemonize: DaemonizeConfig,
    pub pidfile: Option<PathBuf>,
    pub ctrl: Option<CtrlSocketConfig>,
    pub persona: PersonaConfig,
    pub signal: Option<SigDef>,
    pub log: LogConfig,
}

/// Splices `@file` references into the argument list.
///
/// Tokens are whitespace-separated; expansion is a single level.
pub(crate) fn expand_response_files(args: Vec<String>) -> Result<Vec<String>, ConfigError> {
    let mut out = Vec::with_capacity(args.len());
    for (index, arg) in args.into_iter().enumerate() {
        match arg.strip_prefix('@') {
            Some(path) if index > 0 => {
                let content =
                    fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
                        path: PathBuf::from(path),
                        source,
                    })?;
                out.extend(content.split_whitespace().map(str::to_string));
            }
            _ => out.push(arg),
        }
    }
    Ok(out)
}

/// Parses one `key = value` config file. `#` starts a comment, `[section]`
/// headers prefix subsequent keys with `section.`.
pub(crate) fn parse_config_file(path: &Path) -> Result<Vec<(String, String)>, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    let mut section = String::new();
    for (number, raw) in content.lines().enumerate() {
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = header.trim().to_string();
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(ConfigError::Malformed {
                path: path.to_path_buf(),
                line: number + 1,
            });
        };

        let key = if section.is_empty() {
            key.trim().to_string()
        } else {
            format!("{section}.{}", key.trim())
        };
        entries.push((key, value.trim().to_string()));
    }
    Ok(entries)
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Command definition holding the generic options every scaffolded program
/// understands.
pub(crate) fn generic_command(name: &str, service: bool) -> Command {
    let mut cmd = Command::new(name.to_owned())
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('f')
                .value_name("PATH")
                .action(ArgAction::Append)
                .help(
                    "path to configuration file; when using multiple config files \
                     first occurrence of an option wins",
                ),
        )
        .arg(
            Arg::new("log.mask")
                .long("log.mask")
                .value_name("MASK")
                .help("set logging mask (off, error, warn, info, debug, trace or 0-5)"),
        )
        .arg(
            Arg::new("log.file")
                .long("log.file")
                .value_name("PATH")
                .help("set log output file (none by default)"),
        )
        .arg(
            Arg::new("log.console")
                .long("log.console")
                .value_name("BOOL")
                .help("enable console logging"),
        )
        .arg(
            Arg::new("log.timePrecision")
                .long("log.timePrecision")
                .value_name("0..6")
                .help("set logged time sub-second precision (0-6 decimals)"),
        )
        .arg(
            Arg::new("log.file.truncate")
                .long("log.file.truncate")
                .action(ArgAction::SetTrue)
                .help("truncate log file on startup"),
        )
        .arg(
            Arg::new("log.file.archive")
                .long("log.file.archive")
                .action(ArgAction::SetTrue)
                .help(
                    "archive existing log file (adds last modified as an extension) and \
                     start with a new one; overrides log.file.truncate",
                ),
        );

    if service {
        cmd = cmd
            .arg(
                Arg::new("daemonize")
                    .long("daemonize")
                    .short('d')
                    .action(ArgAction::SetTrue)
                    .help("run in daemon mode (otherwise run in foreground)"),
            )
            .arg(
                Arg::new("daemonize-nochdir")
                    .long("daemonize-nochdir")
                    .action(ArgAction::SetTrue)
                    .help("do not leave current directory after forking to background"),
            )
            .arg(
                Arg::new("daemonize-noclose")
                    .long("daemonize-noclose")
                    .action(ArgAction::SetTrue)
                    .help("do not close STDIN/OUT/ERR after forking to background"),
            )
            .arg(
                Arg::new("pidfile")
                    .long("pidfile")
                    .value_name("PATH")
                    .help("path to pid file"),
            )
            .arg(
                Arg::new("ctrl")
                    .long("ctrl")
                    .value_name("PATH")
                    .help("path to UNIX control socket (requires --pidfile)"),
            )
            .arg(
                Arg::new("ctrl.user")
                    .long("ctrl.user")
                    .value_name("USER")
                    .help("owner of the control socket"),
            )
            .arg(
                Arg::new("ctrl.group")
                    .long("ctrl.group")
                    .value_name("GROUP")
                    .help("group of the control socket"),
            )
            .arg(
                Arg::new("ctrl.mode")
                    .long("ctrl.mode")
                    .value_name("OCTAL")
                    .help("permissions of the control socket"),
            )
            .arg(
                Arg::new("service.user")
                    .long("service.user")
                    .value_name("USER")
                    .help("switch process persona to given username"),
            )
            .arg(
                Arg::new("service.group")
                    .long("service.group")
                    .value_name("GROUP")
                    .help("switch process persona to given group name"),
            )
            .arg(
                Arg::new("service.loginEnv")
                    .long("service.loginEnv")
                    .value_name("BOOL")
                    .help("generate login-like environment variables (HOME, USER, ...)"),
            )
            .arg(
                Arg::new("signal")
                    .long("signal")
                    .short('s')
                    .value_name("VERB[/SECONDS]")
                    .help(
                        "signal to be sent to running instance: stop, logrotate, stat, \
                         status; 'stop' can be followed by /timeout specifying the \
                         number of seconds to wait for the running process to terminate",
                    ),
            );
    }

    cmd
}

struct DefaultHelper<'a> {
    handler: &'a dyn Configurable,
}

impl HelpPrinter for DefaultHelper<'_> {
    fn help(&self, out: &mut dyn Write, what: &str) -> io::Result<bool> {
        self.handler.help(out, what)
    }

    fn list(&self) -> Vec<String> {
        self.handler.list_helps()
    }
}

fn bad_value(name: &str, err: ConfigError) -> ImmediateExit {
    eprintln!("{name}: {err}");
    ImmediateExit::new(libc::EXIT_FAILURE)
}

fn build_log_config(name: &str, ctx: &ConfigContext) -> Result<LogConfig, ImmediateExit> {
    let mut log = LogConfig::default();

    if let Some(mask) = ctx.value("log.mask") {
        log.mask = Some(mask.parse::<LogMaskArg>().map_err(|reason| {
            bad_value(
                name,
                ConfigError::BadValue {
                    option: "log.mask",
                    reason,
                },
            )
        })?);
    }
    log.file = ctx.value("log.file").map(PathBuf::from);
    if let Some(value) = ctx.value("log.console") {
        log.console = parse_bool(&value).ok_or_else(|| {
            bad_value(
                name,
                ConfigError::BadValue {
                    option: "log.console",
                    reason: format!("expected boolean, got '{value}'"),
                },
            )
        })?;
    }
    if let Some(value) = ctx.value("log.timePrecision") {
        let precision: u8 = value.parse().unwrap_or(255);
        if precision > 6 {
            return Err(bad_value(
                name,
                ConfigError::BadValue {
                    option: "log.timePrecision",
                    reason: format!("expected 0-6, got '{value}'"),
                },
            ));
        }
        log.time_precision = precision;
    }
    log.truncate = ctx.flag("log.file.truncate");
    log.archive = ctx.flag("log.file.archive");
    Ok(log)
}

fn build_generic(name: &str, ctx: &ConfigContext) -> Result<GenericConfig, ImmediateExit> {
    let mut generic = GenericConfig {
        log: build_log_config(name, ctx)?,
        ..GenericConfig::default()
    };

    generic.daemonize = DaemonizeConfig {
        enabled: ctx.flag("daemonize"),
        nochdir: ctx.flag("daemonize-nochdir"),
        noclose: ctx.flag("daemonize-noclose"),
    };
    if !generic.daemonize.enabled && (generic.daemonize.nochdir || generic.daemonize.noclose) {
        eprintln!(
            "{name}: options --daemonize-nochdir and --daemonize-noclose make sense \
             only together with --daemonize"
        );
    }

    generic.pidfile = ctx.value("pidfile").map(|p| absolute(Path::new(&p)));

    if let Some(path) = ctx.value("ctrl") {
        if generic.pidfile.is_none() {
            eprintln!("{name}: specified ctrl path without pid file");
            return immediate_exit(libc::EXIT_FAILURE);
        }

        let mode = match ctx.value("ctrl.mode") {
            None => None,
            Some(raw) => Some(
                u32::from_str_radix(raw.trim().trim_start_matches("0o"), 8).map_err(|_| {
                    bad_value(
                        name,
                        ConfigError::BadValue {
                            option: "ctrl.mode",
                            reason: format!("expected octal mode, got '{raw}'"),
                        },
                    )
                })?,
            ),
        };

        generic.ctrl = Some(CtrlSocketConfig {
            path: absolute(Path::new(&path)),
            user: ctx.value("ctrl.user"),
            group: ctx.value("ctrl.group"),
            mode,
        });
    }

    generic.persona = PersonaConfig {
        username: ctx.value("service.user"),
        groupname: ctx.value("service.group"),
        login_env: match ctx.value("service.loginEnv") {
            None => false,
            Some(value) => parse_bool(&value).ok_or_else(|| {
                bad_value(
                    name,
                    ConfigError::BadValue {
                        option: "service.loginEnv",
                        reason: format!("expected boolean, got '{value}'"),
                    },
                )
            })?,
        },
    };

    if let Some(spec) = ctx.value("signal") {
        generic.signal = Some(parse_sigdef(name, &spec)?);
    }

    Ok(generic)
}

fn resolve_help_printer<'a>(handler: &'a dyn Configurable) -> Box<dyn HelpPrinter + 'a> {
    match handler.help_printer() {
        Some(custom) => custom,
        None => Box::new(DefaultHelper { handler }),
    }
}

fn print_description(name: &str, printer: &dyn HelpPrinter) {
    let mut out = Vec::new();
    let _ = printer.help(&mut out, "");
    if !out.is_empty() {
        print!("{name}: {}", String::from_utf8_lossy(&out));
        println!();
    }
}

/// Handles `--version`, `--licence` and the help family before clap sees the
/// command line. Returns `Err(ImmediateExit)` when the invocation was fully
/// served.
fn handle_early_options(
    program: &Program,
    handler: &dyn Configurable,
    cmd: &mut Command,
    args: &[String],
) -> Result<(), ImmediateExit> {
    let printer = resolve_help_printer(handler);

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--version" | "-v" => {
                println!("{}", program.version_info());
                println!("{}", program.copyright());
                return immediate_exit(libc::EXIT_SUCCESS);
            }
            "--licence" | "--license" => {
                println!("{}", program.copyright());
                println!();
                if !program.licensee().is_empty() {
                    println!("Licensed to {}", program.licensee());
                }
                println!("{}", program.licence());
                return immediate_exit(libc::EXIT_SUCCESS);
            }
            "--help" => {
                print_description(&program.name, printer.as_ref());
                print!("{}", cmd.render_long_help());
                return immediate_exit(libc::EXIT_SUCCESS);
            }
            "--help-all" => {
                print_description(&program.name, printer.as_ref());
                print!("{}", cmd.render_long_help());
                if program.flags() & crate::program::DISABLE_CONFIG_HELP == 0 {
                    println!();
                    println!(
                        "configuration file options: config files accept the same \
                         dotted option names as the command line (key = value)"
                    );
                }
                let mut stdout = io::stdout();
                for topic in printer.list() {
                    println!();
                    let _ = printer.help(&mut stdout, &topic);
                }
                return immediate_exit(libc::EXIT_SUCCESS);
            }
            other => {
                if let Some(topic) = other.strip_prefix("--help-") {
                    let mut stdout = io::stdout();
                    match printer.help(&mut stdout, topic) {
                        Ok(true) => return immediate_exit(libc::EXIT_SUCCESS),
                        _ => {
                            eprintln!("{}: unknown option --help-{topic}", program.name);
                            return immediate_exit(libc::EXIT_FAILURE);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Result of [`configure_program`].
pub struct Configured {
    pub generic: GenericConfig,
    pub ctx: ConfigContext,
}

/// Parses the command line and config files, applies the logging setup and
/// runs the user `configure` hook.
///
/// `service` selects whether the service-only options (daemonize, pidfile,
/// ctrl, persona, signal) are part of the surface. `pre_config` runs after
/// the merge but before the user hook; the lifecycle driver uses it for the
/// signal-send path and the duplicate-instance probe.
pub(crate) fn configure_program(
    program: &mut Program,
    handler: &mut dyn Configurable,
    argv: Vec<String>,
    default_config: Option<&Path>,
    service: bool,
    pre_config: impl FnOnce(&GenericConfig, &ConfigContext) -> Result<(), ImmediateExit>,
) -> Result<Configured, ImmediateExit> {
    if let Some(argv0) = argv.first() {
        program.set_argv0(argv0);
    }

    let args = expand_response_files(argv).map_err(|e| bad_value(&program.name, e))?;

    let mut cmd = handler.configuration(generic_command(&program.name, service));
    handle_early_options(program, handler, &mut cmd, &args)?;

    let matches = cmd
        .try_get_matches_from(args.iter().map(String::as_str))
        .map_err(|e| {
            eprintln!("{}: {e}", program.name);
            ImmediateExit::new(libc::EXIT_FAILURE)
        })?;

    // config files: the command line list, or the compiled-in default
    let mut config_paths: Vec<PathBuf> = matches
        .get_many::<String>("config")
        .map(|values| values.map(|v| absolute(Path::new(v))).collect())
        .unwrap_or_default();
    if config_paths.is_empty()
        && let Some(default) = default_config
    {
        config_paths.push(absolute(default));
    }

    let mut files = ConfigFileValues::default();
    for path in &config_paths {
        match parse_config_file(path) {
            Ok(entries) => {
                for (key, value) in entries {
                    files.push(key, value);
                }
                program.add_config_file(path.clone());
            }
            Err(e) => {
                eprintln!("{}: cannot read config file: {e}", program.name);
                return immediate_exit(libc::EXIT_FAILURE);
            }
        }
    }

    let ctx = ConfigContext { matches, files };
    let generic = build_generic(&program.name, &ctx)?;

    if let Err(e) = program.apply_log_config(&generic.log) {
        eprintln!("{}: cannot set up logging: {e}", program.name);
        return immediate_exit(libc::EXIT_FAILURE);
    }
    for path in program.config_files() {
        tracing::info!("Loaded configuration from {:?}.", path);
    }

    if program.flags() & SHOW_LICENCE_INFO != 0 {
        tracing::info!(
            "This build of {} is licensed to {}, subject to license agreement.\n{}",
            program.name,
            program.licensee(),
            program.copyright()
        );
    }

    pre_config(&generic, &ctx)?;

    if let Err(e) = handler.configure(&ctx) {
        return match e {
            ServiceError::Exit(exit) => Err(exit),
            other => {
                eprintln!("{}: {other}", program.name);
                tracing::error!("Configure failed: {other}");
                immediate_exit(libc::EXIT_FAILURE)
            }
        };
    }

    if generic.signal.is_some() && !service {
        warn!("Management signals are only available to services.");
    }

    Ok(Configured { generic, ctx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn response_file_tokens_are_spliced() {
        let temp = tempdir().expect("tempdir");
        let rsp = temp.path().join("extra.rsp");
        fs::write(&rsp, "--log.mask debug\n--pidfile /tmp/x.pid\n").expect("write rsp");

        let expanded = expand_response_files(args(&[
            "svc",
            "--log.console",
            "false",
            &format!("@{}", rsp.display()),
        ]))
        .expect("expand");

        assert_eq!(
            expanded,
            args(&[
                "svc",
                "--log.console",
                "false",
                "--log.mask",
                "debug",
                "--pidfile",
                "/tmp/x.pid",
            ])
        );
    }

    #[test]
    fn missing_response_file_is_an_error() {
        let result = expand_response_files(args(&["svc", "@/no/such/file.rsp"]));
        assert!(matches!(result, Err(ConfigError::FileRead { .. })));
    }

    #[test]
    fn argv0_is_never_expanded() {
        let expanded = expand_response_files(args(&["@weird-binary-name"])).expect("expand");
        assert_eq!(expanded, args(&["@weird-binary-name"]));
    }

    #[test]
    fn config_file_sections_prefix_keys() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("svc.conf");
        fs::write(
            &path,
            "log.mask = debug  # comment\n\n[service]\nuser = nobody\n",
        )
        .expect("write config");

        let entries = parse_config_file(&path).expect("parse");
        assert_eq!(
            entries,
            vec![
                ("log.mask".to_string(), "debug".to_string()),
                ("service.user".to_string(), "nobody".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_config_line_reports_position() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("svc.conf");
        fs::write(&path, "log.mask = debug\nnot an entry\n").expect("write config");

        match parse_config_file(&path) {
            Err(ConfigError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn first_config_file_occurrence_wins() {
        let mut files = ConfigFileValues::default();
        files.push("log.mask".into(), "debug".into());
        files.push("log.mask".into(), "trace".into());
        assert_eq!(files.get("log.mask"), Some("debug"));
        assert_eq!(files.get_all("log.mask"), vec!["debug", "trace"]);
    }

    #[test]
    fn sigdef_verbs_and_timeouts() {
        let def = parse_sigdef("svc", "stop/5").expect("stop/5");
        assert_eq!(def.verb, SignalVerb::Stop);
        assert_eq!(def.timeout, Some(5));

        let def = parse_sigdef("svc", "stop/0").expect("stop/0");
        assert_eq!(def.timeout, Some(0));

        let def = parse_sigdef("svc", "status").expect("status");
        assert_eq!(def.verb, SignalVerb::Status);
        assert_eq!(def.timeout, None);

        // timeout is only honoured for stop
        let def = parse_sigdef("svc", "logrotate/9").expect("logrotate/9");
        assert_eq!(def.verb, SignalVerb::Logrotate);
        assert_eq!(def.timeout, None);

        let err = parse_sigdef("svc", "reload").expect_err("unknown verb");
        assert_eq!(err.code, 3);

        let err = parse_sigdef("svc", "stop/soon").expect_err("bad timeout");
        assert_eq!(err.code, 3);
    }

    #[test]
    fn bool_values() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
    }

    struct Passive;

    impl Configurable for Passive {
        fn configure(&mut self, _ctx: &ConfigContext) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    #[test]
    fn generic_record_merges_cmdline_and_files() {
        let temp = tempdir().expect("tempdir");
        let conf = temp.path().join("svc.conf");
        fs::write(&conf, "log.mask = debug\nservice.user = nobody\n").expect("write config");

        let mut program = Program::new("svc", "1.0");
        let mut handler = Passive;
        let configured = configure_program(
            &mut program,
            &mut handler,
            args(&[
                "svc",
                "--config",
                &conf.display().to_string(),
                "--pidfile",
                "run/svc.pid",
                "--ctrl",
                "run/svc.pid.ctrl",
                "--ctrl.mode",
                "0660",
            ]),
            None,
            true,
            |_, _| Ok(()),
        )
        .expect("configure");

        let generic = configured.generic;
        assert!(generic.pidfile.as_ref().expect("pidfile").is_absolute());
        let ctrl = generic.ctrl.expect("ctrl config");
        assert!(ctrl.path.is_absolute());
        assert_eq!(ctrl.mode, Some(0o660));
        assert_eq!(generic.persona.username.as_deref(), Some("nobody"));
        assert_eq!(
            generic.log.mask.expect("mask from config file").as_str(),
            "debug"
        );
    }

    #[test]
    fn ctrl_without_pidfile_is_fatal() {
        let mut program = Program::new("svc", "1.0");
        let mut handler = Passive;
        let err = configure_program(
            &mut program,
            &mut handler,
            args(&["svc", "--ctrl", "/tmp/svc.ctrl"]),
            None,
            true,
            |_, _| Ok(()),
        )
        .err()
        .expect("must fail");
        assert_eq!(err.code, libc::EXIT_FAILURE);
    }
}
