//! Program identity, uptime and the logging stack shared by services and
//! command-line tools.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use chrono::{DateTime, Local, Utc};
use nix::unistd::{Gid, Uid};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer as FmtWriter;
use tracing_subscriber::fmt::time::FormatTime;

/// Disable printing of config-file options in `--help-all`.
pub const DISABLE_CONFIG_HELP: u32 = 0x01;
/// Log licensee information after configuration.
pub const SHOW_LICENCE_INFO: u32 = 0x08;

/// Wrapper around `LevelFilter` so the log mask can be given either as a
/// name ("info", "debug", ...) or a numeric shorthand (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogMaskArg(pub LevelFilter);

impl LogMaskArg {
    /// String representation suitable for an env filter.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogMaskArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log mask cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log mask number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogMaskArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" | "none" => LevelFilter::OFF,
            "error" | "err" | "fatal" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" | "information" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" | "all" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log mask '{trimmed}'")),
        };
        Ok(LogMaskArg(level))
    }
}

/// Logging options assembled during configure.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub mask: Option<LogMaskArg>,
    pub file: Option<PathBuf>,
    pub console: bool,
    pub time_precision: u8,
    pub truncate: bool,
    pub archive: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            mask: None,
            file: None,
            console: true,
            time_precision: 0,
            truncate: false,
            archive: false,
        }
    }
}

/// Destination of log records: an optional file that can be reopened plus a
/// console toggle.
///
/// The sink outlives subscriber initialisation; the reactor swaps the file
/// on log-rotate events and daemonize-finish flips the console off.
pub struct LogSink {
    file: Mutex<Option<File>>,
    path: Mutex<Option<PathBuf>>,
    console: AtomicBool,
}

impl LogSink {
    fn new() -> Self {
        Self {
            file: Mutex::new(None),
            path: Mutex::new(None),
            console: AtomicBool::new(true),
        }
    }

    /// Points the sink at `path`.
    ///
    /// `archive` renames an existing file to `<path>.<mtime>` and forces
    /// truncation; `truncate` truncates in place.
    pub fn set_file(&self, path: &Path, truncate: bool, archive: bool) -> io::Result<()> {
        let mut truncate = truncate;
        if archive {
            if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified()) {
                let stamp = modified
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO)
                    .as_secs();
                let mut archived = path.as_os_str().to_owned();
                archived.push(format!(".{stamp}"));
                let _ = fs::rename(path, PathBuf::from(archived));
            }
            // we do not know who else writes to the file
            truncate = true;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(!truncate)
            .write(true)
            .truncate(truncate)
            .open(path)?;

        *self.file.lock().unwrap() = Some(file);
        *self.path.lock().unwrap() = Some(path.to_path_buf());
        Ok(())
    }

    /// Reopens the current log file; the log-rotate action.
    pub fn reopen(&self) -> io::Result<()> {
        let path = self.path.lock().unwrap().clone();
        if let Some(path) = path {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            *self.file.lock().unwrap() = Some(file);
        }
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    /// Hands the log file to the target persona before a privilege drop.
    pub fn chown(&self, uid: Uid, gid: Gid) -> io::Result<()> {
        let guard = self.file.lock().unwrap();
        if let Some(file) = guard.as_ref() {
            nix::unistd::fchown(file.as_raw_fd(), Some(uid), Some(gid))
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        }
        drop(guard);

        if let Some(path) = self.path() {
            nix::unistd::chown(&path, Some(uid), Some(gid))
                .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        }
        Ok(())
    }

    pub fn set_console(&self, enabled: bool) {
        self.console.store(enabled, Ordering::SeqCst);
    }

    pub fn console(&self) -> bool {
        self.console.load(Ordering::SeqCst)
    }

    /// Raw descriptor of the current log file, for tying stdout/stderr.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.file.lock().unwrap().as_ref().map(|f| f.as_raw_fd())
    }

    fn write_record(&self, buf: &[u8]) {
        if let Some(file) = self.file.lock().unwrap().as_ref() {
            let _ = (&*file).write_all(buf);
        }
        if self.console() {
            let _ = io::stderr().write_all(buf);
        }
    }
}

/// `MakeWriter` adapter over a shared [`LogSink`].
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<LogSink>,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink.write_record(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Timestamp formatter honouring `log.timePrecision` (0-6 sub-second
/// decimals).
struct PrecisionTime {
    precision: u8,
}

impl FormatTime for PrecisionTime {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))?;
        if self.precision > 0 {
            let micros = format!("{:06}", now.timestamp_subsec_micros());
            write!(w, ".{}", &micros[..self.precision.min(6) as usize])?;
        }
        Ok(())
    }
}

/// Pluggable help output.
pub trait HelpPrinter {
    /// Prints help for `what`; false when `what` is not supported. Called
    /// with an empty `what` to obtain the program description.
    fn help(&self, out: &mut dyn Write, what: &str) -> io::Result<bool>;

    /// Lists supported help topics.
    fn list(&self) -> Vec<String>;
}

/// Identity, uptime and logging owned by every scaffolded program.
pub struct Program {
    pub name: String,
    pub version: String,
    flags: u32,
    up_since: DateTime<Utc>,
    started: Instant,
    argv0: Option<String>,
    log_file: Option<PathBuf>,
    config_files: Vec<PathBuf>,
    sink: Arc<LogSink>,
    git_commit: Option<String>,
    build_info: Option<String>,
    copyright: String,
    licence: String,
    licensee: String,
}

impl Program {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        validate_locale(&name);
        Self {
            name,
            version: version.into(),
            flags: 0,
            up_since: Utc::now(),
            started: Instant::now(),
            argv0: None,
            log_file: None,
            config_files: Vec::new(),
            sink: Arc::new(LogSink::new()),
            git_commit: None,
            build_info: None,
            copyright: String::new(),
            licence: String::new(),
            licensee: String::new(),
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Git commit baked into the build, shown in `--version` and identity.
    pub fn with_git_commit(mut self, commit: impl Into<String>) -> Self {
        self.git_commit = Some(commit.into());
        self
    }

    /// Free-form build description ("DATE TIME at HOST").
    pub fn with_build_info(mut self, info: impl Into<String>) -> Self {
        self.build_info = Some(info.into());
        self
    }

    pub fn with_copyright(mut self, text: impl Into<String>) -> Self {
        self.copyright = text.into();
        self
    }

    pub fn with_licence(mut self, text: impl Into<String>) -> Self {
        self.licence = text.into();
        self
    }

    pub fn with_licensee(mut self, text: impl Into<String>) -> Self {
        self.licensee = text.into();
        self
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// `name/version` (plus the git commit when known).
    pub fn identity(&self) -> String {
        match &self.git_commit {
            Some(commit) => format!("{}/{}/{}", self.name, self.version, commit),
            None => format!("{}/{}", self.name, self.version),
        }
    }

    /// Human version banner for `--version`.
    pub fn version_info(&self) -> String {
        let mut out = format!("{} {}", self.name, self.version);
        match (&self.build_info, &self.git_commit) {
            (Some(build), Some(commit)) => {
                out.push_str(&format!(" (built on {build} from git commit {commit})"));
            }
            (Some(build), None) => out.push_str(&format!(" (built on {build})")),
            (None, Some(commit)) => out.push_str(&format!(" (git commit {commit})")),
            (None, None) => {}
        }
        out
    }

    pub fn copyright(&self) -> &str {
        &self.copyright
    }

    pub fn licence(&self) -> &str {
        &self.licence
    }

    pub fn licensee(&self) -> &str {
        &self.licensee
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn up_since(&self) -> DateTime<Utc> {
        self.up_since
    }

    pub(crate) fn set_argv0(&mut self, argv0: &str) {
        self.argv0 = Some(argv0.to_string());
    }

    pub fn argv0(&self) -> Option<&str> {
        self.argv0.as_deref()
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn config_files(&self) -> &[PathBuf] {
        &self.config_files
    }

    pub(crate) fn add_config_file(&mut self, path: PathBuf) {
        self.config_files.push(path);
    }

    /// The shared log sink; the reactor reopens it on log-rotate events.
    pub fn sink(&self) -> Arc<LogSink> {
        Arc::clone(&self.sink)
    }

    /// Applies the final log configuration and installs the global
    /// subscriber. Called once, after command line and config files have
    /// been merged.
    pub(crate) fn apply_log_config(&mut self, cfg: &LogConfig) -> io::Result<()> {
        if let Some(path) = &cfg.file {
            let absolute = if path.is_absolute() {
                path.clone()
            } else {
                std::env::current_dir()?.join(path)
            };
            self.sink.set_file(&absolute, cfg.truncate, cfg.archive)?;
            self.log_file = Some(absolute);
        }
        self.sink.set_console(cfg.console);

        let filter = match cfg.mask {
            Some(mask) => EnvFilter::new(mask.as_str()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        };

        let writer = LogWriter { sink: self.sink() };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_timer(PrecisionTime {
                precision: cfg.time_precision.min(6),
            })
            .try_init();
        Ok(())
    }

    /// Read-only snapshot used by the event loop and the control channel.
    pub fn info(&self) -> ProgramInfo {
        ProgramInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            identity: self.identity(),
            version_info: self.version_info(),
            up_since: self.up_since,
        }
    }
}

/// Immutable program facts shared with the reactor and control sessions.
#[derive(Clone)]
pub struct ProgramInfo {
    pub name: String,
    pub version: String,
    pub identity: String,
    pub version_info: String,
    pub up_since: DateTime<Utc>,
}

impl ProgramInfo {
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.up_since).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Formats a duration as `[Nd ]HH:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

const LOCALE_VARS: [&str; 7] = [
    "LANG",
    "LC_ALL",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_MONETARY",
    "LC_NUMERIC",
    "LC_TIME",
];

/// Falls back to the "C" locale when the environment selects an invalid one.
fn validate_locale(name: &str) {
    let from_env = unsafe { libc::setlocale(libc::LC_ALL, c"".as_ptr()) };
    if !from_env.is_null() {
        return;
    }

    let settings: Vec<String> = LOCALE_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok().map(|v| format!("{var}={v}")))
        .collect();
    eprintln!(
        "{name}: invalid locale settings in the environment ({}); falling back to \"C\" locale",
        settings.join(", ")
    );

    for var in LOCALE_VARS {
        unsafe { std::env::remove_var(var) };
    }
    unsafe { libc::setlocale(libc::LC_ALL, c"C".as_ptr()) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mask_parses_names_and_numbers() {
        assert_eq!(
            "info".parse::<LogMaskArg>().expect("name").as_str(),
            "info"
        );
        assert_eq!("4".parse::<LogMaskArg>().expect("number").as_str(), "debug");
        assert!("9".parse::<LogMaskArg>().is_err());
        assert!("".parse::<LogMaskArg>().is_err());
    }

    #[test]
    fn version_info_mentions_build_and_commit() {
        let program = Program::new("svc", "1.2.3")
            .with_build_info("Jan 1 2026 12:00 at build-host")
            .with_git_commit("abcdef0");

        let info = program.version_info();
        assert!(info.starts_with("svc 1.2.3"));
        assert!(info.contains("built on Jan 1 2026 12:00 at build-host"));
        assert!(info.contains("git commit abcdef0"));
        assert_eq!(program.identity(), "svc/1.2.3/abcdef0");
    }

    #[test]
    fn sink_archive_renames_existing_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("svc.log");
        fs::write(&path, "old contents\n").expect("seed log");

        let sink = LogSink::new();
        sink.set_file(&path, false, true).expect("archive + open");

        let archived: Vec<_> = fs::read_dir(temp.path())
            .expect("list dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("svc.log."))
            .collect();
        assert_eq!(archived.len(), 1, "one archived log: {archived:?}");
        assert_eq!(
            fs::read_to_string(&path).expect("read new log"),
            "",
            "fresh file is empty"
        );
    }

    #[test]
    fn sink_reopen_recreates_rotated_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("svc.log");

        let sink = LogSink::new();
        sink.set_file(&path, false, false).expect("open");
        sink.write_record(b"line one\n");

        fs::rename(&path, temp.path().join("svc.log.1")).expect("rotate away");
        sink.reopen().expect("reopen");
        sink.write_record(b"line two\n");

        assert_eq!(
            fs::read_to_string(&path).expect("read recreated"),
            "line two\n"
        );
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(62)), "00:01:02");
        assert_eq!(
            format_duration(Duration::from_secs(90_061)),
            "1d 01:01:01"
        );
    }
}
