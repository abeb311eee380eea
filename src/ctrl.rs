//! Control channel server: line-oriented request/reply over a stream
//! socket.
//!
//! Requests are `\n`-terminated lines, tokens split on runs of space or
//! tab. A leading `!` on the first token closes the connection after the
//! command. Replies are zero or more lines followed by a single EOT byte;
//! the EOT is omitted on the final reply of a closing connection.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use nix::unistd::{self, Gid, Group, Pid, Uid, User};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::CtrlSocketConfig;
use crate::error::CtrlServerError;
use crate::program::{ProgramInfo, format_duration};
use crate::service::ServiceHandler;
use crate::shmem::SharedFlags;

/// Response-block terminator.
pub const EOT: u8 = 0x04;

/// Default port of the TCP control endpoint.
pub const DEFAULT_CTRL_PORT: u16 = 2020;

/// Alphabet of the authentication challenge: letters, digits, symbols and
/// space, 91 characters total.
pub const CHALLENGE_ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz\
                                      ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                                      1234567890\
                                      !@#$%^&*()\
                                      `~-_=+[{]}|;:<.>/? ";

/// Generates a 32-character challenge drawn uniformly from
/// [`CHALLENGE_ALPHABET`].
pub fn ctrl_challenge() -> String {
    let alphabet: Vec<char> = CHALLENGE_ALPHABET.chars().collect();
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

/// Digest sent in reply to a challenge: `md5_hex(challenge + ":" + secret)`.
pub fn ctrl_response(challenge: &str, secret: &str) -> String {
    format!("{:x}", md5::compute(format!("{challenge}:{secret}")))
}

/// One parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlCommand {
    /// Command verb (first token, `!` stripped).
    pub verb: String,
    /// Positional arguments, in order.
    pub args: Vec<String>,
    /// Leading `!`: close the connection after this command.
    pub close_after: bool,
}

/// Tokenises one request line; `None` for blank lines.
pub fn parse_command_line(line: &str) -> Option<CtrlCommand> {
    let mut tokens = line
        .split([' ', '\t'])
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let first = tokens.next()?;
    let (verb, close_after) = match first.strip_prefix('!') {
        Some(stripped) => (stripped.to_string(), true),
        None => (first, false),
    };
    if verb.is_empty() {
        return None;
    }

    Some(CtrlCommand {
        verb,
        args: tokens.collect(),
        close_after,
    })
}

/// Where the control server listens.
pub enum CtrlEndpoint {
    /// Local UNIX-domain socket with optional ownership adjustments.
    Unix(CtrlSocketConfig),
    /// TCP endpoint guarded by the challenge/response handshake.
    Tcp {
        addr: SocketAddr,
        secret: String,
    },
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }
}

enum AuthState {
    /// Local connections skip the handshake.
    Authed,
    /// Remote connection, waiting for the component name.
    AwaitComponent,
    /// Challenge sent, waiting for the digest.
    AwaitResponse { challenge: String },
}

struct CtrlConnection {
    stream: Stream,
    peer: String,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    auth: AuthState,
    close_after_flush: bool,
    dead: bool,
}

impl CtrlConnection {
    fn push_block(&mut self, reply: Vec<u8>, closing: bool) {
        self.outbuf.extend_from_slice(&reply);
        if closing {
            self.close_after_flush = true;
        } else {
            self.outbuf.push(EOT);
        }
    }
}

/// Asynchronous control acceptor plus its live sessions; polled by the
/// reactor.
pub(crate) struct CtrlServer {
    listener: Option<Listener>,
    socket_path: Option<PathBuf>,
    secret: Option<String>,
    main_pid: Pid,
    conns: Vec<CtrlConnection>,
}

fn ownership_error(
    what: &'static str,
    path: &std::path::Path,
    source: io::Error,
) -> CtrlServerError {
    CtrlServerError::Ownership {
        what,
        path: path.to_path_buf(),
        source,
    }
}

impl CtrlServer {
    pub(crate) fn bind(endpoint: CtrlEndpoint, main_pid: Pid) -> Result<Self, CtrlServerError> {
        match endpoint {
            CtrlEndpoint::Unix(config) => {
                let listener =
                    UnixListener::bind(&config.path).map_err(|source| CtrlServerError::Bind {
                        endpoint: config.path.display().to_string(),
                        source,
                    })?;
                listener
                    .set_nonblocking(true)
                    .map_err(|source| CtrlServerError::Bind {
                        endpoint: config.path.display().to_string(),
                        source,
                    })?;

                apply_socket_ownership(&config)?;
                info!("Using control socket at {:?}.", config.path);

                Ok(Self {
                    listener: Some(Listener::Unix(listener)),
                    socket_path: Some(config.path),
                    secret: None,
                    main_pid,
                    conns: Vec::new(),
                })
            }
            CtrlEndpoint::Tcp { addr, secret } => {
                let listener = TcpListener::bind(addr).map_err(|source| CtrlServerError::Bind {
                    endpoint: addr.to_string(),
                    source,
                })?;
                listener
                    .set_nonblocking(true)
                    .map_err(|source| CtrlServerError::Bind {
                        endpoint: addr.to_string(),
                        source,
                    })?;
                info!("Using control endpoint at {}.", addr);

                Ok(Self {
                    listener: Some(Listener::Tcp(listener)),
                    socket_path: None,
                    secret: Some(secret),
                    main_pid,
                    conns: Vec::new(),
                })
            }
        }
    }

    /// Actual listening address; useful when binding to port 0.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self.listener.as_ref()? {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    pub(crate) fn acceptor_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| match l {
            Listener::Unix(listener) => listener.as_raw_fd(),
            Listener::Tcp(listener) => listener.as_raw_fd(),
        })
    }

    /// Drops the server in a forked child: the acceptor descriptor was
    /// already closed by the atfork handler, inherited session descriptors
    /// are closed here, and the socket path is left to the main process.
    pub(crate) fn dismantle_after_fork(mut self) {
        if let Some(listener) = self.listener.take() {
            match listener {
                Listener::Unix(listener) => {
                    let _ = listener.into_raw_fd();
                }
                Listener::Tcp(listener) => {
                    let _ = listener.into_raw_fd();
                }
            }
        }
        self.conns.clear();
        self.socket_path = None;
    }

    /// Accepts pending connections and serves readable/writable sessions.
    /// Never blocks.
    pub(crate) fn poll(
        &mut self,
        handler: &mut dyn ServiceHandler,
        shared: &SharedFlags,
        info: &ProgramInfo,
    ) {
        self.accept_pending();

        let secret = self.secret.clone();
        for conn in &mut self.conns {
            service_connection(conn, handler, shared, info, secret.as_deref());
        }
        self.conns.retain(|conn| !conn.dead);
    }

    fn accept_pending(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                None => return,
                Some(Listener::Unix(listener)) => match listener.accept() {
                    Ok((stream, _)) => stream.set_nonblocking(true).map(|_| {
                        (Stream::Unix(stream), "local".to_string(), AuthState::Authed)
                    }),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) => Err(e),
                },
                Some(Listener::Tcp(listener)) => match listener.accept() {
                    Ok((stream, peer)) => stream.set_nonblocking(true).map(|_| {
                        (
                            Stream::Tcp(stream),
                            peer.to_string(),
                            AuthState::AwaitComponent,
                        )
                    }),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(e) => Err(e),
                },
            };

            match accepted {
                Ok((stream, peer, auth)) => {
                    debug!("New control connection from <{peer}>.");
                    self.conns.push(CtrlConnection {
                        stream,
                        peer,
                        inbuf: Vec::new(),
                        outbuf: Vec::new(),
                        auth,
                        close_after_flush: false,
                        dead: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Control accept failed: {e}");
                    return;
                }
            }
        }
    }
}

impl Drop for CtrlServer {
    fn drop(&mut self) {
        // the socket path belongs to the main process only
        if let Some(path) = &self.socket_path
            && unistd::getpid() == self.main_pid
        {
            let _ = fs::remove_file(path);
        }
    }
}

fn apply_socket_ownership(config: &CtrlSocketConfig) -> Result<(), CtrlServerError> {
    let uid = match &config.user {
        None => None,
        Some(name) => Some(
            User::from_name(name)
                .map_err(|e| {
                    ownership_error("owner", &config.path, io::Error::from_raw_os_error(e as i32))
                })?
                .map(|u| u.uid)
                .ok_or_else(|| {
                    ownership_error(
                        "owner",
                        &config.path,
                        io::Error::new(io::ErrorKind::NotFound, format!("no user <{name}>")),
                    )
                })?,
        ),
    };
    let gid = match &config.group {
        None => None,
        Some(name) => Some(
            Group::from_name(name)
                .map_err(|e| {
                    ownership_error("group", &config.path, io::Error::from_raw_os_error(e as i32))
                })?
                .map(|g| g.gid)
                .ok_or_else(|| {
                    ownership_error(
                        "group",
                        &config.path,
                        io::Error::new(io::ErrorKind::NotFound, format!("no group <{name}>")),
                    )
                })?,
        ),
    };

    if uid.is_some() || gid.is_some() {
        chown_path(&config.path, uid, gid)
            .map_err(|e| ownership_error("owner", &config.path, e))?;
    }
    if let Some(mode) = config.mode {
        fs::set_permissions(&config.path, fs::Permissions::from_mode(mode))
            .map_err(|e| ownership_error("mode", &config.path, e))?;
    }
    Ok(())
}

fn chown_path(path: &std::path::Path, uid: Option<Uid>, gid: Option<Gid>) -> io::Result<()> {
    unistd::chown(path, uid, gid).map_err(|e| io::Error::from_raw_os_error(e as i32))
}

fn service_connection(
    conn: &mut CtrlConnection,
    handler: &mut dyn ServiceHandler,
    shared: &SharedFlags,
    info: &ProgramInfo,
    secret: Option<&str>,
) {
    // drain everything the peer has sent
    let mut buf = [0u8; 4096];
    loop {
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                conn.dead = true;
                break;
            }
            Ok(count) => conn.inbuf.extend_from_slice(&buf[..count]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Control connection <{}> read failed: {e}", conn.peer);
                conn.dead = true;
                break;
            }
        }
    }

    // one request per line
    while !conn.close_after_flush {
        let Some(pos) = conn.inbuf.iter().position(|b| *b == b'\n') else {
            break;
        };
        let line: Vec<u8> = conn.inbuf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line[..line.len() - 1])
            .trim_end_matches('\r')
            .to_string();
        handle_line(conn, &line, handler, shared, info, secret);
    }

    flush_output(conn);
}

fn handle_line(
    conn: &mut CtrlConnection,
    line: &str,
    handler: &mut dyn ServiceHandler,
    shared: &SharedFlags,
    info: &ProgramInfo,
    secret: Option<&str>,
) {
    match std::mem::replace(&mut conn.auth, AuthState::Authed) {
        AuthState::AwaitComponent => {
            conn.peer = format!("{}:{}", line.trim(), conn.peer);
            let challenge = ctrl_challenge();
            let mut reply = Vec::new();
            let _ = writeln!(reply, "{challenge}");
            conn.push_block(reply, false);
            conn.auth = AuthState::AwaitResponse { challenge };
        }
        AuthState::AwaitResponse { challenge } => {
            let expected = ctrl_response(&challenge, secret.unwrap_or(""));
            if line.trim() == expected {
                debug!("Control connection <{}> authenticated.", conn.peer);
                conn.push_block(Vec::new(), false);
            } else {
                warn!("Control connection <{}> failed authentication.", conn.peer);
                conn.auth = AuthState::AwaitComponent;
                conn.push_block(b"error: authentication failed\n".to_vec(), true);
            }
        }
        AuthState::Authed => {
            let Some(cmd) = parse_command_line(line) else {
                return;
            };
            debug!("Control command <{}> from <{}>.", cmd.verb, conn.peer);

            let mut reply = Vec::new();
            let closing = dispatch(&cmd, &mut reply, handler, shared, info) || cmd.close_after;
            conn.push_block(reply, closing);
        }
    }
}

fn flush_output(conn: &mut CtrlConnection) {
    while !conn.outbuf.is_empty() {
        match conn.stream.write(&conn.outbuf) {
            Ok(0) => {
                conn.dead = true;
                return;
            }
            Ok(count) => {
                conn.outbuf.drain(..count);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Control connection <{}> write failed: {e}", conn.peer);
                conn.dead = true;
                return;
            }
        }
    }

    if conn.close_after_flush {
        conn.dead = true;
    }
}

const BUILTIN_HELP: &str = "help           show this help\n\
                            logrotate      schedule log rotation\n\
                            terminate      schedule termination\n\
                            exit           close this connection\n\
                            stat           show service statistics\n\
                            monitor        report service monitoring info\n";

/// Handles built-in verbs, delegating everything else to the user handler.
/// Returns true when the connection must close (the `exit` verb).
fn dispatch(
    cmd: &CtrlCommand,
    out: &mut Vec<u8>,
    handler: &mut dyn ServiceHandler,
    shared: &SharedFlags,
    info: &ProgramInfo,
) -> bool {
    match cmd.verb.as_str() {
        "help" => {
            out.extend_from_slice(BUILTIN_HELP.as_bytes());
            // user help is appended below the built-ins
            if let Err(e) = handler.ctrl(cmd, out) {
                error!("User help failed: {e}");
            }
        }
        "logrotate" => {
            shared.bump_log_rotate();
            let _ = writeln!(out, "log rotation scheduled");
        }
        "terminate" => {
            shared.set_terminated();
            let _ = writeln!(out, "termination scheduled, bye");
        }
        "exit" => return true,
        "stat" => {
            if let Err(e) = handler.stat(out) {
                error!("Control command <stat> failed: {e}");
                let _ = writeln!(out, "error: failed to execute command");
            }
        }
        "monitor" => {
            if let Err(e) = monitor_block(out, info).and_then(|_| handler.monitor(out)) {
                error!("Control command <monitor> failed: {e}");
                let _ = writeln!(out, "error: failed to execute command");
            }
        }
        other => match handler.ctrl(cmd, out) {
            Ok(true) => {}
            Ok(false) => {
                let _ = writeln!(out, "error: command <{other}> not implemented");
            }
            Err(e) => {
                error!("Control command <{other}> failed: {e}");
                let _ = writeln!(out, "error: failed to execute command");
            }
        },
    }
    false
}

/// Identity/version/pid/persona/uptime block served by `monitor`.
fn monitor_block(out: &mut Vec<u8>, info: &ProgramInfo) -> io::Result<()> {
    let uptime = info.uptime();
    writeln!(out, "Identity: {}", info.version_info)?;
    writeln!(out, "Name: {}", info.name)?;
    writeln!(out, "Version: {}", info.version)?;
    writeln!(out, "Pid: {} ({})", unistd::getpid(), unistd::getppid())?;

    let groups = unistd::getgroups()
        .map(|groups| {
            groups
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_else(|_| "?".to_string());
    writeln!(
        out,
        "Persona: {} {} ({groups})",
        unistd::getuid(),
        unistd::getgid()
    )?;

    let local = info.up_since.with_timezone(&chrono::Local);
    writeln!(
        out,
        "Up-Since: {} ({} GMT)",
        local.format("%Y-%m-%d %H:%M:%S"),
        info.up_since.format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(
        out,
        "Uptime: {} {}",
        uptime.as_secs(),
        format_duration(uptime)
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_tokenisation() {
        let cmd = parse_command_line("restart  worker\t7").expect("parse");
        assert_eq!(cmd.verb, "restart");
        assert_eq!(cmd.args, vec!["worker", "7"]);
        assert!(!cmd.close_after);
    }

    #[test]
    fn bang_prefix_closes_after_command() {
        let cmd = parse_command_line("!stat").expect("parse");
        assert_eq!(cmd.verb, "stat");
        assert!(cmd.close_after);
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_command_line("   \t "), None);
        assert_eq!(parse_command_line("!"), None);
    }

    #[test]
    fn challenge_is_32_chars_from_alphabet() {
        assert_eq!(CHALLENGE_ALPHABET.chars().count(), 91);
        for _ in 0..16 {
            let challenge = ctrl_challenge();
            assert_eq!(challenge.chars().count(), 32);
            assert!(
                challenge.chars().all(|c| CHALLENGE_ALPHABET.contains(c)),
                "challenge {challenge:?} outside alphabet"
            );
        }
    }

    #[test]
    fn response_is_hex_digest_of_challenge_and_secret() {
        let response = ctrl_response("challenge", "secret");
        assert_eq!(response.len(), 32);
        assert!(response.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(response, ctrl_response("challenge", "secret"));
        assert_ne!(response, ctrl_response("challenge", "other"));
        // known md5 vector: empty input
        assert_eq!(
            format!("{:x}", md5::compute("")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }
}
