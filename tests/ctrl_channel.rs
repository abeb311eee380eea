//! Control-channel round trips between a polled server and the synchronous
//! client.

#[path = "common/mod.rs"]
mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use common::TestHandler;
use svckit::client::{CtrlClient, NetParams};
use svckit::config::CtrlSocketConfig;
use svckit::ctrl::{CHALLENGE_ALPHABET, CtrlEndpoint, EOT};
use svckit::error::CtrlClientError;
use svckit::program::Program;
use svckit::reactor::EventLoop;
use tempfile::tempdir;

fn unix_event_loop(dir: &Path) -> (EventLoop, PathBuf) {
    let program = Program::new("ctrltest", "0.0");
    let mut events = EventLoop::new(program.info(), program.sink()).expect("event loop");
    let path = dir.join("svc.ctrl");
    events
        .attach_ctrl(CtrlEndpoint::Unix(CtrlSocketConfig {
            path: path.clone(),
            user: None,
            group: None,
            mode: None,
        }))
        .expect("bind control socket");
    (events, path)
}

fn tcp_event_loop(secret: &str) -> (EventLoop, u16) {
    let program = Program::new("ctrltest", "0.0");
    let mut events = EventLoop::new(program.info(), program.sink()).expect("event loop");
    events
        .attach_ctrl(CtrlEndpoint::Tcp {
            addr: "127.0.0.1:0".parse().expect("loopback addr"),
            secret: secret.to_string(),
        })
        .expect("bind control endpoint");
    let port = events.ctrl_local_addr().expect("local addr").port();
    (events, port)
}

/// Polls the server while the client thread works.
fn serve_while<T: Send + 'static>(
    events: &mut EventLoop,
    handler: &mut TestHandler,
    client: thread::JoinHandle<T>,
) -> T {
    while !client.is_finished() {
        events.process(handler);
        thread::sleep(Duration::from_millis(2));
    }
    events.process(handler);
    client.join().expect("client thread")
}

#[test]
fn builtin_and_user_verbs_round_trip() {
    let temp = tempdir().expect("tempdir");
    let (mut events, path) = unix_event_loop(temp.path());
    let mut handler = TestHandler::new();

    let client_path = path.clone();
    let client = thread::spawn(move || {
        let mut client = CtrlClient::connect(&client_path).expect("connect");
        let help = client.command("help").expect("help");
        let stat = client.command("stat").expect("stat");
        let ping = client.command_args(["ping", "once"]).expect("ping");
        let rotate = client.command("logrotate").expect("logrotate");
        let bogus = match client.command("bogus") {
            Err(CtrlClientError::Command(e)) => e.reason,
            other => panic!("expected command error, got {other:?}"),
        };
        let term = client.command("terminate").expect("terminate");
        (help, stat, ping, rotate, bogus, term)
    });

    let (help, stat, ping, rotate, bogus, term) = serve_while(&mut events, &mut handler, client);

    for verb in ["help", "logrotate", "terminate", "exit", "stat", "monitor"] {
        assert!(
            help.iter().any(|line| line.starts_with(verb)),
            "help misses <{verb}>: {help:?}"
        );
    }
    assert!(
        help.iter().any(|line| line.starts_with("ping")),
        "user help appended: {help:?}"
    );
    assert_eq!(stat, vec!["connections: 0".to_string()]);
    assert_eq!(ping, vec!["pong once".to_string()]);
    assert_eq!(rotate, vec!["log rotation scheduled".to_string()]);
    assert!(bogus.contains("command <bogus> not implemented"), "{bogus}");
    assert_eq!(term, vec!["termination scheduled, bye".to_string()]);

    // the terminate verb schedules global termination
    assert!(events.process(&mut handler));
    assert!(events.flags().terminated());

    // logrotate verb scheduled exactly one rotation event
    assert_eq!(events.flags().log_rotate_event(), 1);

    drop(events);
    assert!(!path.exists(), "socket path removed on scoped destruction");
}

#[test]
fn help_response_block_ends_with_eot() {
    let temp = tempdir().expect("tempdir");
    let (mut events, path) = unix_event_loop(temp.path());
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(&path).expect("connect");
        stream.write_all(b"help\n").expect("send");

        let mut block = Vec::new();
        let mut buf = [0u8; 256];
        while !block.contains(&EOT) {
            let count = stream.read(&mut buf).expect("read");
            assert!(count > 0, "closed before terminator");
            block.extend_from_slice(&buf[..count]);
        }
        block
    });

    let block = serve_while(&mut events, &mut handler, client);
    assert_eq!(*block.last().expect("nonempty"), EOT);
    assert_eq!(block.iter().filter(|b| **b == EOT).count(), 1);
}

#[test]
fn bang_command_replies_then_closes_without_eot() {
    let temp = tempdir().expect("tempdir");
    let (mut events, path) = unix_event_loop(temp.path());
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let mut stream = UnixStream::connect(&path).expect("connect");
        stream.write_all(b"!stat\n").expect("send");
        let mut block = Vec::new();
        stream.read_to_end(&mut block).expect("read to close");
        block
    });

    let block = serve_while(&mut events, &mut handler, client);
    assert_eq!(block, b"connections: 0\n".to_vec());
    assert!(!block.contains(&EOT), "closing reply omits the terminator");
}

#[test]
fn monitor_emits_identity_block() {
    let temp = tempdir().expect("tempdir");
    let (mut events, path) = unix_event_loop(temp.path());
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let mut client = CtrlClient::connect(&path).expect("connect");
        client.command("monitor").expect("monitor")
    });

    let lines = serve_while(&mut events, &mut handler, client);
    assert!(lines[0].starts_with("Identity: ctrltest"), "{lines:?}");
    assert!(lines.iter().any(|l| l == "Name: ctrltest"));
    assert!(lines.iter().any(|l| l.starts_with("Pid: ")));
    assert!(lines.iter().any(|l| l.starts_with("Persona: ")));
    assert!(lines.iter().any(|l| l.starts_with("Up-Since: ")));
    assert!(lines.iter().any(|l| l.starts_with("Uptime: ")));
    assert_eq!(lines.last().map(String::as_str), Some("Status: idle"));
}

#[test]
fn user_command_failure_keeps_connection_open() {
    let temp = tempdir().expect("tempdir");
    let (mut events, path) = unix_event_loop(temp.path());
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let mut client = CtrlClient::connect(&path).expect("connect");
        let failure = match client.command("boom") {
            Err(CtrlClientError::Command(e)) => e.reason,
            other => panic!("expected command error, got {other:?}"),
        };
        // the connection survives the failed command
        let ping = client.command_args(["ping", "again"]).expect("ping");
        (failure, ping)
    });

    let (failure, ping) = serve_while(&mut events, &mut handler, client);
    assert!(failure.contains("failed to execute command"), "{failure}");
    assert_eq!(ping, vec!["pong again".to_string()]);
}

#[test]
fn tcp_handshake_and_commands() {
    let (mut events, port) = tcp_event_loop("s3cret");
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let params = NetParams {
            host: "127.0.0.1".into(),
            port,
            component: "comp".into(),
            secret: "s3cret".into(),
        };
        let mut client = CtrlClient::connect_net(&params).expect("handshake");
        client.command("help").expect("help after auth")
    });

    let help = serve_while(&mut events, &mut handler, client);
    assert!(help.iter().any(|line| line.starts_with("terminate")));
}

#[test]
fn tcp_wrong_secret_is_rejected() {
    let (mut events, port) = tcp_event_loop("s3cret");
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let params = NetParams {
            host: "127.0.0.1".into(),
            port,
            component: "comp".into(),
            secret: "wrong".into(),
        };
        match CtrlClient::connect_net(&params) {
            Err(CtrlClientError::Command(e)) => e.reason,
            other => panic!("expected auth failure, got {other:?}"),
        }
    });

    let reason = serve_while(&mut events, &mut handler, client);
    assert!(reason.contains("authentication failed"), "{reason}");
}

#[test]
fn tcp_challenge_is_32_chars_from_alphabet() {
    let (mut events, port) = tcp_event_loop("s3cret");
    let mut handler = TestHandler::new();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream.write_all(b"comp\n").expect("send component");

        let mut block = Vec::new();
        let mut buf = [0u8; 256];
        while !block.contains(&EOT) {
            let count = stream.read(&mut buf).expect("read");
            assert!(count > 0, "closed before challenge");
            block.extend_from_slice(&buf[..count]);
        }
        let text = String::from_utf8(block).expect("utf8 challenge");
        text.lines().next().expect("challenge line").to_string()
    });

    let challenge = serve_while(&mut events, &mut handler, client);
    assert_eq!(challenge.chars().count(), 32);
    assert!(challenge.chars().all(|c| CHALLENGE_ALPHABET.contains(c)));
}
