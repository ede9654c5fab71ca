//! In-process stand-in for the TPM 2.0 reference simulator.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use tpmlink_tcti::mssim::{MS_SIM_CANCEL_ON, TPM_SEND_COMMAND, TPM_SESSION_END};
use tpmlink_tcti::MssimConfig;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// How the simulator answers one command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Length prefix, response, zero status
    Framed(Vec<u8>),
    /// Only the length prefix, then close the socket
    LengthThenClose(u32),
    /// Close the socket without answering
    Close,
    /// Never answer
    Silent,
    /// Answer once the platform socket saw MS_SIM_CANCEL_ON
    AfterCancel(Vec<u8>),
    /// First two bytes of the length prefix, a pause, then the rest
    SplitPrefix(Vec<u8>, Duration),
    /// Only the given length prefix, socket left open
    Prefix(u32),
}

/// Something the simulator observed on its command socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmEvent {
    Command { locality: u8, bytes: Vec<u8> },
    SessionEnd,
}

pub struct SimServer {
    pub config: MssimConfig,
    pub platform_events: Receiver<u32>,
    pub tpm_events: Receiver<TpmEvent>,
    _dir: Option<tempfile::TempDir>,
}

impl SimServer {
    /// Simulator listening on a Unix socket pair in a fresh directory.
    #[cfg(unix)]
    pub fn unix(replies: Vec<Reply>) -> Self {
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.sock");
        let tpm_listener = UnixListener::bind(&path).unwrap();
        let platform_listener = UnixListener::bind(dir.path().join("sim.sock.ctrl")).unwrap();

        let (platform_tx, platform_events) = channel();
        let (tpm_tx, tpm_events) = channel();
        let (cancel_tx, cancel_rx) = channel();

        thread::spawn(move || {
            let (stream, _) = platform_listener.accept().unwrap();
            serve_platform(stream, platform_tx, cancel_tx);
        });
        thread::spawn(move || {
            let (stream, _) = tpm_listener.accept().unwrap();
            serve_tpm(stream, replies, tpm_tx, cancel_rx);
        });

        Self {
            config: MssimConfig {
                host: None,
                port: 0,
                path: Some(path),
            },
            platform_events,
            tpm_events,
            _dir: Some(dir),
        }
    }

    /// Simulator listening on two consecutive TCP ports on localhost.
    pub fn tcp(replies: Vec<Reply>) -> Self {
        let (tpm_listener, platform_listener) = bind_consecutive();
        let port = tpm_listener.local_addr().unwrap().port();

        let (platform_tx, platform_events) = channel();
        let (tpm_tx, tpm_events) = channel();
        let (cancel_tx, cancel_rx) = channel();

        thread::spawn(move || {
            let (stream, _) = platform_listener.accept().unwrap();
            serve_platform(stream, platform_tx, cancel_tx);
        });
        thread::spawn(move || {
            let (stream, _) = tpm_listener.accept().unwrap();
            serve_tpm(stream, replies, tpm_tx, cancel_rx);
        });

        Self {
            config: MssimConfig {
                host: Some("127.0.0.1".to_string()),
                port,
                path: None,
            },
            platform_events,
            tpm_events,
            _dir: None,
        }
    }

    pub fn next_platform(&self) -> u32 {
        self.platform_events.recv_timeout(EVENT_TIMEOUT).unwrap()
    }

    pub fn next_tpm(&self) -> TpmEvent {
        self.tpm_events.recv_timeout(EVENT_TIMEOUT).unwrap()
    }
}

/// Frame a response the way the simulator does.
pub fn frame(response: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(response.len() + 8);
    out.extend_from_slice(&(response.len() as u32).to_be_bytes());
    out.extend_from_slice(response);
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

fn bind_consecutive() -> (TcpListener, TcpListener) {
    for _ in 0..64 {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(second) = TcpListener::bind(("127.0.0.1", port + 1)) {
            return (first, second);
        }
    }
    panic!("could not bind two consecutive ports");
}

fn read_u32<S: Read>(stream: &mut S) -> Option<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).ok()?;
    Some(u32::from_be_bytes(buf))
}

fn serve_platform<S: Read + Write>(mut stream: S, events: Sender<u32>, cancel: Sender<()>) {
    while let Some(command) = read_u32(&mut stream) {
        let _ = events.send(command);
        if command == TPM_SESSION_END {
            return;
        }
        if command == MS_SIM_CANCEL_ON {
            let _ = cancel.send(());
        }
        if stream.write_all(&0u32.to_be_bytes()).is_err() {
            return;
        }
    }
}

fn serve_tpm<S: Read + Write>(
    mut stream: S,
    replies: Vec<Reply>,
    events: Sender<TpmEvent>,
    cancel: Receiver<()>,
) {
    let mut replies = replies.into_iter();
    loop {
        let command = match read_u32(&mut stream) {
            Some(command) => command,
            None => return,
        };
        if command == TPM_SESSION_END {
            let _ = events.send(TpmEvent::SessionEnd);
            return;
        }
        assert_eq!(command, TPM_SEND_COMMAND, "unexpected simulator command");

        let mut locality = [0u8; 1];
        stream.read_exact(&mut locality).unwrap();
        let size = read_u32(&mut stream).unwrap() as usize;
        let mut bytes = vec![0u8; size];
        stream.read_exact(&mut bytes).unwrap();
        let _ = events.send(TpmEvent::Command {
            locality: locality[0],
            bytes,
        });

        match replies.next() {
            Some(Reply::Framed(response)) => {
                stream.write_all(&frame(&response)).unwrap();
            }
            Some(Reply::LengthThenClose(size)) => {
                stream.write_all(&size.to_be_bytes()).unwrap();
                return;
            }
            Some(Reply::Close) => return,
            Some(Reply::Silent) | None => {}
            Some(Reply::AfterCancel(response)) => {
                cancel.recv_timeout(EVENT_TIMEOUT).unwrap();
                stream.write_all(&frame(&response)).unwrap();
            }
            Some(Reply::SplitPrefix(response, pause)) => {
                let framed = frame(&response);
                stream.write_all(&framed[..2]).unwrap();
                stream.flush().unwrap();
                thread::sleep(pause);
                stream.write_all(&framed[2..]).unwrap();
            }
            Some(Reply::Prefix(size)) => {
                stream.write_all(&size.to_be_bytes()).unwrap();
            }
        }
    }
}
