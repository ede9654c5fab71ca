//! Transport for the TPM 2.0 reference simulator.
//!
//! The simulator listens on two sockets: the TPM command port and the
//! platform port (`port + 1` for TCP, `<path>.ctrl` for Unix sockets). The
//! platform port powers the simulated TPM on and toggles cancellation; the
//! command port carries commands framed as
//!
//! ```text
//! TPM_SEND_COMMAND:u32 | locality:u8 | size:u32 | command
//! ```
//!
//! and responses framed as `size:u32 | response | status:u32`.
//! All integers are big-endian.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::MssimConfig;
use crate::error::{Result, TctiError};
use crate::header::{TpmHeader, MAX_RESPONSE_SIZE, TPM_HEADER_SIZE};
use crate::tcti::{Capabilities, Identity, PollHandle, TctiBackend, TctiInit, Timeout};

/// Magic of the simulator transport.
pub const MSSIM_MAGIC: u64 = 0xf05b_04cd_9f02_728a;

/// Capability table version of the simulator transport.
pub const MSSIM_VERSION: u32 = 2;

/// Platform command: power the simulated TPM on.
pub const MS_SIM_POWER_ON: u32 = 1;
/// Command-port command: a TPM command follows.
pub const TPM_SEND_COMMAND: u32 = 8;
/// Platform command: assert the cancel line.
pub const MS_SIM_CANCEL_ON: u32 = 9;
/// Platform command: release the cancel line.
pub const MS_SIM_CANCEL_OFF: u32 = 10;
/// Platform command: make NV memory available.
pub const MS_SIM_NV_ON: u32 = 11;
/// End of session, sent on both sockets before closing.
pub const TPM_SESSION_END: u32 = 20;

/// Suffix of the platform socket path for Unix-socket simulators.
pub const PLATFORM_SOCKET_SUFFIX: &str = ".ctrl";

/// Smallest read timeout the socket layer accepts.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

enum SimStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl SimStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            SimStream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(unix)]
            SimStream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            SimStream::Tcp(s) => s.shutdown(Shutdown::Both),
            #[cfg(unix)]
            SimStream::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> i32 {
        use std::os::fd::AsRawFd;
        match self {
            SimStream::Tcp(s) => s.as_raw_fd(),
            SimStream::Unix(s) => s.as_raw_fd(),
        }
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_all(&value.to_be_bytes())?;
        self.flush()
    }
}

impl Read for SimStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SimStream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            SimStream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for SimStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SimStream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            SimStream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SimStream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            SimStream::Unix(s) => s.flush(),
        }
    }
}

/// Simulator transport over TCP or Unix sockets.
pub struct MssimTcti {
    tpm: SimStream,
    platform: SimStream,
    locality: u8,
    /// Length prefix of the pending response, once read.
    response_size: Option<usize>,
    /// Length prefix bytes read so far; survives a timed-out receive.
    prefix: [u8; 4],
    prefix_len: usize,
    /// A cancelled response is still in flight on the command socket.
    cancelled: bool,
}

impl std::fmt::Debug for MssimTcti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssimTcti")
            .field("locality", &self.locality)
            .field("response_size", &self.response_size)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl MssimTcti {
    /// Connect to the simulator and power it on.
    pub fn connect(config: &MssimConfig) -> Result<Self> {
        config.validate()?;
        let (tpm, platform) = open_sockets(config)?;
        let mut tcti = Self {
            tpm,
            platform,
            locality: 0,
            response_size: None,
            prefix: [0; 4],
            prefix_len: 0,
            cancelled: false,
        };
        tcti.platform_command(MS_SIM_POWER_ON)?;
        tcti.platform_command(MS_SIM_NV_ON)?;
        debug!(config = %config, "simulator powered on");
        Ok(tcti)
    }

    fn platform_command(&mut self, command: u32) -> Result<()> {
        self.platform.write_u32(command)?;
        let status = self.platform.read_u32()?;
        if status != 0 {
            return Err(TctiError::MalformedResponse {
                reason: format!("platform command {} returned status {}", command, status),
            });
        }
        trace!(command, "platform command acknowledged");
        Ok(())
    }

    fn read_response_size(&mut self, timeout: Timeout) -> Result<usize> {
        if let Some(size) = self.response_size {
            return Ok(size);
        }
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let read = self.read_prefix(deadline);
        self.tpm.set_read_timeout(None)?;
        read?;

        let size = u32::from_be_bytes(self.prefix) as usize;
        self.prefix_len = 0;
        if !(TPM_HEADER_SIZE..=MAX_RESPONSE_SIZE).contains(&size) {
            return Err(TctiError::MalformedResponse {
                reason: format!(
                    "response length prefix {} outside {}..={}",
                    size, TPM_HEADER_SIZE, MAX_RESPONSE_SIZE
                ),
            });
        }
        self.response_size = Some(size);
        Ok(size)
    }

    /// Fill `prefix` up to four bytes. Bytes read before a timeout are kept
    /// so the next call resumes in step with the stream.
    fn read_prefix(&mut self, deadline: Option<Instant>) -> Result<()> {
        while self.prefix_len < self.prefix.len() {
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                self.tpm.set_read_timeout(Some(left.max(MIN_READ_TIMEOUT)))?;
            }
            match self.tpm.read(&mut self.prefix[self.prefix_len..]) {
                Ok(0) => {
                    self.prefix_len = 0;
                    return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
                }
                Ok(n) => self.prefix_len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) => {
                    trace!(have = self.prefix_len, "length prefix incomplete");
                    return Err(TctiError::TryAgain);
                }
                Err(e) => {
                    self.prefix_len = 0;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn drain_cancelled(&mut self) -> Result<()> {
        let size = self.read_response_size(Timeout::Block)?;
        let mut discard = vec![0u8; size + 4];
        self.tpm.read_exact(&mut discard)?;
        self.response_size = None;
        self.platform_command(MS_SIM_CANCEL_OFF)?;
        self.cancelled = false;
        debug!(size, "drained cancelled response");
        Ok(())
    }
}

impl TctiBackend for MssimTcti {
    fn identity(&self) -> Identity {
        Self::IDENTITY
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            get_poll_handles: cfg!(unix),
            ..Capabilities::all()
        }
    }

    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        let header = TpmHeader::decode(command)?;
        if header.size as usize != command.len() {
            return Err(TctiError::bad_value(format!(
                "command header size {} does not match buffer length {}",
                header.size,
                command.len()
            )));
        }
        if self.cancelled {
            self.drain_cancelled()?;
        }

        let mut frame = Vec::with_capacity(9 + command.len());
        frame.extend_from_slice(&TPM_SEND_COMMAND.to_be_bytes());
        frame.push(self.locality);
        frame.extend_from_slice(&header.size.to_be_bytes());
        frame.extend_from_slice(command);
        self.tpm.write_all(&frame)?;
        self.tpm.flush()?;
        self.response_size = None;
        self.prefix_len = 0;
        trace!(
            code = header.code,
            size = header.size,
            locality = self.locality,
            "command sent to simulator"
        );
        Ok(())
    }

    fn receive(&mut self, response: Option<&mut [u8]>, timeout: Timeout) -> Result<usize> {
        let size = self.read_response_size(timeout)?;
        let buf = match response {
            None => return Ok(size),
            Some(buf) => buf,
        };
        if buf.len() < size {
            return Err(TctiError::InsufficientBuffer {
                needed: size,
                available: buf.len(),
            });
        }

        self.response_size = None;
        self.tpm.read_exact(&mut buf[..size])?;
        let status = self.tpm.read_u32()?;
        if status != 0 {
            warn!(status, "simulator reported non-zero trailing status");
        }

        let header = TpmHeader::decode(&buf[..size])?;
        header.validate_len(size)?;
        trace!(code = header.code, size, "response received from simulator");
        Ok(size)
    }

    fn finalize(&mut self) {
        for (name, stream) in [("platform", &mut self.platform), ("tpm", &mut self.tpm)] {
            if let Err(e) = stream.write_u32(TPM_SESSION_END) {
                warn!(socket = name, error = %e, "failed to end simulator session");
            }
            if let Err(e) = stream.shutdown() {
                debug!(socket = name, error = %e, "socket shutdown failed");
            }
        }
        debug!("simulator session closed");
    }

    fn cancel(&mut self) -> Result<()> {
        self.platform_command(MS_SIM_CANCEL_ON)?;
        self.cancelled = true;
        Ok(())
    }

    #[cfg(unix)]
    fn get_poll_handles(&self) -> Result<Vec<PollHandle>> {
        Ok(vec![PollHandle {
            fd: self.tpm.raw_fd(),
        }])
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        self.locality = locality;
        Ok(())
    }
}

impl TctiInit for MssimTcti {
    type Config = MssimConfig;
    const IDENTITY: Identity = Identity::new(MSSIM_MAGIC, MSSIM_VERSION);

    fn initialize(config: MssimConfig) -> Result<Self> {
        Self::connect(&config)
    }
}

fn open_sockets(config: &MssimConfig) -> Result<(SimStream, SimStream)> {
    if let Some(path) = &config.path {
        return open_unix(path);
    }
    let (tpm_addr, platform_addr) = match (config.tpm_addr(), config.platform_addr()) {
        (Some(tpm), Some(platform)) => (tpm, platform),
        _ => return Err(TctiError::bad_value("mssim config has neither host nor path")),
    };
    let tpm = connect_tcp(&tpm_addr)?;
    let platform = connect_tcp(&platform_addr)?;
    Ok((SimStream::Tcp(tpm), SimStream::Tcp(platform)))
}

fn connect_tcp(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).map_err(|e| connect_error(addr, e))?;
    stream.set_nodelay(true)?;
    debug!(addr, "connected to simulator");
    Ok(stream)
}

#[cfg(unix)]
fn open_unix(path: &std::path::Path) -> Result<(SimStream, SimStream)> {
    let mut platform_path = path.as_os_str().to_owned();
    platform_path.push(PLATFORM_SOCKET_SUFFIX);
    let tpm = UnixStream::connect(path)
        .map_err(|e| connect_error(&path.display().to_string(), e))?;
    let platform = UnixStream::connect(&platform_path)
        .map_err(|e| connect_error(&platform_path.to_string_lossy(), e))?;
    debug!(path = %path.display(), "connected to simulator");
    Ok((SimStream::Unix(tpm), SimStream::Unix(platform)))
}

#[cfg(not(unix))]
fn open_unix(_path: &std::path::Path) -> Result<(SimStream, SimStream)> {
    Err(TctiError::bad_value("unix socket paths are not supported on this platform"))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn connect_error(addr: &str, e: io::Error) -> TctiError {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TctiError::NoConnection {
            addr: addr.to_string(),
        },
        _ => TctiError::Io(e),
    }
}
