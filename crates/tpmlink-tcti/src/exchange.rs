//! One synchronous command/response round trip.

use tracing::debug;

use crate::context::TctiContext;
use crate::error::{Result, TctiError};
use crate::header::{ResponseCode, TpmHeader, MAX_RESPONSE_SIZE};
use crate::tcti::{TctiBackend, Timeout};

/// A complete response buffer with its parsed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Parsed envelope
    pub header: TpmHeader,
    /// Whole response, header included
    pub bytes: Vec<u8>,
}

impl Response {
    /// Response code of the envelope.
    pub fn code(&self) -> ResponseCode {
        self.header.response_code()
    }

    /// Bytes after the header.
    pub fn params(&self) -> &[u8] {
        &self.bytes[crate::header::TPM_HEADER_SIZE..]
    }
}

/// Transmit `command`, then receive its response with a size query
/// followed by a fill.
///
/// A retry code such as `TPM_RC_YIELDED` comes back as an ordinary
/// response; re-driving the command is up to the caller.
pub fn exchange<B: TctiBackend>(
    ctx: &mut TctiContext<B>,
    command: &[u8],
    timeout: Timeout,
) -> Result<Response> {
    let sent = TpmHeader::decode(command)?;
    if sent.size as usize != command.len() {
        return Err(TctiError::bad_value(format!(
            "command header size {} does not match buffer length {}",
            sent.size,
            command.len()
        )));
    }

    ctx.transmit(command)?;
    let size = ctx.receive(None, timeout)?;
    if size > MAX_RESPONSE_SIZE {
        return Err(TctiError::MalformedResponse {
            reason: format!(
                "response of {} bytes exceeds maximum {}",
                size, MAX_RESPONSE_SIZE
            ),
        });
    }
    let mut bytes = vec![0u8; size];
    let filled = ctx.receive(Some(&mut bytes), timeout)?;
    bytes.truncate(filled);

    let header = TpmHeader::decode(&bytes)?;
    header.validate_len(bytes.len())?;
    debug!(
        command = sent.code,
        response = %header.response_code(),
        size = bytes.len(),
        "exchange complete"
    );
    Ok(Response { header, bytes })
}
