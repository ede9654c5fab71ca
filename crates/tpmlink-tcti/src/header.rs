//! TPM message envelope codec.
//!
//! Every TPM command and response starts with the same 10-byte header:
//! a 2-byte tag, a 4-byte total size (header included) and a 4-byte code.
//! All fields are big-endian. Commands carry the command code in the code
//! field, responses carry the response code.

use std::fmt;

use crate::error::{Result, TctiError};

/// Header size in bytes (tag:2 + size:4 + code:4)
pub const TPM_HEADER_SIZE: usize = 10;

/// `TPM2_MAX_RESPONSE_SIZE`: no response is larger than this.
pub const MAX_RESPONSE_SIZE: usize = 4096;

/// `TPM_ST_NO_SESSIONS`: no authorization area follows the handles.
pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;

/// `TPM_ST_SESSIONS`: an authorization area follows the handles.
pub const TPM_ST_SESSIONS: u16 = 0x8002;

/// Command codes used in this repository.
pub mod cc {
    /// `TPM2_CC_Startup`
    pub const STARTUP: u32 = 0x0000_0144;
    /// `TPM2_CC_GetRandom`
    pub const GET_RANDOM: u32 = 0x0000_017B;
    /// `TPM2_CC_Policy_AC_SendSelect`
    pub const POLICY_AC_SEND_SELECT: u32 = 0x0000_0196;
}

/// Response code carried in the code field of a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    /// `TPM_RC_SUCCESS`
    pub const SUCCESS: ResponseCode = ResponseCode(0x000);
    /// `TPM_RC_YIELDED`: the TPM suspended the command, re-drive it.
    pub const YIELDED: ResponseCode = ResponseCode(0x908);
    /// `TPM_RC_TESTING`: self-test in progress.
    pub const TESTING: ResponseCode = ResponseCode(0x90A);
    /// `TPM_RC_RETRY`: the TPM was not able to start the command.
    pub const RETRY: ResponseCode = ResponseCode(0x922);

    /// Returns true for `TPM_RC_SUCCESS`.
    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Returns true for warning codes that ask the caller to send the command again.
    pub fn is_retry(&self) -> bool {
        matches!(*self, Self::YIELDED | Self::TESTING | Self::RETRY)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Parsed message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmHeader {
    /// Session framing tag
    pub tag: u16,
    /// Total message size, header included
    pub size: u32,
    /// Command code or response code
    pub code: u32,
}

impl TpmHeader {
    /// Create a new header.
    pub fn new(tag: u16, size: u32, code: u32) -> Self {
        Self { tag, size, code }
    }

    /// Decode a header from the first 10 bytes of `buf`.
    ///
    /// Bytes after the header are not inspected.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TPM_HEADER_SIZE {
            return Err(TctiError::InsufficientBuffer {
                needed: TPM_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let tag = u16::from_be_bytes([buf[0], buf[1]]);
        let size = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let code = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        Ok(Self { tag, size, code })
    }

    /// Encode the header as a 10-byte big-endian array.
    pub fn encode(&self) -> [u8; TPM_HEADER_SIZE] {
        let mut bytes = [0u8; TPM_HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.tag.to_be_bytes());
        bytes[2..6].copy_from_slice(&self.size.to_be_bytes());
        bytes[6..10].copy_from_slice(&self.code.to_be_bytes());
        bytes
    }

    /// Encode the header into `buf` at `*offset` and advance the offset.
    ///
    /// On failure neither `buf` nor `offset` is modified.
    pub fn encode_into(&self, buf: &mut [u8], offset: &mut usize) -> Result<()> {
        let end = offset
            .checked_add(TPM_HEADER_SIZE)
            .filter(|end| *end <= buf.len())
            .ok_or(TctiError::InsufficientBuffer {
                needed: offset.saturating_add(TPM_HEADER_SIZE),
                available: buf.len(),
            })?;
        buf[*offset..end].copy_from_slice(&self.encode());
        *offset = end;
        Ok(())
    }

    /// Build a complete command buffer: header followed by `params`,
    /// with the size field covering both.
    pub fn command(tag: u16, code: u32, params: &[u8]) -> Result<Vec<u8>> {
        let total = TPM_HEADER_SIZE + params.len();
        let size = u32::try_from(total)
            .map_err(|_| TctiError::bad_value(format!("command of {} bytes exceeds u32", total)))?;
        let mut buf = Vec::with_capacity(total);
        buf.extend_from_slice(&TpmHeader::new(tag, size, code).encode());
        buf.extend_from_slice(params);
        Ok(buf)
    }

    /// The code field read as a response code.
    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }

    /// Check that the size field matches the number of bytes actually present.
    pub fn validate_len(&self, actual: usize) -> Result<()> {
        if self.size as usize != actual {
            return Err(TctiError::MalformedResponse {
                reason: format!(
                    "header size field is {} but message has {} bytes",
                    self.size, actual
                ),
            });
        }
        if actual < TPM_HEADER_SIZE {
            return Err(TctiError::MalformedResponse {
                reason: format!("message of {} bytes is shorter than its header", actual),
            });
        }
        Ok(())
    }
}
