use thiserror::Error;

use crate::context::LifecycleState;
use crate::tcti::Operation;

/// TSS2 layer number of the TCTI, shifted into the response-code layer field.
pub const TCTI_RC_LAYER: u32 = 10 << 16;

/// Errors raised by TCTI operations.
#[derive(Debug, Error)]
pub enum TctiError {
    #[error("bad value: {reason}")]
    BadValue { reason: String },

    #[error(
        "invalid context: expected magic 0x{expected_magic:016X} version {expected_version}, \
         got magic 0x{magic:016X} version {version}"
    )]
    InvalidContext {
        expected_magic: u64,
        expected_version: u32,
        magic: u64,
        version: u32,
    },

    #[error("operation not implemented by this transport: {0}")]
    NotImplemented(Operation),

    #[error("insufficient buffer: need {needed} bytes, have {available}")]
    InsufficientBuffer { needed: usize, available: usize },

    #[error("bad sequence: {op} not allowed in state {state}")]
    BadSequence { op: Operation, state: LifecycleState },

    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    #[error("no response available yet, try again")]
    TryAgain,

    #[error("no connection to {addr}")]
    NoConnection { addr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TctiError {
    /// TSS2 base response code of this error, without the layer bits.
    pub fn base_rc(&self) -> u32 {
        match self {
            TctiError::NotImplemented(_) => 2,
            TctiError::InvalidContext { .. } => 3,
            TctiError::InsufficientBuffer { .. } => 6,
            TctiError::BadSequence { .. } => 7,
            TctiError::NoConnection { .. } => 8,
            TctiError::TryAgain => 9,
            TctiError::Io(_) => 10,
            TctiError::BadValue { .. } => 11,
            TctiError::MalformedResponse { .. } => 17,
        }
    }

    /// Full TSS2 response code, as a C caller of the TCTI layer would see it.
    pub fn rc(&self) -> u32 {
        TCTI_RC_LAYER | self.base_rc()
    }

    pub(crate) fn bad_value(reason: impl Into<String>) -> Self {
        TctiError::BadValue {
            reason: reason.into(),
        }
    }
}

/// Result alias for TCTI operations.
pub type Result<T> = std::result::Result<T, TctiError>;
