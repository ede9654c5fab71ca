//! Deterministic stand-in for a TPM.
//!
//! `FakeTcti` accepts exactly one command code and answers every receive
//! with the same 10-byte response. It pins the wire encoding of the layer
//! above: a command carrying any other code is a broken encoder, and the
//! transport panics instead of reporting an error.

use tracing::trace;

use crate::error::{Result, TctiError};
use crate::header::TpmHeader;
use crate::tcti::{Capabilities, Identity, TctiBackend, TctiInit, Timeout};

/// Magic of the fake transport: "FAKE" followed by four zero bytes.
pub const FAKE_MAGIC: u64 = 0x4641_4b45_0000_0000;

/// Capability table version of the fake transport.
pub const FAKE_VERSION: u32 = 1;

/// The only response the fake transport ever produces.
pub const YIELDED_RESPONSE: [u8; 10] = [
    0x80, 0x01, // TPM_ST_NO_SESSIONS
    0x00, 0x00, 0x00, 0x0A, // size 10
    0x00, 0x00, 0x00, 0x00, // response code
];

/// Test double pinned to one command code.
#[derive(Debug, Clone)]
pub struct FakeTcti {
    identity: Identity,
    expected_code: u32,
    transmits: usize,
    receives: usize,
}

impl FakeTcti {
    /// A fake that accepts only commands with `expected_code`.
    pub fn new(expected_code: u32) -> Self {
        Self {
            identity: Self::IDENTITY,
            expected_code,
            transmits: 0,
            receives: 0,
        }
    }

    /// Report a different identity, to exercise the dispatcher's checks.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Number of accepted transmits.
    pub fn transmits(&self) -> usize {
        self.transmits
    }

    /// Number of receive calls, size queries included.
    pub fn receives(&self) -> usize {
        self.receives
    }
}

impl TctiBackend for FakeTcti {
    fn identity(&self) -> Identity {
        self.identity
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::core()
    }

    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        let header = TpmHeader::decode(command)?;
        assert_eq!(
            header.code, self.expected_code,
            "command code 0x{:08X} does not match expected 0x{:08X}",
            header.code, self.expected_code
        );
        self.transmits += 1;
        trace!(code = header.code, "fake accepted command");
        Ok(())
    }

    fn receive(&mut self, response: Option<&mut [u8]>, _timeout: Timeout) -> Result<usize> {
        self.receives += 1;
        if let Some(buf) = response {
            let available = buf.len();
            let dst = buf
                .get_mut(..YIELDED_RESPONSE.len())
                .ok_or(TctiError::InsufficientBuffer {
                    needed: YIELDED_RESPONSE.len(),
                    available,
                })?;
            dst.copy_from_slice(&YIELDED_RESPONSE);
        }
        Ok(YIELDED_RESPONSE.len())
    }

    fn finalize(&mut self) {}
}

impl TctiInit for FakeTcti {
    type Config = u32;
    const IDENTITY: Identity = Identity::new(FAKE_MAGIC, FAKE_VERSION);

    fn initialize(expected_code: u32) -> Result<Self> {
        Ok(Self::new(expected_code))
    }
}
