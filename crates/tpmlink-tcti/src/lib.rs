#![warn(missing_docs)]

//! tpmlink TCTI subsystem: transport abstraction for TPM command buffers,
//! message header codec, simulator and fake transports

pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod fake;
pub mod header;
pub mod mssim;
pub mod tcti;

pub use config::{MssimConfig, TctiFile, TctiSpec};
pub use context::{LifecycleState, TctiContext};
pub use error::{Result, TctiError};
pub use exchange::{exchange, Response};
pub use fake::{FakeTcti, YIELDED_RESPONSE};
pub use header::{ResponseCode, TpmHeader, TPM_HEADER_SIZE};
pub use mssim::MssimTcti;
pub use tcti::{Capabilities, Identity, Operation, PollHandle, TctiBackend, TctiInit, Timeout};
