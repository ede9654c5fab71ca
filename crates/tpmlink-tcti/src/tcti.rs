//! Transport capability table.
//!
//! This module defines the `TctiBackend` trait every transport implements
//! (simulator socket, fake, hardware link) together with the identity and
//! capability descriptors the dispatcher checks before calling into it.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, TctiError};

/// One entry of the capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Initialize an instance
    Init,
    /// Send a command buffer
    Transmit,
    /// Fetch the response buffer
    Receive,
    /// Release transport resources
    Finalize,
    /// Abort an outstanding command
    Cancel,
    /// Report descriptors the caller can poll on
    GetPollHandles,
    /// Change the locality of subsequent commands
    SetLocality,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Init => write!(f, "init"),
            Operation::Transmit => write!(f, "transmit"),
            Operation::Receive => write!(f, "receive"),
            Operation::Finalize => write!(f, "finalize"),
            Operation::Cancel => write!(f, "cancel"),
            Operation::GetPollHandles => write!(f, "get_poll_handles"),
            Operation::SetLocality => write!(f, "set_locality"),
        }
    }
}

/// Which operations a transport provides. An absent entry means the
/// operation is unsupported and is never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Transmit is available
    pub transmit: bool,
    /// Receive is available
    pub receive: bool,
    /// Finalize is available
    pub finalize: bool,
    /// Cancel is available
    pub cancel: bool,
    /// Get-poll-handles is available
    pub get_poll_handles: bool,
    /// Set-locality is available
    pub set_locality: bool,
}

impl Capabilities {
    /// No operations at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Transmit, receive and finalize: the minimum for a working transport.
    pub fn core() -> Self {
        Self {
            transmit: true,
            receive: true,
            finalize: true,
            ..Self::default()
        }
    }

    /// Every operation.
    pub fn all() -> Self {
        Self {
            transmit: true,
            receive: true,
            finalize: true,
            cancel: true,
            get_poll_handles: true,
            set_locality: true,
        }
    }

    /// Returns true if the table has an entry for `op`.
    pub fn supports(&self, op: Operation) -> bool {
        match op {
            Operation::Init => true,
            Operation::Transmit => self.transmit,
            Operation::Receive => self.receive,
            Operation::Finalize => self.finalize,
            Operation::Cancel => self.cancel,
            Operation::GetPollHandles => self.get_poll_handles,
            Operation::SetLocality => self.set_locality,
        }
    }
}

/// Implementation identity: a fixed magic value and table layout version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Implementation tag
    pub magic: u64,
    /// Capability table layout version
    pub version: u32,
}

impl Identity {
    /// Create a new identity.
    pub const fn new(magic: u64, version: u32) -> Self {
        Self { magic, version }
    }
}

/// How long a receive may wait for the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait until the response arrives
    #[default]
    Block,
    /// Give up after the duration and report `TryAgain`
    After(Duration),
}

impl Timeout {
    /// Convert the C convention (`-1` blocks, otherwise milliseconds).
    pub fn from_millis(ms: i32) -> Self {
        if ms < 0 {
            Timeout::Block
        } else {
            Timeout::After(Duration::from_millis(ms as u64))
        }
    }

    /// The duration to wait, `None` when blocking.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Timeout::Block => None,
            Timeout::After(d) => Some(*d),
        }
    }
}

/// A descriptor the caller can poll for readability of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollHandle {
    /// Raw file descriptor
    pub fd: i32,
}

/// A transport implementation.
///
/// Every operation has a default body returning `NotImplemented`; a
/// transport overrides the ones it lists in [`TctiBackend::capabilities`].
/// Callers should go through [`crate::context::TctiContext`], which checks
/// the identity, the capability table and the lifecycle before dispatching.
pub trait TctiBackend: Send {
    /// Identity stored in this instance.
    fn identity(&self) -> Identity;

    /// Operations this instance provides.
    fn capabilities(&self) -> Capabilities;

    /// Send one complete command buffer.
    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        let _ = command;
        Err(TctiError::NotImplemented(Operation::Transmit))
    }

    /// Receive the response to the last transmitted command.
    ///
    /// With `response == None` only the response size is reported. With a
    /// buffer, the response is copied into it and its size returned.
    fn receive(&mut self, response: Option<&mut [u8]>, timeout: Timeout) -> Result<usize> {
        let _ = (response, timeout);
        Err(TctiError::NotImplemented(Operation::Receive))
    }

    /// Release transport resources. The instance must not be used afterwards.
    fn finalize(&mut self) {}

    /// Abort the outstanding command.
    fn cancel(&mut self) -> Result<()> {
        Err(TctiError::NotImplemented(Operation::Cancel))
    }

    /// Descriptors that become readable when a response is available.
    fn get_poll_handles(&self) -> Result<Vec<PollHandle>> {
        Err(TctiError::NotImplemented(Operation::GetPollHandles))
    }

    /// Set the locality used for subsequent commands.
    fn set_locality(&mut self, locality: u8) -> Result<()> {
        let _ = locality;
        Err(TctiError::NotImplemented(Operation::SetLocality))
    }
}

/// Construction side of a transport implementation.
pub trait TctiInit: TctiBackend + Sized {
    /// Configuration accepted by the initializer.
    type Config;

    /// Identity every instance of this implementation carries.
    const IDENTITY: Identity;

    /// Size of one instance. Pure; the same value on every call.
    fn context_size() -> usize {
        std::mem::size_of::<Self>()
    }

    /// Build a ready instance from its configuration.
    fn initialize(config: Self::Config) -> Result<Self>;
}

impl<T: TctiBackend + ?Sized> TctiBackend for Box<T> {
    fn identity(&self) -> Identity {
        (**self).identity()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn transmit(&mut self, command: &[u8]) -> Result<()> {
        (**self).transmit(command)
    }

    fn receive(&mut self, response: Option<&mut [u8]>, timeout: Timeout) -> Result<usize> {
        (**self).receive(response, timeout)
    }

    fn finalize(&mut self) {
        (**self).finalize()
    }

    fn cancel(&mut self) -> Result<()> {
        (**self).cancel()
    }

    fn get_poll_handles(&self) -> Result<Vec<PollHandle>> {
        (**self).get_poll_handles()
    }

    fn set_locality(&mut self, locality: u8) -> Result<()> {
        (**self).set_locality(locality)
    }
}
