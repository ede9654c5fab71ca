//! Lifecycle-checked dispatch through a transport's capability table.
//!
//! `TctiContext` owns one transport instance and enforces the legal call
//! sequence: `Uninitialized -> Ready -> (AwaitingResponse <-> Ready) -> Finalized`.
//! Before every dispatch it checks the instance identity and the capability
//! table, so a confused or partial transport fails with a dedicated error
//! instead of misbehaving.

use std::fmt;

use tracing::{debug, trace, warn};

use crate::error::{Result, TctiError};
use crate::tcti::{Identity, Operation, PollHandle, TctiBackend, TctiInit, Timeout};

/// Where a transport instance is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet initialized
    Uninitialized,
    /// Initialized, no command outstanding
    Ready,
    /// A command was transmitted, its response not yet received
    AwaitingResponse,
    /// Finalized, no further use allowed
    Finalized,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::Ready => write!(f, "ready"),
            LifecycleState::AwaitingResponse => write!(f, "awaiting_response"),
            LifecycleState::Finalized => write!(f, "finalized"),
        }
    }
}

/// A transport instance together with its lifecycle state.
///
/// Not internally synchronized: every operation takes `&mut self`. Share an
/// instance between threads only behind an external lock.
pub struct TctiContext<B: TctiBackend = Box<dyn TctiBackend>> {
    backend: Option<B>,
    expected: Identity,
    state: LifecycleState,
}

impl<B: TctiBackend> fmt::Debug for TctiContext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TctiContext")
            .field("expected", &self.expected)
            .field("state", &self.state)
            .field("initialized", &self.backend.is_some())
            .finish()
    }
}

impl<B: TctiInit> TctiContext<B> {
    /// Size of one instance of the backing implementation.
    pub fn context_size() -> usize {
        B::context_size()
    }

    /// A context with no instance yet; only [`TctiContext::init`] is legal.
    pub fn uninitialized() -> Self {
        Self {
            backend: None,
            expected: B::IDENTITY,
            state: LifecycleState::Uninitialized,
        }
    }

    /// Populate an uninitialized context. Fails with `BadSequence` if the
    /// context was already initialized.
    pub fn init(&mut self, config: B::Config) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(TctiError::BadSequence {
                op: Operation::Init,
                state: self.state,
            });
        }
        let backend = B::initialize(config)?;
        debug!(magic = backend.identity().magic, "TCTI initialized");
        self.backend = Some(backend);
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Build and initialize in one step.
    pub fn initialize(config: B::Config) -> Result<Self> {
        let mut ctx = Self::uninitialized();
        ctx.init(config)?;
        Ok(ctx)
    }
}

impl<B: TctiBackend> TctiContext<B> {
    /// Wrap an already constructed instance, expecting the identity it
    /// reports right now.
    pub fn from_backend(backend: B) -> Self {
        let expected = backend.identity();
        Self::with_expected(backend, expected)
    }

    /// Wrap an already constructed instance that must report `expected` on
    /// every dispatch.
    pub fn with_expected(backend: B, expected: Identity) -> Self {
        Self {
            backend: Some(backend),
            expected,
            state: LifecycleState::Ready,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Identity every dispatch is checked against.
    pub fn expected_identity(&self) -> Identity {
        self.expected
    }

    /// The wrapped instance, if initialized.
    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    /// Erase the concrete backend type.
    pub fn into_dyn(mut self) -> TctiContext
    where
        B: 'static,
    {
        let backend = self
            .backend
            .take()
            .map(|b| Box::new(b) as Box<dyn TctiBackend>);
        let ctx = TctiContext {
            backend,
            expected: self.expected,
            state: self.state,
        };
        self.state = LifecycleState::Finalized;
        ctx
    }

    /// Send one command. Legal only in `Ready`.
    pub fn transmit(&mut self, command: &[u8]) -> Result<()> {
        let backend = self.dispatch(Operation::Transmit, &[LifecycleState::Ready])?;
        backend.transmit(command)?;
        trace!(bytes = command.len(), "command transmitted");
        self.state = LifecycleState::AwaitingResponse;
        Ok(())
    }

    /// Receive the response to the outstanding command.
    ///
    /// Call once with `None` to learn the size, then with a buffer of that
    /// size to fill it. A successful fill returns the context to `Ready`.
    pub fn receive(&mut self, response: Option<&mut [u8]>, timeout: Timeout) -> Result<usize> {
        let filling = response.is_some();
        let backend = self.dispatch(Operation::Receive, &[LifecycleState::AwaitingResponse])?;
        let result = backend.receive(response, timeout);
        match &result {
            Ok(size) => {
                trace!(size = *size, filling, "response received");
                if filling {
                    self.state = LifecycleState::Ready;
                }
            }
            Err(TctiError::TryAgain) | Err(TctiError::InsufficientBuffer { .. }) => {}
            Err(e) => {
                debug!(error = %e, "receive failed, exchange abandoned");
                self.state = LifecycleState::Ready;
            }
        }
        result
    }

    /// Abort the outstanding command. Legal only in `AwaitingResponse`.
    pub fn cancel(&mut self) -> Result<()> {
        let backend = self.dispatch(Operation::Cancel, &[LifecycleState::AwaitingResponse])?;
        backend.cancel()?;
        debug!("outstanding command cancelled");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Descriptors the caller can poll for the response.
    pub fn get_poll_handles(&mut self) -> Result<Vec<PollHandle>> {
        let backend = self.dispatch(
            Operation::GetPollHandles,
            &[LifecycleState::Ready, LifecycleState::AwaitingResponse],
        )?;
        backend.get_poll_handles()
    }

    /// Set the locality of subsequent commands. Legal only in `Ready`.
    pub fn set_locality(&mut self, locality: u8) -> Result<()> {
        let backend = self.dispatch(Operation::SetLocality, &[LifecycleState::Ready])?;
        backend.set_locality(locality)
    }

    /// Release the transport. Legal only in `Ready`; afterwards every
    /// operation fails with `BadSequence`.
    pub fn finalize(&mut self) -> Result<()> {
        let backend = self.dispatch(Operation::Finalize, &[LifecycleState::Ready])?;
        backend.finalize();
        debug!("TCTI finalized");
        self.state = LifecycleState::Finalized;
        Ok(())
    }

    fn dispatch(&mut self, op: Operation, allowed: &[LifecycleState]) -> Result<&mut B> {
        let state = self.state;
        let backend = match (&mut self.backend, state) {
            (_, LifecycleState::Uninitialized | LifecycleState::Finalized) | (None, _) => {
                return Err(TctiError::BadSequence { op, state });
            }
            (Some(backend), _) => backend,
        };

        let found = backend.identity();
        if found != self.expected {
            warn!(
                op = %op,
                expected_magic = self.expected.magic,
                magic = found.magic,
                "identity mismatch, refusing dispatch"
            );
            return Err(TctiError::InvalidContext {
                expected_magic: self.expected.magic,
                expected_version: self.expected.version,
                magic: found.magic,
                version: found.version,
            });
        }

        if !backend.capabilities().supports(op) {
            return Err(TctiError::NotImplemented(op));
        }

        if !allowed.contains(&state) {
            return Err(TctiError::BadSequence { op, state });
        }

        Ok(backend)
    }
}

impl<B: TctiBackend> Drop for TctiContext<B> {
    fn drop(&mut self) {
        if self.state != LifecycleState::Ready && self.state != LifecycleState::AwaitingResponse {
            return;
        }
        if let Some(backend) = self.backend.as_mut() {
            if backend.identity() == self.expected && backend.capabilities().finalize {
                debug!(state = %self.state, "finalizing TCTI on drop");
                backend.finalize();
            }
        }
    }
}
