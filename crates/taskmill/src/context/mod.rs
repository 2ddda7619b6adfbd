//! Execution contexts: spawned units reachable only through a framed channel.
//!
//! A [`Context`] owns one spawned unit (an OS process or a native thread),
//! the channel to it, and its lifecycle state. Lifecycle is strictly
//! `unstarted -> running -> exited`, with `kill` jumping to `exited` from any
//! earlier state. A context is not reusable after exit; `restart` hands back
//! a brand-new instance with the same configuration.

pub mod process;
pub mod thread;
pub mod transport;

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::channel::protocol::{UnitRequest, UnitResponse};
use crate::channel::{ChannelError, FramedChannel};

/// Controller-side channel: sends requests, receives responses.
pub type ControllerChannel = FramedChannel<UnitRequest, UnitResponse>;

/// Unit-side channel: the mirror image.
pub type UnitChannel = FramedChannel<UnitResponse, UnitRequest>;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// `start()` was called twice on the same instance.
    #[error("the context has already been started")]
    AlreadyStarted,

    #[error("the context is not running")]
    NotRunning,

    /// Spawn, transport, or handshake failure. The partially started unit has
    /// already been cleaned up.
    #[error("failed to start the context: {0}")]
    Start(String),

    /// The channel broke while waiting on the unit. The context has been
    /// killed before this error was raised.
    #[error("the context stopped responding, potentially due to a fatal error or an unexpected exit")]
    Unresponsive(#[source] ChannelError),

    /// A protocol invariant was broken: wrong message type where another was
    /// required.
    #[error("synchronization error: {0}")]
    Synchronization(String),

    /// The unit's entry point failed. Carries the remote error's description;
    /// the original error's identity is not reconstructed.
    #[error("the unit raised an uncaught {kind}: {message}")]
    Panic { kind: String, message: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// One spawned execution unit with lifecycle control.
#[async_trait]
pub trait Context: Send + Sync {
    /// Spawn the unit, authenticate it, open the channel. One call per
    /// instance; a second call fails with [`ContextError::AlreadyStarted`].
    async fn start(&self) -> Result<(), ContextError>;

    fn is_running(&self) -> bool;

    async fn send(&self, request: UnitRequest) -> Result<(), ContextError>;

    /// Receive the next data message. An exit result arriving here is a
    /// synchronization fault and marks the context exited.
    async fn receive(&self) -> Result<UnitResponse, ContextError>;

    /// Suspend until the unit sends its exit result, then return the
    /// unwrapped value. A remote failure surfaces as [`ContextError::Panic`].
    async fn join(&self) -> Result<serde_json::Value, ContextError>;

    /// Unconditionally terminate the unit and close the channel. Best-effort,
    /// idempotent, never waits.
    fn kill(&self);

    /// Tear down this context (gracefully unless `force`) and start a fresh
    /// one with identical configuration. The old instance stays exited.
    async fn restart(&self, force: bool) -> Result<Box<dyn Context>, ContextError>;
}

const UNSTARTED: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const EXITED: u8 = 3;

/// Shared start-once/exit-once state machine for context implementations.
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(UNSTARTED))
    }

    /// Claims the one allowed `start()`. False if already claimed.
    pub fn begin_start(&self) -> bool {
        self.0
            .compare_exchange(UNSTARTED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_running(&self) {
        self.0.store(RUNNING, Ordering::Release);
    }

    /// Transition to exited. True if this call performed the transition.
    pub fn exit(&self) -> bool {
        self.0.swap(EXITED, Ordering::AcqRel) != EXITED
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire) == RUNNING
    }
}

/// Waits for the unit's first message and verifies the authentication key.
pub(crate) async fn await_handshake(
    channel: &ControllerChannel,
    key: &str,
    timeout: Duration,
) -> Result<(), ContextError> {
    let hello = tokio::time::timeout(timeout, channel.receive())
        .await
        .map_err(|_| ContextError::Start("timed out waiting for the unit handshake".into()))?
        .map_err(|e| ContextError::Start(format!("handshake receive failed: {e}")))?;

    match hello {
        UnitResponse::Hello { key: presented } if presented == key => Ok(()),
        UnitResponse::Hello { .. } => Err(ContextError::Start(
            "the unit presented a mismatched authentication key".into(),
        )),
        _ => Err(ContextError::Start(
            "the unit sent a non-handshake message first".into(),
        )),
    }
}
